use crate::addr::FAdr;
use crate::packet::true_pkt_leng;
use crate::FOREST_PORT;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Highest usable link number; links are numbered `1..=MAX_LNK` so that a
/// link set fits in a 32-bit mask.
pub const MAX_LNK: u16 = 31;

/// Bit rates are configured in Kb/s within these bounds.
pub const MIN_BIT_RATE: u32 = 50;
pub const MAX_BIT_RATE: u32 = 1_000_000;

/// Packet rates are configured in pkts/s within these bounds.
pub const MIN_PKT_RATE: u32 = 50;
pub const MAX_PKT_RATE: u32 = 800_000;

/// What sits at the far end of a link.
///
/// Types at or above [`NodeType::TRUSTED_BOUNDARY`] are trusted: they may
/// originate network signalling and are exempt from source-address checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Client,
    Server,
    Router,
    Controller,
}

impl NodeType {
    const TRUSTED_BOUNDARY: u32 = 100;

    pub fn code(self) -> u32 {
        match self {
            NodeType::Client => 1,
            NodeType::Server => 2,
            NodeType::Router => 101,
            NodeType::Controller => 102,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(NodeType::Client),
            2 => Some(NodeType::Server),
            101 => Some(NodeType::Router),
            102 => Some(NodeType::Controller),
            _ => None,
        }
    }

    pub fn is_trusted(self) -> bool {
        self.code() >= Self::TRUSTED_BOUNDARY
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Client => "client",
            NodeType::Server => "server",
            NodeType::Router => "router",
            NodeType::Controller => "controller",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid node type `{0}`")]
pub struct InvalidNodeType(String);

impl FromStr for NodeType {
    type Err = InvalidNodeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(NodeType::Client),
            "server" => Ok(NodeType::Server),
            "router" => Ok(NodeType::Router),
            "controller" => Ok(NodeType::Controller),
            other => Err(InvalidNodeType(other.to_owned())),
        }
    }
}

#[derive(Debug)]
pub struct LinkEntry {
    pub iface: u16,
    pub peer_ip: Ipv4Addr,
    /// Peer UDP port; 0 until the first CONNECT teaches it.
    pub peer_port: u16,
    pub peer_type: NodeType,
    pub peer_adr: FAdr,
    /// If non-null, the only destination (besides this router) the peer may
    /// send to.
    pub peer_dest: FAdr,
    /// Kb/s.
    pub bit_rate: u32,
    /// pkts/s.
    pub pkt_rate: u32,

    in_pkts: u64,
    out_pkts: u64,
    in_bytes: u64,
    out_bytes: u64,
}

impl LinkEntry {
    /// Minimum microseconds between packets implied by the packet rate.
    pub fn min_delta(&self) -> u32 {
        1_000_000 / self.pkt_rate
    }

    pub fn in_pkts(&self) -> u64 {
        self.in_pkts
    }

    pub fn in_bytes(&self) -> u64 {
        self.in_bytes
    }

    pub fn out_pkts(&self) -> u64 {
        self.out_pkts
    }

    pub fn out_bytes(&self) -> u64 {
        self.out_bytes
    }
}

/// Aggregate traffic counters across all links.
#[derive(Debug, Default, Clone, Copy)]
pub struct Totals {
    pub in_pkts: u64,
    pub out_pkts: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub router_in_pkts: u64,
    pub router_out_pkts: u64,
    pub client_in_pkts: u64,
    pub client_out_pkts: u64,
}

/// All links incident to this router, indexed by link number.
///
/// Ingress demultiplexing is a hashed lookup: packets from peers that send
/// from the forest port are keyed by their IP address alone, everything else
/// by (IP, claimed source address) so several clients can share a NAT'd IP.
pub struct LinkTable {
    entries: Vec<Option<LinkEntry>>,
    by_key: HashMap<(Ipv4Addr, u32), u16>,
    totals: Totals,
}

impl Default for LinkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkTable {
    pub fn new() -> Self {
        Self {
            entries: (0..=MAX_LNK).map(|_| None).collect(),
            by_key: HashMap::new(),
            totals: Totals::default(),
        }
    }

    fn key_for(peer_ip: Ipv4Addr, peer_type: NodeType, peer_adr: FAdr) -> (Ipv4Addr, u32) {
        // Clients send from an ephemeral port and are told apart by their
        // forest address; every other node type listens on the forest port.
        if peer_type == NodeType::Client {
            (peer_ip, peer_adr.raw() as u32)
        } else {
            (peer_ip, u32::from(peer_ip))
        }
    }

    /// Adds a link. Fails if the link number is taken or out of range, the
    /// rates are out of bounds, or the peer clashes with an existing entry.
    pub fn add(
        &mut self,
        lnk: u16,
        iface: u16,
        peer_type: NodeType,
        peer_ip: Ipv4Addr,
        peer_adr: FAdr,
        bit_rate: u32,
        pkt_rate: u32,
    ) -> bool {
        if lnk < 1 || lnk > MAX_LNK || self.get(lnk).is_some() {
            return false;
        }
        if !(MIN_BIT_RATE..=MAX_BIT_RATE).contains(&bit_rate)
            || !(MIN_PKT_RATE..=MAX_PKT_RATE).contains(&pkt_rate)
        {
            return false;
        }
        if !peer_adr.is_unicast() {
            return false;
        }

        let key = Self::key_for(peer_ip, peer_type, peer_adr);
        if self.by_key.contains_key(&key) {
            return false;
        }

        self.by_key.insert(key, lnk);
        self.entries[lnk as usize] = Some(LinkEntry {
            iface,
            peer_ip,
            peer_port: if peer_type == NodeType::Client {
                0
            } else {
                FOREST_PORT
            },
            peer_type,
            peer_adr,
            peer_dest: FAdr::NULL,
            bit_rate,
            pkt_rate,
            in_pkts: 0,
            out_pkts: 0,
            in_bytes: 0,
            out_bytes: 0,
        });

        true
    }

    pub fn remove(&mut self, lnk: u16) -> bool {
        let Some(entry) = self.get(lnk) else {
            return false;
        };

        let key = Self::key_for(entry.peer_ip, entry.peer_type, entry.peer_adr);
        self.by_key.remove(&key);
        self.entries[lnk as usize] = None;

        true
    }

    pub fn get(&self, lnk: u16) -> Option<&LinkEntry> {
        self.entries.get(lnk as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, lnk: u16) -> Option<&mut LinkEntry> {
        self.entries.get_mut(lnk as usize)?.as_mut()
    }

    pub fn is_valid(&self, lnk: u16) -> bool {
        self.get(lnk).is_some()
    }

    /// Links in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &LinkEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| Some((i as u16, e.as_ref()?)))
    }

    /// Identifies the link a datagram belongs to.
    ///
    /// `iface` must match the entry's interface, and the source port must
    /// match the stored peer port unless that is still 0 (not yet learned
    /// from a CONNECT).
    pub fn lookup(
        &self,
        iface: u16,
        src_ip: Ipv4Addr,
        src_port: u16,
        src_adr: FAdr,
    ) -> Option<u16> {
        let x = if src_port != FOREST_PORT {
            src_adr.raw() as u32
        } else {
            u32::from(src_ip)
        };

        let lnk = *self.by_key.get(&(src_ip, x))?;
        let entry = self.get(lnk)?;

        if entry.iface != iface {
            return None;
        }
        if entry.peer_port != 0 && entry.peer_port != src_port {
            return None;
        }

        Some(lnk)
    }

    /// Records an arriving packet of wire length `leng` on `lnk`.
    pub fn post_in(&mut self, lnk: u16, leng: u16) {
        let len = true_pkt_leng(leng) as u64;
        let Some(entry) = self.get_mut(lnk) else {
            return;
        };

        entry.in_pkts += 1;
        entry.in_bytes += len;
        let peer_type = entry.peer_type;

        self.totals.in_pkts += 1;
        self.totals.in_bytes += len;
        match peer_type {
            NodeType::Router => self.totals.router_in_pkts += 1,
            NodeType::Client => self.totals.client_in_pkts += 1,
            NodeType::Server | NodeType::Controller => {}
        }
    }

    /// Records a departing packet of wire length `leng` on `lnk`.
    pub fn post_out(&mut self, lnk: u16, leng: u16) {
        let len = true_pkt_leng(leng) as u64;
        let Some(entry) = self.get_mut(lnk) else {
            return;
        };

        entry.out_pkts += 1;
        entry.out_bytes += len;
        let peer_type = entry.peer_type;

        self.totals.out_pkts += 1;
        self.totals.out_bytes += len;
        match peer_type {
            NodeType::Router => self.totals.router_out_pkts += 1,
            NodeType::Client => self.totals.client_out_pkts += 1,
            NodeType::Server | NodeType::Controller => {}
        }
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }
}

impl fmt::Display for LinkTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.iter().count())?;
        for (lnk, e) in self.iter() {
            writeln!(
                f,
                "{lnk} {} {} {} {} {} {}",
                e.iface, e.peer_ip, e.peer_adr, e.peer_type, e.bit_rate, e.pkt_rate
            )?;
        }
        Ok(())
    }
}
