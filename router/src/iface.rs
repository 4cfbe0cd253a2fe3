use crate::link::{LinkTable, MAX_BIT_RATE, MAX_PKT_RATE, MIN_BIT_RATE, MIN_PKT_RATE};
use crate::FOREST_PORT;
use anyhow::{Context, Result};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// Highest usable interface number.
pub const MAX_IFACE: u16 = 31;

#[derive(Debug)]
pub struct IfaceEntry {
    pub ip: Ipv4Addr,
    /// Ceiling on the summed bit rates of links using this interface (Kb/s).
    pub max_bit_rate: u32,
    /// Ceiling on the summed packet rates of links using this interface
    /// (pkts/s).
    pub max_pkt_rate: u32,
    socket: Option<UdpSocket>,
}

/// The router's logical interfaces: one bound, non-blocking UDP socket per
/// local IP address.
pub struct InterfaceTable {
    entries: Vec<Option<IfaceEntry>>,
    /// Where the next receive sweep starts, so busy low-numbered interfaces
    /// cannot starve the others.
    next_sweep: u16,
}

/// A datagram picked up by [`InterfaceTable::recv_any`].
#[derive(Debug, Clone, Copy)]
pub struct Datagram {
    pub iface: u16,
    pub len: usize,
    pub src: SocketAddrV4,
}

impl Default for InterfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self {
            entries: (0..=MAX_IFACE).map(|_| None).collect(),
            next_sweep: 1,
        }
    }

    /// Records an interface. The socket is opened separately by
    /// [`setup`](Self::setup) so tables can be built and validated without
    /// touching the network.
    pub fn add(&mut self, iface: u16, ip: Ipv4Addr, max_bit_rate: u32, max_pkt_rate: u32) -> bool {
        if iface < 1 || iface > MAX_IFACE || self.get(iface).is_some() {
            return false;
        }
        if !(MIN_BIT_RATE..=MAX_BIT_RATE).contains(&max_bit_rate)
            || !(MIN_PKT_RATE..=MAX_PKT_RATE).contains(&max_pkt_rate)
        {
            return false;
        }

        self.entries[iface as usize] = Some(IfaceEntry {
            ip,
            max_bit_rate,
            max_pkt_rate,
            socket: None,
        });

        true
    }

    pub fn remove(&mut self, iface: u16) {
        if let Some(slot) = self.entries.get_mut(iface as usize) {
            *slot = None;
        }
    }

    pub fn get(&self, iface: u16) -> Option<&IfaceEntry> {
        self.entries.get(iface as usize)?.as_ref()
    }

    pub fn is_valid(&self, iface: u16) -> bool {
        self.get(iface).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &IfaceEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| Some((i as u16, e.as_ref()?)))
    }

    /// True while the summed rates of all links on `iface` stay within its
    /// ceilings.
    pub fn within_capacity(&self, iface: u16, lt: &LinkTable) -> bool {
        let Some(entry) = self.get(iface) else {
            return false;
        };

        let (mut bit_rate, mut pkt_rate) = (0u64, 0u64);
        for (_, link) in lt.iter() {
            if link.iface == iface {
                bit_rate += u64::from(link.bit_rate);
                pkt_rate += u64::from(link.pkt_rate);
            }
        }

        bit_rate <= u64::from(entry.max_bit_rate) && pkt_rate <= u64::from(entry.max_pkt_rate)
    }

    /// Adjusts the rate ceilings, rolling back if the links already on the
    /// interface would no longer fit.
    pub fn modify(
        &mut self,
        iface: u16,
        max_bit_rate: Option<u32>,
        max_pkt_rate: Option<u32>,
        lt: &LinkTable,
    ) -> bool {
        let Some(entry) = self.get(iface) else {
            return false;
        };
        let (old_bit, old_pkt) = (entry.max_bit_rate, entry.max_pkt_rate);

        let new_bit = max_bit_rate.unwrap_or(old_bit);
        let new_pkt = max_pkt_rate.unwrap_or(old_pkt);
        if !(MIN_BIT_RATE..=MAX_BIT_RATE).contains(&new_bit)
            || !(MIN_PKT_RATE..=MAX_PKT_RATE).contains(&new_pkt)
        {
            return false;
        }

        {
            let entry = self.entries[iface as usize].as_mut().expect("checked above");
            entry.max_bit_rate = new_bit;
            entry.max_pkt_rate = new_pkt;
        }

        if !self.within_capacity(iface, lt) {
            let entry = self.entries[iface as usize].as_mut().expect("checked above");
            entry.max_bit_rate = old_bit;
            entry.max_pkt_rate = old_pkt;
            return false;
        }

        true
    }

    /// Opens the interface's socket: non-blocking UDP bound to
    /// `(ip, FOREST_PORT)`.
    pub fn setup(&mut self, iface: u16) -> Result<()> {
        use socket2::{Domain, Protocol, Socket, Type};

        let entry = self
            .entries
            .get_mut(iface as usize)
            .and_then(|e| e.as_mut())
            .with_context(|| format!("no interface {iface}"))?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create UDP socket")?;
        socket
            .set_nonblocking(true)
            .context("Failed to make socket non-blocking")?;
        let bind_addr = SocketAddr::from(SocketAddrV4::new(entry.ip, FOREST_PORT));
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("Failed to bind {bind_addr}; check the interface's IP"))?;

        entry.socket = Some(socket.into());

        Ok(())
    }

    /// Polls every bound socket for one waiting datagram.
    ///
    /// Returns `None` when nothing is waiting anywhere. The sweep starts at
    /// a different interface each call.
    pub fn recv_any(&mut self, buf: &mut [u8]) -> io::Result<Option<Datagram>> {
        let start = self.next_sweep;

        for offset in 0..MAX_IFACE {
            let iface = (start + offset - 1) % MAX_IFACE + 1;
            let Some(entry) = self.entries[iface as usize].as_ref() else {
                continue;
            };
            let Some(socket) = entry.socket.as_ref() else {
                continue;
            };

            match socket.recv_from(buf) {
                Ok((len, SocketAddr::V4(src))) => {
                    self.next_sweep = iface % MAX_IFACE + 1;
                    return Ok(Some(Datagram { iface, len, src }));
                }
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Sends one datagram out of `iface`.
    pub fn send_to(&self, iface: u16, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        let socket = self
            .get(iface)
            .and_then(|e| e.socket.as_ref())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, format!("no socket on interface {iface}"))
            })?;

        socket.send_to(buf, SocketAddr::from(dest))
    }
}

impl fmt::Display for InterfaceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.iter().count())?;
        for (iface, e) in self.iter() {
            writeln!(f, "{iface} {} {} {}", e.ip, e.max_bit_rate, e.max_pkt_rate)?;
        }
        Ok(())
    }
}
