use crate::addr::FAdr;
use crate::comtree::{ComtreeEntry, ComtreeTable};
use crate::config;
use crate::ctl::{CpAttr, CpType, CtlPkt, RrType};
use crate::iface::InterfaceTable;
use crate::link::{
    LinkTable, NodeType, MAX_BIT_RATE, MAX_PKT_RATE, MIN_BIT_RATE, MIN_PKT_RATE,
};
use crate::packet::{PktType, FOREST_VERSION, HDR_LENG, OVERHEAD, RTE_REQ};
use crate::qmgr::QueueManager;
use crate::route::{RouteEntry, RouteTable};
use crate::stats::StatsRecorder;
use crate::store::{PacketStore, Pkt, BUF_SIZ};
use crate::time::Micros;
use anyhow::{Context, Result};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tracing::Level;

/// Network signalling travels on comtrees in this range.
const NET_SIG_COMTS: std::ops::RangeInclusive<u32> = 100..=999;

/// Untrusted peers may use signalling packet types only on comtrees up to
/// this number.
const CLIENT_SIG_COMT_MAX: u32 = 100;

/// Process one control packet per this many busy iterations.
const CTL_THROTTLE: i32 = 20;

/// Capacity knobs for the router's pools and queues.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub num_pkts: usize,
    pub num_bufs: usize,
    /// Cap on queued packets per link.
    pub link_queue_cap: u32,
    /// Default per-queue packet limit.
    pub queue_pkt_lim: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            num_pkts: 8192,
            num_bufs: 4096,
            link_queue_cap: 1024,
            queue_pkt_lim: 512,
        }
    }
}

/// The four startup table streams.
#[derive(Debug, Clone, Copy)]
pub struct ConfigFiles<'a> {
    pub interfaces: &'a str,
    pub links: &'a str,
    pub comtrees: &'a str,
    pub routes: &'a str,
}

/// A forest router's forwarding plane.
///
/// One instance owns every table, the packet store and the queue manager;
/// the main loop is the sole mutator, so there is no locking anywhere.
pub struct Router {
    my_adr: FAdr,
    ift: InterfaceTable,
    lt: LinkTable,
    ctt: ComtreeTable,
    rt: RouteTable,
    ps: PacketStore,
    qm: QueueManager,
    sm: StatsRecorder,
    /// Deferred signalling packets, processed at most one per
    /// [`CTL_THROTTLE`] busy iterations.
    ctl_q: VecDeque<Pkt>,
    /// Circular scheduler clock.
    now: Micros,
    /// Monotonic microseconds since startup; drives the finish time and
    /// stats cadence.
    uptime: u64,
    discards: u64,
}

impl Router {
    pub fn new(my_adr: FAdr, limits: Limits) -> Self {
        Self {
            my_adr,
            ift: InterfaceTable::new(),
            lt: LinkTable::new(),
            ctt: ComtreeTable::new(my_adr),
            rt: RouteTable::new(my_adr),
            ps: PacketStore::new(limits.num_pkts, limits.num_bufs),
            qm: QueueManager::new(crate::link::MAX_LNK, limits.link_queue_cap, limits.queue_pkt_lim),
            sm: StatsRecorder::new(),
            ctl_q: VecDeque::new(),
            now: Micros::ZERO,
            uptime: 0,
            discards: 0,
        }
    }

    pub fn my_adr(&self) -> FAdr {
        self.my_adr
    }

    /// Populates the tables from the startup configuration streams.
    pub fn load(&mut self, cfg: ConfigFiles<'_>) -> Result<()> {
        config::read_interfaces(cfg.interfaces, &mut self.ift)
            .context("can't read interface table")?;
        config::read_links(cfg.links, &mut self.lt, &self.ift).context("can't read link table")?;
        config::read_comtrees(cfg.comtrees, &mut self.ctt, &self.lt, &mut self.qm)
            .context("can't read comtree table")?;
        config::read_routes(cfg.routes, &mut self.rt, &self.ctt).context("can't read route table")?;

        self.add_local_routes();

        Ok(())
    }

    /// Opens one socket per configured interface.
    pub fn setup_sockets(&mut self) -> Result<()> {
        let ifaces: Vec<u16> = self.ift.iter().map(|(i, _)| i).collect();
        for iface in ifaces {
            self.ift
                .setup(iface)
                .with_context(|| format!("can't set up interface {iface}"))?;
        }

        Ok(())
    }

    /// Seeds unicast routes for directly attached peers: every comtree link
    /// gets a route to its peer, except links to routers in our own zip
    /// code (those are reachable by local flooding). Foreign-zip routers
    /// come out zip-aggregated.
    fn add_local_routes(&mut self) {
        let mut seeds: Vec<(u32, FAdr, u16)> = Vec::new();

        for (comt, entry) in self.ctt.iter() {
            for lnk in entry.links.iter() {
                let Some(link) = self.lt.get(lnk) else {
                    continue;
                };
                if link.peer_type == NodeType::Router && link.peer_adr.zip() == self.my_adr.zip() {
                    continue;
                }
                seeds.push((comt, link.peer_adr, lnk));
            }
        }

        for (comt, adr, lnk) in seeds {
            if !self.rt.contains(comt, adr) {
                self.rt.add_entry(comt, adr, lnk);
            }
        }
    }

    /// All tables in their config-stream form.
    pub fn dump(&self) -> String {
        format!(
            "Interface Table\n{}\nLink Table\n{}\nComtree Table\n{}\nRoute Table\n{}",
            self.ift, self.lt, self.ctt, self.rt
        )
    }

    pub fn links(&self) -> &LinkTable {
        &self.lt
    }

    pub fn comtrees(&self) -> &ComtreeTable {
        &self.ctt
    }

    pub fn routes(&self) -> &RouteTable {
        &self.rt
    }

    pub fn now(&self) -> Micros {
        self.now
    }

    pub fn discards(&self) -> u64 {
        self.discards
    }

    /// Packets currently queued for `lnk`.
    pub fn queued_pkts(&self, lnk: u16) -> u32 {
        self.qm.qlen_pkts(lnk)
    }

    /// Advances the router clocks without doing IO; used by the run loop
    /// and by tests driving virtual time.
    pub fn advance_clock(&mut self, micros: u64) {
        self.uptime += micros;
        self.now = self.now.add(micros as u32);
    }

    /// Feeds one datagram into the ingress path as if it had arrived on
    /// `iface` from `src`.
    pub fn inject(&mut self, bytes: &[u8], iface: u16, src: SocketAddrV4) {
        let Some(p) = self.ps.alloc() else {
            self.discards += 1;
            return;
        };

        let len = bytes.len().min(BUF_SIZ);
        self.ps.buffer_mut(p)[..len].copy_from_slice(&bytes[..len]);
        self.accept(p, iface, len, src);
    }

    /// Pulls the next transmittable packet off the queues, without sockets.
    ///
    /// Returns the egress link and the wire bytes.
    pub fn poll_egress(&mut self) -> Option<(u16, Vec<u8>)> {
        let lnk = self.qm.next_ready(self.now)?;
        let (bit_rate, min_delta) = self.link_rates(lnk);
        let p = self.qm.deq(lnk, &self.ps, bit_rate, min_delta)?;

        let leng = (self.ps.header(p).leng as usize).min(BUF_SIZ);
        let bytes = self.ps.buffer(p)[..leng].to_vec();
        self.lt.post_out(lnk, leng as u16);
        self.ps.free(p);

        Some((lnk, bytes))
    }

    /// Processes deferred control packets regardless of the busy throttle;
    /// test hook mirroring the idle branch of the run loop.
    pub fn drain_control(&mut self) {
        while let Some(p) = self.ctl_q.pop_front() {
            self.handle_ctl(p);
        }
    }

    fn link_rates(&self, lnk: u16) -> (u32, u32) {
        match self.lt.get(lnk) {
            Some(link) => (link.bit_rate, link.min_delta()),
            // Link vanished while packets were queued; drain at the floor
            // rate.
            None => (MIN_BIT_RATE, 0),
        }
    }

    /// The main loop: receive, forward, transmit, signalling, stats.
    ///
    /// Runs until `finish_time` elapses (forever when `None`). IO and clock
    /// failures are fatal; everything else drops the offending packet and
    /// keeps going.
    pub fn run(&mut self, finish_time: Option<Duration>) -> Result<()> {
        let finish_us = finish_time.map(|d| d.as_micros() as u64);
        let mut prev = Instant::now();
        let mut control_count = CTL_THROTTLE;

        loop {
            if let Some(finish) = finish_us {
                if self.uptime > finish {
                    break;
                }
            }

            let mut did_nothing = true;

            if self.receive()? {
                did_nothing = false;
            }

            while let Some(lnk) = self.qm.next_ready(self.now) {
                did_nothing = false;
                let (bit_rate, min_delta) = self.link_rates(lnk);
                let Some(p) = self.qm.deq(lnk, &self.ps, bit_rate, min_delta) else {
                    break;
                };
                self.send(p, lnk)?;
            }

            if !self.ctl_q.is_empty() {
                control_count -= 1;
                if did_nothing || control_count <= 0 {
                    if let Some(p) = self.ctl_q.pop_front() {
                        self.handle_ctl(p);
                        did_nothing = false;
                    }
                    control_count = CTL_THROTTLE;
                }
            }

            self.sm.tick(self.uptime, &self.lt, &self.qm);

            self.advance_clock(prev.elapsed().as_micros() as u64);
            prev = Instant::now();

            if did_nothing {
                std::thread::sleep(Duration::from_millis(1));
                self.advance_clock(prev.elapsed().as_micros() as u64);
                prev = Instant::now();
            }
        }

        self.sm.summary(&self.lt);
        tracing::debug!(discards = self.discards, "run loop finished");

        Ok(())
    }

    /// Picks up one waiting datagram, if any. True when a packet was read.
    fn receive(&mut self) -> Result<bool> {
        // Allocate first so an exhausted pool leaves the datagram queued in
        // the kernel instead of reading and dropping it.
        let Some(p) = self.ps.alloc() else {
            return Ok(false);
        };

        let datagram = match self.ift.recv_any(self.ps.buffer_mut(p)) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => {
                self.ps.free(p);
                return Ok(false);
            }
            Err(e) => {
                self.ps.free(p);
                return Err(e).context("recvfrom failed");
            }
        };

        if tracing::enabled!(target: "wire", Level::TRACE) {
            let bytes = &self.ps.buffer(p)[..datagram.len];
            tracing::trace!(target: "wire", iface = datagram.iface, src = %datagram.src, rx = %hex::encode(bytes));
        }

        self.accept(p, datagram.iface, datagram.len, datagram.src);

        Ok(true)
    }

    /// Attaches an arrived packet to its link and runs the ingress path.
    fn accept(&mut self, p: Pkt, iface: u16, len: usize, src: SocketAddrV4) {
        self.ps.unpack(p);

        if !self.ps.hdr_err_check(p) {
            self.drop_pkt(p, "header checksum");
            return;
        }

        let src_adr = self.ps.header(p).src;
        let Some(lnk) = self.lt.lookup(iface, *src.ip(), src.port(), src_adr) else {
            tracing::trace!(iface, %src, "datagram from unknown peer");
            self.discards += 1;
            self.ps.free(p);
            return;
        };

        self.ps.set_io_bytes(p, len as u16);
        self.ps.set_in_link(p, lnk);
        self.ps.set_tun_src(p, *src.ip(), src.port());
        self.lt.post_in(lnk, len as u16);

        self.handle_ingress(p);
    }

    fn drop_pkt(&mut self, p: Pkt, why: &'static str) {
        tracing::trace!(why, "dropping packet");
        self.discards += 1;
        self.ps.free(p);
    }

    /// Validates and classifies one ingress packet.
    fn handle_ingress(&mut self, p: Pkt) {
        if !self.pkt_check(p) {
            self.drop_pkt(p, "failed packet check");
            return;
        }

        match self.ps.header(p).typ {
            PktType::Connect => self.connect(p),
            PktType::Disconnect => self.disconnect(p),
            PktType::ClientData => self.forward(p),
            PktType::SubUnsub => self.sub_unsub(p),
            PktType::RteReply => self.handle_rte_reply(p),
            PktType::ClientSig | PktType::NetSig | PktType::Undef => self.ctl_q.push_back(p),
        }
    }

    /// The admission checks of the data path: version, length, link
    /// membership, and the extra scrutiny applied to untrusted peers.
    fn pkt_check(&self, p: Pkt) -> bool {
        let hdr = self.ps.header(p);

        if hdr.version != FOREST_VERSION {
            return false;
        }
        if hdr.leng != self.ps.io_bytes(p) || (hdr.leng as usize) < HDR_LENG {
            return false;
        }

        let in_link = self.ps.in_link(p);
        let Some(link) = self.lt.get(in_link) else {
            return false;
        };

        if !link.peer_type.is_trusted() {
            // Spoofed source addresses go no further.
            if link.peer_adr != hdr.src {
                return false;
            }
            // Destination restrictions, when configured, always allow
            // talking to this router itself.
            if !link.peer_dest.is_null() && hdr.dst != link.peer_dest && hdr.dst != self.my_adr {
                return false;
            }
            if hdr.typ.is_internal() {
                return false;
            }
            if hdr.typ.is_signalling() && hdr.comt > CLIENT_SIG_COMT_MAX {
                return false;
            }
        }

        self.ctt.in_comt(hdr.comt, in_link)
    }

    /// First CONNECT from a client teaches its UDP port.
    fn connect(&mut self, p: Pkt) {
        let in_link = self.ps.in_link(p);
        let port = self.ps.tun_src(p).map(|s| s.port()).unwrap_or(0);

        if let Some(link) = self.lt.get_mut(in_link) {
            if link.peer_port == 0 {
                link.peer_port = port;
                tracing::debug!(link = in_link, port, "learned peer port from connect");
            }
        }

        self.ps.free(p);
    }

    /// DISCONNECT forgets the port, but only from the port that set it.
    fn disconnect(&mut self, p: Pkt) {
        let in_link = self.ps.in_link(p);
        let port = self.ps.tun_src(p).map(|s| s.port()).unwrap_or(0);

        if let Some(link) = self.lt.get_mut(in_link) {
            if link.peer_port == port {
                link.peer_port = 0;
                tracing::debug!(link = in_link, "peer disconnected");
            }
        }

        self.ps.free(p);
    }

    /// Routes one data packet; signalling in transit takes the same path.
    fn forward(&mut self, p: Pkt) {
        let hdr = *self.ps.header(p);
        let Some(ct) = self.ctt.lookup(hdr.comt).copied() else {
            self.drop_pkt(p, "no comtree");
            return;
        };
        let rte = self.rt.lookup(hdr.comt, hdr.dst).copied();

        let Some(rte) = rte else {
            // No route: unicast floods with a route request, multicast
            // floods plain.
            if hdr.dst.is_unicast() {
                let h = self.ps.header_mut(p);
                h.flags |= RTE_REQ;
                self.ps.pack(p);
                self.ps.hdr_err_update(p);
            }
            self.multi_send(p, ct, None);
            return;
        };

        if hdr.flags & RTE_REQ != 0 {
            self.send_rte_reply(p, &ct);
            let h = self.ps.header_mut(p);
            h.flags &= !RTE_REQ;
            self.ps.pack(p);
            self.ps.hdr_err_update(p);
        }

        if hdr.dst.is_unicast() {
            let qnum = if rte.qnum != 0 { rte.qnum } else { ct.qnum };
            let lnk = rte.link();

            if lnk != self.ps.in_link(p) && self.qm.enq(p, lnk, qnum, self.now, &self.ps) {
                return;
            }
            self.drop_pkt(p, "unicast forward refused");
            return;
        }

        self.multi_send(p, ct, Some(rte));
    }

    /// Fans a packet out to a set of links, cloning the buffer for all but
    /// the last copy.
    fn multi_send(&mut self, p: Pkt, ct: ComtreeEntry, rte: Option<RouteEntry>) {
        let hdr = *self.ps.header(p);
        let in_link = self.ps.in_link(p);

        let mut qnum = ct.qnum;
        let mut links: SmallVec<[u16; 16]> = SmallVec::new();

        if hdr.dst.is_unicast() {
            // Flooding an unknown unicast destination: local routers for a
            // local zip, all routers otherwise.
            let set = if hdr.dst.zip() == self.my_adr.zip() {
                ct.llinks
            } else {
                ct.rlinks
            };
            links.extend(set.iter());
        } else {
            if let Some(rte) = rte {
                if rte.qnum != 0 {
                    qnum = rte.qnum;
                }
                links.extend(rte.links().iter());
            }
            links.extend(ct.clinks.iter());
            if ct.parent != 0 && !ct.clinks.contains(ct.parent) {
                links.push(ct.parent);
            }
        }

        links.retain(|lnk| *lnk != in_link);
        if links.is_empty() {
            self.ps.free(p);
            return;
        }

        let mut current = p;
        let last = links.len() - 1;
        for (i, lnk) in links.iter().enumerate() {
            if !self.qm.enq(current, *lnk, qnum, self.now, &self.ps) {
                self.discards += 1;
                if i == last {
                    break;
                }
                continue;
            }
            if i == last {
                return;
            }
            match self.ps.clone_pkt(current) {
                Some(copy) => current = copy,
                // Descriptor pool dry: stop fanning out.
                None => {
                    self.discards += 1;
                    return;
                }
            }
        }

        self.ps.free(current);
    }

    /// Applies a SUB_UNSUB to the multicast routes and propagates it
    /// towards the comtree root when something changed.
    fn sub_unsub(&mut self, p: Pkt) {
        let hdr = *self.ps.header(p);
        let in_link = self.ps.in_link(p);
        let Some(ct) = self.ctt.lookup(hdr.comt).copied() else {
            self.drop_pkt(p, "no comtree");
            return;
        };

        // Subscriptions from upstream or from peer cores are ignored.
        if in_link == ct.parent || ct.clinks.contains(in_link) {
            self.ps.free(p);
            return;
        }

        let comt = hdr.comt;
        let leng = hdr.leng as usize;
        let mut propagate = false;

        let add_cnt = self.ps.payload_word(p, 0) as usize;
        if add_cnt > 350 || (add_cnt + 8) * 4 > leng {
            self.drop_pkt(p, "bad subscription counts");
            return;
        }
        for i in 1..=add_cnt {
            let adr = FAdr::new(self.ps.payload_word(p, i) as i32);
            if !adr.is_multicast() {
                continue;
            }

            let member = self.rt.lookup(comt, adr).map(|r| r.links().contains(in_link));
            match member {
                None => {
                    self.rt.add_entry(comt, adr, in_link);
                    propagate = true;
                }
                Some(false) => {
                    self.rt.add_link(comt, adr, in_link);
                    // Zeroed so routers upstream ignore this one.
                    self.ps.set_payload_word(p, i, 0);
                }
                Some(true) => {}
            }
        }

        let drop_cnt = self.ps.payload_word(p, add_cnt + 1) as usize;
        if add_cnt + drop_cnt > 350 || (add_cnt + drop_cnt + 8) * 4 > leng {
            self.drop_pkt(p, "bad subscription counts");
            return;
        }
        for i in add_cnt + 2..=add_cnt + drop_cnt + 1 {
            let adr = FAdr::new(self.ps.payload_word(p, i) as i32);
            if !adr.is_multicast() {
                continue;
            }
            if self.rt.lookup(comt, adr).is_none() {
                continue;
            }

            self.rt.remove_link(comt, adr, in_link);
            if self.rt.lookup(comt, adr).is_some_and(|r| r.links().is_empty()) {
                self.rt.remove_entry(comt, adr);
                propagate = true;
            } else {
                self.ps.set_payload_word(p, i, 0);
            }
        }

        if propagate && !ct.core_flag && ct.parent != 0 {
            if let Some(parent_adr) = self.lt.get(ct.parent).map(|l| l.peer_adr) {
                let h = self.ps.header_mut(p);
                h.dst = parent_adr;
                self.ps.pack(p);
                self.ps.hdr_err_update(p);
                self.ps.pay_err_update(p);

                if self.qm.enq(p, ct.parent, ct.qnum, self.now, &self.ps) {
                    return;
                }
            }
        }

        self.ps.free(p);
    }

    /// Learns from (and forwards) a RTE_REPLY.
    fn handle_rte_reply(&mut self, p: Pkt) {
        let hdr = *self.ps.header(p);
        let in_link = self.ps.in_link(p);
        let Some(ct) = self.ctt.lookup(hdr.comt).copied() else {
            self.drop_pkt(p, "no comtree");
            return;
        };

        let rte = self.rt.lookup(hdr.comt, hdr.dst).copied();

        if hdr.flags & RTE_REQ != 0 && rte.is_some() {
            self.send_rte_reply(p, &ct);
        }

        // The address the reply is about sits in payload word 0; cache a
        // route for it on the ingress link.
        let learned = FAdr::new(self.ps.payload_word(p, 0) as i32);
        if learned.is_unicast() && !self.rt.contains(hdr.comt, learned) {
            self.rt.add_entry(hdr.comt, learned, in_link);
            tracing::debug!(comt = hdr.comt, adr = %learned, link = in_link, "learned route");
        }

        let Some(rte) = rte else {
            // Still no route for the reply's destination: keep flooding.
            let h = self.ps.header_mut(p);
            h.flags = RTE_REQ;
            self.ps.pack(p);
            self.ps.hdr_err_update(p);
            self.multi_send(p, ct, None);
            return;
        };

        let lnk = rte.link();
        let is_router = self.lt.get(lnk).map(|l| l.peer_type) == Some(NodeType::Router);
        if is_router && lnk != in_link && self.qm.enq(p, lnk, ct.qnum, self.now, &self.ps) {
            return;
        }
        self.ps.free(p);
    }

    /// Emits a RTE_REPLY about `p`'s destination back through its ingress
    /// link.
    fn send_rte_reply(&mut self, p: Pkt, ct: &ComtreeEntry) {
        let hdr = *self.ps.header(p);
        let Some(reply) = self.ps.alloc() else {
            self.discards += 1;
            return;
        };

        *self.ps.header_mut(reply) = crate::packet::Header {
            version: FOREST_VERSION,
            leng: (HDR_LENG + 8) as u16,
            typ: PktType::RteReply,
            flags: 0,
            comt: hdr.comt,
            src: self.my_adr,
            dst: hdr.src,
        };
        self.ps.pack(reply);
        self.ps.set_payload_word(reply, 0, hdr.dst.raw() as u32);
        self.ps.hdr_err_update(reply);
        self.ps.pay_err_update(reply);

        let in_link = self.ps.in_link(p);
        if !self.qm.enq(reply, in_link, ct.qnum, self.now, &self.ps) {
            self.discards += 1;
            self.ps.free(reply);
        }
    }

    /// Handles one deferred control packet.
    fn handle_ctl(&mut self, p: Pkt) {
        let hdr = *self.ps.header(p);

        if hdr.typ == PktType::Undef {
            self.drop_pkt(p, "unknown packet type");
            return;
        }

        // Signalling in transit (e.g. client signals to the comtree
        // controller) is forwarded like data.
        if hdr.dst != self.my_adr {
            self.forward(p);
            return;
        }

        if hdr.typ != PktType::NetSig {
            self.drop_pkt(p, "unexpected control type");
            return;
        }
        if !NET_SIG_COMTS.contains(&hdr.comt) {
            self.drop_pkt(p, "signalling outside 100-999");
            return;
        }

        let paylen = (hdr.leng as usize)
            .saturating_sub(OVERHEAD)
            .min(BUF_SIZ - HDR_LENG);
        let cp = match CtlPkt::unpack(&self.ps.buffer(p)[HDR_LENG..HDR_LENG + paylen]) {
            Ok(cp) => cp,
            Err(e) => {
                tracing::debug!("misformatted control packet: {e}");
                self.drop_pkt(p, "misformatted control packet");
                return;
            }
        };

        if cp.rr_type != RrType::Request {
            // Replies are not ours to answer.
            self.ps.free(p);
            return;
        }

        tracing::debug!(%cp, "control request");
        let reply = match self.dispatch_ctl(&cp) {
            Ok(reply) => reply,
            Err(msg) => {
                tracing::debug!(%cp, error = %msg, "control request failed");
                cp.neg_reply(msg)
            }
        };
        self.send_ctl_reply(p, &reply);
    }

    /// Applies one control request to the tables. An `Err` becomes a
    /// negative reply with that text.
    fn dispatch_ctl(&mut self, cp: &CtlPkt) -> Result<CtlPkt, String> {
        let attr = |a: CpAttr, what: &str| cp.attr(a).ok_or_else(|| format!("missing {what}"));

        let mut reply = cp.pos_reply();
        match cp.cp_type {
            CpType::AddIface => {
                let iface = attr(CpAttr::IfaceNum, "interface number")? as u16;
                let ip = std::net::Ipv4Addr::from(attr(CpAttr::LocalIp, "local ip")?);
                let bit = attr(CpAttr::MaxBitRate, "max bit rate")?;
                let pkt = attr(CpAttr::MaxPktRate, "max packet rate")?;

                if !self.ift.add(iface, ip, bit, pkt) {
                    return Err("add iface: cannot add interface".into());
                }
                if let Err(e) = self.ift.setup(iface) {
                    self.ift.remove(iface);
                    return Err(format!("add iface: {e}"));
                }
            }
            CpType::DropIface => {
                let iface = attr(CpAttr::IfaceNum, "interface number")? as u16;
                self.ift.remove(iface);
            }
            CpType::GetIface => {
                let iface = attr(CpAttr::IfaceNum, "interface number")? as u16;
                let entry = self
                    .ift
                    .get(iface)
                    .ok_or("get iface: invalid interface")?;
                reply
                    .set_attr(CpAttr::IfaceNum, iface.into())
                    .set_attr(CpAttr::LocalIp, entry.ip.into())
                    .set_attr(CpAttr::MaxBitRate, entry.max_bit_rate)
                    .set_attr(CpAttr::MaxPktRate, entry.max_pkt_rate);
            }
            CpType::ModIface => {
                let iface = attr(CpAttr::IfaceNum, "interface number")? as u16;
                if !self.ift.is_valid(iface) {
                    return Err("mod iface: invalid interface".into());
                }
                let ok = self.ift.modify(
                    iface,
                    cp.attr(CpAttr::MaxBitRate),
                    cp.attr(CpAttr::MaxPktRate),
                    &self.lt,
                );
                if !ok {
                    return Err("mod iface: invalid rate".into());
                }
            }
            CpType::AddLink => {
                let lnk = attr(CpAttr::LinkNum, "link number")? as u16;
                let iface = attr(CpAttr::IfaceNum, "interface number")? as u16;
                let type_code = attr(CpAttr::PeerType, "peer type")?;
                let peer_type =
                    NodeType::from_code(type_code).ok_or("add link: bad peer type")?;
                let peer_ip = std::net::Ipv4Addr::from(attr(CpAttr::PeerIp, "peer ip")?);
                let peer_adr = FAdr::new(attr(CpAttr::PeerAdr, "peer address")? as i32);
                let bit_rate = cp.attr(CpAttr::BitRate).unwrap_or(MIN_BIT_RATE);
                let pkt_rate = cp.attr(CpAttr::PktRate).unwrap_or(MIN_PKT_RATE);

                if !self.ift.is_valid(iface) {
                    return Err("add link: invalid interface".into());
                }
                if !self
                    .lt
                    .add(lnk, iface, peer_type, peer_ip, peer_adr, bit_rate, pkt_rate)
                {
                    return Err("add link: cannot add link".into());
                }
                if !self.ift.within_capacity(iface, &self.lt) {
                    self.lt.remove(lnk);
                    return Err("add link: interface capacity exceeded".into());
                }
            }
            CpType::DropLink => {
                let lnk = attr(CpAttr::LinkNum, "link number")? as u16;
                if !self.lt.remove(lnk) {
                    return Err("drop link: cannot drop link".into());
                }
            }
            CpType::GetLink => {
                let lnk = attr(CpAttr::LinkNum, "link number")? as u16;
                let entry = self.lt.get(lnk).ok_or("get link: invalid link number")?;
                reply
                    .set_attr(CpAttr::LinkNum, lnk.into())
                    .set_attr(CpAttr::IfaceNum, entry.iface.into())
                    .set_attr(CpAttr::PeerIp, entry.peer_ip.into())
                    .set_attr(CpAttr::PeerType, entry.peer_type.code())
                    .set_attr(CpAttr::PeerPort, entry.peer_port.into())
                    .set_attr(CpAttr::PeerAdr, entry.peer_adr.raw() as u32)
                    .set_attr(CpAttr::PeerDest, entry.peer_dest.raw() as u32)
                    .set_attr(CpAttr::BitRate, entry.bit_rate)
                    .set_attr(CpAttr::PktRate, entry.pkt_rate);
            }
            CpType::ModLink => {
                let lnk = attr(CpAttr::LinkNum, "link number")? as u16;
                if self.lt.get(lnk).is_none() {
                    return Err("mod link: invalid link number".into());
                }

                let peer_type = match cp.attr(CpAttr::PeerType) {
                    Some(code) => {
                        Some(NodeType::from_code(code).ok_or("mod link: bad peer type")?)
                    }
                    None => None,
                };
                let peer_port = match cp.attr(CpAttr::PeerPort) {
                    Some(port) => {
                        Some(u16::try_from(port).map_err(|_| "mod link: bad peer port")?)
                    }
                    None => None,
                };
                let peer_dest = match cp.attr(CpAttr::PeerDest) {
                    Some(raw) => {
                        let dest = FAdr::new(raw as i32);
                        if !dest.is_unicast() {
                            return Err("mod link: bad peer dest".into());
                        }
                        Some(dest)
                    }
                    None => None,
                };
                if let Some(rate) = cp.attr(CpAttr::BitRate) {
                    if !(MIN_BIT_RATE..=MAX_BIT_RATE).contains(&rate) {
                        return Err("mod link: bit rate out of range".into());
                    }
                }
                if let Some(rate) = cp.attr(CpAttr::PktRate) {
                    if !(MIN_PKT_RATE..=MAX_PKT_RATE).contains(&rate) {
                        return Err("mod link: packet rate out of range".into());
                    }
                }

                let entry = self.lt.get_mut(lnk).ok_or("mod link: invalid link number")?;
                if let Some(t) = peer_type {
                    entry.peer_type = t;
                }
                if let Some(port) = peer_port {
                    entry.peer_port = port;
                }
                if let Some(dest) = peer_dest {
                    entry.peer_dest = dest;
                }
                if let Some(rate) = cp.attr(CpAttr::BitRate) {
                    entry.bit_rate = rate;
                }
                if let Some(rate) = cp.attr(CpAttr::PktRate) {
                    entry.pkt_rate = rate;
                }
            }
            CpType::AddComtree => {
                let comt = attr(CpAttr::ComtreeNum, "comtree number")?;
                if !self.ctt.add_entry(comt) {
                    return Err("add comtree: cannot add comtree".into());
                }
            }
            CpType::DropComtree => {
                let comt = attr(CpAttr::ComtreeNum, "comtree number")?;
                if !self.ctt.remove_entry(comt) {
                    return Err("drop comtree: cannot drop comtree".into());
                }
            }
            CpType::GetComtree => {
                let comt = attr(CpAttr::ComtreeNum, "comtree number")?;
                let entry = self.ctt.lookup(comt).ok_or("get comtree: invalid comtree")?;
                reply
                    .set_attr(CpAttr::ComtreeNum, comt)
                    .set_attr(CpAttr::CoreFlag, entry.core_flag.into())
                    .set_attr(CpAttr::ParentLink, entry.parent.into())
                    .set_attr(CpAttr::QueueNum, entry.qnum.into());
            }
            CpType::ModComtree => {
                let comt = attr(CpAttr::ComtreeNum, "comtree number")?;
                let old = *self
                    .ctt
                    .lookup(comt)
                    .ok_or("modify comtree: invalid comtree")?;

                {
                    let entry = self
                        .ctt
                        .lookup_mut(comt)
                        .ok_or("modify comtree: invalid comtree")?;
                    if let Some(flag) = cp.attr(CpAttr::CoreFlag) {
                        entry.core_flag = flag != 0;
                    }
                    if let Some(parent) = cp.attr(CpAttr::ParentLink) {
                        entry.parent = parent as u16;
                    }
                    if let Some(qnum) = cp.attr(CpAttr::QueueNum) {
                        entry.qnum = qnum as u16;
                    }
                }

                if !self.ctt.consistent(comt, &self.lt) {
                    if let Some(entry) = self.ctt.lookup_mut(comt) {
                        *entry = old;
                    }
                    return Err("modify comtree: inconsistent entry".into());
                }
            }
            CpType::AddRoute => {
                let comt = attr(CpAttr::ComtreeNum, "comtree number")?;
                let adr = FAdr::new(attr(CpAttr::DestAdr, "destination")? as i32);
                let lnk = attr(CpAttr::LinkNum, "link number")? as u16;

                if lnk != 0 && !self.ctt.in_comt(comt, lnk) {
                    return Err("add route: link not in comtree".into());
                }
                if !self.rt.add_entry(comt, adr, lnk) {
                    return Err("add route: cannot add route".into());
                }
                if let Some(qnum) = cp.attr(CpAttr::QueueNum) {
                    self.rt.set_qnum(comt, adr, qnum as u16);
                }
            }
            CpType::DropRoute => {
                let comt = attr(CpAttr::ComtreeNum, "comtree number")?;
                let adr = FAdr::new(attr(CpAttr::DestAdr, "destination")? as i32);
                if !self.rt.remove_entry(comt, adr) {
                    return Err("drop route: invalid route".into());
                }
            }
            CpType::GetRoute => {
                let comt = attr(CpAttr::ComtreeNum, "comtree number")?;
                let adr = FAdr::new(attr(CpAttr::DestAdr, "destination")? as i32);
                let entry = self.rt.lookup(comt, adr).ok_or("get route: invalid route")?;
                reply
                    .set_attr(CpAttr::ComtreeNum, comt)
                    .set_attr(CpAttr::DestAdr, adr.raw() as u32)
                    .set_attr(CpAttr::LinkNum, entry.link().into())
                    .set_attr(CpAttr::QueueNum, entry.qnum.into());
            }
            CpType::ModRoute => {
                let comt = attr(CpAttr::ComtreeNum, "comtree number")?;
                let adr = FAdr::new(attr(CpAttr::DestAdr, "destination")? as i32);
                if !self.rt.contains(comt, adr) {
                    return Err("mod route: invalid route".into());
                }
                if let Some(lnk) = cp.attr(CpAttr::LinkNum) {
                    if !self.rt.set_link(comt, adr, lnk as u16) {
                        return Err("mod route: cannot set link".into());
                    }
                }
                if let Some(qnum) = cp.attr(CpAttr::QueueNum) {
                    self.rt.set_qnum(comt, adr, qnum as u16);
                }
            }
        }

        Ok(reply)
    }

    /// Sends a control reply by rewriting the request packet in place and
    /// queueing it back out of its ingress link.
    fn send_ctl_reply(&mut self, p: Pkt, reply: &CtlPkt) {
        let hdr = *self.ps.header(p);
        let paylen = reply.packed_len();

        {
            let buf = self.ps.buffer_mut(p);
            reply.pack(&mut buf[HDR_LENG..HDR_LENG + paylen]);
        }

        let h = self.ps.header_mut(p);
        h.leng = (HDR_LENG + paylen + 4) as u16;
        h.flags = 0;
        h.dst = hdr.src;
        h.src = self.my_adr;
        self.ps.pack(p);
        self.ps.hdr_err_update(p);
        self.ps.pay_err_update(p);

        let qnum = self.ctt.lookup(hdr.comt).map(|e| e.qnum).unwrap_or(1);
        let in_link = self.ps.in_link(p);
        if !self.qm.enq(p, in_link, qnum, self.now, &self.ps) {
            self.discards += 1;
            self.ps.free(p);
        }
    }

    /// Transmits a dequeued packet out of its link's interface.
    ///
    /// A peer without a learned port silently swallows the packet; a send
    /// failure that is not back-pressure is fatal.
    fn send(&mut self, p: Pkt, lnk: u16) -> Result<()> {
        let Some((peer_ip, peer_port, iface)) =
            self.lt.get(lnk).map(|l| (l.peer_ip, l.peer_port, l.iface))
        else {
            self.drop_pkt(p, "send on dead link");
            return Ok(());
        };
        if peer_port == 0 {
            self.drop_pkt(p, "peer port unknown");
            return Ok(());
        }

        let dest = SocketAddrV4::new(peer_ip, peer_port);
        let leng = (self.ps.header(p).leng as usize).min(BUF_SIZ);

        let mut attempts = 0;
        loop {
            match self.ift.send_to(iface, &self.ps.buffer(p)[..leng], dest) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts < 10 => {
                    attempts += 1;
                }
                Err(e) => {
                    // The host can no longer forward; give up loudly.
                    return Err(e).with_context(|| format!("sendto failed on link {lnk}"));
                }
            }
        }

        if tracing::enabled!(target: "wire", Level::TRACE) {
            let bytes = &self.ps.buffer(p)[..leng];
            tracing::trace!(target: "wire", link = lnk, dst = %dest, tx = %hex::encode(bytes));
        }

        self.lt.post_out(lnk, leng as u16);
        self.ps.free(p);

        Ok(())
    }
}
