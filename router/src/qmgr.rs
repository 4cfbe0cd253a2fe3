use crate::packet::true_pkt_leng;
use crate::store::{PacketStore, Pkt};
use crate::time::{DeadlineHeap, Micros};
use std::collections::{HashMap, VecDeque};

/// Default per-queue quantum in bytes.
pub const DEFAULT_QUANTUM: u32 = 100;

#[derive(Debug)]
struct QueueState {
    quantum: u32,
    /// Unused credits; goes negative when a packet's framing overhead
    /// exceeds what the admission check charged for.
    credits: i64,
    pkts: VecDeque<Pkt>,
    npkts: u32,
    nbytes: u32,
    pkt_lim: u32,
    byte_lim: u32,
}

#[derive(Debug, Default)]
struct LinkState {
    /// Round-robin schedule of non-empty queues; the front is the current
    /// queue.
    sched: VecDeque<u16>,
    npkts: u32,
    nbytes: u32,
}

/// Per-link WDRR scheduler over multiple queues.
///
/// Each link owns a round-robin list of its non-empty queues; a queue may
/// send `quantum` new bytes per visit. Two heaps gate transmission by
/// circular microsecond deadlines: `active` holds links with queued
/// packets, `vactive` links that recently sent and are still inside the
/// inter-packet gap their rates impose. A packet arriving for a virtually
/// active link inherits that deadline instead of sending immediately,
/// which is what makes the configured rates hold across idle gaps.
pub struct QueueManager {
    /// Cap on queued packets per link, across all its queues.
    link_cap: u32,
    default_pkt_lim: u32,
    default_byte_lim: u32,
    queues: HashMap<(u16, u16), QueueState>,
    links: Vec<LinkState>,
    active: DeadlineHeap,
    vactive: DeadlineHeap,
}

impl QueueManager {
    pub fn new(max_link: u16, link_cap: u32, queue_pkt_lim: u32) -> Self {
        Self {
            link_cap,
            default_pkt_lim: queue_pkt_lim,
            default_byte_lim: queue_pkt_lim * 1600,
            queues: HashMap::new(),
            links: (0..=max_link).map(|_| LinkState::default()).collect(),
            active: DeadlineHeap::new(max_link),
            vactive: DeadlineHeap::new(max_link),
        }
    }

    fn queue_mut(&mut self, lnk: u16, q: u16) -> &mut QueueState {
        let (pkt_lim, byte_lim) = (self.default_pkt_lim, self.default_byte_lim);

        self.queues.entry((lnk, q)).or_insert_with(|| QueueState {
            quantum: DEFAULT_QUANTUM,
            credits: 0,
            pkts: VecDeque::new(),
            npkts: 0,
            nbytes: 0,
            pkt_lim,
            byte_lim,
        })
    }

    pub fn quantum(&self, lnk: u16, q: u16) -> u32 {
        self.queues
            .get(&(lnk, q))
            .map(|qs| qs.quantum)
            .unwrap_or(DEFAULT_QUANTUM)
    }

    pub fn set_quantum(&mut self, lnk: u16, q: u16, quantum: u32) {
        self.queue_mut(lnk, q).quantum = quantum.max(1);
    }

    pub fn set_limits(&mut self, lnk: u16, q: u16, pkt_lim: u32, byte_lim: u32) {
        let qs = self.queue_mut(lnk, q);
        qs.pkt_lim = pkt_lim;
        qs.byte_lim = byte_lim;
    }

    /// Packets queued for `lnk` across all its queues.
    pub fn qlen_pkts(&self, lnk: u16) -> u32 {
        self.links[lnk as usize].npkts
    }

    pub fn qlen_bytes(&self, lnk: u16) -> u32 {
        self.links[lnk as usize].nbytes
    }

    pub fn queue_pkts(&self, lnk: u16, q: u16) -> u32 {
        self.queues.get(&(lnk, q)).map(|qs| qs.npkts).unwrap_or(0)
    }

    /// Total packets queued across every link.
    pub fn total_pkts(&self) -> u32 {
        self.links.iter().map(|l| l.npkts).sum()
    }

    /// Appends `p` to queue `q` of `lnk`.
    ///
    /// False when the link or queue is at its limit; the caller keeps
    /// ownership of the packet and must free it.
    pub fn enq(&mut self, p: Pkt, lnk: u16, q: u16, now: Micros, store: &PacketStore) -> bool {
        let pleng = true_pkt_leng(store.header(p).leng);

        if self.links[lnk as usize].npkts >= self.link_cap {
            return false;
        }

        let default_quantum = self.quantum(lnk, q);
        let qs = self.queue_mut(lnk, q);
        if qs.npkts >= qs.pkt_lim || qs.nbytes + pleng > qs.byte_lim {
            return false;
        }

        if qs.pkts.is_empty() {
            // Queue becomes schedulable; if it is the only one it is also
            // the current queue and starts a fresh quantum.
            let link = &mut self.links[lnk as usize];
            link.sched.push_back(q);

            if link.sched.len() == 1 {
                let qs = self.queue_mut(lnk, q);
                qs.credits = default_quantum as i64;

                let deadline = if self.vactive.contains(lnk) {
                    let d = self.vactive.key(lnk);
                    self.vactive.remove(lnk);
                    // A deadline already in the past collapses to `now`.
                    if now.at_or_after(d) {
                        now
                    } else {
                        d
                    }
                } else {
                    now
                };
                self.active.insert(lnk, deadline);
            } else {
                self.queue_mut(lnk, q).credits = 0;
            }
        }

        let qs = self.queue_mut(lnk, q);
        qs.pkts.push_back(p);
        qs.npkts += 1;
        qs.nbytes += pleng;

        let link = &mut self.links[lnk as usize];
        link.npkts += 1;
        link.nbytes += pleng;

        true
    }

    /// Removes and returns the next packet for `lnk`.
    ///
    /// Walks the round-robin schedule, topping up each visited queue's
    /// credits by its quantum, until the current queue can afford its head
    /// packet. Must only be called for a link reported by
    /// [`next_ready`](Self::next_ready).
    pub fn deq(&mut self, lnk: u16, store: &PacketStore, bit_rate: u32, min_delta: u32) -> Option<Pkt> {
        let mut q = *self.links[lnk as usize].sched.front()?;

        loop {
            let qs = self.queues.get(&(lnk, q))?;
            let head = *qs.pkts.front()?;
            if qs.credits >= store.header(head).leng as i64 {
                break;
            }

            let link = &mut self.links[lnk as usize];
            link.sched.rotate_left(1);
            q = *link.sched.front()?;
            let quantum = self.quantum(lnk, q);
            self.queue_mut(lnk, q).credits += quantum as i64;
        }

        let qs = self.queues.get_mut(&(lnk, q))?;
        let p = qs.pkts.pop_front()?;
        let pleng = true_pkt_leng(store.header(p).leng);

        qs.credits -= pleng as i64;
        qs.npkts -= 1;
        qs.nbytes -= pleng;
        let emptied = qs.pkts.is_empty();

        let link = &mut self.links[lnk as usize];
        link.npkts -= 1;
        link.nbytes -= pleng;

        if emptied {
            link.sched.pop_front();
            if let Some(&next) = link.sched.front() {
                let quantum = self.quantum(lnk, next);
                self.queue_mut(lnk, next).credits += quantum as i64;
            }
        }

        // Push the link's deadline out by the packet's transmission time,
        // but never closer than the packet-rate floor.
        let delta = (pleng * 8000 / bit_rate.max(1)).max(min_delta);
        let deadline = self.active.key(lnk).add(delta);

        if self.links[lnk as usize].sched.is_empty() {
            self.active.remove(lnk);
            self.vactive.insert(lnk, deadline);
        } else {
            self.active.change_key(lnk, deadline);
        }

        Some(p)
    }

    /// The next link whose deadline has arrived, if any.
    ///
    /// Also retires `vactive` links whose inter-packet gap has elapsed, so
    /// stale deadlines never linger past half the circular space.
    pub fn next_ready(&mut self, now: Micros) -> Option<u16> {
        while let Some((lnk, deadline)) = self.vactive.peek() {
            if !now.at_or_after(deadline) {
                break;
            }
            self.vactive.remove(lnk);
        }

        let (lnk, deadline) = self.active.peek()?;
        now.at_or_after(deadline).then_some(lnk)
    }

    #[cfg(test)]
    fn is_active(&self, lnk: u16) -> bool {
        self.active.contains(lnk)
    }

    #[cfg(test)]
    fn is_vactive(&self, lnk: u16) -> bool {
        self.vactive.contains(lnk)
    }
}
