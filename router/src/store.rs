use crate::packet::{Header, HDR_LENG};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Size of a packet buffer in bytes.
pub const BUF_SIZ: usize = 1600;

pub type Buffer = [u8; BUF_SIZ];

/// Handle to a packet descriptor inside a [`PacketStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pkt(u32);

impl std::fmt::Display for Pkt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
struct Descriptor {
    hdr: Header,
    buf: u32,
    /// Link the packet arrived on; 0 for locally generated packets.
    in_link: u16,
    /// Number of bytes read from the wire for this packet.
    io_bytes: u16,
    tun_src: Option<SocketAddrV4>,
}

/// A fixed-capacity pool of packet descriptors and byte buffers.
///
/// A descriptor exclusively owns its header fields. Buffers are shared:
/// [`PacketStore::clone_pkt`] hands out a second descriptor referencing the
/// same bytes and bumps the buffer's reference count. A buffer returns to
/// the free list exactly when its count reaches zero.
///
/// Free lists are LIFO so that recently-used descriptors and buffers are
/// reused while still warm in cache.
pub struct PacketStore {
    descriptors: Vec<Descriptor>,
    buffers: Vec<Box<Buffer>>,
    refs: Vec<u16>,
    free_pkts: Vec<u32>,
    free_bufs: Vec<u32>,
}

impl PacketStore {
    /// Creates a store with `num_pkts` descriptors and `num_bufs` buffers.
    ///
    /// `num_pkts >= num_bufs` is the useful configuration: cloned packets
    /// consume a descriptor but no buffer.
    pub fn new(num_pkts: usize, num_bufs: usize) -> Self {
        Self {
            descriptors: (0..num_pkts).map(|_| Descriptor::default()).collect(),
            buffers: (0..num_bufs).map(|_| Box::new([0; BUF_SIZ])).collect(),
            refs: vec![0; num_bufs],
            free_pkts: (0..num_pkts as u32).rev().collect(),
            free_bufs: (0..num_bufs as u32).rev().collect(),
        }
    }

    /// Number of descriptors currently in use.
    pub fn live_pkts(&self) -> usize {
        self.descriptors.len() - self.free_pkts.len()
    }

    /// Number of buffers currently in use.
    pub fn live_bufs(&self) -> usize {
        self.buffers.len() - self.free_bufs.len()
    }

    /// Allocates a fresh descriptor with a fresh buffer.
    ///
    /// Header fields are undefined until [`unpack`](Self::unpack) or direct
    /// writes. Returns `None` when either pool is exhausted; the caller must
    /// treat that as a (non-fatal) drop.
    pub fn alloc(&mut self) -> Option<Pkt> {
        if self.free_pkts.is_empty() || self.free_bufs.is_empty() {
            return None;
        }

        let p = self.free_pkts.pop()?;
        let b = self.free_bufs.pop()?;

        self.refs[b as usize] = 1;
        self.descriptors[p as usize] = Descriptor {
            buf: b,
            ..Descriptor::default()
        };

        Some(Pkt(p))
    }

    /// Allocates a new descriptor sharing `p`'s buffer.
    ///
    /// The new header starts out as a copy of `p`'s current header.
    pub fn clone_pkt(&mut self, p: Pkt) -> Option<Pkt> {
        let p1 = self.free_pkts.pop()?;

        let src = &self.descriptors[p.0 as usize];
        let buf = src.buf;
        let copy = Descriptor {
            hdr: src.hdr,
            buf,
            in_link: src.in_link,
            io_bytes: src.io_bytes,
            tun_src: src.tun_src,
        };

        self.refs[buf as usize] += 1;
        self.descriptors[p1 as usize] = copy;

        Some(Pkt(p1))
    }

    /// Allocates a new descriptor with a private copy of `p`'s bytes.
    ///
    /// The new header is unpacked from the copied buffer, so later mutation
    /// of `p` cannot leak into the copy.
    pub fn full_copy(&mut self, p: Pkt) -> Option<Pkt> {
        let p1 = self.alloc()?;

        let len = (self.header(p).leng as usize).min(BUF_SIZ);
        let src_buf = self.descriptors[p.0 as usize].buf as usize;
        let dst_buf = self.descriptors[p1.0 as usize].buf as usize;

        if src_buf != dst_buf {
            let (a, b) = if src_buf < dst_buf {
                let (lo, hi) = self.buffers.split_at_mut(dst_buf);
                (&lo[src_buf], &mut hi[0])
            } else {
                let (lo, hi) = self.buffers.split_at_mut(src_buf);
                (&hi[0], &mut lo[dst_buf])
            };
            b[..len].copy_from_slice(&a[..len]);
        }

        let src = &self.descriptors[p.0 as usize];
        let (in_link, io_bytes, tun_src) = (src.in_link, src.io_bytes, src.tun_src);
        let dst = &mut self.descriptors[p1.0 as usize];
        dst.in_link = in_link;
        dst.io_bytes = io_bytes;
        dst.tun_src = tun_src;

        self.unpack(p1);

        Some(p1)
    }

    /// Releases `p`'s descriptor and drops its buffer reference.
    pub fn free(&mut self, p: Pkt) {
        let b = self.descriptors[p.0 as usize].buf;
        debug_assert!(self.refs[b as usize] > 0, "freeing packet with dead buffer");

        self.free_pkts.push(p.0);

        self.refs[b as usize] -= 1;
        if self.refs[b as usize] == 0 {
            self.free_bufs.push(b);
        }
    }

    pub fn header(&self, p: Pkt) -> &Header {
        &self.descriptors[p.0 as usize].hdr
    }

    pub fn header_mut(&mut self, p: Pkt) -> &mut Header {
        &mut self.descriptors[p.0 as usize].hdr
    }

    pub fn buffer(&self, p: Pkt) -> &Buffer {
        &self.buffers[self.descriptors[p.0 as usize].buf as usize]
    }

    pub fn buffer_mut(&mut self, p: Pkt) -> &mut Buffer {
        &mut self.buffers[self.descriptors[p.0 as usize].buf as usize]
    }

    /// 32-bit big-endian payload word `i` (word 0 starts right after the
    /// header).
    pub fn payload_word(&self, p: Pkt, i: usize) -> u32 {
        let buf = self.buffer(p);
        let at = HDR_LENG + 4 * i;

        u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    pub fn set_payload_word(&mut self, p: Pkt, i: usize, word: u32) {
        let buf = self.buffer_mut(p);
        let at = HDR_LENG + 4 * i;

        buf[at..at + 4].copy_from_slice(&word.to_be_bytes());
    }

    /// Writes the in-memory header into the buffer's wire bytes.
    pub fn pack(&mut self, p: Pkt) {
        let hdr = self.descriptors[p.0 as usize].hdr;
        let buf = self.buffer_mut(p);
        let head: &mut [u8; HDR_LENG] = (&mut buf[..HDR_LENG]).try_into().expect("buffer > header");

        hdr.pack(head);
    }

    /// Refreshes the in-memory header from the buffer's wire bytes.
    pub fn unpack(&mut self, p: Pkt) {
        let buf = self.buffer(p);
        let head: &[u8; HDR_LENG] = (&buf[..HDR_LENG]).try_into().expect("buffer > header");
        let hdr = Header::unpack(head);

        self.descriptors[p.0 as usize].hdr = hdr;
    }

    // The checksum entry points are called after every header or payload
    // mutation that will hit the wire. The reference protocol does not yet
    // define the checksum algorithm, so both words are written as zero and
    // accepted unconditionally on receive.

    pub fn hdr_err_update(&mut self, p: Pkt) {
        let buf = self.buffer_mut(p);
        buf[16..HDR_LENG].fill(0);
    }

    pub fn pay_err_update(&mut self, p: Pkt) {
        let leng = self.header(p).leng as usize;
        if leng < 4 || leng > BUF_SIZ {
            return;
        }

        let buf = self.buffer_mut(p);
        buf[leng - 4..leng].fill(0);
    }

    pub fn hdr_err_check(&self, _p: Pkt) -> bool {
        true
    }

    pub fn pay_err_check(&self, _p: Pkt) -> bool {
        true
    }

    pub fn in_link(&self, p: Pkt) -> u16 {
        self.descriptors[p.0 as usize].in_link
    }

    pub fn set_in_link(&mut self, p: Pkt, lnk: u16) {
        self.descriptors[p.0 as usize].in_link = lnk;
    }

    pub fn io_bytes(&self, p: Pkt) -> u16 {
        self.descriptors[p.0 as usize].io_bytes
    }

    pub fn set_io_bytes(&mut self, p: Pkt, n: u16) {
        self.descriptors[p.0 as usize].io_bytes = n;
    }

    /// IP address and UDP port the packet's datagram came from.
    pub fn tun_src(&self, p: Pkt) -> Option<SocketAddrV4> {
        self.descriptors[p.0 as usize].tun_src
    }

    pub fn set_tun_src(&mut self, p: Pkt, ip: Ipv4Addr, port: u16) {
        self.descriptors[p.0 as usize].tun_src = Some(SocketAddrV4::new(ip, port));
    }

    #[cfg(test)]
    fn ref_count(&self, p: Pkt) -> u16 {
        self.refs[self.descriptors[p.0 as usize].buf as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::FAdr;
    use crate::packet::PktType;

    #[test]
    fn alloc_until_exhaustion_then_none() {
        let mut store = PacketStore::new(2, 2);

        assert!(store.alloc().is_some());
        assert!(store.alloc().is_some());
        assert!(store.alloc().is_none());
        assert_eq!(store.live_pkts(), 2);
    }

    #[test]
    fn failed_alloc_leaves_store_untouched() {
        let mut store = PacketStore::new(1, 1);
        let p = store.alloc().unwrap();

        assert!(store.alloc().is_none());
        assert_eq!(store.live_pkts(), 1);
        assert_eq!(store.live_bufs(), 1);

        store.free(p);
        assert_eq!(store.live_pkts(), 0);
        assert_eq!(store.live_bufs(), 0);
    }

    #[test]
    fn clone_shares_the_buffer_and_bumps_the_refcount() {
        let mut store = PacketStore::new(4, 4);
        let p = store.alloc().unwrap();
        store.buffer_mut(p)[100] = 0xab;

        let p1 = store.clone_pkt(p).unwrap();

        assert_eq!(store.ref_count(p), 2);
        assert_eq!(store.buffer(p1)[100], 0xab);
        assert_eq!(store.live_bufs(), 1);

        store.free(p);
        assert_eq!(store.ref_count(p1), 1);
        assert_eq!(store.live_bufs(), 1);

        store.free(p1);
        assert_eq!(store.live_bufs(), 0);
        assert_eq!(store.live_pkts(), 0);
    }

    #[test]
    fn clone_needs_a_descriptor_but_no_buffer() {
        let mut store = PacketStore::new(3, 1);
        let p = store.alloc().unwrap();

        assert!(store.clone_pkt(p).is_some());
        assert!(store.clone_pkt(p).is_some());
        assert!(store.clone_pkt(p).is_none());
    }

    #[test]
    fn full_copy_is_isolated_from_the_original() {
        let mut store = PacketStore::new(4, 4);
        let p = store.alloc().unwrap();

        *store.header_mut(p) = Header {
            version: 1,
            leng: 32,
            typ: PktType::ClientData,
            flags: 0,
            comt: 7,
            src: FAdr::unicast(1, 1),
            dst: FAdr::unicast(1, 2),
        };
        store.pack(p);
        store.set_payload_word(p, 0, 0xdead_beef);

        let p1 = store.full_copy(p).unwrap();

        assert_eq!(store.ref_count(p1), 1);
        assert_eq!(store.header(p1).comt, 7);
        assert_eq!(store.payload_word(p1, 0), 0xdead_beef);

        // Mutating the original must not affect the copy.
        store.set_payload_word(p, 0, 0);
        assert_eq!(store.payload_word(p1, 0), 0xdead_beef);
    }

    #[test]
    fn random_churn_preserves_pool_invariants() {
        use rand::prelude::*;

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut store = PacketStore::new(64, 32);
        let mut live: Vec<Pkt> = Vec::new();

        for _ in 0..10_000 {
            match rng.gen_range(0..3) {
                0 => {
                    if let Some(p) = store.alloc() {
                        live.push(p);
                    }
                }
                1 => {
                    if let Some(&p) = live.choose(&mut rng) {
                        if let Some(c) = store.clone_pkt(p) {
                            live.push(c);
                        }
                    }
                }
                _ => {
                    if !live.is_empty() {
                        let at = rng.gen_range(0..live.len());
                        store.free(live.swap_remove(at));
                    }
                }
            }

            assert_eq!(store.live_pkts(), live.len());
            assert!(store.live_bufs() <= live.len().min(32));
            assert_eq!(store.live_bufs() == 0, live.is_empty());
            for p in &live {
                assert!(store.ref_count(*p) > 0);
            }
        }
    }

    #[test]
    fn free_lists_are_lifo() {
        let mut store = PacketStore::new(4, 4);
        let a = store.alloc().unwrap();
        let b = store.alloc().unwrap();

        store.free(b);
        store.free(a);

        // Most recently freed comes back first.
        assert_eq!(store.alloc().unwrap(), a);
        assert_eq!(store.alloc().unwrap(), b);
    }
}
