//! In-band control protocol: NET_SIG requests against the four tables.

use forest_router::packet::{Header, HDR_LENG, FOREST_VERSION};
use forest_router::{
    ConfigFiles, CpAttr, CpType, CtlPkt, FAdr, Limits, PktType, Router, RrType, FOREST_PORT,
};
use std::net::{Ipv4Addr, SocketAddrV4};

const IFACES: &str = "\
1
1 127.0.0.1 400000 200000
";

const LINKS: &str = "\
3
1 1 10.0.0.2 1.10 client 1000 1000
2 1 10.0.0.3 1.1 router 10000 5000
3 1 10.0.0.4 2.1 router 10000 5000
";

const COMTREES: &str = "\
2
200 0 3 1 2000 1,2,3 3
1000 0 0 1 100 2,3 -
";

const ROUTES: &str = "0\n";

fn router() -> Router {
    let mut router = Router::new(FAdr::unicast(1, 2), Limits::default());
    router
        .load(ConfigFiles {
            interfaces: IFACES,
            links: LINKS,
            comtrees: COMTREES,
            routes: ROUTES,
        })
        .unwrap();
    router
}

/// Wraps a control packet in a NET_SIG datagram.
fn net_sig(cp: &CtlPkt, comt: u32, src: FAdr, dst: FAdr) -> Vec<u8> {
    let paylen = cp.packed_len();
    let leng = HDR_LENG + paylen + 4;
    let mut bytes = vec![0u8; leng];

    let header = Header {
        version: FOREST_VERSION,
        leng: leng as u16,
        typ: PktType::NetSig,
        flags: 0,
        comt,
        src,
        dst,
    };
    let head: &mut [u8; HDR_LENG] = (&mut bytes[..HDR_LENG]).try_into().unwrap();
    header.pack(head);
    cp.pack(&mut bytes[HDR_LENG..HDR_LENG + paylen]);

    bytes
}

/// Sends `cp` from the trusted router on link 2 and returns the decoded
/// reply.
fn roundtrip(router: &mut Router, cp: &CtlPkt) -> CtlPkt {
    let bytes = net_sig(cp, 200, FAdr::unicast(1, 1), FAdr::unicast(1, 2));
    router.inject(
        &bytes,
        1,
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), FOREST_PORT),
    );
    router.drain_control();

    let mut idle = 0;
    let (lnk, reply) = loop {
        if let Some(item) = router.poll_egress() {
            break item;
        }
        idle += 1;
        assert!(idle < 100, "no control reply");
        router.advance_clock(1_000);
    };
    assert_eq!(lnk, 2, "reply must leave through the ingress link");

    let head: &[u8; HDR_LENG] = reply[..HDR_LENG].try_into().unwrap();
    let header = Header::unpack(head);
    assert_eq!(header.typ, PktType::NetSig);
    assert_eq!(header.dst, FAdr::unicast(1, 1));
    assert_eq!(header.src, FAdr::unicast(1, 2));

    CtlPkt::unpack(&reply[HDR_LENG..reply.len() - 4]).unwrap()
}

#[test]
fn add_comtree_request_creates_an_entry() {
    let mut router = router();

    let mut cp = CtlPkt::new(CpType::AddComtree, RrType::Request, 31);
    cp.set_attr(CpAttr::ComtreeNum, 500);

    let reply = roundtrip(&mut router, &cp);

    assert_eq!(reply.rr_type, RrType::PosReply);
    assert_eq!(reply.seq_num, 31);
    assert!(router.comtrees().lookup(500).is_some());
}

#[test]
fn get_link_reports_the_entry() {
    let mut router = router();

    let mut cp = CtlPkt::new(CpType::GetLink, RrType::Request, 7);
    cp.set_attr(CpAttr::LinkNum, 3);

    let reply = roundtrip(&mut router, &cp);

    assert_eq!(reply.rr_type, RrType::PosReply);
    assert_eq!(
        reply.attr(CpAttr::PeerIp),
        Some(u32::from(Ipv4Addr::new(10, 0, 0, 4)))
    );
    assert_eq!(reply.attr(CpAttr::BitRate), Some(10_000));
    assert_eq!(reply.attr(CpAttr::PeerPort), Some(u32::from(FOREST_PORT)));
}

#[test]
fn unknown_link_yields_a_negative_reply() {
    let mut router = router();

    let mut cp = CtlPkt::new(CpType::GetLink, RrType::Request, 8);
    cp.set_attr(CpAttr::LinkNum, 29);

    let reply = roundtrip(&mut router, &cp);

    assert_eq!(reply.rr_type, RrType::NegReply);
    assert!(reply.err_msg.unwrap().contains("invalid link"));
}

#[test]
fn missing_attribute_yields_a_negative_reply() {
    let mut router = router();

    let cp = CtlPkt::new(CpType::GetLink, RrType::Request, 9);

    let reply = roundtrip(&mut router, &cp);

    assert_eq!(reply.rr_type, RrType::NegReply);
    assert!(reply.err_msg.unwrap().contains("missing"));
}

#[test]
fn mod_comtree_rejects_inconsistent_parent() {
    let mut router = router();

    // Link 1 is a client link and cannot be a comtree parent.
    let mut cp = CtlPkt::new(CpType::ModComtree, RrType::Request, 10);
    cp.set_attr(CpAttr::ComtreeNum, 200);
    cp.set_attr(CpAttr::ParentLink, 1);

    let reply = roundtrip(&mut router, &cp);

    assert_eq!(reply.rr_type, RrType::NegReply);
    assert_eq!(router.comtrees().lookup(200).unwrap().parent, 3);
}

#[test]
fn mod_comtree_applies_a_consistent_change() {
    let mut router = router();

    let mut cp = CtlPkt::new(CpType::ModComtree, RrType::Request, 11);
    cp.set_attr(CpAttr::ComtreeNum, 200);
    cp.set_attr(CpAttr::QueueNum, 4);

    let reply = roundtrip(&mut router, &cp);

    assert_eq!(reply.rr_type, RrType::PosReply);
    assert_eq!(router.comtrees().lookup(200).unwrap().qnum, 4);
}

#[test]
fn add_route_validates_comtree_membership() {
    let mut router = router();

    let mut cp = CtlPkt::new(CpType::AddRoute, RrType::Request, 12);
    cp.set_attr(CpAttr::ComtreeNum, 200);
    cp.set_attr(CpAttr::DestAdr, FAdr::unicast(1, 40).raw() as u32);
    cp.set_attr(CpAttr::LinkNum, 9);

    let reply = roundtrip(&mut router, &cp);
    assert_eq!(reply.rr_type, RrType::NegReply);

    let mut cp = CtlPkt::new(CpType::AddRoute, RrType::Request, 13);
    cp.set_attr(CpAttr::ComtreeNum, 200);
    cp.set_attr(CpAttr::DestAdr, FAdr::unicast(1, 40).raw() as u32);
    cp.set_attr(CpAttr::LinkNum, 1);

    let reply = roundtrip(&mut router, &cp);
    assert_eq!(reply.rr_type, RrType::PosReply);
    assert_eq!(
        router.routes().lookup(200, FAdr::unicast(1, 40)).unwrap().link(),
        1
    );
}

#[test]
fn drop_route_removes_the_entry() {
    let mut router = router();

    // Local routes were seeded at startup for attached peers.
    assert!(router.routes().lookup(200, FAdr::unicast(1, 10)).is_some());

    let mut cp = CtlPkt::new(CpType::DropRoute, RrType::Request, 14);
    cp.set_attr(CpAttr::ComtreeNum, 200);
    cp.set_attr(CpAttr::DestAdr, FAdr::unicast(1, 10).raw() as u32);

    let reply = roundtrip(&mut router, &cp);

    assert_eq!(reply.rr_type, RrType::PosReply);
    assert!(router.routes().lookup(200, FAdr::unicast(1, 10)).is_none());
}

#[test]
fn mod_iface_rolls_back_invalid_rates() {
    let mut router = router();

    let mut cp = CtlPkt::new(CpType::ModIface, RrType::Request, 15);
    cp.set_attr(CpAttr::IfaceNum, 1);
    // Far below what the configured links consume.
    cp.set_attr(CpAttr::MaxBitRate, 100);

    let reply = roundtrip(&mut router, &cp);

    assert_eq!(reply.rr_type, RrType::NegReply);
}

#[test]
fn untrusted_peers_cannot_send_net_sig() {
    let mut router = router();
    let drops_before = router.discards();

    let mut cp = CtlPkt::new(CpType::AddComtree, RrType::Request, 16);
    cp.set_attr(CpAttr::ComtreeNum, 900);
    let bytes = net_sig(&cp, 200, FAdr::unicast(1, 10), FAdr::unicast(1, 2));

    // From the client on link 1.
    router.inject(
        &bytes,
        1,
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40001),
    );
    router.drain_control();

    assert!(router.poll_egress().is_none());
    assert_eq!(router.discards(), drops_before + 1);
    assert!(router.comtrees().lookup(900).is_none());
}

#[test]
fn net_sig_outside_the_signalling_range_is_dropped() {
    let mut router = router();

    let mut cp = CtlPkt::new(CpType::AddComtree, RrType::Request, 17);
    cp.set_attr(CpAttr::ComtreeNum, 900);
    let bytes = net_sig(&cp, 1000, FAdr::unicast(1, 1), FAdr::unicast(1, 2));

    router.inject(
        &bytes,
        1,
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), FOREST_PORT),
    );
    router.drain_control();

    assert!(router.poll_egress().is_none());
    assert!(router.comtrees().lookup(900).is_none());
}

#[test]
fn net_sig_in_transit_is_forwarded_not_consumed() {
    let mut router = router();

    // Destined for the foreign-zip router, not for us; must transit.
    let mut cp = CtlPkt::new(CpType::AddComtree, RrType::Request, 18);
    cp.set_attr(CpAttr::ComtreeNum, 900);
    let bytes = net_sig(&cp, 200, FAdr::unicast(1, 1), FAdr::unicast(2, 1));

    router.inject(
        &bytes,
        1,
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), FOREST_PORT),
    );
    router.drain_control();

    let (lnk, _) = router.poll_egress().expect("transit packet");
    assert_eq!(lnk, 3);
    assert!(router.comtrees().lookup(900).is_none());
}
