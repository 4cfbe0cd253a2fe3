//! End-to-end forwarding scenarios driven through the ingress/egress API.

use forest_router::packet::{Header, HDR_LENG, FOREST_VERSION, RTE_REQ};
use forest_router::{ConfigFiles, FAdr, Limits, PktType, Router, FOREST_PORT};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

const IFACES: &str = "\
1
1 127.0.0.1 400000 200000
";

const LINKS: &str = "\
7
1 1 10.0.0.2 1.10 client 1000 1000
2 1 10.0.0.3 1.1 router 10000 5000
3 1 10.0.0.4 2.1 router 10000 5000
4 1 10.0.0.5 1.11 client 1000 1000
5 1 10.0.0.6 1.20 server 1000 1000
6 1 10.0.0.7 1.12 client 1000 1000
7 1 10.0.0.8 1.3 router 10000 5000
";

const COMTREES: &str = "\
3
1 1 0 1 100 1,4,6 -
200 0 3 1 2000 1,2,3,4,5,6 3
300 0 7 2 2000 4,6,7 -
";

const ROUTES: &str = "0\n";

/// Router 1.2 with one interface, three router peers and four leaf peers.
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

fn peer_src(last_octet: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last_octet), port)
}

/// Builds a full packet: header, payload words, trailing checksum word.
fn packet(
    typ: PktType,
    flags: u8,
    comt: u32,
    src: FAdr,
    dst: FAdr,
    payload: &[u32],
) -> Vec<u8> {
    let leng = HDR_LENG + 4 * payload.len() + 4;
    let mut bytes = vec![0u8; leng];

    let header = Header {
        version: FOREST_VERSION,
        leng: leng as u16,
        typ,
        flags,
        comt,
        src,
        dst,
    };
    let head: &mut [u8; HDR_LENG] = (&mut bytes[..HDR_LENG]).try_into().unwrap();
    header.pack(head);

    for (i, word) in payload.iter().enumerate() {
        let at = HDR_LENG + 4 * i;
        bytes[at..at + 4].copy_from_slice(&word.to_be_bytes());
    }

    bytes
}

fn parse(bytes: &[u8]) -> Header {
    let head: &[u8; HDR_LENG] = bytes[..HDR_LENG].try_into().unwrap();
    Header::unpack(head)
}

fn payload_word(bytes: &[u8], i: usize) -> u32 {
    let at = HDR_LENG + 4 * i;
    u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap())
}

/// Pulls every packet currently ready or becoming ready, advancing virtual
/// time across rate gaps.
fn drain(router: &mut Router) -> Vec<(u16, Vec<u8>)> {
    let mut out = Vec::new();
    let mut idle = 0;

    while idle < 100 {
        match router.poll_egress() {
            Some(item) => {
                out.push(item);
                idle = 0;
            }
            None => {
                router.advance_clock(10_000);
                idle += 1;
            }
        }
    }

    out
}

#[test]
fn unknown_unicast_floods_router_links_with_route_request() {
    let mut router = router();

    // From the same-zip router on link 2, towards a zip nobody has a route
    // for.
    let data = packet(
        PktType::ClientData,
        0,
        200,
        FAdr::unicast(1, 99),
        FAdr::unicast(3, 30),
        &[0xaaaa_bbbb],
    );
    router.inject(&data, 1, peer_src(3, FOREST_PORT));

    let out = drain(&mut router);
    let by_link: HashMap<u16, &Vec<u8>> = out.iter().map(|(l, b)| (*l, b)).collect();

    // Flooded to the other router link only, never back out the ingress
    // link, never to clients.
    assert_eq!(out.len(), 1);
    let flooded = by_link[&3];
    let header = parse(flooded);
    assert_eq!(header.typ, PktType::ClientData);
    assert_eq!(header.flags & RTE_REQ, RTE_REQ);
    assert_eq!(header.dst, FAdr::unicast(3, 30));
}

#[test]
fn route_reply_installs_a_zip_aggregated_route() {
    let mut router = router();
    assert!(router.routes().lookup(200, FAdr::unicast(3, 30)).is_none());

    // Reply from the foreign-zip router on link 3, vouching for 3.30.
    let reply = packet(
        PktType::RteReply,
        0,
        200,
        FAdr::unicast(2, 1),
        FAdr::unicast(1, 10),
        &[FAdr::unicast(3, 30).raw() as u32],
    );
    router.inject(&reply, 1, peer_src(4, FOREST_PORT));

    // The learned route is aggregated: any host in zip 3 now resolves.
    let rte = router.routes().lookup(200, FAdr::unicast(3, 77)).unwrap();
    assert_eq!(rte.link(), 3);
}

#[test]
fn route_request_flag_triggers_a_reply_and_is_cleared() {
    let mut router = router();

    // Data for a known destination (client 1.10) arriving with RTE_REQ from
    // the router on link 3.
    let data = packet(
        PktType::ClientData,
        RTE_REQ,
        200,
        FAdr::unicast(2, 9),
        FAdr::unicast(1, 10),
        &[1, 2],
    );
    router.inject(&data, 1, peer_src(4, FOREST_PORT));

    let out = drain(&mut router);
    let by_link: HashMap<u16, &Vec<u8>> = out.iter().map(|(l, b)| (*l, b)).collect();
    assert_eq!(out.len(), 2);

    // The data went on to its client with the flag cleared.
    let forwarded = parse(by_link[&1]);
    assert_eq!(forwarded.typ, PktType::ClientData);
    assert_eq!(forwarded.flags & RTE_REQ, 0);

    // And a RTE_REPLY about 1.10 went back out the ingress link.
    let reply_bytes = by_link[&3];
    let reply = parse(reply_bytes);
    assert_eq!(reply.typ, PktType::RteReply);
    assert_eq!(reply.src, FAdr::unicast(1, 2));
    assert_eq!(reply.dst, FAdr::unicast(2, 9));
    assert_eq!(
        payload_word(reply_bytes, 0),
        FAdr::unicast(1, 10).raw() as u32
    );
}

#[test]
fn subscribe_creates_a_route_and_propagates_to_the_parent() {
    let mut router = router();
    let group = FAdr::new(-5);

    let sub = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 11),
        FAdr::unicast(1, 2),
        &[1, group.raw() as u32, 0],
    );
    router.inject(&sub, 1, peer_src(5, 41000));

    let rte = router.routes().lookup(300, group).unwrap();
    assert!(rte.links().contains(4));
    assert_eq!(rte.links().len(), 1);

    // Propagated up the comtree with the parent router as destination.
    let out = drain(&mut router);
    assert_eq!(out.len(), 1);
    let (lnk, bytes) = &out[0];
    assert_eq!(*lnk, 7);
    let header = parse(bytes);
    assert_eq!(header.typ, PktType::SubUnsub);
    assert_eq!(header.dst, FAdr::unicast(1, 3));
}

#[test]
fn second_subscriber_is_added_and_zeroed_in_the_forwarded_payload() {
    let mut router = router();
    let known = FAdr::new(-5);
    let fresh = FAdr::new(-6);

    let first = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 11),
        FAdr::unicast(1, 2),
        &[1, known.raw() as u32, 0],
    );
    router.inject(&first, 1, peer_src(5, 41000));
    drain(&mut router);

    // Second subscriber adds the known group plus a new one.
    let second = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 12),
        FAdr::unicast(1, 2),
        &[2, known.raw() as u32, fresh.raw() as u32, 0],
    );
    router.inject(&second, 1, peer_src(7, 42000));

    let known_rte = router.routes().lookup(300, known).unwrap();
    assert!(known_rte.links().contains(4));
    assert!(known_rte.links().contains(6));
    assert!(router.routes().lookup(300, fresh).unwrap().links().contains(6));

    // The propagated copy zeroes the group the parent already knows about.
    let out = drain(&mut router);
    assert_eq!(out.len(), 1);
    let (lnk, bytes) = &out[0];
    assert_eq!(*lnk, 7);
    assert_eq!(payload_word(bytes, 0), 2);
    assert_eq!(payload_word(bytes, 1), 0);
    assert_eq!(payload_word(bytes, 2), fresh.raw() as u32);
}

#[test]
fn unsubscribe_of_last_member_deletes_the_route_and_propagates() {
    let mut router = router();
    let group = FAdr::new(-5);

    let sub = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 11),
        FAdr::unicast(1, 2),
        &[1, group.raw() as u32, 0],
    );
    router.inject(&sub, 1, peer_src(5, 41000));
    drain(&mut router);
    assert!(router.routes().lookup(300, group).is_some());

    let unsub = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 11),
        FAdr::unicast(1, 2),
        &[0, 1, group.raw() as u32],
    );
    router.inject(&unsub, 1, peer_src(5, 41000));

    assert!(router.routes().lookup(300, group).is_none());

    let out = drain(&mut router);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, 7);
}

#[test]
fn empty_sub_unsub_is_a_no_op() {
    let mut router = router();
    let routes_before = router.routes().len();

    let noop = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 11),
        FAdr::unicast(1, 2),
        &[0, 0],
    );
    router.inject(&noop, 1, peer_src(5, 41000));

    assert_eq!(router.routes().len(), routes_before);
    assert!(drain(&mut router).is_empty());
}

#[test]
fn oversized_subscription_counts_are_rejected() {
    let mut router = router();
    let routes_before = router.routes().len();

    // Claims 400 adds in a packet that is far too short for any.
    let bogus = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 11),
        FAdr::unicast(1, 2),
        &[400, FAdr::new(-9).raw() as u32, 0],
    );
    router.inject(&bogus, 1, peer_src(5, 41000));

    assert_eq!(router.routes().len(), routes_before);
    assert!(drain(&mut router).is_empty());
}

#[test]
fn subscriptions_from_the_parent_link_are_ignored() {
    let mut router = router();

    // Link 7 is comtree 300's parent; its subscriptions must not create
    // state.
    let sub = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 3),
        FAdr::unicast(1, 2),
        &[1, FAdr::new(-5).raw() as u32, 0],
    );
    router.inject(&sub, 1, peer_src(8, FOREST_PORT));

    assert!(router.routes().lookup(300, FAdr::new(-5)).is_none());
    assert!(drain(&mut router).is_empty());
}

#[test]
fn multicast_data_follows_subscriptions_and_the_parent_link() {
    let mut router = router();
    let group = FAdr::new(-5);

    let sub = packet(
        PktType::SubUnsub,
        0,
        300,
        FAdr::unicast(1, 11),
        FAdr::unicast(1, 2),
        &[1, group.raw() as u32, 0],
    );
    router.inject(&sub, 1, peer_src(5, 41000));
    drain(&mut router);

    // Multicast data from the other client fans out to the subscriber and
    // up to the parent.
    let data = packet(
        PktType::ClientData,
        0,
        300,
        FAdr::unicast(1, 12),
        group,
        &[7],
    );
    router.inject(&data, 1, peer_src(7, 42000));

    let out = drain(&mut router);
    let mut links: Vec<u16> = out.iter().map(|(l, _)| *l).collect();
    links.sort_unstable();
    assert_eq!(links, vec![4, 7]);
}

#[test]
fn spoofed_source_is_dropped_but_counted() {
    let mut router = router();
    let routes_before = router.routes().len();
    let drops_before = router.discards();

    // Link 5's peer is 1.20; the packet claims 1.21.
    let spoof = packet(
        PktType::ClientData,
        0,
        200,
        FAdr::unicast(1, 21),
        FAdr::unicast(1, 10),
        &[1],
    );
    let wire_len = spoof.len();
    router.inject(&spoof, 1, peer_src(6, FOREST_PORT));

    assert!(drain(&mut router).is_empty());
    assert_eq!(router.routes().len(), routes_before);
    assert_eq!(router.discards(), drops_before + 1);

    // The arrival was still accounted to the link.
    let link = router.links().get(5).unwrap();
    assert_eq!(link.in_pkts(), 1);
    assert_eq!(link.in_bytes(), 70 + wire_len as u64);
}

#[test]
fn connect_learns_and_disconnect_forgets_the_peer_port() {
    let mut router = router();
    assert_eq!(router.links().get(1).unwrap().peer_port, 0);

    let connect = packet(
        PktType::Connect,
        0,
        1,
        FAdr::unicast(1, 10),
        FAdr::unicast(1, 2),
        &[],
    );
    router.inject(&connect, 1, peer_src(2, 40001));
    assert_eq!(router.links().get(1).unwrap().peer_port, 40001);

    // A second CONNECT from elsewhere cannot overwrite it.
    let reconnect = packet(
        PktType::Connect,
        0,
        1,
        FAdr::unicast(1, 10),
        FAdr::unicast(1, 2),
        &[],
    );
    router.inject(&reconnect, 1, peer_src(2, 40001));
    assert_eq!(router.links().get(1).unwrap().peer_port, 40001);

    // DISCONNECT from the learned port clears it again.
    let disconnect = packet(
        PktType::Disconnect,
        0,
        1,
        FAdr::unicast(1, 10),
        FAdr::unicast(1, 2),
        &[],
    );
    router.inject(&disconnect, 1, peer_src(2, 40001));
    assert_eq!(router.links().get(1).unwrap().peer_port, 0);
}

#[test]
fn known_unicast_goes_out_exactly_one_link() {
    let mut router = router();

    // 2.0 was seeded from the adjacent foreign-zip router.
    let data = packet(
        PktType::ClientData,
        0,
        200,
        FAdr::unicast(1, 10),
        FAdr::unicast(2, 55),
        &[42],
    );
    router.inject(&data, 1, peer_src(2, 40001));

    let out = drain(&mut router);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, 3);
}

#[test]
fn packet_on_a_comtree_the_link_is_not_in_is_dropped() {
    let mut router = router();
    let drops_before = router.discards();

    // Link 5 is not a member of comtree 300.
    let data = packet(
        PktType::ClientData,
        0,
        300,
        FAdr::unicast(1, 20),
        FAdr::unicast(1, 11),
        &[1],
    );
    router.inject(&data, 1, peer_src(6, FOREST_PORT));

    assert!(drain(&mut router).is_empty());
    assert_eq!(router.discards(), drops_before + 1);
}

#[test]
fn length_mismatch_is_dropped() {
    let mut router = router();
    let drops_before = router.discards();

    let mut data = packet(
        PktType::ClientData,
        0,
        200,
        FAdr::unicast(1, 10),
        FAdr::unicast(2, 55),
        &[42],
    );
    // One byte of trailing garbage breaks the length check.
    data.push(0);
    router.inject(&data, 1, peer_src(2, 40001));

    assert!(drain(&mut router).is_empty());
    assert_eq!(router.discards(), drops_before + 1);
}
