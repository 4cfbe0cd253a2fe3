//! Readers for the four startup table files.
//!
//! Each file starts with an entry count; `#` starts a comment and blank
//! lines are ignored. A malformed entry aborts startup with a diagnostic.

use crate::addr::FAdr;
use crate::comtree::ComtreeTable;
use crate::iface::InterfaceTable;
use crate::link::{LinkTable, NodeType};
use crate::qmgr::QueueManager;
use crate::route::RouteTable;
use anyhow::{bail, ensure, Context, Result};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Lines that carry content: comments stripped, blanks skipped.
fn significant_lines(input: &str) -> impl Iterator<Item = &str> {
    input
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
}

/// Reads the leading entry count and hands back exactly that many entry
/// lines.
fn entry_lines(input: &str) -> Result<Vec<&str>> {
    let mut lines = significant_lines(input);

    let count: usize = lines
        .next()
        .context("missing entry count")?
        .parse()
        .context("invalid entry count")?;

    let entries: Vec<&str> = lines.collect();
    ensure!(
        entries.len() == count,
        "expected {count} entries, found {}",
        entries.len()
    );

    Ok(entries)
}

fn field<T: FromStr>(fields: &mut std::str::SplitWhitespace<'_>, name: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    fields
        .next()
        .with_context(|| format!("missing {name}"))?
        .parse()
        .with_context(|| format!("invalid {name}"))
}

fn parse_link_list(s: &str) -> Result<Vec<u16>> {
    if s == "-" {
        return Ok(Vec::new());
    }

    s.split(',')
        .map(|lnk| lnk.parse::<u16>().with_context(|| format!("invalid link `{lnk}`")))
        .collect()
}

/// `ifnum ip maxBitRate maxPktRate`
pub fn read_interfaces(input: &str, ift: &mut InterfaceTable) -> Result<()> {
    for (i, line) in entry_lines(input)?.iter().enumerate() {
        read_interface_entry(line, ift)
            .with_context(|| format!("interface table entry #{}", i + 1))?;
    }

    Ok(())
}

fn read_interface_entry(line: &str, ift: &mut InterfaceTable) -> Result<()> {
    let mut fields = line.split_whitespace();
    let ifnum: u16 = field(&mut fields, "interface number")?;
    let ip: Ipv4Addr = field(&mut fields, "ip address")?;
    let max_bit_rate: u32 = field(&mut fields, "max bit rate")?;
    let max_pkt_rate: u32 = field(&mut fields, "max packet rate")?;

    ensure!(
        ift.add(ifnum, ip, max_bit_rate, max_pkt_rate),
        "cannot add interface {ifnum}"
    );

    Ok(())
}

/// `linkNum ifaceNum ip peerAddr peerType bitRate pktRate`
pub fn read_links(input: &str, lt: &mut LinkTable, ift: &InterfaceTable) -> Result<()> {
    for (i, line) in entry_lines(input)?.iter().enumerate() {
        read_link_entry(line, lt, ift).with_context(|| format!("link table entry #{}", i + 1))?;
    }

    Ok(())
}

fn read_link_entry(line: &str, lt: &mut LinkTable, ift: &InterfaceTable) -> Result<()> {
    let mut fields = line.split_whitespace();
    let lnk: u16 = field(&mut fields, "link number")?;
    let iface: u16 = field(&mut fields, "interface number")?;
    let peer_ip: Ipv4Addr = field(&mut fields, "peer ip")?;
    let peer_adr: FAdr = field(&mut fields, "peer address")?;
    let peer_type: NodeType = field(&mut fields, "peer type")?;
    let bit_rate: u32 = field(&mut fields, "bit rate")?;
    let pkt_rate: u32 = field(&mut fields, "packet rate")?;

    ensure!(ift.is_valid(iface), "unknown interface {iface}");
    ensure!(
        lt.add(lnk, iface, peer_type, peer_ip, peer_adr, bit_rate, pkt_rate),
        "cannot add link {lnk}"
    );
    ensure!(
        ift.within_capacity(iface, lt),
        "link {lnk} overcommits interface {iface}"
    );

    Ok(())
}

/// `comt coreFlag parentLink queueNum quantum linkList coreLinkList`
pub fn read_comtrees(
    input: &str,
    ctt: &mut ComtreeTable,
    lt: &LinkTable,
    qm: &mut QueueManager,
) -> Result<()> {
    for (i, line) in entry_lines(input)?.iter().enumerate() {
        read_comtree_entry(line, ctt, lt, qm)
            .with_context(|| format!("comtree table entry #{}", i + 1))?;
    }

    Ok(())
}

fn read_comtree_entry(
    line: &str,
    ctt: &mut ComtreeTable,
    lt: &LinkTable,
    qm: &mut QueueManager,
) -> Result<()> {
    let mut fields = line.split_whitespace();
    let comt: u32 = field(&mut fields, "comtree number")?;
    let core_flag: u8 = field(&mut fields, "core flag")?;
    let parent: u16 = field(&mut fields, "parent link")?;
    let qnum: u16 = field(&mut fields, "queue number")?;
    let quantum: u32 = field(&mut fields, "quantum")?;
    let links = parse_link_list(fields.next().context("missing link list")?)?;
    let clinks = parse_link_list(fields.next().context("missing core link list")?)?;

    ensure!(core_flag <= 1, "core flag must be 0 or 1");
    ensure!(qnum > 0, "queue number must be positive");
    ensure!(ctt.add_entry(comt), "duplicate comtree {comt}");

    for lnk in &links {
        let rflag = lt.get(*lnk).is_some_and(|e| e.peer_type == NodeType::Router);
        ctt.add_link(comt, *lnk, rflag, clinks.contains(lnk), lt);
    }
    {
        let entry = ctt.lookup_mut(comt).context("comtree just added")?;
        entry.core_flag = core_flag == 1;
        entry.parent = parent;
        entry.qnum = qnum;
        entry.quantum = quantum;
    }

    if !ctt.consistent(comt, lt) {
        ctt.remove_entry(comt);
        bail!("inconsistent comtree {comt}");
    }

    // The comtree's quantum seeds its queue on each member link.
    for lnk in &links {
        qm.set_quantum(*lnk, qnum, quantum);
    }

    Ok(())
}

/// `comt address link` (unicast) or `comt address link1,link2,…`
/// (multicast).
pub fn read_routes(input: &str, rt: &mut RouteTable, ctt: &ComtreeTable) -> Result<()> {
    for (i, line) in entry_lines(input)?.iter().enumerate() {
        read_route_entry(line, rt, ctt).with_context(|| format!("route table entry #{}", i + 1))?;
    }

    Ok(())
}

fn read_route_entry(line: &str, rt: &mut RouteTable, ctt: &ComtreeTable) -> Result<()> {
    let mut fields = line.split_whitespace();
    let comt: u32 = field(&mut fields, "comtree number")?;
    let adr: FAdr = field(&mut fields, "destination address")?;
    let links = parse_link_list(fields.next().context("missing link list")?)?;

    for lnk in &links {
        ensure!(
            ctt.in_comt(comt, *lnk),
            "link {lnk} is not in comtree {comt}"
        );
    }

    if adr.is_multicast() {
        ensure!(rt.add_entry(comt, adr, 0), "duplicate route {comt}/{adr}");
        for lnk in &links {
            rt.add_link(comt, adr, *lnk);
        }
    } else {
        let lnk = *links.first().context("missing link")?;
        ensure!(rt.add_entry(comt, adr, lnk), "duplicate route {comt}/{adr}");
    }

    Ok(())
}
