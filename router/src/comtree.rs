use crate::addr::FAdr;
use crate::link::{LinkTable, NodeType};
use std::collections::HashMap;
use std::fmt;

/// A set of link numbers, stored as a 32-bit mask (bit `i` = link `i`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkSet(u32);

impl LinkSet {
    pub const EMPTY: LinkSet = LinkSet(0);

    pub fn insert(&mut self, lnk: u16) {
        self.0 |= 1 << lnk;
    }

    pub fn remove(&mut self, lnk: u16) {
        self.0 &= !(1 << lnk);
    }

    pub fn contains(self, lnk: u16) -> bool {
        self.0 & (1 << lnk) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_subset_of(self, other: LinkSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// Member links in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u16> {
        (1..32).filter(move |lnk| self.contains(*lnk))
    }
}

impl FromIterator<u16> for LinkSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut set = LinkSet::EMPTY;
        for lnk in iter {
            set.insert(lnk);
        }
        set
    }
}

impl fmt::Display for LinkSet {
    /// Comma-separated link list; `-` for the empty set.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }

        let mut first = true;
        for lnk in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            lnk.fmt(f)?;
        }
        Ok(())
    }
}

/// Per-comtree forwarding state.
///
/// The four masks are nested: `clinks ⊆ rlinks ⊆ links` and
/// `llinks ⊆ rlinks`. [`ComtreeTable::consistent`] is the admission gate
/// that keeps them that way.
#[derive(Debug, Clone, Copy)]
pub struct ComtreeEntry {
    /// Link towards the comtree root; 0 when this router is the root.
    pub parent: u16,
    /// True when this router belongs to the comtree's core subtree.
    pub core_flag: bool,
    /// Default queue number for traffic in this comtree.
    pub qnum: u16,
    /// Initial WDRR quantum for this comtree's queue on each of its links.
    pub quantum: u32,
    /// All comtree links.
    pub links: LinkSet,
    /// Links whose peer is another router.
    pub rlinks: LinkSet,
    /// Router links whose peer shares this router's zip code.
    pub llinks: LinkSet,
    /// Links to neighboring core routers.
    pub clinks: LinkSet,
}

impl ComtreeEntry {
    fn new() -> Self {
        Self {
            parent: 0,
            core_flag: false,
            qnum: 1,
            quantum: 100,
            links: LinkSet::EMPTY,
            rlinks: LinkSet::EMPTY,
            llinks: LinkSet::EMPTY,
            clinks: LinkSet::EMPTY,
        }
    }
}

/// The comtrees this router participates in, keyed by comtree number.
pub struct ComtreeTable {
    my_adr: FAdr,
    entries: HashMap<u32, ComtreeEntry>,
}

impl ComtreeTable {
    pub fn new(my_adr: FAdr) -> Self {
        Self {
            my_adr,
            entries: HashMap::new(),
        }
    }

    pub fn lookup(&self, comt: u32) -> Option<&ComtreeEntry> {
        self.entries.get(&comt)
    }

    pub fn lookup_mut(&mut self, comt: u32) -> Option<&mut ComtreeEntry> {
        self.entries.get_mut(&comt)
    }

    pub fn add_entry(&mut self, comt: u32) -> bool {
        if comt == 0 || self.entries.contains_key(&comt) {
            return false;
        }

        self.entries.insert(comt, ComtreeEntry::new());
        true
    }

    pub fn remove_entry(&mut self, comt: u32) -> bool {
        self.entries.remove(&comt).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &ComtreeEntry)> {
        self.entries.iter().map(|(comt, e)| (*comt, e))
    }

    /// Adds `lnk` to the comtree's link sets.
    ///
    /// `rflag` marks a router peer, `cflag` a core router; whether the peer
    /// is in this router's zip code is read from the link table.
    pub fn add_link(&mut self, comt: u32, lnk: u16, rflag: bool, cflag: bool, lt: &LinkTable) {
        let local = rflag
            && lt
                .get(lnk)
                .is_some_and(|e| e.peer_adr.zip() == self.my_adr.zip());

        let Some(entry) = self.entries.get_mut(&comt) else {
            return;
        };

        entry.links.insert(lnk);
        if rflag {
            entry.rlinks.insert(lnk);
            if local {
                entry.llinks.insert(lnk);
            }
            if cflag {
                entry.clinks.insert(lnk);
            }
        }
    }

    pub fn remove_link(&mut self, comt: u32, lnk: u16) {
        let Some(entry) = self.entries.get_mut(&comt) else {
            return;
        };

        entry.links.remove(lnk);
        entry.rlinks.remove(lnk);
        entry.llinks.remove(lnk);
        entry.clinks.remove(lnk);
    }

    pub fn in_comt(&self, comt: u32, lnk: u16) -> bool {
        self.lookup(comt).is_some_and(|e| e.links.contains(lnk))
    }

    /// Tests every comtree invariant; mutations that would break one are
    /// rejected by running their result through this check.
    pub fn consistent(&self, comt: u32, lt: &LinkTable) -> bool {
        let Some(e) = self.lookup(comt) else {
            return false;
        };

        if !e.clinks.is_subset_of(e.rlinks)
            || !e.rlinks.is_subset_of(e.links)
            || !e.llinks.is_subset_of(e.rlinks)
        {
            return false;
        }

        for lnk in e.links.iter() {
            if !lt.is_valid(lnk) {
                return false;
            }
        }
        for lnk in e.rlinks.iter() {
            if lt.get(lnk).map(|l| l.peer_type) != Some(NodeType::Router) {
                return false;
            }
        }
        for lnk in e.llinks.iter() {
            if lt.get(lnk).map(|l| l.peer_adr.zip()) != Some(self.my_adr.zip()) {
                return false;
            }
        }

        if e.parent != 0 {
            if !e.rlinks.contains(e.parent) {
                return false;
            }
            if e.core_flag && !e.clinks.contains(e.parent) {
                return false;
            }
        }
        if !e.core_flag && e.clinks.len() > 1 {
            return false;
        }

        true
    }
}

impl fmt::Display for ComtreeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.entries.len())?;

        let mut comts: Vec<u32> = self.entries.keys().copied().collect();
        comts.sort_unstable();
        for comt in comts {
            let e = &self.entries[&comt];
            writeln!(
                f,
                "{comt} {} {} {} {} {} {}",
                e.core_flag as u8, e.parent, e.qnum, e.quantum, e.links, e.clinks
            )?;
        }
        Ok(())
    }
}
