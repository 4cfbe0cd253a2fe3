use crate::addr::FAdr;
use crate::comtree::LinkSet;
use std::collections::HashMap;
use std::fmt;

/// Where a route points: one link for unicast destinations, a set of links
/// for multicast groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Unicast(u16),
    Multicast(LinkSet),
}

#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    /// Queue override for this route; 0 means "use the comtree default".
    pub qnum: u16,
    pub target: RouteTarget,
}

impl RouteEntry {
    /// The outgoing link of a unicast route, 0 for multicast entries.
    pub fn link(&self) -> u16 {
        match self.target {
            RouteTarget::Unicast(lnk) => lnk,
            RouteTarget::Multicast(_) => 0,
        }
    }

    pub fn links(&self) -> LinkSet {
        match self.target {
            RouteTarget::Unicast(_) => LinkSet::EMPTY,
            RouteTarget::Multicast(set) => set,
        }
    }
}

/// Routes keyed by (comtree, destination address).
///
/// Unicast destinations outside this router's zip code are aggregated: they
/// are stored (and matched) under `zip.0`, one route per foreign zip.
pub struct RouteTable {
    my_adr: FAdr,
    entries: HashMap<(u32, FAdr), RouteEntry>,
}

impl RouteTable {
    pub fn new(my_adr: FAdr) -> Self {
        Self {
            my_adr,
            entries: HashMap::new(),
        }
    }

    fn storage_adr(&self, adr: FAdr) -> FAdr {
        if adr.is_unicast() && adr.zip() != self.my_adr.zip() {
            adr.zip_prefix()
        } else {
            adr
        }
    }

    /// Looks up the route for `dst` in `comt`.
    ///
    /// Foreign-zip unicast destinations are tried exactly first and then in
    /// their zip-aggregated form.
    pub fn lookup(&self, comt: u32, dst: FAdr) -> Option<&RouteEntry> {
        if let Some(entry) = self.entries.get(&(comt, dst)) {
            return Some(entry);
        }
        if dst.is_unicast() && dst.zip() != self.my_adr.zip() {
            return self.entries.get(&(comt, dst.zip_prefix()));
        }

        None
    }

    pub fn contains(&self, comt: u32, dst: FAdr) -> bool {
        self.lookup(comt, dst).is_some()
    }

    /// Inserts a route. For multicast destinations a fresh link set is
    /// created holding `lnk` (empty when `lnk` is 0).
    pub fn add_entry(&mut self, comt: u32, adr: FAdr, lnk: u16) -> bool {
        if adr.is_null() || (!adr.is_unicast() && !adr.is_multicast()) {
            return false;
        }

        let adr = self.storage_adr(adr);
        if self.entries.contains_key(&(comt, adr)) {
            return false;
        }

        let target = if adr.is_multicast() {
            let mut set = LinkSet::EMPTY;
            if lnk != 0 {
                set.insert(lnk);
            }
            RouteTarget::Multicast(set)
        } else {
            RouteTarget::Unicast(lnk)
        };

        self.entries.insert((comt, adr), RouteEntry { qnum: 0, target });
        true
    }

    pub fn remove_entry(&mut self, comt: u32, adr: FAdr) -> bool {
        let adr = self.storage_adr(adr);

        self.entries.remove(&(comt, adr)).is_some()
    }

    /// Adds a link to a multicast route. False for unicast routes.
    pub fn add_link(&mut self, comt: u32, adr: FAdr, lnk: u16) -> bool {
        match self.entries.get_mut(&(comt, adr)) {
            Some(RouteEntry {
                target: RouteTarget::Multicast(set),
                ..
            }) => {
                set.insert(lnk);
                true
            }
            Some(_) | None => false,
        }
    }

    /// Removes a link from a multicast route. False for unicast routes.
    pub fn remove_link(&mut self, comt: u32, adr: FAdr, lnk: u16) -> bool {
        match self.entries.get_mut(&(comt, adr)) {
            Some(RouteEntry {
                target: RouteTarget::Multicast(set),
                ..
            }) => {
                set.remove(lnk);
                true
            }
            Some(_) | None => false,
        }
    }

    /// Redirects a unicast route. False for multicast routes.
    pub fn set_link(&mut self, comt: u32, adr: FAdr, lnk: u16) -> bool {
        let adr = self.storage_adr(adr);

        match self.entries.get_mut(&(comt, adr)) {
            Some(entry) => match entry.target {
                RouteTarget::Unicast(_) => {
                    entry.target = RouteTarget::Unicast(lnk);
                    true
                }
                RouteTarget::Multicast(_) => false,
            },
            None => false,
        }
    }

    pub fn set_qnum(&mut self, comt: u32, adr: FAdr, qnum: u16) -> bool {
        let adr = self.storage_adr(adr);

        match self.entries.get_mut(&(comt, adr)) {
            Some(entry) => {
                entry.qnum = qnum;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, FAdr, &RouteEntry)> {
        self.entries
            .iter()
            .map(|((comt, adr), entry)| (*comt, *adr, entry))
    }
}

impl fmt::Display for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.entries.len())?;

        let mut keys: Vec<(u32, FAdr)> = self.entries.keys().copied().collect();
        keys.sort_unstable();
        for (comt, adr) in keys {
            let entry = &self.entries[&(comt, adr)];
            match entry.target {
                RouteTarget::Unicast(lnk) => writeln!(f, "{comt} {adr} {lnk}")?,
                RouteTarget::Multicast(set) => writeln!(f, "{comt} {adr} {set}")?,
            }
        }
        Ok(())
    }
}
