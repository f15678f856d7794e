use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lamport timestamp carried by every atom id.
pub type Lamport = u64;

/// Unique identifier for a replica. Backed by raw bytes to support arbitrary identity formats.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SiteId(pub Vec<u8>);

impl SiteId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Identity of an atom.
///
/// Two ids are the same atom when `(timestamp, site)` match. `priority` is an explicit
/// tie-break weight that only participates in sibling ordering.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AtomId {
    pub timestamp: Lamport,
    pub site: SiteId,
    #[cfg_attr(feature = "serde", serde(default))]
    pub priority: u32,
}

impl AtomId {
    pub fn new(timestamp: Lamport, site: &SiteId, priority: u32) -> Self {
        Self {
            timestamp,
            site: site.clone(),
            priority,
        }
    }
}

impl PartialEq for AtomId {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.site == other.site
    }
}

impl Eq for AtomId {}

impl Hash for AtomId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.timestamp.hash(state);
        self.site.hash(state);
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.site, self.timestamp)?;
        if self.priority > 0 {
            write!(f, "^{}", self.priority)?;
        }
        Ok(())
    }
}

/// Canonical ordering for siblings sharing a cause: higher priority first, then newer
/// timestamps first, then ascending site.
///
/// `Ordering::Less` means `a` is placed before `b` in the weave.
pub fn cmp_siblings(a: &AtomId, b: &AtomId) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| a.site.cmp(&b.site))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_ignores_priority() {
        let site = SiteId::new(b"a");
        let low = AtomId::new(3, &site, 0);
        let high = AtomId::new(3, &site, 7);
        assert_eq!(low, high);

        let mut set = HashSet::new();
        set.insert(low);
        assert!(set.contains(&high));
    }

    #[test]
    fn siblings_order_by_priority_then_newest_then_site() {
        let a = SiteId::new(b"a");
        let b = SiteId::new(b"b");

        let prioritized = AtomId::new(1, &b, 5);
        let newest = AtomId::new(9, &b, 0);
        let older_a = AtomId::new(4, &a, 0);
        let older_b = AtomId::new(4, &b, 0);

        let mut ids = vec![
            older_b.clone(),
            newest.clone(),
            older_a.clone(),
            prioritized.clone(),
        ];
        ids.sort_by(cmp_siblings);
        assert_eq!(ids, vec![prioritized, newest, older_a, older_b]);
    }
}
