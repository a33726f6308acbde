//! Registry of live connections keyed by link id.

use super::connection::LinkId;
use std::collections::{BTreeMap, HashMap};

/// Live links of one worker, ordered by id.
///
/// Generic over the stored value so the selection policy can be exercised
/// without sockets; workers store [`ConnRef`](super::ConnRef)s.
pub struct ConnectionManager<T> {
    links: BTreeMap<LinkId, T>,
    /// Round-robin cursor per server type.
    rotation: HashMap<u16, usize>,
}

impl<T> Default for ConnectionManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionManager<T> {
    pub fn new() -> Self {
        Self {
            links: BTreeMap::new(),
            rotation: HashMap::new(),
        }
    }

    /// Insert a link. Returns false, leaving the registry unchanged, if the
    /// id is already present.
    pub fn add(&mut self, id: LinkId, link: T) -> bool {
        if self.links.contains_key(&id) {
            return false;
        }
        self.links.insert(id, link);
        true
    }

    pub fn remove(&mut self, id: LinkId) -> Option<T> {
        self.links.remove(&id)
    }

    pub fn get(&self, id: LinkId) -> Option<&T> {
        self.links.get(&id)
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.links.contains_key(&id)
    }

    /// First free internal id of `server_type`, trying sequence numbers from
    /// `start` upward and wrapping past `u16::MAX` to 1. `None` once all of
    /// them are taken.
    pub fn free_internal_id(&self, server_type: u16, start: u16) -> Option<LinkId> {
        let start = start.max(1);
        (start..=u16::MAX)
            .chain(1..start)
            .map(|seq| LinkId::internal(server_type, seq))
            .find(|id| !self.links.contains_key(id))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Pick one link whose id encodes `server_type`.
    ///
    /// `key == 0` rotates through the matching links on successive calls;
    /// any other key selects `key % count` directly, so equal keys always
    /// land on the same link while the set is unchanged.
    pub fn get_by_type(&mut self, server_type: u16, key: u64) -> Option<&T> {
        let count = self
            .links
            .keys()
            .filter(|id| id.server_type() == server_type)
            .count();
        if count == 0 {
            return None;
        }

        let index = if key == 0 {
            let cursor = self.rotation.entry(server_type).or_insert(0);
            let index = *cursor % count;
            *cursor = cursor.wrapping_add(1);
            index
        } else {
            (key % count as u64) as usize
        };

        self.links
            .iter()
            .filter(|(id, _)| id.server_type() == server_type)
            .nth(index)
            .map(|(_, link)| link)
    }

    pub fn all_by_type(&self, server_type: u16) -> Vec<&T> {
        self.links
            .iter()
            .filter(|(id, _)| id.server_type() == server_type)
            .map(|(_, link)| link)
            .collect()
    }

    pub fn all_keys(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    /// Visit links in id order until `f` returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(LinkId, &T) -> bool,
    {
        for (id, link) in &self.links {
            if !f(*id, link) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager() -> ConnectionManager<&'static str> {
        let mut mgr = ConnectionManager::new();
        assert!(mgr.add(LinkId::internal(1, 1), "a1"));
        assert!(mgr.add(LinkId::internal(1, 2), "a2"));
        assert!(mgr.add(LinkId::internal(1, 3), "a3"));
        assert!(mgr.add(LinkId::internal(2, 1), "b1"));
        assert!(mgr.add(LinkId::passive(12), "client"));
        mgr
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut mgr = manager();
        assert!(!mgr.add(LinkId::passive(12), "other"));
        assert_eq!(mgr.get(LinkId::passive(12)), Some(&"client"));
        assert_eq!(mgr.len(), 5);

        assert_eq!(mgr.remove(LinkId::passive(12)), Some("client"));
        assert!(mgr.get(LinkId::passive(12)).is_none());
    }

    #[test]
    fn test_round_robin_visits_every_link() {
        let mut mgr = manager();
        let m = mgr.all_by_type(1).len();
        assert_eq!(m, 3);

        for _ in 0..3 {
            let seen: HashSet<_> = (0..m)
                .map(|_| *mgr.get_by_type(1, 0).unwrap())
                .collect();
            assert_eq!(seen.len(), m);
        }
    }

    #[test]
    fn test_rotation_is_per_type() {
        let mut mgr = manager();
        assert_eq!(mgr.get_by_type(1, 0), Some(&"a1"));
        assert_eq!(mgr.get_by_type(2, 0), Some(&"b1"));
        assert_eq!(mgr.get_by_type(1, 0), Some(&"a2"));
    }

    #[test]
    fn test_explicit_key_is_modulo() {
        let mut mgr = manager();
        assert_eq!(mgr.get_by_type(1, 4), Some(&"a2"));
        assert_eq!(mgr.get_by_type(1, 4), Some(&"a2"));
        assert_eq!(mgr.get_by_type(1, 3), Some(&"a1"));
        assert_eq!(mgr.get_by_type(9, 1), None);
    }

    #[test]
    fn test_free_internal_id_skips_taken_and_wraps() {
        let mgr = manager();
        assert_eq!(mgr.free_internal_id(1, 1), Some(LinkId::internal(1, 4)));
        assert_eq!(mgr.free_internal_id(2, 0), Some(LinkId::internal(2, 2)));

        let mut mgr = ConnectionManager::new();
        assert!(mgr.add(LinkId::internal(5, u16::MAX), ()));
        assert_eq!(mgr.free_internal_id(5, u16::MAX), Some(LinkId::internal(5, 1)));
    }

    #[test]
    fn test_free_internal_id_exhausted() {
        let mut mgr = ConnectionManager::new();
        for seq in 1..=u16::MAX {
            assert!(mgr.add(LinkId::internal(3, seq), ()));
        }
        assert_eq!(mgr.free_internal_id(3, 1), None);
        assert_eq!(mgr.free_internal_id(3, 40_000), None);
        assert!(mgr.free_internal_id(4, 1).is_some());
    }

    #[test]
    fn test_for_each_stops_early() {
        let mgr = manager();
        let mut visited = 0;
        mgr.for_each(|_, _| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
        assert_eq!(mgr.all_keys().len(), 5);
    }
}
