//! Region-location cache (spec §4.3).
//!
//! Per-table ordered map from region start-key to `(region_info,
//! server_address)`, plus a reverse `known_servers` index. A single
//! lock guards both structures (spec §3 invariant 3, §5): every
//! mutation path takes it for the whole critical section.

use crate::identifiers::{RegionLocation, RowKey, ServerAddress};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Table names for which cache prefetch is disabled. Default: prefetch
/// enabled for every table (spec §3).
#[derive(Debug, Default, Clone)]
pub struct PrefetchPolicy {
    disabled: HashSet<String>,
}

impl PrefetchPolicy {
    pub fn is_enabled(&self, table: &str) -> bool {
        !self.disabled.contains(table)
    }

    pub fn set_enabled(&mut self, table: &str, enabled: bool) {
        if enabled {
            self.disabled.remove(table);
        } else {
            self.disabled.insert(table.to_string());
        }
    }
}

struct Inner {
    per_table: HashMap<String, BTreeMap<RowKey, RegionLocation>>,
    known_servers: HashSet<ServerAddress>,
    root_location: Option<RegionLocation>,
    prefetch: PrefetchPolicy,
}

/// Region-location cache. Cloning is cheap (`Arc`-shared); every clone
/// observes the same underlying state.
#[derive(Clone)]
pub struct LocationCache {
    inner: Arc<RwLock<Inner>>,
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                per_table: HashMap::new(),
                known_servers: HashSet::new(),
                root_location: None,
                prefetch: PrefetchPolicy::default(),
            })),
        }
    }

    /// Returns the unique cached location whose `start_key <= row <
    /// end_key`, or `None`. Finds the greatest start key not exceeding
    /// `row` via the ordered map's predecessor query, then verifies the
    /// row actually falls inside that region's range.
    pub fn lookup(&self, table: &str, row: &RowKey) -> Option<RegionLocation> {
        let inner = self.inner.read();
        let table_map = inner.per_table.get(table)?;
        let (_, candidate) = table_map.range(..=row.clone()).next_back()?;
        if candidate.region_info.contains_row(row) {
            Some(candidate.clone())
        } else {
            None
        }
    }

    /// Idempotent insert; overwrites any existing entry with the same
    /// start key and adds the server to `known_servers`.
    pub fn insert(&self, table: &str, location: RegionLocation) {
        let mut inner = self.inner.write();
        inner.known_servers.insert(location.server_address.clone());
        inner
            .per_table
            .entry(table.to_string())
            .or_default()
            .insert(location.region_info.start_key.clone(), location);
    }

    /// Removes the matching entry only if its current server equals
    /// `expected_server` (`None` forces removal regardless of server).
    /// Prevents a stale invalidation racing with a fresher insert.
    pub fn invalidate(&self, table: &str, row: &RowKey, expected_server: Option<&ServerAddress>) {
        let mut inner = self.inner.write();
        let Some(table_map) = inner.per_table.get_mut(table) else {
            return;
        };
        let start_key = {
            let Some((start_key, candidate)) = table_map.range(..=row.clone()).next_back() else {
                return;
            };
            if !candidate.region_info.contains_row(row) {
                return;
            }
            match expected_server {
                Some(expected) if &candidate.server_address != expected => return,
                _ => {}
            }
            start_key.clone()
        };
        table_map.remove(&start_key);
    }

    /// Removes every entry mapping to `server` and removes `server`
    /// from `known_servers`. Short-circuits if `server` is not known.
    pub fn drop_server(&self, server: &ServerAddress) {
        let mut inner = self.inner.write();
        if !inner.known_servers.contains(server) {
            return;
        }
        for table_map in inner.per_table.values_mut() {
            table_map.retain(|_, loc| &loc.server_address != server);
        }
        inner.known_servers.remove(server);
        if inner
            .root_location
            .as_ref()
            .is_some_and(|loc| &loc.server_address == server)
        {
            inner.root_location = None;
        }
    }

    /// Empties both structures and the root location.
    pub fn drop_all(&self) {
        let mut inner = self.inner.write();
        inner.per_table.clear();
        inner.known_servers.clear();
        inner.root_location = None;
    }

    /// Clears cached entries for a single table.
    pub fn drop_table(&self, table: &str) {
        self.inner.write().per_table.remove(table);
    }

    /// The root-region location, stored separately from `per_table`
    /// since it is discovered via the coordination service (spec §3
    /// invariant 4).
    pub fn root_location(&self) -> Option<RegionLocation> {
        self.inner.read().root_location.clone()
    }

    pub fn set_root_location(&self, location: RegionLocation) {
        let mut inner = self.inner.write();
        inner.known_servers.insert(location.server_address.clone());
        inner.root_location = Some(location);
    }

    /// Clears the separately-stored root-region location, forcing the
    /// next lookup to re-resolve it via the coordination service.
    pub fn invalidate_root(&self) {
        self.inner.write().root_location = None;
    }

    pub fn known_servers(&self) -> HashSet<ServerAddress> {
        self.inner.read().known_servers.clone()
    }

    pub fn is_prefetch_enabled(&self, table: &str) -> bool {
        self.inner.read().prefetch.is_enabled(table)
    }

    pub fn set_prefetch_enabled(&self, table: &str, enabled: bool) {
        self.inner.write().prefetch.set_enabled(table, enabled);
    }

    /// Scans every table's entries for one whose region name matches.
    /// Used by `Connection::locate_region_by_name`, which has no table
    /// hint to index into `per_table` directly.
    pub fn find_by_region_name(&self, region_name: &crate::identifiers::RegionName) -> Option<RegionLocation> {
        let inner = self.inner.read();
        inner
            .per_table
            .values()
            .flat_map(|table_map| table_map.values())
            .find(|loc| &loc.region_info.region_name == region_name)
            .cloned()
    }

    /// All cached locations for a table, in start-key order.
    pub fn locations_for_table(&self, table: &str) -> Vec<RegionLocation> {
        self.inner
            .read()
            .per_table
            .get(table)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::RegionInfo;

    fn loc(table: &str, start: &str, end: &str, server: &str) -> RegionLocation {
        RegionLocation::new(
            RegionInfo::new(table, RowKey::from(start), RowKey::from(end), 1),
            ServerAddress::new(server, 1),
        )
    }

    #[test]
    fn lookup_finds_covering_region() {
        let cache = LocationCache::new();
        cache.insert("t1", loc("t1", "a", "m", "s1"));
        cache.insert("t1", loc("t1", "m", "", "s2"));

        assert_eq!(
            cache.lookup("t1", &RowKey::from("f")).unwrap().server_address,
            ServerAddress::new("s1", 1)
        );
        assert_eq!(
            cache.lookup("t1", &RowKey::from("z")).unwrap().server_address,
            ServerAddress::new("s2", 1)
        );
        assert!(cache.lookup("t1", &RowKey::default()).is_none());
    }

    #[test]
    fn insert_is_idempotent_on_start_key() {
        let cache = LocationCache::new();
        cache.insert("t1", loc("t1", "a", "m", "s1"));
        cache.insert("t1", loc("t1", "a", "m", "s2"));
        assert_eq!(cache.locations_for_table("t1").len(), 1);
        assert_eq!(
            cache.lookup("t1", &RowKey::from("b")).unwrap().server_address,
            ServerAddress::new("s2", 1)
        );
    }

    #[test]
    fn invalidate_is_noop_when_server_mismatched() {
        let cache = LocationCache::new();
        cache.insert("t1", loc("t1", "a", "m", "s1"));
        cache.invalidate("t1", &RowKey::from("b"), Some(&ServerAddress::new("wrong", 1)));
        assert!(cache.lookup("t1", &RowKey::from("b")).is_some());
    }

    #[test]
    fn invalidate_with_expected_server_removes_entry() {
        let cache = LocationCache::new();
        cache.insert("t1", loc("t1", "a", "m", "s1"));
        cache.invalidate("t1", &RowKey::from("b"), Some(&ServerAddress::new("s1", 1)));
        assert!(cache.lookup("t1", &RowKey::from("b")).is_none());
    }

    #[test]
    fn invalidate_with_none_forces_removal() {
        let cache = LocationCache::new();
        cache.insert("t1", loc("t1", "a", "m", "s1"));
        cache.invalidate("t1", &RowKey::from("b"), None);
        assert!(cache.lookup("t1", &RowKey::from("b")).is_none());
    }

    #[test]
    fn drop_server_removes_all_entries_and_updates_known_servers() {
        let cache = LocationCache::new();
        cache.insert("t1", loc("t1", "a", "m", "s1"));
        cache.insert("t1", loc("t1", "m", "", "s2"));
        cache.insert("t2", loc("t2", "a", "", "s1"));

        cache.drop_server(&ServerAddress::new("s1", 1));

        assert!(cache.lookup("t1", &RowKey::from("b")).is_none());
        assert!(cache.lookup("t2", &RowKey::from("b")).is_none());
        assert!(cache.lookup("t1", &RowKey::from("z")).is_some());
        assert!(!cache.known_servers().contains(&ServerAddress::new("s1", 1)));
    }

    #[test]
    fn drop_all_empties_every_table_and_root() {
        let cache = LocationCache::new();
        cache.insert("t1", loc("t1", "a", "", "s1"));
        cache.set_root_location(loc("-ROOT-", "", "", "root1"));
        cache.drop_all();
        assert!(cache.lookup("t1", &RowKey::from("b")).is_none());
        assert!(cache.root_location().is_none());
        assert!(cache.known_servers().is_empty());
    }

    #[test]
    fn prefetch_enabled_by_default() {
        let cache = LocationCache::new();
        assert!(cache.is_prefetch_enabled("t1"));
        cache.set_prefetch_enabled("t1", false);
        assert!(!cache.is_prefetch_enabled("t1"));
    }
}
