//! Locator (spec §4.4).
//!
//! Resolves `(table, row) -> RegionLocation`, layered root → meta →
//! user, serializing concurrent cache misses behind one discovery lock
//! per level with a double-checked cache re-read after acquiring it.

use crate::cache::LocationCache;
use crate::coordination::CoordinationSession;
use crate::error::{ClusterError, Result};
use crate::identifiers::{
    closest_row_before_probe, RegionInfo, RegionLocation, RowKey, ServerAddress, META_TABLE, ROOT_TABLE,
};
use crate::retry::backoff_delay;
use crate::rpc::RpcProxyRegistry;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const META_FAMILY: &str = "info";
const REGIONINFO_QUALIFIER: &str = "regioninfo";
const SERVER_QUALIFIER: &str = "server";

/// Encodes a meta/root row for `(region_info, server_address)` using
/// the two-qualifier convention this crate's locator and its RPC fakes
/// agree on (`regioninfo` = JSON `RegionInfo`, `server` = `"host:port"`).
pub fn encode_region_row(region_info: &RegionInfo, server: &ServerAddress) -> Vec<(String, Vec<u8>)> {
    vec![
        (
            REGIONINFO_QUALIFIER.to_string(),
            serde_json::to_vec(region_info).expect("RegionInfo always serializes"),
        ),
        (SERVER_QUALIFIER.to_string(), server.to_string().into_bytes()),
    ]
}

pub(crate) fn decode_region_row(columns: &[(String, Vec<u8>)]) -> Result<(RegionInfo, ServerAddress)> {
    let region_info_bytes = columns
        .iter()
        .find(|(q, _)| q == REGIONINFO_QUALIFIER)
        .map(|(_, v)| v.as_slice())
        .ok_or_else(|| ClusterError::Serialization("meta row missing regioninfo column".into()))?;
    let server_bytes = columns
        .iter()
        .find(|(q, _)| q == SERVER_QUALIFIER)
        .map(|(_, v)| v.as_slice())
        .ok_or_else(|| ClusterError::Serialization("meta row missing server column".into()))?;

    let region_info: RegionInfo = serde_json::from_slice(region_info_bytes)?;
    let server_str = std::str::from_utf8(server_bytes)
        .map_err(|e| ClusterError::Serialization(format!("invalid server column: {e}")))?;
    let server: ServerAddress = server_str.parse()?;
    Ok((region_info, server))
}

/// Resolves region locations for root, meta, and user tables.
pub struct Locator {
    cache: LocationCache,
    session: Arc<CoordinationSession>,
    rpc_registry: Arc<RpcProxyRegistry>,
    retries_number: u32,
    pause_ms: u64,
    prefetch_limit: u32,
    root_lock: Mutex<()>,
    meta_lock: Mutex<()>,
    user_lock: Mutex<()>,
}

impl Locator {
    pub fn new(
        cache: LocationCache,
        session: Arc<CoordinationSession>,
        rpc_registry: Arc<RpcProxyRegistry>,
        retries_number: u32,
        pause_ms: u64,
        prefetch_limit: u32,
    ) -> Self {
        Self {
            cache,
            session,
            rpc_registry,
            retries_number,
            pause_ms,
            prefetch_limit,
            root_lock: Mutex::new(()),
            meta_lock: Mutex::new(()),
            user_lock: Mutex::new(()),
        }
    }

    /// Resolves `(table, row)` to its covering region location.
    pub async fn locate_region(&self, table: &str, row: &RowKey, use_cache: bool) -> Result<RegionLocation> {
        if table == ROOT_TABLE {
            self.locate_root().await
        } else if table == META_TABLE {
            self.locate_meta_for(table, row, use_cache).await
        } else {
            self.locate_user(table, row, use_cache).await
        }
    }

    /// Invalidates the cached location for `(table, row)` and re-resolves.
    pub async fn relocate_region(&self, table: &str, row: &RowKey) -> Result<RegionLocation> {
        self.cache.invalidate(table, row, None);
        self.locate_region(table, row, false).await
    }

    async fn locate_root(&self) -> Result<RegionLocation> {
        if let Some(loc) = self.cache.root_location() {
            return Ok(loc);
        }

        let _guard = self.root_lock.lock().await;
        if let Some(loc) = self.cache.root_location() {
            return Ok(loc);
        }

        let mut causes = Vec::new();
        for attempt in 0..self.retries_number {
            match self.session.acquire().await {
                Ok(()) => {}
                Err(e) if !e.is_do_not_retry() => {
                    causes.push(e.to_string());
                    tokio::time::sleep(backoff_delay(attempt, self.pause_ms)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self.session.root_region_address().await {
                Some(addr) => {
                    let region_info = RegionInfo::new(ROOT_TABLE, RowKey::default(), RowKey::default(), 0);
                    let loc = RegionLocation::new(region_info, addr);
                    self.cache.set_root_location(loc.clone());
                    debug!(server = %loc.server_address, "resolved root region");
                    return Ok(loc);
                }
                None => {
                    causes.push("coordination service reports no root address".to_string());
                    tokio::time::sleep(backoff_delay(attempt, self.pause_ms)).await;
                }
            }
        }

        warn!(?causes, "root region resolution exhausted retries");
        Err(ClusterError::NoServerForRegion(ROOT_TABLE.to_string()))
    }

    /// Resolves the meta region covering `(for_table, row)`, using the
    /// closest-row-before probe key against the root region.
    async fn locate_meta_for(&self, for_table: &str, row: &RowKey, use_cache: bool) -> Result<RegionLocation> {
        let probe = closest_row_before_probe(for_table, row);
        let probe_key = RowKey(probe.0.clone());

        if use_cache {
            if let Some(loc) = self.cache.lookup(META_TABLE, &probe_key) {
                return Ok(loc);
            }
        }

        let _guard = self.meta_lock.lock().await;
        if use_cache {
            if let Some(loc) = self.cache.lookup(META_TABLE, &probe_key) {
                return Ok(loc);
            }
        }

        let mut causes = Vec::new();
        for attempt in 0..self.retries_number {
            let root_loc = match self.locate_root().await {
                Ok(loc) => loc,
                Err(e) if e.is_do_not_retry() => return Err(e),
                Err(e) => {
                    causes.push(e.to_string());
                    tokio::time::sleep(backoff_delay(attempt, self.pause_ms)).await;
                    continue;
                }
            };

            let stub = self.rpc_registry.get_shard_server(&root_loc.server_address).await?;
            match stub
                .get_closest_row_before(&root_loc.region_info.region_name, &probe_key, META_FAMILY)
                .await
            {
                Ok(Some((_, columns))) => {
                    let (region_info, server) = decode_region_row(&columns)?;
                    if region_info.offline {
                        causes.push(format!("region {} offline", region_info.encoded_name));
                        tokio::time::sleep(backoff_delay(attempt, self.pause_ms)).await;
                        continue;
                    }
                    let loc = RegionLocation::new(region_info, server);
                    self.cache.insert(META_TABLE, loc.clone());
                    return Ok(loc);
                }
                Ok(None) => return Err(ClusterError::TableNotFound(for_table.to_string())),
                Err(e) => {
                    if e.is_do_not_retry() {
                        return Err(e);
                    }
                    if !e.is_region_offline() && !e.is_no_server_for_region() {
                        self.cache.invalidate_root();
                    }
                    causes.push(e.to_string());
                    tokio::time::sleep(backoff_delay(attempt, self.pause_ms)).await;
                }
            }
        }

        warn!(?causes, table = for_table, "meta region resolution exhausted retries");
        Err(ClusterError::NoServerForRegion(META_TABLE.to_string()))
    }

    async fn locate_user(&self, table: &str, row: &RowKey, use_cache: bool) -> Result<RegionLocation> {
        if use_cache {
            if let Some(loc) = self.cache.lookup(table, row) {
                return Ok(loc);
            }
        }

        let _guard = self.user_lock.lock().await;
        if use_cache {
            if let Some(loc) = self.cache.lookup(table, row) {
                return Ok(loc);
            }
        }

        let mut causes = Vec::new();
        for attempt in 0..self.retries_number {
            let meta_loc = match self.locate_meta_for(table, row, true).await {
                Ok(loc) => loc,
                Err(e) if e.is_do_not_retry() => return Err(e),
                Err(e) => {
                    causes.push(e.to_string());
                    tokio::time::sleep(backoff_delay(attempt, self.pause_ms)).await;
                    continue;
                }
            };

            let stub = self.rpc_registry.get_shard_server(&meta_loc.server_address).await?;
            match stub
                .get_closest_row_before(&meta_loc.region_info.region_name, row, META_FAMILY)
                .await
            {
                Ok(Some((_, columns))) => {
                    let (region_info, server) = decode_region_row(&columns)?;
                    if region_info.table_name != table {
                        return Err(ClusterError::TableNotFound(table.to_string()));
                    }
                    if region_info.offline {
                        causes.push(format!("region {} offline", region_info.encoded_name));
                        tokio::time::sleep(backoff_delay(attempt, self.pause_ms)).await;
                        continue;
                    }
                    let loc = RegionLocation::new(region_info.clone(), server.clone());
                    self.cache.insert(table, loc.clone());

                    if self.cache.is_prefetch_enabled(table) {
                        self.prefetch(table, &meta_loc, &region_info).await;
                    }

                    return Ok(loc);
                }
                Ok(None) => return Err(ClusterError::TableNotFound(table.to_string())),
                Err(e) => {
                    if e.is_do_not_retry() {
                        return Err(e);
                    }
                    if !e.is_region_offline() && !e.is_no_server_for_region() {
                        let meta_probe = closest_row_before_probe(table, row);
                        self.cache.invalidate(META_TABLE, &RowKey(meta_probe.0), None);
                    }
                    causes.push(e.to_string());
                    tokio::time::sleep(backoff_delay(attempt, self.pause_ms)).await;
                }
            }
        }

        warn!(?causes, table, "user region resolution exhausted retries");
        Err(ClusterError::NoServerForRegion(table.to_string()))
    }

    /// Reads up to `prefetch_limit` consecutive region descriptors from
    /// `just_resolved.end_key` onward and inserts each into the cache.
    /// Stops early on an offline region or one belonging to a different
    /// table (spec §4.4). Best-effort: scan failures are logged and
    /// otherwise ignored, since prefetch never gates the caller.
    async fn prefetch(&self, table: &str, meta_loc: &RegionLocation, just_resolved: &RegionInfo) {
        if just_resolved.end_key.is_empty() {
            return;
        }
        let stub = match self.rpc_registry.get_shard_server(&meta_loc.server_address).await {
            Ok(stub) => stub,
            Err(e) => {
                debug!(error = %e, "prefetch skipped: could not reach meta server");
                return;
            }
        };

        let rows = match stub
            .meta_scan(&meta_loc.region_info.region_name, &just_resolved.end_key, self.prefetch_limit)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, "prefetch scan failed");
                return;
            }
        };

        for (_, columns) in rows {
            let Ok((region_info, server)) = decode_region_row(&columns) else {
                break;
            };
            if region_info.offline || region_info.table_name != table {
                break;
            }
            self.cache.insert(table, RegionLocation::new(region_info, server));
        }
    }

    /// Exposes the underlying cache to other components (e.g. the
    /// `Connection` facade's `clear_region_cache`/`is_dead_server` calls).
    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    /// Resolves the meta region covering `(table, row)`. Exposed so
    /// `Connection::locate_regions` can walk a table's meta entries
    /// directly, bypassing the per-row `contains_row` gate that
    /// `locate_region` applies (needed to surface offline regions).
    pub async fn locate_meta(&self, table: &str, row: &RowKey) -> Result<RegionLocation> {
        self.locate_meta_for(table, row, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CoordinationClient;
    use crate::identifiers::RegionName;
    use crate::test_support::{FakeCoordClient, FakeFactory, FakeMaster, FakeShard};

    fn build_locator(shard: Arc<FakeShard>, root_addr: ServerAddress) -> Locator {
        let session = Arc::new(CoordinationSession::new(3, move || {
            let root_addr = root_addr.clone();
            async move { Ok(Arc::new(FakeCoordClient::new(None, Some(root_addr))) as Arc<dyn CoordinationClient>) }
        }));
        let factory = Arc::new(FakeFactory::new(shard, Arc::new(FakeMaster::new(vec![]))));
        let rpc_registry = Arc::new(RpcProxyRegistry::new(factory, 1000));
        Locator::new(LocationCache::new(), session, rpc_registry, 3, 1, 10)
    }

    #[tokio::test]
    async fn locate_root_resolves_via_coordination_service() {
        let shard = Arc::new(FakeShard::new());
        let locator = build_locator(shard, ServerAddress::new("root1", 1));
        let loc = locator.locate_region(ROOT_TABLE, &RowKey::default(), true).await.unwrap();
        assert_eq!(loc.server_address, ServerAddress::new("root1", 1));
    }

    #[tokio::test]
    async fn locate_user_table_resolves_full_ladder() {
        let root_addr = ServerAddress::new("root1", 1);
        let shard = Arc::new(FakeShard::new());

        let root_region_name = RegionName(b"-ROOT-,,0".to_vec());
        let meta_region_info = RegionInfo::new("meta-a", RowKey::default(), RowKey::default(), 0);
        let meta_server = ServerAddress::new("meta1", 2);
        shard.add_row(
            &root_region_name,
            RowKey(closest_row_before_probe("users", &RowKey::from("alice")).0),
            encode_region_row(&meta_region_info, &meta_server),
        );

        let user_region_info = RegionInfo::new("users", RowKey::from("a"), RowKey::from("z"), 7);
        let user_server = ServerAddress::new("user1", 3);
        shard.add_row(
            &meta_region_info.region_name,
            RowKey::from("alice"),
            encode_region_row(&user_region_info, &user_server),
        );

        let locator = build_locator(shard, root_addr);
        let loc = locator
            .locate_region("users", &RowKey::from("alice"), true)
            .await
            .unwrap();
        assert_eq!(loc.server_address, user_server);
        assert_eq!(loc.region_info.table_name, "users");

        // second lookup should hit the cache, not re-query the fakes.
        let cached = locator.locate_region("users", &RowKey::from("alice"), true).await.unwrap();
        assert_eq!(cached.server_address, user_server);
    }

    #[tokio::test]
    async fn relocate_invalidates_then_reresolves() {
        let root_addr = ServerAddress::new("root1", 1);
        let shard = Arc::new(FakeShard::new());
        let root_region_name = RegionName(b"-ROOT-,,0".to_vec());
        let meta_region_info = RegionInfo::new("meta-a", RowKey::default(), RowKey::default(), 0);
        let meta_server = ServerAddress::new("meta1", 2);
        shard.add_row(
            &root_region_name,
            RowKey(closest_row_before_probe("users", &RowKey::from("bob")).0),
            encode_region_row(&meta_region_info, &meta_server),
        );
        let user_region_info = RegionInfo::new("users", RowKey::from("a"), RowKey::from("z"), 1);
        let user_server = ServerAddress::new("user1", 3);
        shard.add_row(
            &meta_region_info.region_name,
            RowKey::from("bob"),
            encode_region_row(&user_region_info, &user_server),
        );

        let locator = build_locator(shard, root_addr);
        let first = locator.locate_region("users", &RowKey::from("bob"), true).await.unwrap();
        assert_eq!(first.server_address, user_server);

        let again = locator.relocate_region("users", &RowKey::from("bob")).await.unwrap();
        assert_eq!(again.server_address, user_server);
    }
}
