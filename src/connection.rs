//! Connection facade (spec §6).
//!
//! The public surface a per-table handle or administrative client talks
//! to: a single owning struct composing the locator, caches, master
//! holder, RPC registry, and batch engine, mirroring the way
//! `networking::pool::manager::PoolManager` is the one top-level struct
//! other code holds on to.

use crate::batch::BatchEngine;
use crate::cache::LocationCache;
use crate::config::ClientConfig;
use crate::coordination::CoordinationSession;
use crate::error::{ClusterError, Result};
use crate::identifiers::{RegionInfo, RegionLocation, RegionName, RowKey, ServerAddress};
use crate::locator::{decode_region_row, Locator};
use crate::master::MasterProxyHolder;
use crate::rpc::{Action, MasterClient, RpcProxyRegistry, ShardServerClient, StubFactory, TableDescriptor};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Hard cap on meta-scan pagination rounds in `locate_regions`, guarding
/// against an unbounded loop if meta rows never signal end-of-table.
const MAX_META_SCAN_ROUNDS: u32 = 10_000;

pub struct Connection {
    config: ClientConfig,
    session: Arc<CoordinationSession>,
    rpc_registry: Arc<RpcProxyRegistry>,
    locator: Arc<Locator>,
    master_holder: Arc<MasterProxyHolder>,
    batch_engine: BatchEngine,
    closed: AtomicBool,
}

impl Connection {
    /// Builds a connection from its two external collaborators: the RPC
    /// stub factory and an already-constructed coordination session
    /// (itself parameterized by a `CoordinationClient` factory — see
    /// `CoordinationSession::new`).
    pub fn new(config: ClientConfig, factory: Arc<dyn StubFactory>, session: Arc<CoordinationSession>) -> Self {
        let rpc_registry = Arc::new(RpcProxyRegistry::new(factory, config.rpc_timeout_ms));
        let cache = LocationCache::new();
        let locator = Arc::new(Locator::new(
            cache.clone(),
            Arc::clone(&session),
            Arc::clone(&rpc_registry),
            config.retries_number,
            config.pause_ms,
            config.prefetch_limit,
        ));
        let master_holder = Arc::new(MasterProxyHolder::new(
            Arc::clone(&session),
            Arc::clone(&rpc_registry),
            config.retries_number,
            config.pause_ms,
        ));
        let batch_engine = BatchEngine::new(
            Arc::clone(&locator),
            Arc::clone(&rpc_registry),
            cache,
            config.retries_number,
            config.pause_ms,
        );

        Self {
            config,
            session,
            rpc_registry,
            locator,
            master_holder,
            batch_engine,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClusterError::DoNotRetry("connection is closed".into()))
        } else {
            Ok(())
        }
    }

    pub fn configuration(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn is_master_running(&self) -> Result<bool> {
        self.ensure_open()?;
        self.master_holder.is_master_running().await
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.master_holder.get_master().await?.list_tables().await
    }

    pub async fn get_table_descriptor(&self, name: &str) -> Result<TableDescriptor> {
        self.ensure_open()?;
        self.master_holder.get_master().await?.get_table_descriptor(name).await
    }

    pub async fn is_table_enabled(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        self.master_holder.get_master().await?.is_table_enabled(name).await
    }

    pub async fn is_table_disabled(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        self.master_holder.get_master().await?.is_table_disabled(name).await
    }

    /// `true` if every known region of `name` is online.
    pub async fn is_table_available(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        let regions = self.locate_regions(name, false, true).await?;
        Ok(!regions.is_empty() && regions.iter().all(|r| !r.offline))
    }

    /// Like `is_table_available`, additionally verifying the region
    /// boundaries exactly match `split_keys` (one region per key plus
    /// the unbounded tail region).
    pub async fn is_table_available_with_splits(&self, name: &str, split_keys: &[RowKey]) -> Result<bool> {
        self.ensure_open()?;
        let regions = self.locate_regions(name, false, true).await?;
        if regions.iter().any(|r| r.offline) {
            return Ok(false);
        }
        let mut starts: Vec<&RowKey> = regions.iter().map(|r| &r.start_key).collect();
        starts.sort();
        let mut expected: Vec<&RowKey> = std::iter::once(&RowKey(Vec::new())).chain(split_keys.iter()).collect();
        expected.sort();
        Ok(starts == expected)
    }

    pub async fn locate_region(&self, table: &str, row: &RowKey) -> Result<RegionLocation> {
        self.ensure_open()?;
        self.locator.locate_region(table, row, true).await
    }

    pub async fn relocate_region(&self, table: &str, row: &RowKey) -> Result<RegionLocation> {
        self.ensure_open()?;
        self.locator.relocate_region(table, row).await
    }

    pub fn locate_region_by_name(&self, region_name: &RegionName) -> Option<RegionLocation> {
        self.locator.cache().find_by_region_name(region_name)
    }

    /// Walks a table's meta entries from its first region onward,
    /// paginating with `meta_scanner_caching`-sized scans. Bypasses
    /// `Locator::locate_region`'s row-containment gate so offline
    /// regions are reportable rather than surfaced as errors.
    pub async fn locate_regions(&self, table: &str, use_cache: bool, include_offlined: bool) -> Result<Vec<RegionInfo>> {
        self.ensure_open()?;

        if use_cache {
            let cached = self.locator.cache().locations_for_table(table);
            if !cached.is_empty() {
                return Ok(cached.into_iter().map(|loc| loc.region_info).collect());
            }
        }

        let mut infos = Vec::new();
        let mut cursor = RowKey::default();

        for _ in 0..MAX_META_SCAN_ROUNDS {
            let meta_loc = self.locator.locate_meta(table, &cursor).await?;
            let stub = self.rpc_registry.get_shard_server(&meta_loc.server_address).await?;
            let rows = stub
                .meta_scan(&meta_loc.region_info.region_name, &cursor, self.config.meta_scanner_caching)
                .await?;
            if rows.is_empty() {
                break;
            }

            let mut reached_end = false;
            for (_, columns) in &rows {
                let (region_info, _server) = decode_region_row(columns)?;
                if region_info.table_name != table {
                    reached_end = true;
                    break;
                }
                if !region_info.offline || include_offlined {
                    let end_key = region_info.end_key.clone();
                    infos.push(region_info);
                    if end_key.is_empty() {
                        reached_end = true;
                        break;
                    }
                    cursor = end_key;
                } else {
                    cursor = region_info.end_key.clone();
                    if cursor.is_empty() {
                        reached_end = true;
                        break;
                    }
                }
            }
            if reached_end {
                break;
            }
        }

        Ok(infos)
    }

    pub fn clear_region_cache(&self) {
        self.locator.cache().drop_all();
    }

    pub fn clear_region_cache_for_table(&self, table: &str) {
        self.locator.cache().drop_table(table);
    }

    pub fn drop_cached_location(&self, location: &RegionLocation) {
        self.locator.cache().invalidate(
            &location.region_info.table_name,
            &location.region_info.start_key,
            Some(&location.server_address),
        );
    }

    pub fn clear_caches_for_server(&self, server: &ServerAddress) {
        self.locator.cache().drop_server(server);
    }

    pub async fn get_shard_admin(&self, server: &ServerAddress, check_master: bool) -> Result<Arc<dyn ShardServerClient>> {
        self.ensure_open()?;
        if check_master && !self.is_master_running().await? {
            return Err(ClusterError::MasterNotRunning(format!("master unavailable, refusing admin stub for {server}")));
        }
        self.rpc_registry.get_shard_server(server).await
    }

    pub async fn get_shard_client(&self, server: &ServerAddress) -> Result<Arc<dyn ShardServerClient>> {
        self.ensure_open()?;
        self.rpc_registry.get_shard_server(server).await
    }

    pub async fn keep_alive_master_monitor(&self) -> Result<Arc<dyn MasterClient>> {
        self.ensure_open()?;
        self.master_holder.get_master().await
    }

    pub async fn keep_alive_master_admin(&self) -> Result<Arc<dyn MasterClient>> {
        self.ensure_open()?;
        self.master_holder.get_master().await
    }

    pub fn is_dead_server(&self, server: &ServerAddress) -> bool {
        !self.locator.cache().known_servers().contains(server)
    }

    pub fn set_region_cache_prefetch(&self, table: &str, enabled: bool) {
        self.locator.cache().set_prefetch_enabled(table, enabled);
    }

    pub fn region_cache_prefetch(&self, table: &str) -> bool {
        self.locator.cache().is_prefetch_enabled(table)
    }

    pub async fn batch_gets(&self, table: &str, rows: &[RowKey]) -> Result<Vec<Option<Vec<(String, Vec<u8>)>>>> {
        self.ensure_open()?;
        self.batch_engine.batch_gets(table, rows).await
    }

    pub async fn batch_mutations(&self, table: &str, mutations: &[(RowKey, Action)]) -> Result<Vec<(usize, ClusterError)>> {
        self.ensure_open()?;
        self.batch_engine.batch_mutations(table, mutations).await
    }

    /// Runs `operation` under the bounded single-row retry loop, using
    /// this connection's cache and configured retry/backoff/deadline
    /// settings (spec §4.6).
    pub async fn with_retries<F, Fut, T>(&self, table: &str, row: &RowKey, server: &ServerAddress, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        crate::retry::with_retries(
            self.locator.cache(),
            table,
            row,
            Some(server),
            self.config.retries_number,
            self.config.pause_ms,
            self.config.rpc_retry_timeout_ms,
            operation,
            || async { self.locator.locate_region(table, row, true).await.map(|loc| loc.server_address) },
        )
        .await
    }

    /// Runs `operation` once; on a locally-raised transient failure,
    /// drops every cache entry for `server` (spec §4.6).
    pub async fn without_retries<F, Fut, T>(&self, server: &ServerAddress, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        crate::retry::without_retries(self.locator.cache(), Some(server), operation).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: tears down the RPC registry and the
    /// coordination session. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.rpc_registry.shutdown().await;
        self.session.close().await;
        Ok(())
    }

    /// Immediate, non-graceful shutdown triggered by an unrecoverable
    /// caller-observed condition.
    pub async fn abort(&self, message: &str, cause: Option<&ClusterError>) {
        error!(message, ?cause, "connection aborted");
        if let Err(e) = self.close().await {
            warn!(error = %e, "error while closing connection during abort");
        }
    }
}
