//! RPC proxy registry (spec §4.2).
//!
//! Capability traits modeling the wire protocol to a shard server and to
//! the master, plus a keyed pool of stubs bound to `(server_address,
//! interface_kind)` so repeated calls to the same server reuse one stub.

mod registry;

pub use registry::RpcProxyRegistry;

use crate::error::Result;
use crate::identifiers::{RegionInfo, RegionName, RowKey, ServerAddress};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single mutation or get bound for one region, as submitted to
/// `multi_action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Action {
    Get { row: RowKey },
    Put { row: RowKey, values: Vec<(String, Vec<u8>)> },
    Delete { row: RowKey },
}

/// One action plus the index of its slot in the caller's original
/// request list, so multi-round batch results can be placed back in order.
#[derive(Debug, Clone)]
pub struct IndexedAction {
    pub original_index: usize,
    pub action: Action,
}

/// Outcome of a single `Action` inside a `multi_action` response.
#[derive(Debug, Clone)]
pub enum ActionResult {
    Success(Option<Vec<(String, Vec<u8>)>>),
    Failure(crate::error::ClusterError),
}

/// Capability trait for the wire protocol exposed by a shard (region)
/// server (spec §6, "wire protocol to a shard server").
#[async_trait]
pub trait ShardServerClient: Send + Sync {
    async fn multi_action(
        &self,
        region_name: &RegionName,
        actions: &[IndexedAction],
    ) -> Result<Vec<(usize, ActionResult)>>;

    async fn get_closest_row_before(
        &self,
        region_name: &RegionName,
        key: &RowKey,
        family: &str,
    ) -> Result<Option<(RowKey, Vec<(String, Vec<u8>)>)>>;

    /// Meta-scan helper (spec §6): yields rows with key `>= start_key`,
    /// up to `limit` rows, used by the locator's prefetch window.
    async fn meta_scan(
        &self,
        region_name: &RegionName,
        start_key: &RowKey,
        limit: u32,
    ) -> Result<Vec<(RowKey, Vec<(String, Vec<u8>)>)>>;

    async fn put(&self, region_name: &RegionName, puts: &[Action]) -> Result<i32>;
    async fn delete(&self, region_name: &RegionName, deletes: &[Action]) -> Result<i32>;
    async fn mutate_row(&self, region_name: &RegionName, mutations: &[Action]) -> Result<()>;
    async fn get_region_info(&self, region_name: &RegionName) -> Result<RegionInfo>;
    async fn get_regions_assignment(&self) -> Result<Vec<RegionInfo>>;
}

/// Administrative description of a table, as returned by the master.
/// The connection core treats this as an opaque value it passes through
/// to callers; it never inspects `column_families` itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub enabled: bool,
    pub column_families: Vec<String>,
}

/// Capability trait for the master's administrative surface.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn is_master_running(&self) -> Result<bool>;
    async fn list_tables(&self) -> Result<Vec<String>>;
    async fn is_table_enabled(&self, name: &str) -> Result<bool>;
    async fn is_table_disabled(&self, name: &str) -> Result<bool>;
    async fn get_table_descriptor(&self, name: &str) -> Result<TableDescriptor>;
}

/// Which capability a pooled stub implements, used as half of the
/// `RpcProxyRegistry` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    ShardServer,
    Master,
}

/// Constructs concrete stub instances for a server address. The
/// connection core depends only on this factory trait, never on a
/// specific transport.
#[async_trait]
pub trait StubFactory: Send + Sync {
    async fn create_shard_server(&self, addr: &ServerAddress, timeout_ms: u64) -> Result<std::sync::Arc<dyn ShardServerClient>>;
    async fn create_master(&self, addr: &ServerAddress, timeout_ms: u64) -> Result<std::sync::Arc<dyn MasterClient>>;
}
