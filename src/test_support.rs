//! Shared test fakes (spec.md §8's in-memory fixtures), generalizing the
//! teacher's `TestHandler` pattern in `networking/routing/router.rs`'s
//! test module into one reusable set so the locator, retry, batch,
//! master, connection, and registry test modules don't each redefine
//! near-identical `ShardServerClient`/`CoordinationClient`/`MasterClient`
//! fakes.

use crate::coordination::{CoordinationClient, CoordinationListener};
use crate::error::{ClusterError, Result};
use crate::identifiers::{RegionInfo, RegionName, RowKey, ServerAddress};
use crate::rpc::{Action, ActionResult, IndexedAction, MasterClient, ShardServerClient, StubFactory, TableDescriptor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

/// A coordination-service fake reporting fixed master/root addresses.
pub struct FakeCoordClient {
    master: Option<ServerAddress>,
    root: Option<ServerAddress>,
}

impl FakeCoordClient {
    pub fn new(master: Option<ServerAddress>, root: Option<ServerAddress>) -> Self {
        Self { master, root }
    }
}

#[async_trait::async_trait]
impl CoordinationClient for FakeCoordClient {
    async fn read_master_address(&self) -> Result<Option<ServerAddress>> {
        Ok(self.master.clone())
    }
    async fn read_root_region_address(&self) -> Result<Option<ServerAddress>> {
        Ok(self.root.clone())
    }
    async fn register_listener(&self, _listener: Box<dyn CoordinationListener>) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory shard server keyed by region name. `get_closest_row_before`
/// and `meta_scan` answer out of rows added via `add_row`; `multi_action`
/// can be scripted to fail the whole call once, or fail a single item by
/// `original_index` once, to exercise the batch engine's retry/regather
/// paths.
#[derive(Default)]
pub struct FakeShard {
    rows: StdMutex<HashMap<Vec<u8>, Vec<(RowKey, Vec<(String, Vec<u8>)>)>>>,
    pub multi_calls: AtomicU32,
    fail_server_once: StdMutex<bool>,
    fail_item_once: StdMutex<Option<usize>>,
}

impl FakeShard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&self, region_name: &RegionName, row: RowKey, columns: Vec<(String, Vec<u8>)>) {
        self.rows.lock().unwrap().entry(region_name.0.clone()).or_default().push((row, columns));
    }

    /// The next `multi_action` call fails the whole server call once.
    pub fn fail_server_once(&self) {
        *self.fail_server_once.lock().unwrap() = true;
    }

    /// The next `multi_action` call fails only the item at `original_index`.
    pub fn fail_item_once(&self, original_index: usize) {
        *self.fail_item_once.lock().unwrap() = Some(original_index);
    }
}

#[async_trait::async_trait]
impl ShardServerClient for FakeShard {
    async fn multi_action(&self, _region_name: &RegionName, actions: &[IndexedAction]) -> Result<Vec<(usize, ActionResult)>> {
        self.multi_calls.fetch_add(1, Ordering::SeqCst);

        let mut should_fail = self.fail_server_once.lock().unwrap();
        if *should_fail {
            *should_fail = false;
            return Err(ClusterError::TransientNetwork("simulated".into()));
        }
        drop(should_fail);

        let failing_index = self.fail_item_once.lock().unwrap().take();
        Ok(actions
            .iter()
            .map(|a| {
                if failing_index == Some(a.original_index) {
                    (a.original_index, ActionResult::Failure(ClusterError::TransientNetwork("item simulated".into())))
                } else {
                    (a.original_index, ActionResult::Success(Some(vec![("v".to_string(), b"ok".to_vec())])))
                }
            })
            .collect())
    }

    async fn get_closest_row_before(
        &self,
        region_name: &RegionName,
        key: &RowKey,
        _family: &str,
    ) -> Result<Option<(RowKey, Vec<(String, Vec<u8>)>)>> {
        let rows = self.rows.lock().unwrap();
        let Some(candidates) = rows.get(&region_name.0) else {
            return Ok(None);
        };
        Ok(candidates.iter().filter(|(row, _)| row <= key).max_by(|(a, _), (b, _)| a.cmp(b)).cloned())
    }

    async fn meta_scan(&self, region_name: &RegionName, start_key: &RowKey, limit: u32) -> Result<Vec<(RowKey, Vec<(String, Vec<u8>)>)>> {
        let rows = self.rows.lock().unwrap();
        let Some(candidates) = rows.get(&region_name.0) else {
            return Ok(vec![]);
        };
        Ok(candidates.iter().filter(|(row, _)| row >= start_key).take(limit as usize).cloned().collect())
    }

    async fn put(&self, _region_name: &RegionName, _puts: &[Action]) -> Result<i32> {
        Ok(0)
    }
    async fn delete(&self, _region_name: &RegionName, _deletes: &[Action]) -> Result<i32> {
        Ok(0)
    }
    async fn mutate_row(&self, _region_name: &RegionName, _mutations: &[Action]) -> Result<()> {
        Ok(())
    }
    async fn get_region_info(&self, _region_name: &RegionName) -> Result<RegionInfo> {
        Err(ClusterError::DoNotRetry("unsupported".into()))
    }
    async fn get_regions_assignment(&self) -> Result<Vec<RegionInfo>> {
        Ok(vec![])
    }
}

/// A master fake that always reports itself running and answers from a
/// fixed table list.
pub struct FakeMaster {
    tables: Vec<String>,
}

impl FakeMaster {
    pub fn new(tables: Vec<String>) -> Self {
        Self { tables }
    }
}

#[async_trait::async_trait]
impl MasterClient for FakeMaster {
    async fn is_master_running(&self) -> Result<bool> {
        Ok(true)
    }
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.clone())
    }
    async fn is_table_enabled(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }
    async fn is_table_disabled(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }
    async fn get_table_descriptor(&self, name: &str) -> Result<TableDescriptor> {
        Ok(TableDescriptor {
            name: name.to_string(),
            enabled: true,
            column_families: vec![],
        })
    }
}

/// Builds stubs backed by a single shared `FakeShard` and `FakeMaster`.
pub struct FakeFactory {
    shard: Arc<FakeShard>,
    master: Arc<FakeMaster>,
    pub master_calls: AtomicU32,
}

impl FakeFactory {
    pub fn new(shard: Arc<FakeShard>, master: Arc<FakeMaster>) -> Self {
        Self {
            shard,
            master,
            master_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl StubFactory for FakeFactory {
    async fn create_shard_server(&self, _addr: &ServerAddress, _timeout_ms: u64) -> Result<Arc<dyn ShardServerClient>> {
        Ok(self.shard.clone())
    }
    async fn create_master(&self, _addr: &ServerAddress, _timeout_ms: u64) -> Result<Arc<dyn MasterClient>> {
        self.master_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.master.clone())
    }
}
