use super::{MasterClient, ShardServerClient, StubFactory};
use crate::error::Result;
use crate::identifiers::ServerAddress;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

/// Keyed pool of RPC stubs. Shard-server stubs are cached unconditionally
/// on first creation; the master stub additionally verifies liveness
/// before being cached, and concurrent discoverers share one in-flight
/// attempt (spec §4.2).
pub struct RpcProxyRegistry {
    factory: Arc<dyn StubFactory>,
    rpc_timeout_ms: u64,
    shard_servers: RwLock<HashMap<ServerAddress, Arc<dyn ShardServerClient>>>,
    master: Mutex<Option<Arc<dyn MasterClient>>>,
    master_discovery_in_flight: Mutex<bool>,
    master_notify: Notify,
}

impl RpcProxyRegistry {
    pub fn new(factory: Arc<dyn StubFactory>, rpc_timeout_ms: u64) -> Self {
        Self {
            factory,
            rpc_timeout_ms,
            shard_servers: RwLock::new(HashMap::new()),
            master: Mutex::new(None),
            master_discovery_in_flight: Mutex::new(false),
            master_notify: Notify::new(),
        }
    }

    /// Returns a stub for `addr`, creating it on miss using the
    /// registry's configured RPC timeout. Double-checked locking: a
    /// fast read-lock path covers the common case; a miss falls through
    /// to a write-lock with re-check.
    pub async fn get_shard_server(&self, addr: &ServerAddress) -> Result<Arc<dyn ShardServerClient>> {
        {
            let servers = self.shard_servers.read().await;
            if let Some(stub) = servers.get(addr) {
                return Ok(Arc::clone(stub));
            }
        }

        let mut servers = self.shard_servers.write().await;
        if let Some(stub) = servers.get(addr) {
            return Ok(Arc::clone(stub));
        }

        debug!(%addr, "creating shard server stub");
        let stub = self.factory.create_shard_server(addr, self.rpc_timeout_ms).await?;
        servers.insert(addr.clone(), Arc::clone(&stub));
        Ok(stub)
    }

    /// Returns the master stub, testing `is_master_running()` before
    /// caching it. Only one caller performs discovery at a time; the
    /// rest wait on `master_notify` and reuse the result.
    pub async fn get_master(&self, addr: &ServerAddress) -> Result<Arc<dyn MasterClient>> {
        loop {
            {
                let master = self.master.lock().await;
                if let Some(stub) = master.as_ref() {
                    return Ok(Arc::clone(stub));
                }
            }

            let mut in_flight = self.master_discovery_in_flight.lock().await;
            if *in_flight {
                drop(in_flight);
                self.master_notify.notified().await;
                continue;
            }
            *in_flight = true;
            drop(in_flight);

            let result = self.discover_master(addr).await;

            *self.master_discovery_in_flight.lock().await = false;
            self.master_notify.notify_waiters();

            return result;
        }
    }

    async fn discover_master(&self, addr: &ServerAddress) -> Result<Arc<dyn MasterClient>> {
        debug!(%addr, "discovering master stub");
        let stub = self.factory.create_master(addr, self.rpc_timeout_ms).await?;
        if stub.is_master_running().await? {
            *self.master.lock().await = Some(Arc::clone(&stub));
        }
        Ok(stub)
    }

    /// Drops the cached master stub so the next `get_master` re-discovers.
    pub async fn invalidate_master(&self) {
        *self.master.lock().await = None;
    }

    /// Drops a cached shard-server stub (e.g. after the server is
    /// declared dead).
    pub async fn drop_shard_server(&self, addr: &ServerAddress) {
        self.shard_servers.write().await.remove(addr);
    }

    /// Tears down every cached stub.
    pub async fn shutdown(&self) {
        self.shard_servers.write().await.clear();
        *self.master.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use crate::identifiers::RegionInfo;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeShard;
    #[async_trait::async_trait]
    impl ShardServerClient for FakeShard {
        async fn multi_action(
            &self,
            _region_name: &crate::identifiers::RegionName,
            _actions: &[super::super::IndexedAction],
        ) -> Result<Vec<(usize, super::super::ActionResult)>> {
            Ok(vec![])
        }
        async fn get_closest_row_before(
            &self,
            _region_name: &crate::identifiers::RegionName,
            _key: &crate::identifiers::RowKey,
            _family: &str,
        ) -> Result<Option<(crate::identifiers::RowKey, Vec<(String, Vec<u8>)>)>> {
            Ok(None)
        }
        async fn meta_scan(
            &self,
            _region_name: &crate::identifiers::RegionName,
            _start_key: &crate::identifiers::RowKey,
            _limit: u32,
        ) -> Result<Vec<(crate::identifiers::RowKey, Vec<(String, Vec<u8>)>)>> {
            Ok(vec![])
        }
        async fn put(&self, _region_name: &crate::identifiers::RegionName, _puts: &[super::super::Action]) -> Result<i32> {
            Ok(0)
        }
        async fn delete(&self, _region_name: &crate::identifiers::RegionName, _deletes: &[super::super::Action]) -> Result<i32> {
            Ok(0)
        }
        async fn mutate_row(&self, _region_name: &crate::identifiers::RegionName, _mutations: &[super::super::Action]) -> Result<()> {
            Ok(())
        }
        async fn get_region_info(&self, _region_name: &crate::identifiers::RegionName) -> Result<RegionInfo> {
            Err(ClusterError::DoNotRetry("unsupported in test".into()))
        }
        async fn get_regions_assignment(&self) -> Result<Vec<RegionInfo>> {
            Ok(vec![])
        }
    }

    struct FakeMaster {
        running: bool,
    }
    #[async_trait::async_trait]
    impl MasterClient for FakeMaster {
        async fn is_master_running(&self) -> Result<bool> {
            Ok(self.running)
        }
        async fn list_tables(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn is_table_enabled(&self, _name: &str) -> Result<bool> {
            Ok(true)
        }
        async fn is_table_disabled(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn get_table_descriptor(&self, name: &str) -> Result<super::TableDescriptor> {
            Ok(super::TableDescriptor {
                name: name.to_string(),
                enabled: true,
                column_families: vec![],
            })
        }
    }

    struct FakeFactory {
        shard_calls: AtomicU32,
        master_calls: AtomicU32,
        master_running: bool,
    }
    #[async_trait::async_trait]
    impl StubFactory for FakeFactory {
        async fn create_shard_server(&self, _addr: &ServerAddress, _timeout_ms: u64) -> Result<Arc<dyn ShardServerClient>> {
            self.shard_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeShard))
        }
        async fn create_master(&self, _addr: &ServerAddress, _timeout_ms: u64) -> Result<Arc<dyn MasterClient>> {
            self.master_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeMaster { running: self.master_running }))
        }
    }

    #[tokio::test]
    async fn shard_server_stub_is_reused() {
        let factory = Arc::new(FakeFactory {
            shard_calls: AtomicU32::new(0),
            master_calls: AtomicU32::new(0),
            master_running: true,
        });
        let registry = RpcProxyRegistry::new(factory.clone(), 1000);
        let addr = ServerAddress::new("h", 1);
        registry.get_shard_server(&addr).await.unwrap();
        registry.get_shard_server(&addr).await.unwrap();
        assert_eq!(factory.shard_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn master_stub_not_cached_when_not_running() {
        let factory = Arc::new(FakeFactory {
            shard_calls: AtomicU32::new(0),
            master_calls: AtomicU32::new(0),
            master_running: false,
        });
        let registry = RpcProxyRegistry::new(factory.clone(), 1000);
        let addr = ServerAddress::new("h", 2);
        registry.get_master(&addr).await.unwrap();
        registry.get_master(&addr).await.unwrap();
        assert_eq!(factory.master_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn master_stub_cached_when_running() {
        let factory = Arc::new(FakeFactory {
            shard_calls: AtomicU32::new(0),
            master_calls: AtomicU32::new(0),
            master_running: true,
        });
        let registry = RpcProxyRegistry::new(factory.clone(), 1000);
        let addr = ServerAddress::new("h", 3);
        registry.get_master(&addr).await.unwrap();
        registry.get_master(&addr).await.unwrap();
        assert_eq!(factory.master_calls.load(Ordering::SeqCst), 1);
    }
}
