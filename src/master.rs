//! Master proxy holder (spec §4.5).
//!
//! Discovers the master via the coordination service and verifies
//! liveness, serializing concurrent discoverers behind a mutex with
//! notify-all so they share one outcome.

use crate::coordination::CoordinationSession;
use crate::error::{ClusterError, Result};
use crate::identifiers::ServerAddress;
use crate::rpc::{MasterClient, RpcProxyRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Holds the current master proxy, re-running discovery whenever the
/// prior attempt returned nothing.
pub struct MasterProxyHolder {
    session: Arc<CoordinationSession>,
    rpc_registry: Arc<RpcProxyRegistry>,
    num_retries: u32,
    pause_ms: u64,
    current: Mutex<Option<Arc<dyn MasterClient>>>,
    discovery_in_flight: Mutex<bool>,
    notify: Notify,
    master_checked: AtomicBool,
}

impl MasterProxyHolder {
    pub fn new(
        session: Arc<CoordinationSession>,
        rpc_registry: Arc<RpcProxyRegistry>,
        num_retries: u32,
        pause_ms: u64,
    ) -> Self {
        Self {
            session,
            rpc_registry,
            num_retries,
            pause_ms,
            current: Mutex::new(None),
            discovery_in_flight: Mutex::new(false),
            notify: Notify::new(),
            master_checked: AtomicBool::new(false),
        }
    }

    /// Returns the current master proxy, discovering it if needed. A
    /// successful discovery sets `master_checked`; a null-result lookup
    /// re-runs discovery on the next call.
    pub async fn get_master(&self) -> Result<Arc<dyn MasterClient>> {
        loop {
            {
                let current = self.current.lock().await;
                if let Some(stub) = current.as_ref() {
                    return Ok(Arc::clone(stub));
                }
            }

            let mut in_flight = self.discovery_in_flight.lock().await;
            if *in_flight {
                drop(in_flight);
                self.notify.notified().await;
                continue;
            }
            *in_flight = true;
            drop(in_flight);

            let result = self.discover().await;

            *self.discovery_in_flight.lock().await = false;
            self.notify.notify_waiters();

            return result;
        }
    }

    async fn discover(&self) -> Result<Arc<dyn MasterClient>> {
        let mut last_err = None;
        for attempt in 0..self.num_retries {
            match self.try_discover_once().await {
                Ok(stub) => {
                    *self.current.lock().await = Some(Arc::clone(&stub));
                    self.master_checked.store(true, Ordering::SeqCst);
                    return Ok(stub);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "master discovery attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(self.pause_ms)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ClusterError::MasterNotRunning("discovery exhausted".into())))
    }

    async fn try_discover_once(&self) -> Result<Arc<dyn MasterClient>> {
        self.session.acquire().await?;
        let addr: ServerAddress = self
            .session
            .master_address()
            .await
            .ok_or_else(|| ClusterError::MasterNotRunning("no master address from coordination service".into()))?;

        debug!(%addr, "discovering master proxy");
        let stub = self.rpc_registry.get_master(&addr).await?;
        if stub.is_master_running().await? {
            Ok(stub)
        } else {
            Err(ClusterError::MasterNotRunning(format!("{addr} reports not running")))
        }
    }

    pub async fn is_master_running(&self) -> Result<bool> {
        match self.get_master().await {
            Ok(stub) => stub.is_master_running().await,
            Err(e) if matches!(e, ClusterError::MasterNotRunning(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drops the cached master proxy so the next call re-discovers.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
        self.master_checked.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CoordinationClient;
    use crate::test_support::{FakeCoordClient, FakeFactory, FakeMaster, FakeShard};

    #[tokio::test]
    async fn get_master_discovers_and_caches() {
        let session = Arc::new(CoordinationSession::new(3, || async {
            Ok(Arc::new(FakeCoordClient::new(Some(ServerAddress::new("master1", 60000)), None)) as Arc<dyn CoordinationClient>)
        }));
        let factory = Arc::new(FakeFactory::new(Arc::new(FakeShard::new()), Arc::new(FakeMaster::new(vec![]))));
        let registry = Arc::new(RpcProxyRegistry::new(factory.clone(), 1000));
        let holder = MasterProxyHolder::new(session, registry, 3, 1);

        holder.get_master().await.unwrap();
        holder.get_master().await.unwrap();
        assert_eq!(factory.master_calls.load(Ordering::SeqCst), 1);
        assert!(holder.is_master_running().await.unwrap());
    }

    /// End-to-end scenario 5 (master discovery race): two concurrent
    /// callers both miss the cached proxy and race into discovery; the
    /// single-flight lock must ensure only one of them actually builds a
    /// master stub.
    #[tokio::test]
    async fn concurrent_callers_share_one_discovery() {
        let session = Arc::new(CoordinationSession::new(3, || async {
            Ok(Arc::new(FakeCoordClient::new(Some(ServerAddress::new("master1", 60000)), None)) as Arc<dyn CoordinationClient>)
        }));
        let factory = Arc::new(FakeFactory::new(Arc::new(FakeShard::new()), Arc::new(FakeMaster::new(vec![]))));
        let registry = Arc::new(RpcProxyRegistry::new(factory.clone(), 1000));
        let holder = Arc::new(MasterProxyHolder::new(session, registry, 3, 1));

        let (a, b) = tokio::join!(
            { let holder = holder.clone(); async move { holder.get_master().await } },
            { let holder = holder.clone(); async move { holder.get_master().await } },
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(factory.master_calls.load(Ordering::SeqCst), 1);
    }
}
