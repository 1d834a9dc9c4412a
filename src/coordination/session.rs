use super::{CoordinationClient, CoordinationEvent, CoordinationListener};
use crate::error::{ClusterError, Result};
use crate::identifiers::ServerAddress;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type ClientFactory =
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Arc<dyn CoordinationClient>>> + Send>> + Send + Sync;

/// A single logical, process-wide session to the coordination quorum.
///
/// `acquire` lazily constructs the underlying client via the supplied
/// factory; `on_event` implements the reconnect-with-cap state machine
/// from spec §4.1.
pub struct CoordinationSession {
    factory: Box<ClientFactory>,
    max_reconnection: u32,
    reconnect_count: AtomicU32,
    aborted: AtomicBool,
    client: RwLock<Option<Arc<dyn CoordinationClient>>>,
    master_address: RwLock<Option<ServerAddress>>,
    root_region_address: RwLock<Option<ServerAddress>>,
}

impl CoordinationSession {
    pub fn new<F, Fut>(max_reconnection: u32, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn CoordinationClient>>> + Send + 'static,
    {
        Self {
            factory: Box::new(move || Box::pin(factory())),
            max_reconnection,
            reconnect_count: AtomicU32::new(0),
            aborted: AtomicBool::new(false),
            client: RwLock::new(None),
            master_address: RwLock::new(None),
            root_region_address: RwLock::new(None),
        }
    }

    /// Lazily creates the session, retrying the factory up to
    /// `max_reconnection` times. Fails with `CoordinationSessionLostPermanent`
    /// once the cap is exceeded, and once aborted never attempts again.
    pub async fn acquire(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(ClusterError::CoordinationSessionLostPermanent(
                "session permanently aborted".into(),
            ));
        }
        {
            let guard = self.client.read().await;
            if guard.is_some() {
                return Ok(());
            }
        }

        let mut last_err = None;
        for attempt in 0..=self.max_reconnection {
            match (self.factory)().await {
                Ok(client) => {
                    self.refresh_snapshots(&client).await;
                    *self.client.write().await = Some(client);
                    debug!(attempt, "coordination session acquired");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "coordination session attempt failed");
                    last_err = Some(e);
                }
            }
        }

        self.aborted.store(true, Ordering::SeqCst);
        Err(ClusterError::CoordinationSessionLostPermanent(format!(
            "exceeded {} reconnection attempts, last error: {:?}",
            self.max_reconnection, last_err
        )))
    }

    async fn refresh_snapshots(&self, client: &Arc<dyn CoordinationClient>) {
        if let Ok(addr) = client.read_master_address().await {
            *self.master_address.write().await = addr;
        }
        if let Ok(addr) = client.read_root_region_address().await {
            *self.root_region_address.write().await = addr;
        }
    }

    /// Snapshot read of the last observed master address.
    pub async fn master_address(&self) -> Option<ServerAddress> {
        self.master_address.read().await.clone()
    }

    /// Snapshot read of the last observed root-region server address.
    pub async fn root_region_address(&self) -> Option<ServerAddress> {
        self.root_region_address.read().await.clone()
    }

    /// Invoked by the session thread on lifecycle transitions.
    pub async fn on_event(&self, event: CoordinationEvent) {
        match event {
            CoordinationEvent::Connected => {
                self.reconnect_count.store(0, Ordering::SeqCst);
                info!("coordination session connected");
            }
            CoordinationEvent::SessionExpired => {
                let count = self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count <= self.max_reconnection {
                    warn!(count, "coordination session expired, reconnecting");
                    *self.client.write().await = None;
                    if let Err(e) = self.acquire().await {
                        warn!(error = %e, "reconnect after session expiry failed");
                    }
                } else {
                    warn!(count, "coordination session permanently aborted");
                    self.aborted.store(true, Ordering::SeqCst);
                    *self.client.write().await = None;
                }
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Registers a listener with the underlying client, acquiring the
    /// session first if needed.
    pub async fn register_listener(&self, listener: Box<dyn CoordinationListener>) -> Result<()> {
        self.acquire().await?;
        let guard = self.client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| ClusterError::CoordinationSessionLostPermanent("no session".into()))?;
        client.register_listener(listener).await
    }

    /// Releases the session; a closed session can be re-acquired unless
    /// it was aborted.
    pub async fn close(&self) {
        if let Some(client) = self.client.write().await.take() {
            let _ = client.close().await;
        }
        info!("coordination session closed");
    }
}
