//! Connection registry (spec §4.8).
//!
//! Process-wide multiton keyed by `ClientConfig::fingerprint()`. Bounded
//! by an LRU of capacity 31; the evicted connection is closed
//! asynchronously. A process-wide shutdown hook closes every cached
//! connection and refuses to hand out new ones afterward.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClusterError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default capacity named literally by spec.md's "bounded LRU (default
/// capacity 31)".
const DEFAULT_CAPACITY: usize = 31;

pub struct ConnectionRegistry {
    connections: Mutex<LruCache<String, Arc<Connection>>>,
    shutdown: AtomicBool,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        Self {
            connections: Mutex::new(LruCache::new(capacity)),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Returns the cached connection for `config`'s fingerprint,
    /// building one with `build` on a miss. Two concurrent misses for
    /// the same fingerprint may both build; the second insert simply
    /// wins and the first build's connection is dropped unregistered
    /// (the caller's `Arc` still owns it and may close it explicitly).
    pub async fn get_or_create<F, Fut>(&self, config: &ClientConfig, build: F) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Connection>>,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ClusterError::DoNotRetry("connection registry is shut down".into()));
        }

        let key = config.fingerprint();
        {
            let mut connections = self.connections.lock();
            if let Some(conn) = connections.get(&key) {
                return Ok(Arc::clone(conn));
            }
        }

        let conn = Arc::new(build().await?);

        let evicted = {
            let mut connections = self.connections.lock();
            if let Some(existing) = connections.get(&key) {
                return Ok(Arc::clone(existing));
            }
            connections.push(key, Arc::clone(&conn))
        };

        if let Some((evicted_key, evicted_conn)) = evicted {
            debug!(key = %evicted_key, "evicting connection from registry");
            tokio::spawn(async move {
                if let Err(e) = evicted_conn.close().await {
                    warn!(error = %e, "error closing evicted connection");
                }
            });
        }

        Ok(conn)
    }

    pub fn get(&self, config: &ClientConfig) -> Option<Arc<Connection>> {
        self.connections.lock().get(&config.fingerprint()).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every cached connection and refuses further creation.
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let conns: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock();
            let conns = connections.iter().map(|(_, v)| Arc::clone(v)).collect();
            connections.clear();
            conns
        };

        for conn in conns {
            conn.close().await?;
        }

        Ok(())
    }
}
