//! Coordination-service session (spec §4.1).
//!
//! A single logical session to the coordination quorum (ZooKeeper-analog),
//! exposing snapshot reads of the master and root-region addresses and a
//! transparent-reconnect-with-cap lifecycle.

mod session;

pub use session::CoordinationSession;

use crate::error::Result;
use crate::identifiers::ServerAddress;
use async_trait::async_trait;

/// Capability trait for the coordination-service client. A concrete
/// implementation talks to the actual quorum service (ZooKeeper, etcd,
/// Consul, ...); the connection core only depends on this interface.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn read_master_address(&self) -> Result<Option<ServerAddress>>;
    async fn read_root_region_address(&self) -> Result<Option<ServerAddress>>;
    async fn register_listener(&self, listener: Box<dyn CoordinationListener>) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Receives session lifecycle events from a `CoordinationClient`.
pub trait CoordinationListener: Send + Sync {
    fn on_event(&self, event: CoordinationEvent);
}

/// Events a coordination-service session can deliver to its listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    Connected,
    SessionExpired,
}
