use thiserror::Error;

/// Errors surfaced by the connection core.
///
/// Every failure that crosses an RPC, cache, or coordination-session
/// boundary is classified into one of these kinds before it leaves the
/// crate (see spec §7).
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("region not serving: {0}")]
    RegionNotServing(String),

    #[error("region offline: {0}")]
    RegionOffline(String),

    #[error("no server for region: {0}")]
    NoServerForRegion(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("do not retry: {0}")]
    DoNotRetry(String),

    #[error("master not running: {0}")]
    MasterNotRunning(String),

    #[error("coordination session permanently lost: {0}")]
    CoordinationSessionLostPermanent(String),

    #[error("retries exhausted after {attempts} attempt(s), last errors: {causes:?}")]
    RetriesExhausted {
        attempts: u32,
        causes: Vec<String>,
    },

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Failures the server or client has flagged as hopeless to retry.
    pub fn is_do_not_retry(&self) -> bool {
        matches!(
            self,
            ClusterError::DoNotRetry(_) | ClusterError::TableNotFound(_)
        )
    }

    pub fn is_region_not_serving(&self) -> bool {
        matches!(self, ClusterError::RegionNotServing(_))
    }

    pub fn is_region_offline(&self) -> bool {
        matches!(self, ClusterError::RegionOffline(_))
    }

    pub fn is_no_server_for_region(&self) -> bool {
        matches!(self, ClusterError::NoServerForRegion(_))
    }

    /// Local, connection-ish failures that should be treated as "the
    /// server is dead" by `without_retries` (spec §4.6).
    pub fn is_transient_network(&self) -> bool {
        matches!(self, ClusterError::TransientNetwork(_) | ClusterError::Interrupted(_))
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        ClusterError::TransientNetwork(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn do_not_retry_classification() {
        assert!(ClusterError::DoNotRetry("x".into()).is_do_not_retry());
        assert!(ClusterError::TableNotFound("t".into()).is_do_not_retry());
        assert!(!ClusterError::RegionOffline("r".into()).is_do_not_retry());
    }

    #[test]
    fn transient_network_classification() {
        assert!(ClusterError::TransientNetwork("timeout".into()).is_transient_network());
        assert!(!ClusterError::RegionNotServing("r".into()).is_transient_network());
    }
}
