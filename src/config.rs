//! Client configuration for the connection core (spec §6).

use crate::identifiers::ServerAddress;
use serde::{Deserialize, Serialize};

/// Tunables recognized by the connection core. Every field maps to a
/// `client.*`/`rpc.*` configuration key listed in spec.md §6; there is
/// no file-format parser — callers construct one via `ClientConfig::default()`
/// and override fields directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `client.coordination.quorum` — the coordination service's member
    /// addresses. Part of cluster identity: two configs naming different
    /// quorums must never fingerprint to the same `ConnectionRegistry` key,
    /// even if every other tunable matches.
    pub quorum_addresses: Vec<ServerAddress>,

    /// `client.retries.number` — max attempts for `with_retries`.
    pub retries_number: u32,

    /// `client.pause` — base pause, in milliseconds, scaled by the
    /// backoff schedule in `retry.rs`.
    pub pause_ms: u64,

    /// `client.rpc.retry.timeout` — wall-clock deadline for a
    /// `with_retries` call, in milliseconds. `u64::MAX` means no deadline.
    pub rpc_retry_timeout_ms: u64,

    /// `rpc.timeout` — per-attempt RPC timeout, in milliseconds.
    pub rpc_timeout_ms: u64,

    /// `client.prefetch.limit` — number of extra meta rows fetched per
    /// meta scan.
    pub prefetch_limit: u32,

    /// `client.max.coordination.reconnection` — reconnect attempts the
    /// coordination session makes before giving up permanently.
    pub max_coordination_reconnection: u32,

    /// `meta.scanner.caching` — row batch size used when scanning meta.
    pub meta_scanner_caching: u32,

    /// `region.server.class` — retained only so configuration round-trips
    /// the key; the connection core takes its RPC stub as a trait object
    /// from the caller instead of constructing one reflectively.
    pub region_server_class: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            quorum_addresses: Vec::new(),
            retries_number: 10,
            pause_ms: 100,
            rpc_retry_timeout_ms: u64::MAX,
            rpc_timeout_ms: 60_000,
            prefetch_limit: 10,
            max_coordination_reconnection: 3,
            meta_scanner_caching: 100,
            region_server_class: None,
        }
    }
}

impl ClientConfig {
    pub fn with_quorum_addresses(mut self, addresses: Vec<ServerAddress>) -> Self {
        self.quorum_addresses = addresses;
        self
    }

    pub fn with_retries_number(mut self, n: u32) -> Self {
        self.retries_number = n;
        self
    }

    pub fn with_pause_ms(mut self, ms: u64) -> Self {
        self.pause_ms = ms;
        self
    }

    pub fn with_rpc_retry_timeout_ms(mut self, ms: u64) -> Self {
        self.rpc_retry_timeout_ms = ms;
        self
    }

    pub fn with_rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.rpc_timeout_ms = ms;
        self
    }

    pub fn with_prefetch_limit(mut self, n: u32) -> Self {
        self.prefetch_limit = n;
        self
    }

    pub fn with_max_coordination_reconnection(mut self, n: u32) -> Self {
        self.max_coordination_reconnection = n;
        self
    }

    /// Fingerprint used by `ConnectionRegistry` to key its multiton map.
    /// Two configs with the same fingerprint are treated as describing
    /// the same cluster connection. Sorted first so that two quorum
    /// lists naming the same members in a different order still collide
    /// on purpose.
    pub fn fingerprint(&self) -> String {
        let mut quorum: Vec<String> = self.quorum_addresses.iter().map(ServerAddress::to_string).collect();
        quorum.sort();
        format!(
            "q{}:r{}:p{}:rrt{}:rt{}:pf{}:mcr{}:msc{}",
            quorum.join(","),
            self.retries_number,
            self.pause_ms,
            self.rpc_retry_timeout_ms,
            self.rpc_timeout_ms,
            self.prefetch_limit,
            self.max_coordination_reconnection,
            self.meta_scanner_caching,
        )
    }
}
