//! Server identity, region identity, and row-key ordering primitives.
//!
//! These are the smallest, leaf-most types in the crate: every other
//! module builds on `RowKey`, `ServerAddress`, `RegionInfo`, and
//! `RegionLocation`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Name of the special region whose rows are `RegionInfo` records for
/// all meta regions.
pub const ROOT_TABLE: &str = "-ROOT-";

/// Name of the special region whose rows are `RegionInfo` records for
/// all user-table regions.
pub const META_TABLE: &str = ".META.";

/// A fixed high-value suffix used when constructing a closest-row-before
/// probe key (spec §4.4). Any real region name must sort strictly below
/// this, so appending it to `(table, row)` guarantees the predecessor
/// lookup lands on the region that covers `row`.
const SENTINEL_MAX: &str = "\u{ffff}\u{ffff}\u{ffff}\u{ffff}";

/// An opaque, ordered byte sequence. Comparison is lexicographic.
///
/// `RowKey::default()` (the empty key) is the sentinel used both as the
/// minimum key (the first region's start) and the maximum key (the
/// region past the last one's end).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey(pub Vec<u8>);

impl RowKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        RowKey(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for RowKey {
    fn from(v: Vec<u8>) -> Self {
        RowKey(v)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A `(host, port)` pair identifying a shard server or master process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for ServerAddress {
    type Err = crate::error::ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::error::ClusterError::Configuration(format!("invalid server address: {s}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| crate::error::ClusterError::Configuration(format!("invalid port in: {s}")))?;
        Ok(ServerAddress::new(host, port))
    }
}

/// Unique binary identifier for a region, embedding the table name,
/// start key, and a creation id so that two regions covering the same
/// key range at different points in time compare unequal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionName(pub Vec<u8>);

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Encodes `(table, start_key, creation_id)` into the region name format:
/// `table,start_key,creation_id`. `creation_id` is opaque; callers that
/// only need a closest-row-before probe key pass `u64::MAX` (or rely on
/// `closest_row_before_probe`, below).
pub fn region_name_encode(table: &str, start_key: &RowKey, creation_id: u64) -> RegionName {
    let mut buf = Vec::with_capacity(table.len() + start_key.0.len() + 24);
    buf.extend_from_slice(table.as_bytes());
    buf.push(b',');
    buf.extend_from_slice(&start_key.0);
    buf.push(b',');
    buf.extend_from_slice(creation_id.to_string().as_bytes());
    RegionName(buf)
}

/// Builds the closest-row-before probe key for `(table, row)`: a key
/// guaranteed to sort strictly above every real region name for that
/// table/row prefix, so that a predecessor lookup against the covering
/// meta/root region returns the intended row (spec §4.4).
pub fn closest_row_before_probe(table: &str, row: &RowKey) -> RegionName {
    let mut buf = Vec::with_capacity(table.len() + row.0.len() + SENTINEL_MAX.len() + 2);
    buf.extend_from_slice(table.as_bytes());
    buf.push(b',');
    buf.extend_from_slice(&row.0);
    buf.push(b',');
    buf.extend_from_slice(SENTINEL_MAX.as_bytes());
    RegionName(buf)
}

/// Immutable descriptor of a region at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub region_name: RegionName,
    pub table_name: String,
    pub start_key: RowKey,
    /// Half-open end; `RowKey::default()` (empty) means "to +infinity".
    pub end_key: RowKey,
    pub offline: bool,
    pub split: bool,
    pub encoded_name: String,
    pub creation_id: u64,
}

impl RegionInfo {
    pub fn new(table_name: impl Into<String>, start_key: RowKey, end_key: RowKey, creation_id: u64) -> Self {
        let table_name = table_name.into();
        let region_name = region_name_encode(&table_name, &start_key, creation_id);
        let encoded_name = format!("{:x}", md5_like_hash(&region_name.0));
        Self {
            region_name,
            table_name,
            start_key,
            end_key,
            offline: false,
            split: false,
            encoded_name,
            creation_id,
        }
    }

    /// `true` if `row` falls within `[start_key, end_key)`, treating an
    /// empty `end_key` as +infinity.
    pub fn contains_row(&self, row: &RowKey) -> bool {
        self.start_key <= *row && (self.end_key.is_empty() || *row < self.end_key)
    }
}

/// A cheap, stable (non-cryptographic) fingerprint used only to derive a
/// short opaque id for logging; not used for any correctness-sensitive
/// comparison.
fn md5_like_hash(bytes: &[u8]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// `(region_info, server_address)`. Transient: becomes stale on any
/// region movement or server death.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLocation {
    pub region_info: RegionInfo,
    pub server_address: ServerAddress,
}

impl RegionLocation {
    pub fn new(region_info: RegionInfo, server_address: ServerAddress) -> Self {
        Self {
            region_info,
            server_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_key_ordering_is_lexicographic() {
        assert!(RowKey::from("a") < RowKey::from("b"));
        assert!(RowKey::from("aa") > RowKey::from("a"));
        assert_eq!(RowKey::default(), RowKey::from(""));
    }

    #[test]
    fn region_contains_row_half_open() {
        let region = RegionInfo::new("t1", RowKey::from("a"), RowKey::from("z"), 1);
        assert!(region.contains_row(&RowKey::from("a")));
        assert!(region.contains_row(&RowKey::from("m")));
        assert!(!region.contains_row(&RowKey::from("z")));
    }

    #[test]
    fn region_with_empty_end_key_is_unbounded() {
        let region = RegionInfo::new("t1", RowKey::from("m"), RowKey::default(), 1);
        assert!(region.contains_row(&RowKey::from("zzzzzz")));
    }

    #[test]
    fn server_address_display_and_parse_roundtrip() {
        let addr = ServerAddress::new("10.0.0.1", 60020);
        assert_eq!(addr.to_string(), "10.0.0.1:60020");
        let parsed: ServerAddress = "10.0.0.1:60020".parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn closest_row_before_probe_sorts_above_real_region_names() {
        let real = region_name_encode("t1", &RowKey::from("g"), 42);
        let probe = closest_row_before_probe("t1", &RowKey::from("g"));
        assert!(probe.0 > real.0);
    }
}
