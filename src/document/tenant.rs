//! Tenant identifiers and the persisted tenant scope
//!
//! A tenant scope is a set of tenant ids persisted as one `|`-joined string. The
//! same string is sent verbatim as the upstream query scope header.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Separator between tenant ids in the persisted scope
pub const SCOPE_DELIMITER: char = '|';

/// Longest accepted tenant id, in bytes
pub const MAX_TENANT_ID_LEN: usize = 150;

const RESERVED_TENANT_IDS: [&str; 3] = [".", "..", "__mimir_cluster"];

static TENANT_ID_CHARSET: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[a-zA-Z0-9!_\-.*'()]+$").expect("tenant id pattern is a valid regex")
});

/// Reasons a tenant id is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenantIdError {
    #[error("tenant ID cannot be empty")]
    Empty,

    #[error("tenant ID exceeds {MAX_TENANT_ID_LEN} characters (got {0} bytes)")]
    TooLong(usize),

    #[error("tenant ID cannot be '.' or '..' or '__mimir_cluster'")]
    Reserved,

    #[error("tenant ID contains unsupported characters")]
    UnsupportedCharacters,
}

/// A validated tenant id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Validate a raw tenant id
    ///
    /// Accepts `[A-Za-z0-9!_\-.*'()]+`, at most 150 bytes, excluding `.`, `..`
    /// and `__mimir_cluster`.
    pub fn parse(raw: &str) -> Result<Self, TenantIdError> {
        if raw.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(TenantIdError::TooLong(raw.len()));
        }
        if RESERVED_TENANT_IDS.contains(&raw) {
            return Err(TenantIdError::Reserved);
        }
        if !TENANT_ID_CHARSET.is_match(raw) {
            return Err(TenantIdError::UnsupportedCharacters);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tenant ids authorised for a query source, kept in persisted form
///
/// The raw string is preserved until the scope is mutated so that parsing and
/// re-serialising an untouched document does not change its hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantScope(String);

impl TenantScope {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The persisted `|`-joined form, also used as the scope header value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tenant ids in persisted order, skipping empty segments
    pub fn tenants(&self) -> Vec<&str> {
        self.0
            .split(SCOPE_DELIMITER)
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.tenants().contains(&tenant.as_str())
    }

    /// Append a tenant; returns `false` without changes if it is already present
    pub fn insert(&mut self, tenant: &TenantId) -> bool {
        if self.contains(tenant) {
            return false;
        }
        let mut tenants = self.tenants();
        tenants.push(tenant.as_str());
        self.0 = join(&tenants);
        true
    }

    /// Remove every occurrence of a tenant; returns `false` if it was absent
    pub fn remove(&mut self, tenant: &TenantId) -> bool {
        let tenants = self.tenants();
        let remaining: Vec<&str> = tenants
            .iter()
            .copied()
            .filter(|t| *t != tenant.as_str())
            .collect();
        if remaining.len() == tenants.len() {
            return false;
        }
        self.0 = join(&remaining);
        true
    }
}

fn join(tenants: &[&str]) -> String {
    let mut delimiter = [0u8; 4];
    tenants.join(SCOPE_DELIMITER.encode_utf8(&mut delimiter))
}
