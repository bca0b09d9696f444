//! Liveness leases for pool passes sharing one store.
//!
//! A pass writes `<project_root>/.tasksmith/leases/<owner>.json` when it
//! starts and refreshes it while it still has tasks in flight. A RUNNING task
//! is claimed by the owner that admitted it; it is only stale once that owner
//! has no fresh lease.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Directory under the project root holding lease files.
pub const LEASES_DIR: &str = ".tasksmith/leases";

/// A lease older than this is treated as abandoned.
pub const LEASE_TTL: std::time::Duration = std::time::Duration::from_secs(30);

/// How often a live pass rewrites its lease.
pub const LEASE_REFRESH: std::time::Duration = std::time::Duration::from_secs(10);

/// Heartbeat record of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub pid: u32,
    pub refreshed_at: DateTime<Utc>,
}

impl Lease {
    /// A lease for `owner` refreshed now.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            pid: std::process::id(),
            refreshed_at: Utc::now(),
        }
    }

    /// Whether the lease was refreshed within `ttl` of `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        let ttl = Duration::from_std(ttl).unwrap_or(Duration::MAX);
        now.signed_duration_since(self.refreshed_at) <= ttl
    }
}

/// A fresh owner id: process id plus a random suffix, unique per pass.
pub fn owner_id() -> String {
    format!("pool-{}-{}", std::process::id(), Uuid::new_v4().simple())
}
