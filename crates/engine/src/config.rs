use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and identity settings shared by every pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Requeue delay when a prerequisite object is missing.
    pub dependency_requeue: Duration,
    /// Requeue delay when a remote endpoint is not reachable yet.
    pub remote_requeue: Duration,
    /// Re-check delay while converged children are not live.
    pub liveness_requeue: Duration,
    /// Periodic resync of converged objects.
    pub resync: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub workers: u16,
    pub finalizer: String,
    pub field_manager: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dependency_requeue: Duration::from_secs(30),
            remote_requeue: Duration::from_secs(60),
            liveness_requeue: Duration::from_secs(30),
            resync: Duration::from_secs(300),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            workers: 4,
            finalizer: "kestrel.io/finalizer".to_string(),
            field_manager: "kestrel".to_string(),
        }
    }
}

fn secs(var: &str, default: Duration) -> Duration {
    std::env::var(var).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
}

impl EngineConfig {
    /// Defaults overlaid with `KESTREL_*` variables; unparsable values keep the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dependency_requeue: secs("KESTREL_DEPENDENCY_REQUEUE_SECS", d.dependency_requeue),
            remote_requeue: secs("KESTREL_REMOTE_REQUEUE_SECS", d.remote_requeue),
            liveness_requeue: secs("KESTREL_LIVENESS_REQUEUE_SECS", d.liveness_requeue),
            resync: secs("KESTREL_RESYNC_SECS", d.resync),
            backoff_base: secs("KESTREL_BACKOFF_BASE_SECS", d.backoff_base),
            backoff_max: secs("KESTREL_BACKOFF_MAX_SECS", d.backoff_max),
            workers: std::env::var("KESTREL_WORKERS").ok().and_then(|s| s.parse().ok()).filter(|w| *w > 0).unwrap_or(d.workers),
            finalizer: std::env::var("KESTREL_FINALIZER").unwrap_or(d.finalizer),
            field_manager: std::env::var("KESTREL_FIELD_MANAGER").unwrap_or(d.field_manager),
        }
    }
}
