//! Kestrel engine: phases, pipelines, the remote object reconciler and the
//! controller runtime that drives them.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kestrel_kubehub::ClusterClient;
use kestrel_status::StatusTracker;

mod config;
mod finalizer;
pub mod phase;
pub mod pipeline;
pub mod remote;
pub mod runtime;

pub use config::EngineConfig;
pub use phase::{
    run_phase, to_dynamic, Applier, Builder, ChildApplier, ChildDiff, ChildPhase, ChildReader, ChildState, Cleanup, Cx,
    Dependency, Differ, ObjectDependency, Pending, Phase, PhaseOutcome, Plan, Read, Reader, Readiness, Scratch,
};
pub use pipeline::{Liveness, Pipeline};
pub use runtime::{Backoff, Reconcile, Runtime};

/// Collaborators shared by every pass.
#[derive(Clone)]
pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub tracker: StatusTracker,
    pub config: EngineConfig,
}

impl Context {
    pub fn new(cluster: Arc<dyn ClusterClient>, tracker: StatusTracker, config: EngineConfig) -> Self {
        Self { cluster, tracker, config }
    }
}
