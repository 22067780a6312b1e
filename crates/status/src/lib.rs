//! Kestrel status tracker: per-phase conditions, readiness aggregation,
//! notification events and error accounting.
//!
//! The tracker only mutates a [`ManagedStatus`] in memory; persisting it is
//! the orchestrator's job, so one pass produces at most one status write.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kestrel_core::{now_rfc3339, Condition, ConditionStatus, Error, ManagedObject, ManagedStatus};
use kube::Resource;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub const READY_CONDITION: &str = "Ready";
pub const PHASE_STARTING: &str = "Starting";
pub const PHASE_RUNNING: &str = "Running";

pub mod reason {
    pub const INITIALIZE: &str = "Initialize";
    pub const SUCCESS: &str = "Success";
    pub const FAILED: &str = "Failed";
    pub const COMPLETED: &str = "Completed";
    pub const READY: &str = "Ready";
    pub const NOT_READY: &str = "NotReady";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Sink for user-facing notification events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        object: &ObjectReference,
        kind: EventKind,
        reason: &str,
        action: &str,
        message: &str,
    ) -> anyhow::Result<()>;
}

/// Reconcile counters, injected into the engine at construction.
pub trait MetricsSink: Send + Sync {
    fn reconcile_started(&self, kind: &str);
    fn reconcile_error(&self, kind: &str, phase: &str);
    fn reconcile_pending(&self, kind: &str, phase: &str);
    fn reconcile_duration(&self, kind: &str, elapsed: Duration);
}

/// Records through the `metrics` facade; exported by whichever recorder the
/// binary installed (Prometheus in `kestrelctl`).
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn reconcile_started(&self, kind: &str) {
        counter!("kestrel_reconcile_total", 1u64, "kind" => kind.to_string());
    }

    fn reconcile_error(&self, kind: &str, phase: &str) {
        counter!("kestrel_reconcile_errors_total", 1u64, "kind" => kind.to_string(), "phase" => phase.to_string());
    }

    fn reconcile_pending(&self, kind: &str, phase: &str) {
        counter!("kestrel_reconcile_pending_total", 1u64, "kind" => kind.to_string(), "phase" => phase.to_string());
    }

    fn reconcile_duration(&self, kind: &str, elapsed: Duration) {
        histogram!("kestrel_reconcile_duration_ms", elapsed.as_secs_f64() * 1000.0, "kind" => kind.to_string());
    }
}

/// In-memory counters for tests.
#[derive(Debug, Default)]
pub struct CountingSink {
    started: AtomicU64,
    errors: AtomicU64,
    pending: AtomicU64,
}

impl CountingSink {
    pub fn started(&self) -> u64 { self.started.load(Ordering::Relaxed) }
    pub fn errors(&self) -> u64 { self.errors.load(Ordering::Relaxed) }
    pub fn pending(&self) -> u64 { self.pending.load(Ordering::Relaxed) }
}

impl MetricsSink for CountingSink {
    fn reconcile_started(&self, _kind: &str) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }
    fn reconcile_error(&self, _kind: &str, _phase: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
    fn reconcile_pending(&self, _kind: &str, _phase: &str) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }
    fn reconcile_duration(&self, _kind: &str, _elapsed: Duration) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub kind: EventKind,
    pub reason: String,
    pub action: String,
    pub message: String,
}

/// Keeps published events in memory for tests.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(
        &self,
        object: &ObjectReference,
        kind: EventKind,
        reason: &str,
        action: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let ev = RecordedEvent {
            object: format!(
                "{}/{}",
                object.namespace.clone().unwrap_or_default(),
                object.name.clone().unwrap_or_default()
            ),
            kind,
            reason: reason.to_string(),
            action: action.to_string(),
            message: message.to_string(),
        };
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("event log poisoned"))?
            .push(ev);
        Ok(())
    }
}

/// Identity of the object whose status is being tracked.
#[derive(Debug, Clone)]
pub struct Target {
    pub kind: String,
    pub key: String,
    pub reference: ObjectReference,
    pub generation: Option<i64>,
}

impl Target {
    pub fn of<K: ManagedObject>(obj: &K) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            key: obj.key(),
            reference: obj.object_ref(&()),
            generation: obj.meta().generation,
        }
    }
}

#[derive(Clone)]
pub struct StatusTracker {
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<dyn MetricsSink>,
}

impl StatusTracker {
    pub fn new(recorder: Arc<dyn EventRecorder>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { recorder, metrics }
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Add `False/Initialize` for a condition type the object never had.
    pub fn initialize(&self, target: &Target, status: &mut ManagedStatus, condition: &str) -> bool {
        if status.condition(condition).is_some() {
            return false;
        }
        status.set_condition(
            Condition::new(condition, ConditionStatus::False, reason::INITIALIZE, "").with_generation(target.generation),
        )
    }

    pub fn set_phase(&self, target: &Target, status: &mut ManagedStatus, phase: &str) {
        if status.phase.as_deref() != Some(phase) {
            debug!(kind = %target.kind, key = %target.key, phase, "phase");
            status.phase = Some(phase.to_string());
        }
    }

    /// Mark a phase converged. A Completed event goes out only when calls were made.
    pub async fn record_success(&self, target: &Target, status: &mut ManagedStatus, condition: &str, changed: bool) {
        if !status.is_condition_true(condition) {
            status.set_condition(
                Condition::new(condition, ConditionStatus::True, reason::SUCCESS, "").with_generation(target.generation),
            );
        }
        if changed {
            let msg = format!("{} successfully reconciled", condition);
            self.emit(target, EventKind::Normal, reason::COMPLETED, condition, &msg).await;
        }
    }

    pub async fn record_failure(
        &self,
        target: &Target,
        status: &mut ManagedStatus,
        condition: &str,
        phase: &str,
        err: &Error,
    ) {
        let msg = err.to_string();
        warn!(kind = %target.kind, key = %target.key, phase, error = %msg, "phase failed");
        status.set_condition(
            Condition::new(condition, ConditionStatus::False, reason::FAILED, &msg).with_generation(target.generation),
        );
        status.is_error = true;
        status.last_error_time = Some(now_rfc3339());
        self.metrics.reconcile_error(&target.kind, phase);
        self.emit(target, EventKind::Warning, reason::FAILED, condition, &msg).await;
    }

    /// Dependency not ready: counted apart from errors, no status change, no event.
    pub fn record_pending(&self, target: &Target, phase: &str, why: &str) {
        info!(kind = %target.kind, key = %target.key, phase, reason = %why, "dependency pending");
        self.metrics.reconcile_pending(&target.kind, phase);
    }

    /// Drive `Ready` and the object-level phase from the phase conditions and
    /// the liveness probe. Returns whether the object is ready.
    pub fn aggregate_ready(&self, target: &Target, status: &mut ManagedStatus, phase_conditions: &[&str], live: bool) -> bool {
        let waiting: Vec<&str> = phase_conditions
            .iter()
            .copied()
            .filter(|c| !status.is_condition_true(c))
            .collect();
        let ready = waiting.is_empty() && live;
        let cond = if ready {
            Condition::new(READY_CONDITION, ConditionStatus::True, reason::READY, "all phases converged")
        } else {
            let msg = if waiting.is_empty() {
                "waiting for workload to become live".to_string()
            } else {
                format!("waiting for {}", waiting.join(", "))
            };
            Condition::new(READY_CONDITION, ConditionStatus::False, reason::NOT_READY, &msg)
        };
        status.set_condition(cond.with_generation(target.generation));
        let phase = if ready { PHASE_RUNNING } else { PHASE_STARTING };
        self.set_phase(target, status, phase);
        ready
    }

    async fn emit(&self, target: &Target, kind: EventKind, reason: &str, action: &str, message: &str) {
        if let Err(e) = self.recorder.publish(&target.reference, kind, reason, action, message).await {
            warn!(key = %target.key, error = %e, "failed to publish event");
        }
    }
}
