use std::time::Instant;

use async_trait::async_trait;
use kestrel_core::{Error, ManagedObject, ManagedStatus, Outcome, Result};
use kestrel_status::Target;
use kube::core::ApiResource;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::finalizer;
use crate::phase::{run_phase, Cx, Phase, PhaseOutcome, Scratch};
use crate::Context;

/// Object-level check that converged children are actually serving.
#[async_trait]
pub trait Liveness<K, D>: Send + Sync {
    async fn is_live(&self, cx: &Cx<'_, K>, scratch: &D) -> Result<bool>;
}

/// Ordered phases for one managed kind.
pub struct Pipeline<K, D> {
    phases: Vec<Phase<K, D>>,
    liveness: Option<Box<dyn Liveness<K, D>>>,
    ar: ApiResource,
}

impl<K: ManagedObject, D: Scratch> Default for Pipeline<K, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ManagedObject, D: Scratch> Pipeline<K, D> {
    pub fn new() -> Self {
        Self { phases: Vec::new(), liveness: None, ar: ApiResource::erase::<K>(&()) }
    }

    pub fn phase(mut self, phase: Phase<K, D>) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn liveness(mut self, probe: impl Liveness<K, D> + 'static) -> Self {
        self.liveness = Some(Box::new(probe));
        self
    }

    pub fn phases(&self) -> &[Phase<K, D>] {
        &self.phases
    }

    /// One reconcile pass. Dependency waits come back as `Ok(Outcome::Pending)`;
    /// the status is written once at the end, and only if it changed.
    pub async fn converge(&self, ctx: &Context, obj: &K) -> Result<Outcome> {
        let target = Target::of(obj);
        let metrics = ctx.tracker.metrics().clone();
        metrics.reconcile_started(&target.kind);
        let started = Instant::now();

        let res = if obj.is_deleting() {
            self.finalize(ctx, obj, &target).await
        } else {
            self.apply_all(ctx, obj, &target).await
        };

        metrics.reconcile_duration(&target.kind, started.elapsed());
        res
    }

    async fn apply_all(&self, ctx: &Context, obj: &K, target: &Target) -> Result<Outcome> {
        if !finalizer::has(obj, &ctx.config.finalizer) {
            finalizer::add(ctx.cluster.as_ref(), &self.ar, obj, &ctx.config.finalizer).await?;
        }

        let before = obj.managed_status().cloned().unwrap_or_default();
        let mut status = before.clone();
        let mut scratch = D::default();
        let cx = Cx {
            obj,
            target,
            cluster: ctx.cluster.as_ref(),
            tracker: &ctx.tracker,
            config: &ctx.config,
        };

        let mut stopped = None;
        for phase in &self.phases {
            match run_phase(phase, &cx, &mut scratch, &mut status).await {
                PhaseOutcome::Success { .. } => {}
                PhaseOutcome::Pending(p) => {
                    // earlier phases of this pass already moved the phase
                    status.phase = before.phase.clone();
                    stopped = Some(Ok(Outcome::pending(p.after, p.reason)));
                    break;
                }
                PhaseOutcome::Failed(e) => {
                    stopped = Some(Err(e));
                    break;
                }
            }
        }

        let res = match stopped {
            Some(r) => r,
            None => self.aggregate(&cx, &scratch, &mut status, obj).await,
        };
        self.write_status(ctx, obj, &before, &status).await?;
        res
    }

    async fn aggregate(&self, cx: &Cx<'_, K>, scratch: &D, status: &mut ManagedStatus, obj: &K) -> Result<Outcome> {
        let live = match &self.liveness {
            Some(probe) => probe.is_live(cx, scratch).await?,
            None => true,
        };
        let conditions: Vec<&str> = self.phases.iter().map(|p| p.condition()).collect();
        let ready = cx.tracker.aggregate_ready(cx.target, status, &conditions, live);
        status.is_error = false;
        status.observed_generation = obj.meta().generation;
        if ready {
            debug!(key = %cx.target.key, "converged");
            Ok(Outcome::Done)
        } else {
            info!(key = %cx.target.key, "converged, waiting for liveness");
            Ok(Outcome::Requeue { after: cx.config.liveness_requeue })
        }
    }

    async fn write_status(&self, ctx: &Context, obj: &K, before: &ManagedStatus, after: &ManagedStatus) -> Result<()> {
        if before == after {
            return Ok(());
        }
        let body = status_patch(before, after)?;
        ctx.cluster
            .patch_status(&self.ar, &obj.namespace().unwrap_or_default(), &obj.name_any(), &body)
            .await
    }

    /// Run cleanups newest phase first, then release the finalizer. A failed
    /// cleanup keeps the finalizer so the delete is retried.
    async fn finalize(&self, ctx: &Context, obj: &K, target: &Target) -> Result<Outcome> {
        if !finalizer::has(obj, &ctx.config.finalizer) {
            return Ok(Outcome::Done);
        }
        let cx = Cx {
            obj,
            target,
            cluster: ctx.cluster.as_ref(),
            tracker: &ctx.tracker,
            config: &ctx.config,
        };
        for phase in self.phases.iter().rev() {
            let Some(cleanup) = phase.cleanup() else { continue };
            debug!(key = %target.key, phase = %phase.name(), "cleanup");
            if let Err(e) = cleanup.cleanup(&cx).await {
                let before = obj.managed_status().cloned().unwrap_or_default();
                let mut status = before.clone();
                ctx.tracker.record_failure(target, &mut status, phase.condition(), phase.name(), &e).await;
                self.write_status(ctx, obj, &before, &status).await?;
                return Err(e);
            }
        }
        finalizer::remove(ctx.cluster.as_ref(), &self.ar, obj, &ctx.config.finalizer).await?;
        info!(key = %target.key, "finalized");
        Ok(Outcome::Done)
    }
}

/// Merge patch turning `before` into `after`. Fields cleared since `before`
/// are sent as null, otherwise the server keeps them.
pub(crate) fn status_patch(before: &ManagedStatus, after: &ManagedStatus) -> Result<serde_json::Value> {
    let encode = |s: &ManagedStatus| serde_json::to_value(s).map_err(|e| Error::Status(format!("encoding status: {}", e)));
    let mut body = encode(after)?;
    if let (serde_json::Value::Object(old), Some(new)) = (encode(before)?, body.as_object_mut()) {
        for key in old.keys() {
            if !new.contains_key(key) {
                new.insert(key.clone(), serde_json::Value::Null);
            }
        }
    }
    Ok(body)
}
