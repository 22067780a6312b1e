//! Controller wiring: watches, work queue, requeue policy.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kestrel_core::{Error, ManagedObject, Outcome, Result, OWNER_KIND_LABEL};
use kestrel_index::{FieldIndex, ObjectKey};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Client, Resource, ResourceExt,
};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::phase::Scratch;
use crate::{Context, Pipeline};

/// Anything that can run one pass for a managed object.
#[async_trait]
pub trait Reconcile<K>: Send + Sync + 'static {
    async fn reconcile(&self, ctx: &Context, obj: &K) -> Result<Outcome>;
}

#[async_trait]
impl<K: ManagedObject, D: Scratch> Reconcile<K> for Pipeline<K, D> {
    async fn reconcile(&self, ctx: &Context, obj: &K) -> Result<Outcome> {
        self.converge(ctx, obj).await
    }
}

/// Per-key exponential backoff, cleared by the next successful pass.
///
/// A failing key is retried within `max`, so an entry idle for longer than
/// twice that belongs to an object that went away and is dropped.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<FxHashMap<String, (u32, Instant)>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempts: Mutex::new(FxHashMap::default()) }
    }

    pub fn next(&self, key: &str) -> Duration {
        self.next_at(key, Instant::now())
    }

    fn next_at(&self, key: &str, now: Instant) -> Duration {
        let idle = self.max.saturating_mul(2);
        let mut attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        attempts.retain(|k, (_, last)| k == key || now.saturating_duration_since(*last) <= idle);
        let (n, last) = attempts.entry(key.to_string()).or_insert((0, now));
        *n = n.saturating_add(1);
        *last = now;
        let exp = (*n - 1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn reset(&self, key: &str) {
        self.attempts.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().unwrap_or_else(|p| p.into_inner()).get(key).map(|(n, _)| *n).unwrap_or(0)
    }

    /// Keys currently backing off.
    pub fn len(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Requeue for a pass that did not fail. Pending never escalates.
pub fn action_for(outcome: &Outcome, resync: Duration) -> Action {
    Action::requeue(outcome.requeue_after().unwrap_or(resync))
}

/// State shared by every reconcile of one controller.
pub struct Shared<K> {
    reconciler: Arc<dyn Reconcile<K>>,
    ctx: Context,
    backoff: Backoff,
    index: Option<Arc<FieldIndex<K>>>,
}

impl<K: ManagedObject> Shared<K> {
    pub fn new(reconciler: Arc<dyn Reconcile<K>>, ctx: Context, index: Option<Arc<FieldIndex<K>>>) -> Self {
        let backoff = Backoff::new(ctx.config.backoff_base, ctx.config.backoff_max);
        Self { reconciler, ctx, backoff, index }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

pub async fn reconcile<K: ManagedObject>(obj: Arc<K>, shared: Arc<Shared<K>>) -> Result<Action> {
    let key = obj.key();
    if let Some(index) = &shared.index {
        index.upsert(obj.as_ref());
    }
    let outcome = shared.reconciler.reconcile(&shared.ctx, obj.as_ref()).await?;
    shared.backoff.reset(&key);
    if obj.is_deleting() {
        if let Some(index) = &shared.index {
            index.remove(&ObjectKey::of(obj.as_ref()));
        }
    }
    if let Outcome::Pending { reason, after } = &outcome {
        debug!(key = %key, reason = %reason, after_s = after.as_secs(), "requeue pending");
    }
    Ok(action_for(&outcome, shared.ctx.config.resync))
}

/// Transient failures back off per key; anything else waits the maximum delay.
pub fn error_policy<K: ManagedObject>(obj: Arc<K>, err: &Error, shared: Arc<Shared<K>>) -> Action {
    let key = obj.key();
    let delay = if err.is_transient() { shared.backoff.next(&key) } else { shared.ctx.config.backoff_max };
    warn!(key = %key, error = %err, transient = err.is_transient(), retry_ms = delay.as_millis() as u64, "reconcile failed");
    Action::requeue(delay)
}

/// Runs one managed kind under `kube::runtime::Controller`.
pub struct Runtime<K> {
    reconciler: Arc<dyn Reconcile<K>>,
    ctx: Context,
    namespace: Option<String>,
    owns: Vec<ApiResource>,
    watches: Vec<(ApiResource, String)>,
    index: Option<Arc<FieldIndex<K>>>,
}

impl<K> Runtime<K>
where
    K: ManagedObject + Resource<Scope = NamespaceResourceScope>,
{
    pub fn new(reconciler: impl Reconcile<K>, ctx: Context) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            ctx,
            namespace: None,
            owns: Vec::new(),
            watches: Vec::new(),
            index: None,
        }
    }

    /// Restrict every watch to one namespace.
    pub fn namespace(mut self, ns: Option<String>) -> Self {
        self.namespace = ns;
        self
    }

    /// Child kind whose changes trigger the owner.
    pub fn owns(mut self, ar: ApiResource) -> Self {
        self.owns.push(ar);
        self
    }

    pub fn index(mut self, index: Arc<FieldIndex<K>>) -> Self {
        self.index = Some(index);
        self
    }

    /// Dependency kind mapped back to owners through the named index. Needs [`Runtime::index`].
    pub fn watches(mut self, ar: ApiResource, index_name: impl Into<String>) -> Self {
        self.watches.push((ar, index_name.into()));
        self
    }

    fn dynamic_api(&self, client: &Client, ar: &ApiResource) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
            None => Api::all_with(client.clone(), ar),
        }
    }

    pub async fn run(self, client: Client) {
        let kind = K::kind(&()).to_string();
        let api: Api<K> = match &self.namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let mut ctrl = Controller::new(api, watcher::Config::default());

        let owned_by = watcher::Config::default().labels(&format!("{}={}", OWNER_KIND_LABEL, kind));
        for ar in &self.owns {
            ctrl = ctrl.owns_with(self.dynamic_api(&client, ar), ar.clone(), owned_by.clone());
        }
        for (ar, index_name) in &self.watches {
            let Some(index) = self.index.clone() else {
                warn!(kind = %kind, watched = %ar.kind, "dependency watch without index, skipped");
                continue;
            };
            let index_name = index_name.clone();
            ctrl = ctrl.watches_with(self.dynamic_api(&client, ar), ar.clone(), watcher::Config::default(), move |dep: DynamicObject| {
                let ns = dep.namespace().unwrap_or_default();
                index
                    .referencing(&index_name, &ns, &dep.name_any())
                    .into_iter()
                    .map(|k| ObjectRef::<K>::new(&k.name).within(&k.namespace))
                    .collect::<Vec<_>>()
            });
        }

        let workers = self.ctx.config.workers;
        let shared = Arc::new(Shared::new(self.reconciler, self.ctx, self.index));
        info!(kind = %kind, workers, ns = ?self.namespace, "controller starting");
        ctrl.with_config(controller::Config::default().concurrency(workers))
            .shutdown_on_signal()
            .run(reconcile::<K>, error_policy::<K>, shared)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!(name = %obj.name, ns = ?obj.namespace, "reconciled"),
                    Err(e) => debug!(error = %e, "reconcile loop error"),
                }
            })
            .await;
        info!(kind = %kind, "controller stopped");
    }
}
