//! Reconciliation of objects living behind an external REST API.
//!
//! The managed object maps to exactly one remote entity, named by
//! [`RemoteKind::external_name`]. There is no ownership: the entity is
//! removed by an explicit delete while the finalizer holds the object.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use kestrel_core::{Error, ManagedObject, ManagedStatus, Result};
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value as Json};
use tracing::{info, warn};

use crate::phase::{Applier, Cleanup, Cx, Differ, Pending, Phase, Plan, Read, Reader, Scratch};

pub const SYNC_PHASE: &str = "Sync";
pub const SYNC_CONDITION: &str = "Synced";

/// Request/response body of the remote API.
pub trait RemoteBody: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {}
impl<T: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static> RemoteBody for T {}

/// Patch returned by the remote API's diff call. `{}` means in sync.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePatch(pub Json);

impl RemotePatch {
    pub fn empty() -> Self {
        RemotePatch(json!({}))
    }

    pub fn is_empty(&self) -> bool {
        kestrel_diff::is_empty_patch(&self.0)
    }
}

/// Opaque client of the external management API. `delete` of an absent
/// entity succeeds.
#[async_trait]
pub trait RemoteClient<R>: Send + Sync {
    async fn get(&self, name: &str) -> anyhow::Result<Option<R>>;
    async fn create(&self, name: &str, body: &R) -> anyhow::Result<()>;
    async fn update(&self, name: &str, body: &R) -> anyhow::Result<()>;
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
    /// `Ok(None)` without an error is not a valid answer.
    async fn diff(&self, current: &R, expected: &R, original: Option<&R>) -> anyhow::Result<Option<RemotePatch>>;
}

pub type Handler<R> = Arc<dyn RemoteClient<R>>;

/// A managed kind backed by one remote entity.
pub trait RemoteKind: ManagedObject {
    type Remote: RemoteBody;

    /// Name set in the spec, if any.
    fn spec_external_name(&self) -> Option<String>;

    fn external_name(&self) -> String {
        self.spec_external_name().filter(|n| !n.is_empty()).unwrap_or_else(|| self.name_any())
    }

    fn build(&self) -> anyhow::Result<Self::Remote>;

    fn is_force_update(&self) -> bool {
        false
    }
}

/// Finds the endpoint and credentials for an object.
#[async_trait]
pub trait HandlerResolver<K: RemoteKind>: Send + Sync {
    /// `Ok(None)` while the endpoint is not ready.
    async fn resolve(&self, cx: &Cx<'_, K>) -> Result<Option<Handler<K::Remote>>>;
}

/// Secondary call made after the entity is created, and after updates of
/// objects flagged `isForceUpdate`.
#[async_trait]
pub trait AfterCreate<K: RemoteKind>: Send + Sync {
    async fn after_create(&self, cx: &Cx<'_, K>, client: &dyn RemoteClient<K::Remote>, body: &K::Remote) -> anyhow::Result<()>;
}

pub struct RemoteState<R> {
    client: Handler<R>,
    name: String,
    current: Option<R>,
    expected: R,
}

pub enum RemotePlan<R> {
    Create { client: Handler<R>, name: String, body: R },
    Update { client: Handler<R>, name: String, body: R, patch: RemotePatch },
    NoChange,
}

impl<R: RemoteBody> Plan for RemotePlan<R> {
    fn is_empty(&self) -> bool {
        matches!(self, RemotePlan::NoChange)
    }

    fn describe(&self) -> String {
        match self {
            RemotePlan::Create { name, .. } => format!("create remote {}", name),
            RemotePlan::Update { name, patch, .. } => format!("update remote {}: {}", name, patch.0),
            RemotePlan::NoChange => String::new(),
        }
    }
}

struct RemoteReader<K: RemoteKind> {
    resolver: Arc<dyn HandlerResolver<K>>,
}

#[async_trait]
impl<K: RemoteKind, D: Scratch> Reader<K, D> for RemoteReader<K> {
    type State = RemoteState<K::Remote>;

    async fn read(&self, cx: &Cx<'_, K>, _scratch: &mut D) -> Result<Read<Self::State>> {
        let Some(client) = self.resolver.resolve(cx).await? else {
            return Ok(Read::Pending(Pending {
                reason: format!("remote endpoint for {} not ready", cx.target.key),
                after: cx.config.remote_requeue,
            }));
        };
        let name = cx.obj.external_name();
        let expected = cx.obj.build().map_err(|e| Error::build(&name, e))?;
        let current = client.get(&name).await.map_err(|e| Error::remote(format!("get {}", name), e))?;
        Ok(Read::Ready(RemoteState { client, name, current, expected }))
    }
}

struct RemoteDiffer;

#[async_trait]
impl<K: RemoteKind> Differ<K, RemoteState<K::Remote>> for RemoteDiffer {
    type Plan = RemotePlan<K::Remote>;

    async fn diff(&self, cx: &Cx<'_, K>, state: RemoteState<K::Remote>) -> Result<Self::Plan> {
        let RemoteState { client, name, current, expected } = state;
        let Some(current) = current else {
            return Ok(RemotePlan::Create { client, name, body: expected });
        };
        let original = cx
            .obj
            .managed_status()
            .and_then(|s| s.last_applied_configuration.as_deref())
            .map(serde_json::from_str::<K::Remote>)
            .transpose()
            .map_err(|e| Error::diff(&name, e))?;
        let patch = client
            .diff(&current, &expected, original.as_ref())
            .await
            .map_err(|e| Error::remote(format!("diff {}", name), e))?;
        match patch {
            None => panic!("remote diff for {} returned neither a patch nor an error", cx.target.key),
            Some(p) if p.is_empty() => Ok(RemotePlan::NoChange),
            Some(patch) => Ok(RemotePlan::Update { client, name, body: expected, patch }),
        }
    }
}

struct RemoteApplier<K: RemoteKind> {
    after_create: Option<Arc<dyn AfterCreate<K>>>,
}

impl<K: RemoteKind> RemoteApplier<K> {
    async fn hook(&self, cx: &Cx<'_, K>, client: &dyn RemoteClient<K::Remote>, name: &str, body: &K::Remote) -> Result<()> {
        if let Some(hook) = &self.after_create {
            hook.after_create(cx, client, body)
                .await
                .map_err(|e| Error::remote(format!("after create {}", name), e))?;
        }
        Ok(())
    }
}

fn record_applied<R: RemoteBody>(status: &mut ManagedStatus, name: &str, body: &R) -> Result<()> {
    let applied = serde_json::to_string(body).map_err(|e| Error::diff(name, e))?;
    status.last_applied_configuration = Some(applied);
    status.is_sync = true;
    Ok(())
}

#[async_trait]
impl<K: RemoteKind> Applier<K, RemotePlan<K::Remote>> for RemoteApplier<K> {
    async fn apply(&self, cx: &Cx<'_, K>, plan: RemotePlan<K::Remote>, status: &mut ManagedStatus) -> Result<()> {
        status.is_sync = false;
        match plan {
            RemotePlan::Create { client, name, body } => {
                client.create(&name, &body).await.map_err(|e| Error::remote(format!("create {}", name), e))?;
                info!(key = %cx.target.key, remote = %name, "remote created");
                self.hook(cx, client.as_ref(), &name, &body).await?;
                record_applied(status, &name, &body)
            }
            RemotePlan::Update { client, name, body, .. } => {
                client.update(&name, &body).await.map_err(|e| Error::remote(format!("update {}", name), e))?;
                info!(key = %cx.target.key, remote = %name, "remote updated");
                if cx.obj.is_force_update() {
                    self.hook(cx, client.as_ref(), &name, &body).await?;
                }
                record_applied(status, &name, &body)
            }
            RemotePlan::NoChange => Ok(()),
        }
    }

    fn unchanged(&self, status: &mut ManagedStatus) {
        status.is_sync = true;
    }
}

struct RemoteCleanup<K: RemoteKind> {
    resolver: Arc<dyn HandlerResolver<K>>,
}

#[async_trait]
impl<K: RemoteKind> Cleanup<K> for RemoteCleanup<K> {
    async fn cleanup(&self, cx: &Cx<'_, K>) -> Result<()> {
        let name = cx.obj.external_name();
        match self.resolver.resolve(cx).await? {
            Some(client) => {
                client.delete(&name).await.map_err(|e| Error::remote(format!("delete {}", name), e))?;
                info!(key = %cx.target.key, remote = %name, "remote deleted");
            }
            None => warn!(key = %cx.target.key, remote = %name, "endpoint not ready, skipping remote delete"),
        }
        Ok(())
    }
}

/// Builds the single sync phase of a remote kind.
pub struct RemoteReconciler<K: RemoteKind> {
    resolver: Arc<dyn HandlerResolver<K>>,
    after_create: Option<Arc<dyn AfterCreate<K>>>,
}

impl<K: RemoteKind> RemoteReconciler<K> {
    pub fn new(resolver: impl HandlerResolver<K> + 'static) -> Self {
        Self { resolver: Arc::new(resolver), after_create: None }
    }

    pub fn with_after_create(mut self, hook: impl AfterCreate<K> + 'static) -> Self {
        self.after_create = Some(Arc::new(hook));
        self
    }

    pub fn phase<D: Scratch>(self) -> Phase<K, D> {
        Phase::new(
            SYNC_PHASE,
            RemoteReader { resolver: self.resolver.clone() },
            RemoteDiffer,
            RemoteApplier { after_create: self.after_create },
        )
        .with_condition(SYNC_CONDITION)
        .with_cleanup(RemoteCleanup { resolver: self.resolver })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMode {
    /// Three-way merge patch of the JSON forms.
    #[default]
    Auto,
    /// Always in sync.
    Empty,
    /// Returns neither patch nor error.
    Nil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteVerb {
    Get,
    Create,
    Update,
    Delete,
    Diff,
}

struct MockRemoteState<R> {
    objects: BTreeMap<String, R>,
    calls: Vec<(RemoteVerb, String)>,
    failures: Vec<RemoteVerb>,
    mode: DiffMode,
}

/// In-memory remote API for tests.
pub struct MockRemote<R> {
    state: Mutex<MockRemoteState<R>>,
}

impl<R: RemoteBody> Default for MockRemote<R> {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockRemoteState {
                objects: BTreeMap::new(),
                calls: Vec::new(),
                failures: Vec::new(),
                mode: DiffMode::Auto,
            }),
        }
    }
}

impl<R: RemoteBody> MockRemote<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockRemoteState<R>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_diff_mode(&self, mode: DiffMode) {
        self.lock().mode = mode;
    }

    pub fn seed(&self, name: &str, body: R) {
        self.lock().objects.insert(name.to_string(), body);
    }

    pub fn object(&self, name: &str) -> Option<R> {
        self.lock().objects.get(name).cloned()
    }

    pub fn fail_next(&self, verb: RemoteVerb) {
        self.lock().failures.push(verb);
    }

    pub fn calls(&self) -> Vec<(RemoteVerb, String)> {
        self.lock().calls.clone()
    }

    pub fn count(&self, verb: RemoteVerb) -> usize {
        self.lock().calls.iter().filter(|(v, _)| *v == verb).count()
    }

    fn record(&self, verb: RemoteVerb, name: &str) -> anyhow::Result<()> {
        let mut st = self.lock();
        st.calls.push((verb, name.to_string()));
        if let Some(i) = st.failures.iter().position(|v| *v == verb) {
            st.failures.remove(i);
            return Err(anyhow!("remote api unavailable").context(format!("{:?} {}", verb, name)));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: RemoteBody> RemoteClient<R> for MockRemote<R> {
    async fn get(&self, name: &str) -> anyhow::Result<Option<R>> {
        self.record(RemoteVerb::Get, name)?;
        Ok(self.object(name))
    }

    async fn create(&self, name: &str, body: &R) -> anyhow::Result<()> {
        self.record(RemoteVerb::Create, name)?;
        let mut st = self.lock();
        if st.objects.contains_key(name) {
            return Err(anyhow!("{} already exists", name));
        }
        st.objects.insert(name.to_string(), body.clone());
        Ok(())
    }

    async fn update(&self, name: &str, body: &R) -> anyhow::Result<()> {
        self.record(RemoteVerb::Update, name)?;
        let mut st = self.lock();
        match st.objects.get_mut(name) {
            Some(existing) => {
                *existing = body.clone();
                Ok(())
            }
            None => Err(anyhow!("{} not found", name)),
        }
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        self.record(RemoteVerb::Delete, name)?;
        self.lock().objects.remove(name);
        Ok(())
    }

    async fn diff(&self, current: &R, expected: &R, original: Option<&R>) -> anyhow::Result<Option<RemotePatch>> {
        self.record(RemoteVerb::Diff, "")?;
        let mode = self.lock().mode;
        match mode {
            DiffMode::Empty => Ok(Some(RemotePatch::empty())),
            DiffMode::Nil => Ok(None),
            DiffMode::Auto => {
                let current = serde_json::to_value(current)?;
                let expected = serde_json::to_value(expected)?;
                let original = original.map(serde_json::to_value).transpose()?;
                Ok(Some(RemotePatch(kestrel_diff::three_way_patch(original.as_ref(), &expected, &current))))
            }
        }
    }
}
