//! One unit of convergence work.
//!
//! A [`Phase`] is composed from three capabilities: a [`Reader`] producing
//! the current and expected state (or a pending verdict), a [`Differ`]
//! turning that state into a [`Plan`], and an [`Applier`] executing it.
//! [`run_phase`] wraps the composition with condition bookkeeping.

use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::{Error, ManagedObject, ManagedStatus, Result, MANAGED_BY, MANAGED_BY_LABEL, OWNER_KIND_LABEL, OWNER_UID_LABEL};
use kestrel_diff::DiffResult;
use kestrel_kubehub::{ClusterClient, Selector};
use kestrel_status::{StatusTracker, Target};
use kube::core::{ApiResource, DynamicObject, TypeMeta};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::EngineConfig;

/// What a phase sees during one pass.
pub struct Cx<'a, K> {
    pub obj: &'a K,
    pub target: &'a Target,
    pub cluster: &'a dyn ClusterClient,
    pub tracker: &'a StatusTracker,
    pub config: &'a EngineConfig,
}

impl<'a, K: ManagedObject> Cx<'a, K> {
    pub fn namespace(&self) -> String {
        self.obj.namespace().unwrap_or_default()
    }

    pub fn name(&self) -> String {
        self.obj.name_any()
    }
}

/// Typed scratch shared by reference between the phases of one pass.
pub trait Scratch: Default + Send + Sync + 'static {}
impl<T: Default + Send + Sync + 'static> Scratch for T {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub reason: String,
    pub after: Duration,
}

pub enum Read<S> {
    Ready(S),
    Pending(Pending),
}

#[async_trait]
pub trait Reader<K, D>: Send + Sync {
    type State: Send;
    async fn read(&self, cx: &Cx<'_, K>, scratch: &mut D) -> Result<Read<Self::State>>;
}

pub trait Plan: Send {
    fn is_empty(&self) -> bool;
    fn describe(&self) -> String;
}

impl Plan for DiffResult {
    fn is_empty(&self) -> bool {
        DiffResult::is_empty(self)
    }

    fn describe(&self) -> String {
        self.diff.clone()
    }
}

#[async_trait]
pub trait Differ<K, S>: Send + Sync {
    type Plan: Plan;
    async fn diff(&self, cx: &Cx<'_, K>, state: S) -> Result<Self::Plan>;
}

#[async_trait]
pub trait Applier<K, P>: Send + Sync {
    async fn apply(&self, cx: &Cx<'_, K>, plan: P, status: &mut ManagedStatus) -> Result<()>;

    /// Called instead of `apply` when the plan is empty.
    fn unchanged(&self, _status: &mut ManagedStatus) {}
}

/// Delete-time work of a phase, run before the finalizer is released.
#[async_trait]
pub trait Cleanup<K>: Send + Sync {
    async fn cleanup(&self, cx: &Cx<'_, K>) -> Result<()>;
}

/// Pure desired-state transform for cluster-native children.
pub trait Builder<K, D>: Send + Sync {
    fn build(&self, obj: &K, scratch: &D) -> anyhow::Result<Vec<DynamicObject>>;
}

impl<K, D, F> Builder<K, D> for F
where
    F: Fn(&K, &D) -> anyhow::Result<Vec<DynamicObject>> + Send + Sync,
{
    fn build(&self, obj: &K, scratch: &D) -> anyhow::Result<Vec<DynamicObject>> {
        self(obj, scratch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Missing(String),
}

/// A prerequisite checked before a phase builds its children.
#[async_trait]
pub trait Dependency<K, D>: Send + Sync {
    async fn check(&self, cx: &Cx<'_, K>, scratch: &mut D) -> Result<Readiness>;
}

type NameOf<K> = Box<dyn Fn(&K) -> Option<String> + Send + Sync>;
type OnFound<D> = Box<dyn Fn(&mut D, &DynamicObject) + Send + Sync>;

/// Object in the owner's namespace that must exist. An owner that does not
/// reference one is ready.
pub struct ObjectDependency<K, D> {
    ar: ApiResource,
    name_of: NameOf<K>,
    on_found: OnFound<D>,
}

impl<K, D> ObjectDependency<K, D> {
    pub fn new(ar: ApiResource, name_of: impl Fn(&K) -> Option<String> + Send + Sync + 'static) -> Self {
        Self { ar, name_of: Box::new(name_of), on_found: Box::new(|_, _| {}) }
    }

    /// Copy what later phases need from the dependency into the scratch.
    pub fn on_found(mut self, f: impl Fn(&mut D, &DynamicObject) + Send + Sync + 'static) -> Self {
        self.on_found = Box::new(f);
        self
    }
}

#[async_trait]
impl<K: ManagedObject, D: Scratch> Dependency<K, D> for ObjectDependency<K, D> {
    async fn check(&self, cx: &Cx<'_, K>, scratch: &mut D) -> Result<Readiness> {
        let Some(name) = (self.name_of)(cx.obj) else {
            return Ok(Readiness::Ready);
        };
        let ns = cx.namespace();
        match cx.cluster.get(&self.ar, &ns, &name).await? {
            Some(found) => {
                (self.on_found)(scratch, &found);
                Ok(Readiness::Ready)
            }
            None => Ok(Readiness::Missing(format!("{} {}/{} not found", self.ar.kind, ns, name))),
        }
    }
}

fn owner_uid<K: ManagedObject>(obj: &K) -> Result<String> {
    obj.uid().ok_or_else(|| Error::Build {
        what: "owner reference".into(),
        message: format!("{} has no uid yet", obj.name_any()),
    })
}

/// Labels selecting the children of `obj`.
pub fn owner_selector<K: ManagedObject>(obj: &K) -> Result<Selector> {
    Ok(Selector::default()
        .label(OWNER_UID_LABEL, owner_uid(obj)?)
        .label(OWNER_KIND_LABEL, K::kind(&()).to_string()))
}

/// Serialize a typed object into the dynamic form the diff engine works on.
pub fn to_dynamic<T>(obj: &T) -> anyhow::Result<DynamicObject>
where
    T: Resource<DynamicType = ()> + Serialize,
{
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    dynamic.types = Some(TypeMeta { api_version: T::api_version(&()).into_owned(), kind: T::kind(&()).into_owned() });
    Ok(dynamic)
}

pub struct ChildState {
    pub current: Vec<DynamicObject>,
    pub expected: Vec<DynamicObject>,
}

/// Checks dependencies, builds expected children and lists current ones.
pub struct ChildReader<K, D> {
    ar: ApiResource,
    builder: Box<dyn Builder<K, D>>,
    dependencies: Vec<Box<dyn Dependency<K, D>>>,
}

impl<K: ManagedObject, D: Scratch> ChildReader<K, D> {
    pub fn new(ar: ApiResource, builder: impl Builder<K, D> + 'static) -> Self {
        Self { ar, builder: Box::new(builder), dependencies: Vec::new() }
    }

    pub fn depends_on(mut self, dep: impl Dependency<K, D> + 'static) -> Self {
        self.dependencies.push(Box::new(dep));
        self
    }

    fn stamp(&self, uid: &str, mut child: DynamicObject) -> DynamicObject {
        if child.types.is_none() {
            child.types = Some(TypeMeta { api_version: self.ar.api_version.clone(), kind: self.ar.kind.clone() });
        }
        let labels = child.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(OWNER_UID_LABEL.to_string(), uid.to_string());
        labels.insert(OWNER_KIND_LABEL.to_string(), K::kind(&()).to_string());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        child
    }
}

#[async_trait]
impl<K: ManagedObject, D: Scratch> Reader<K, D> for ChildReader<K, D> {
    type State = ChildState;

    async fn read(&self, cx: &Cx<'_, K>, scratch: &mut D) -> Result<Read<ChildState>> {
        for dep in &self.dependencies {
            if let Readiness::Missing(reason) = dep.check(cx, scratch).await? {
                return Ok(Read::Pending(Pending { reason, after: cx.config.dependency_requeue }));
            }
        }
        let uid = owner_uid(cx.obj)?;
        let expected = self
            .builder
            .build(cx.obj, scratch)
            .map_err(|e| Error::build(&self.ar.kind, e))?
            .into_iter()
            .map(|c| self.stamp(&uid, c))
            .collect();
        let mut current = cx.cluster.list(&self.ar, &cx.namespace(), &owner_selector(cx.obj)?).await?;
        // labels can be copied; the owner reference is what makes a child ours
        current.retain(|c| c.owner_references().iter().any(|o| o.uid == uid));
        Ok(Read::Ready(ChildState { current, expected }))
    }
}

/// Diff of cluster-native children against the owner.
#[derive(Debug, Clone, Default)]
pub struct ChildDiff {
    noise: Vec<String>,
    single: bool,
}

impl ChildDiff {
    pub fn list() -> Self {
        Self::default()
    }

    /// At most one child; compares the first current item with the first expected one.
    pub fn single() -> Self {
        Self { single: true, ..Self::default() }
    }

    pub fn ignore(mut self, pointer: impl Into<String>) -> Self {
        self.noise.push(pointer.into());
        self
    }
}

#[async_trait]
impl<K: ManagedObject> Differ<K, ChildState> for ChildDiff {
    type Plan = DiffResult;

    async fn diff(&self, cx: &Cx<'_, K>, state: ChildState) -> Result<DiffResult> {
        let differ = kestrel_diff::Differ::for_owner(cx.obj)?.ignore_all(self.noise.iter().cloned());
        if self.single {
            differ.diff_single(state.current.first(), state.expected.into_iter().next())
        } else {
            differ.diff_list(&state.current, state.expected)
        }
    }
}

/// Sends creates, then updates, then deletes.
#[derive(Debug, Clone)]
pub struct ChildApplier {
    ar: ApiResource,
}

impl ChildApplier {
    pub fn new(ar: ApiResource) -> Self {
        Self { ar }
    }
}

#[async_trait]
impl<K: ManagedObject> Applier<K, DiffResult> for ChildApplier {
    async fn apply(&self, cx: &Cx<'_, K>, plan: DiffResult, _status: &mut ManagedStatus) -> Result<()> {
        for obj in &plan.to_create {
            cx.cluster.create(&self.ar, obj).await?;
            debug!(key = %cx.target.key, kind = %self.ar.kind, child = %obj.name_any(), "created");
        }
        for obj in &plan.to_update {
            cx.cluster.update(&self.ar, obj).await?;
            debug!(key = %cx.target.key, kind = %self.ar.kind, child = %obj.name_any(), "updated");
        }
        for obj in &plan.to_delete {
            let ns = obj.namespace().unwrap_or_else(|| cx.namespace());
            cx.cluster.delete(&self.ar, &ns, &obj.name_any()).await?;
            debug!(key = %cx.target.key, kind = %self.ar.kind, child = %obj.name_any(), "deleted");
        }
        Ok(())
    }
}

pub(crate) enum Progress {
    Pending(Pending),
    Done { changed: bool },
}

#[async_trait]
pub(crate) trait Step<K, D>: Send + Sync {
    async fn step(&self, cx: &Cx<'_, K>, scratch: &mut D, status: &mut ManagedStatus) -> Result<Progress>;
}

struct Composed<R, Df, A> {
    reader: R,
    differ: Df,
    applier: A,
}

#[async_trait]
impl<K, D, R, Df, A> Step<K, D> for Composed<R, Df, A>
where
    K: ManagedObject,
    D: Scratch,
    R: Reader<K, D> + 'static,
    Df: Differ<K, R::State> + 'static,
    A: Applier<K, Df::Plan> + 'static,
{
    async fn step(&self, cx: &Cx<'_, K>, scratch: &mut D, status: &mut ManagedStatus) -> Result<Progress> {
        let state = match self.reader.read(cx, scratch).await? {
            Read::Ready(state) => state,
            Read::Pending(p) => return Ok(Progress::Pending(p)),
        };
        let plan = self.differ.diff(cx, state).await?;
        if plan.is_empty() {
            self.applier.unchanged(status);
            return Ok(Progress::Done { changed: false });
        }
        info!(key = %cx.target.key, diff = %plan.describe(), "applying changes");
        self.applier.apply(cx, plan, status).await?;
        Ok(Progress::Done { changed: true })
    }
}

/// A named pipeline step with its own condition type.
pub struct Phase<K, D> {
    name: String,
    condition: String,
    step: Box<dyn Step<K, D>>,
    cleanup: Option<Box<dyn Cleanup<K>>>,
}

impl<K: ManagedObject, D: Scratch> Phase<K, D> {
    /// Condition type defaults to `<name>Ready`.
    pub fn new<R, Df, A>(name: impl Into<String>, reader: R, differ: Df, applier: A) -> Self
    where
        R: Reader<K, D> + 'static,
        Df: Differ<K, R::State> + 'static,
        A: Applier<K, Df::Plan> + 'static,
    {
        let name = name.into();
        Self {
            condition: format!("{}Ready", name),
            name,
            step: Box::new(Composed { reader, differ, applier }),
            cleanup: None,
        }
    }

    /// Phase over cluster-native children of one kind.
    pub fn children(name: impl Into<String>, ar: ApiResource, builder: impl Builder<K, D> + 'static) -> ChildPhase<K, D> {
        ChildPhase { name: name.into(), reader: ChildReader::new(ar.clone(), builder), diff: ChildDiff::list(), ar }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_cleanup(mut self, cleanup: impl Cleanup<K> + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn cleanup(&self) -> Option<&dyn Cleanup<K>> {
        self.cleanup.as_deref()
    }
}

/// Builder for [`Phase::children`].
pub struct ChildPhase<K, D> {
    name: String,
    ar: ApiResource,
    reader: ChildReader<K, D>,
    diff: ChildDiff,
}

impl<K: ManagedObject, D: Scratch> ChildPhase<K, D> {
    pub fn depends_on(mut self, dep: impl Dependency<K, D> + 'static) -> Self {
        self.reader = self.reader.depends_on(dep);
        self
    }

    /// Ignore a server-assigned field, as a JSON pointer.
    pub fn ignore(mut self, pointer: impl Into<String>) -> Self {
        self.diff = self.diff.ignore(pointer);
        self
    }

    pub fn single(mut self) -> Self {
        self.diff.single = true;
        self
    }

    pub fn build(self) -> Phase<K, D> {
        Phase::new(self.name, self.reader, self.diff, ChildApplier::new(self.ar))
    }
}

#[derive(Debug)]
pub enum PhaseOutcome {
    Success { changed: bool },
    Pending(Pending),
    Failed(Error),
}

/// Configure, read, diff and apply one phase, recording the outcome.
///
/// A pending read restores the status as it was before the phase started,
/// so waiting on a dependency never touches this phase's condition. The
/// pipeline puts `status.phase` back to its value at the start of the pass.
pub async fn run_phase<K: ManagedObject, D: Scratch>(
    phase: &Phase<K, D>,
    cx: &Cx<'_, K>,
    scratch: &mut D,
    status: &mut ManagedStatus,
) -> PhaseOutcome {
    let snapshot = status.clone();
    debug!(key = %cx.target.key, phase = %phase.name, "phase start");
    cx.tracker.initialize(cx.target, status, &phase.condition);
    cx.tracker.set_phase(cx.target, status, &phase.name);

    match phase.step.step(cx, scratch, status).await {
        Ok(Progress::Done { changed }) => {
            cx.tracker.record_success(cx.target, status, &phase.condition, changed).await;
            PhaseOutcome::Success { changed }
        }
        Ok(Progress::Pending(p)) => {
            *status = snapshot;
            cx.tracker.record_pending(cx.target, &phase.name, &p.reason);
            PhaseOutcome::Pending(p)
        }
        Err(e) => {
            cx.tracker.record_failure(cx.target, status, &phase.condition, &phase.name, &e).await;
            PhaseOutcome::Failed(e)
        }
    }
}
