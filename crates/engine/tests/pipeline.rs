use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServicePort, ServiceSpec};
use kestrel_core::{ConditionStatus, ManagedStatus, Outcome};
use kestrel_engine::{to_dynamic, Cleanup, Context, Cx, EngineConfig, Liveness, ObjectDependency, Phase, Pipeline};
use kestrel_kubehub::{ClusterClient, MockCluster, Verb};
use kestrel_status::{CountingSink, EventKind, MemoryRecorder, StatusTracker};
use kube::core::{ApiResource, DynamicObject, ObjectMeta};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(group = "test.kestrel.io", version = "v1", kind = "Widget", namespaced, status = "ManagedStatus")]
pub struct WidgetSpec {
    pub color: String,
    #[serde(default)]
    pub secret: Option<String>,
}

kestrel_core::managed_object!(Widget);

#[derive(Default)]
struct WidgetScratch {
    secret_version: Option<String>,
}

type P = Phase<Widget, WidgetScratch>;

fn maps(w: &Widget, s: &WidgetScratch) -> anyhow::Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    for suffix in ["a", "b"] {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(format!("{}-{}", w.name_any(), suffix)),
                namespace: w.namespace(),
                labels: Some([("color".to_string(), w.spec.color.clone())].into()),
                ..Default::default()
            },
            data: Some([("secret".to_string(), s.secret_version.clone().unwrap_or_default())].into()),
            ..Default::default()
        };
        out.push(to_dynamic(&cm)?);
    }
    Ok(out)
}

fn service(w: &Widget, _: &WidgetScratch) -> anyhow::Result<Vec<DynamicObject>> {
    let svc = Service {
        metadata: ObjectMeta { name: Some(w.name_any()), namespace: w.namespace(), ..Default::default() },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort { port: 80, ..Default::default() }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(vec![to_dynamic(&svc)?])
}

struct Flag(Arc<AtomicBool>);

#[async_trait]
impl Liveness<Widget, WidgetScratch> for Flag {
    async fn is_live(&self, _cx: &Cx<'_, Widget>, _scratch: &WidgetScratch) -> kestrel_core::Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

struct Note {
    phase: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    fail: bool,
}

#[async_trait]
impl Cleanup<Widget> for Note {
    async fn cleanup(&self, _cx: &Cx<'_, Widget>) -> kestrel_core::Result<()> {
        self.log.lock().unwrap().push(self.phase);
        if self.fail {
            return Err(kestrel_core::Error::remote("cleanup", anyhow::anyhow!("endpoint refused")));
        }
        Ok(())
    }
}

struct Harness {
    cluster: Arc<MockCluster>,
    events: Arc<MemoryRecorder>,
    sink: Arc<CountingSink>,
    live: Arc<AtomicBool>,
    ctx: Context,
}

fn harness() -> Harness {
    let cluster = Arc::new(MockCluster::new());
    let events = Arc::new(MemoryRecorder::default());
    let sink = Arc::new(CountingSink::default());
    let tracker = StatusTracker::new(events.clone(), sink.clone());
    let ctx = Context::new(cluster.clone(), tracker, EngineConfig::default());
    Harness { cluster, events, sink, live: Arc::new(AtomicBool::new(true)), ctx }
}

fn pipeline(h: &Harness) -> Pipeline<Widget, WidgetScratch> {
    let secrets = ApiResource::erase::<Secret>(&());
    Pipeline::new()
        .phase(
            P::children("ConfigMap", ApiResource::erase::<ConfigMap>(&()), maps)
                .depends_on(
                    ObjectDependency::new(secrets, |w: &Widget| w.spec.secret.clone())
                        .on_found(|s: &mut WidgetScratch, o: &DynamicObject| s.secret_version = o.metadata.resource_version.clone()),
                )
                .build(),
        )
        .phase(P::children("Service", ApiResource::erase::<Service>(&()), service).single().ignore("/spec/clusterIP").build())
        .liveness(Flag(h.live.clone()))
}

fn seed_widget(h: &Harness, secret: Option<&str>) -> Widget {
    let mut w = Widget::new("demo", WidgetSpec { color: "blue".into(), secret: secret.map(Into::into) });
    w.metadata.namespace = Some("ns".into());
    h.cluster.seed_typed(&w).unwrap()
}

fn seed_secret(h: &Harness, name: &str) {
    let s = Secret {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), ..Default::default() },
        ..Default::default()
    };
    h.cluster.seed(&ApiResource::erase::<Secret>(&()), to_dynamic(&s).unwrap());
}

fn fetch(h: &Harness) -> Widget {
    h.cluster.typed::<Widget>("ns", "demo").unwrap()
}

fn status(h: &Harness) -> ManagedStatus {
    fetch(h).status.unwrap_or_default()
}

#[tokio::test]
async fn fresh_object_creates_owned_children_and_becomes_ready() {
    let h = harness();
    let p = pipeline(&h);
    let w = seed_widget(&h, None);

    let out = p.converge(&h.ctx, &w).await.unwrap();
    assert_eq!(out, Outcome::Done);
    assert_eq!(h.cluster.count(Verb::Create, "ConfigMap"), 2);
    assert_eq!(h.cluster.count(Verb::Create, "Service"), 1);
    assert_eq!(h.cluster.count(Verb::Update, "ConfigMap"), 0);

    let uid = w.uid().unwrap();
    for child in h.cluster.objects_of("ConfigMap").iter().chain(h.cluster.objects_of("Service").iter()) {
        let owners = child.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, uid);
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(child.labels().get("kestrel.io/owner-uid"), Some(&uid));
        assert!(child.annotations().contains_key(kestrel_diff::LAST_APPLIED_ANNOTATION));
    }

    let got = fetch(&h);
    assert!(got.finalizers().iter().any(|f| f == "kestrel.io/finalizer"));
    let st = got.status.unwrap();
    assert!(st.is_condition_true("ConfigMapReady"));
    assert!(st.is_condition_true("ServiceReady"));
    assert!(st.is_condition_true("Ready"));
    assert_eq!(st.phase.as_deref(), Some("Running"));
    assert_eq!(st.observed_generation, Some(1));
    assert!(!st.is_error);
    assert_eq!(st.conditions.len(), 3);

    let reasons = h.events.reasons();
    assert_eq!(reasons, vec!["Completed".to_string(), "Completed".to_string()]);
    assert_eq!(h.sink.started(), 1);
}

#[tokio::test]
async fn second_pass_makes_no_calls_and_no_status_write() {
    let h = harness();
    let p = pipeline(&h);
    p.converge(&h.ctx, &seed_widget(&h, None)).await.unwrap();
    // a server-assigned field must not show up as drift
    h.cluster.modify("Service", "ns", "demo", |o| o.data["spec"]["clusterIP"] = serde_json::json!("10.0.0.7"));
    h.cluster.clear_calls();

    let out = p.converge(&h.ctx, &fetch(&h)).await.unwrap();
    assert_eq!(out, Outcome::Done);
    assert!(h.cluster.writes().is_empty(), "{:?}", h.cluster.writes());
    assert_eq!(h.cluster.count(Verb::PatchStatus, "Widget"), 0);
    assert_eq!(h.cluster.count(Verb::SetFinalizers, "Widget"), 0);
    assert_eq!(h.events.count(), 2);
}

#[tokio::test]
async fn label_edit_updates_only_labelled_children() {
    let h = harness();
    let p = pipeline(&h);
    p.converge(&h.ctx, &seed_widget(&h, None)).await.unwrap();
    h.cluster.clear_calls();

    let mut w = fetch(&h);
    w.spec.color = "red".into();
    w.metadata.generation = Some(2);
    let w = h.cluster.seed_typed(&w).unwrap();

    let out = p.converge(&h.ctx, &w).await.unwrap();
    assert_eq!(out, Outcome::Done);
    assert_eq!(h.cluster.count(Verb::Update, "ConfigMap"), 2);
    assert_eq!(h.cluster.count(Verb::Create, "ConfigMap"), 0);
    assert_eq!(h.cluster.count(Verb::Delete, "ConfigMap"), 0);
    assert_eq!(h.cluster.count(Verb::Update, "Service"), 0);
    for cm in h.cluster.objects_of("ConfigMap") {
        assert_eq!(cm.labels().get("color").map(String::as_str), Some("red"));
    }
    let st = status(&h);
    assert!(st.is_condition_true("Ready"));
    assert_eq!(st.observed_generation, Some(2));
}

#[tokio::test]
async fn removed_child_is_deleted() {
    let h = harness();
    let p = pipeline(&h);
    p.converge(&h.ctx, &seed_widget(&h, None)).await.unwrap();
    // a stale child from an older desired state
    let mut stale = h.cluster.object("ConfigMap", "ns", "demo-a").unwrap();
    stale.metadata.name = Some("demo-old".into());
    stale.metadata.uid = None;
    h.cluster.seed(&ApiResource::erase::<ConfigMap>(&()), stale);
    h.cluster.clear_calls();

    p.converge(&h.ctx, &fetch(&h)).await.unwrap();
    let deletes: Vec<_> = h.cluster.writes().into_iter().filter(|c| c.verb == Verb::Delete).collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].name, "demo-old");
    assert!(h.cluster.object("ConfigMap", "ns", "demo-old").is_none());
}

#[tokio::test]
async fn missing_dependency_is_pending_not_failed() {
    let h = harness();
    let p = pipeline(&h);
    seed_secret(&h, "creds");
    p.converge(&h.ctx, &seed_widget(&h, Some("creds"))).await.unwrap();
    let before = status(&h);
    let events_before = h.events.count();
    assert_eq!(before.phase.as_deref(), Some("Running"));

    h.cluster.remove("Secret", "ns", "creds");
    h.cluster.clear_calls();
    let out = p.converge(&h.ctx, &fetch(&h)).await.unwrap();

    assert!(out.is_pending());
    assert_eq!(out.requeue_after(), Some(Duration::from_secs(30)));
    assert_eq!(h.events.count(), events_before);
    assert_eq!(h.sink.errors(), 0);
    assert_eq!(h.sink.pending(), 1);
    assert!(h.cluster.writes().is_empty());
    assert_eq!(h.cluster.count(Verb::PatchStatus, "Widget"), 0);
    assert_eq!(status(&h), before);
}

/// Secret gate on the second phase instead of the first.
fn late_dependency_pipeline() -> Pipeline<Widget, WidgetScratch> {
    let secrets = ApiResource::erase::<Secret>(&());
    Pipeline::new()
        .phase(P::children("ConfigMap", ApiResource::erase::<ConfigMap>(&()), maps).build())
        .phase(
            P::children("Service", ApiResource::erase::<Service>(&()), service)
                .single()
                .depends_on(ObjectDependency::new(secrets, |w: &Widget| w.spec.secret.clone()))
                .build(),
        )
}

#[tokio::test]
async fn dependency_on_later_phase_keeps_phase_and_status() {
    let h = harness();
    let p = late_dependency_pipeline();
    seed_secret(&h, "creds");
    p.converge(&h.ctx, &seed_widget(&h, Some("creds"))).await.unwrap();
    let before = status(&h);
    assert_eq!(before.phase.as_deref(), Some("Running"));

    h.cluster.remove("Secret", "ns", "creds");
    h.cluster.clear_calls();
    let out = p.converge(&h.ctx, &fetch(&h)).await.unwrap();

    assert!(out.is_pending());
    // the first phase still ran
    assert_eq!(h.cluster.count(Verb::List, "ConfigMap"), 1);
    assert_eq!(h.cluster.count(Verb::List, "Service"), 0);
    assert!(h.cluster.writes().is_empty());
    assert_eq!(h.cluster.count(Verb::PatchStatus, "Widget"), 0);
    assert_eq!(status(&h), before);
}

#[tokio::test]
async fn long_owner_name_still_converges() {
    let h = harness();
    let p = pipeline(&h);
    let name = "w".repeat(70);
    let mut w = Widget::new(&name, WidgetSpec { color: "blue".into(), secret: None });
    w.metadata.namespace = Some("ns".into());
    let w = h.cluster.seed_typed(&w).unwrap();

    let out = p.converge(&h.ctx, &w).await.unwrap();
    assert_eq!(out, Outcome::Done);
    assert_eq!(h.cluster.objects_of("ConfigMap").len(), 2);
    for child in h.cluster.objects_of("ConfigMap").iter().chain(h.cluster.objects_of("Service").iter()) {
        assert!(child.labels().values().all(|v| v.len() <= 63), "{:?}", child.labels());
    }

    h.cluster.clear_calls();
    let again = h.cluster.typed::<Widget>("ns", &name).unwrap();
    assert_eq!(p.converge(&h.ctx, &again).await.unwrap(), Outcome::Done);
    assert!(h.cluster.writes().is_empty(), "{:?}", h.cluster.writes());
}

#[tokio::test]
async fn child_with_copied_labels_but_other_owner_is_left_alone() {
    let h = harness();
    let p = pipeline(&h);
    p.converge(&h.ctx, &seed_widget(&h, None)).await.unwrap();
    let mut foreign = h.cluster.object("ConfigMap", "ns", "demo-a").unwrap();
    foreign.metadata.name = Some("someone-else".into());
    foreign.metadata.uid = None;
    foreign.metadata.owner_references = None;
    h.cluster.seed(&ApiResource::erase::<ConfigMap>(&()), foreign);
    h.cluster.clear_calls();

    p.converge(&h.ctx, &fetch(&h)).await.unwrap();
    assert!(h.cluster.writes().is_empty(), "{:?}", h.cluster.writes());
    assert!(h.cluster.object("ConfigMap", "ns", "someone-else").is_some());
}

#[tokio::test]
async fn finalizer_add_does_not_clobber_concurrent_finalizer() {
    let h = harness();
    let p = pipeline(&h);
    let stale = seed_widget(&h, None);
    h.cluster.modify("Widget", "ns", "demo", |o| o.metadata.finalizers = Some(vec!["other.io/hold".into()]));

    let err = p.converge(&h.ctx, &stale).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(fetch(&h).finalizers(), &["other.io/hold".to_string()]);

    assert_eq!(p.converge(&h.ctx, &fetch(&h)).await.unwrap(), Outcome::Done);
    let finalizers = fetch(&h).finalizers().to_vec();
    assert_eq!(finalizers, vec!["other.io/hold".to_string(), "kestrel.io/finalizer".to_string()]);
}

#[tokio::test]
async fn dependency_data_flows_through_scratch() {
    let h = harness();
    let p = pipeline(&h);
    seed_secret(&h, "creds");
    let rv = h.cluster.object("Secret", "ns", "creds").unwrap().metadata.resource_version.unwrap();
    p.converge(&h.ctx, &seed_widget(&h, Some("creds"))).await.unwrap();
    let cm = h.cluster.object("ConfigMap", "ns", "demo-a").unwrap();
    assert_eq!(cm.data["data"]["secret"], rv);
}

#[tokio::test]
async fn failure_stops_later_phases_and_marks_error() {
    let h = harness();
    let p = pipeline(&h);
    h.cluster.fail_next(Verb::Create, "ConfigMap", 500);

    let err = p.converge(&h.ctx, &seed_widget(&h, None)).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.cluster.count(Verb::List, "Service"), 0);

    let st = status(&h);
    let cond = st.condition("ConfigMapReady").unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason, "Failed");
    assert!(cond.message.contains("injected failure"), "{}", cond.message);
    assert!(st.is_error);
    assert!(st.last_error_time.is_some());
    assert!(st.condition("ServiceReady").is_none());
    assert!(st.condition("Ready").is_none());
    assert_eq!(st.phase.as_deref(), Some("ConfigMap"));
    assert_eq!(h.sink.errors(), 1);
    let last = h.events.events().pop().unwrap();
    assert_eq!(last.kind, EventKind::Warning);
    assert_eq!(last.reason, "Failed");

    // the retry converges and clears the error flag
    let out = p.converge(&h.ctx, &fetch(&h)).await.unwrap();
    assert_eq!(out, Outcome::Done);
    let st = status(&h);
    assert!(!st.is_error);
    assert!(st.is_condition_true("ConfigMapReady"));
    assert_eq!(st.conditions.iter().filter(|c| c.type_ == "ConfigMapReady").count(), 1);
}

#[tokio::test]
async fn not_live_requeues_without_error() {
    let h = harness();
    let p = pipeline(&h);
    h.live.store(false, Ordering::SeqCst);

    let out = p.converge(&h.ctx, &seed_widget(&h, None)).await.unwrap();
    assert_eq!(out, Outcome::Requeue { after: Duration::from_secs(30) });
    let st = status(&h);
    let ready = st.condition("Ready").unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "NotReady");
    assert_eq!(st.phase.as_deref(), Some("Starting"));
    assert!(!st.is_error);
    assert_eq!(h.sink.errors(), 0);

    h.live.store(true, Ordering::SeqCst);
    p.converge(&h.ctx, &fetch(&h)).await.unwrap();
    let st = status(&h);
    assert!(st.is_condition_true("Ready"));
    assert_eq!(st.phase.as_deref(), Some("Running"));
}

fn cleanup_pipeline(log: Arc<Mutex<Vec<&'static str>>>, fail_first: bool) -> Pipeline<Widget, WidgetScratch> {
    Pipeline::new()
        .phase(
            P::children("ConfigMap", ApiResource::erase::<ConfigMap>(&()), maps)
                .build()
                .with_cleanup(Note { phase: "ConfigMap", log: log.clone(), fail: false }),
        )
        .phase(
            P::children("Service", ApiResource::erase::<Service>(&()), service)
                .single()
                .build()
                .with_cleanup(Note { phase: "Service", log, fail: fail_first }),
        )
}

#[tokio::test]
async fn delete_runs_cleanups_in_reverse_then_releases_finalizer() {
    let h = harness();
    let log = Arc::new(Mutex::new(Vec::new()));
    let p = cleanup_pipeline(log.clone(), false);
    p.converge(&h.ctx, &seed_widget(&h, None)).await.unwrap();

    let ar = ApiResource::erase::<Widget>(&());
    h.cluster.delete(&ar, "ns", "demo").await.unwrap();
    let deleting = fetch(&h);
    assert!(deleting.metadata.deletion_timestamp.is_some());

    let out = p.converge(&h.ctx, &deleting).await.unwrap();
    assert_eq!(out, Outcome::Done);
    assert_eq!(*log.lock().unwrap(), vec!["Service", "ConfigMap"]);
    assert!(h.cluster.typed::<Widget>("ns", "demo").is_none());
}

#[tokio::test]
async fn failed_cleanup_keeps_finalizer() {
    let h = harness();
    let log = Arc::new(Mutex::new(Vec::new()));
    let p = cleanup_pipeline(log.clone(), true);
    p.converge(&h.ctx, &seed_widget(&h, None)).await.unwrap();

    let ar = ApiResource::erase::<Widget>(&());
    h.cluster.delete(&ar, "ns", "demo").await.unwrap();
    let err = p.converge(&h.ctx, &fetch(&h)).await.unwrap_err();
    assert!(err.to_string().contains("endpoint refused"), "{}", err);
    assert_eq!(*log.lock().unwrap(), vec!["Service"]);

    let still = fetch(&h);
    assert!(still.finalizers().iter().any(|f| f == "kestrel.io/finalizer"));
    assert!(still.status.unwrap().is_error);
}
