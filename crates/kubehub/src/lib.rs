//! Kestrel kubehub: the cluster API seam used by the engine, its kube-backed
//! implementation, discovery and event publishing.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use kestrel_core::{Error, Result};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{Discovery, Scope},
    Client, ResourceExt,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, info};

mod events;
mod mock;

pub use events::KubeEventRecorder;
pub use mock::{Call, MockCluster, Verb};

/// Label and field constraints for list calls. Only equality is supported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

impl Selector {
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn label_query(&self) -> String {
        join_pairs(&self.labels)
    }

    pub fn field_query(&self) -> String {
        join_pairs(&self.fields)
    }

    /// Client-side evaluation, used by the in-memory cluster. Field selectors
    /// understand `metadata.name` and `metadata.namespace`.
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        let labels = obj.labels();
        let labels_ok = self.labels.iter().all(|(k, v)| labels.get(k) == Some(v));
        let fields_ok = self.fields.iter().all(|(k, v)| match k.as_str() {
            "metadata.name" => obj.metadata.name.as_deref() == Some(v.as_str()),
            "metadata.namespace" => obj.metadata.namespace.as_deref() == Some(v.as_str()),
            _ => false,
        });
        labels_ok && fields_ok
    }
}

fn join_pairs(m: &BTreeMap<String, String>) -> String {
    m.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Namespaced object access the engine needs from the cluster.
///
/// `delete` of an absent object succeeds. `update` is a full replace guarded
/// by the object's resourceVersion.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, ar: &ApiResource, ns: &str, name: &str) -> Result<Option<DynamicObject>>;
    async fn list(&self, ar: &ApiResource, ns: &str, selector: &Selector) -> Result<Vec<DynamicObject>>;
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn delete(&self, ar: &ApiResource, ns: &str, name: &str) -> Result<()>;
    /// Merge-patch `.status` through the status subresource; null clears a field.
    async fn patch_status(&self, ar: &ApiResource, ns: &str, name: &str, status: &Json) -> Result<()>;
    /// Replace the finalizer list. With a resourceVersion the write fails with
    /// a conflict if the object changed since it was read.
    async fn set_finalizers(
        &self,
        ar: &ApiResource,
        ns: &str,
        name: &str,
        finalizers: &[String],
        resource_version: Option<&str>,
    ) -> Result<()>;
}

/// [`ClusterClient`] over a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, ar: &ApiResource, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, ar)
    }

    fn post_params(&self) -> PostParams {
        PostParams { dry_run: false, field_manager: Some(self.field_manager.clone()) }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }
}

fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    obj
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, ar: &ApiResource, ns: &str, name: &str) -> Result<Option<DynamicObject>> {
        let obj = self
            .api(ar, ns)
            .get_opt(name)
            .await
            .map_err(|e| Error::kube(format!("get {} {}/{}", ar.kind, ns, name), e))?;
        Ok(obj.map(|o| with_types(o, ar)))
    }

    async fn list(&self, ar: &ApiResource, ns: &str, selector: &Selector) -> Result<Vec<DynamicObject>> {
        let mut lp = ListParams::default();
        if !selector.labels.is_empty() {
            lp = lp.labels(&selector.label_query());
        }
        if !selector.fields.is_empty() {
            lp = lp.fields(&selector.field_query());
        }
        let list = self
            .api(ar, ns)
            .list(&lp)
            .await
            .map_err(|e| Error::kube(format!("list {} in {}", ar.kind, ns), e))?;
        debug!(kind = %ar.kind, ns, count = list.items.len(), "listed");
        Ok(list.items.into_iter().map(|o| with_types(o, ar)).collect())
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let ns = obj.namespace().unwrap_or_default();
        let created = self
            .api(ar, &ns)
            .create(&self.post_params(), obj)
            .await
            .map_err(|e| Error::kube(format!("create {} {}/{}", ar.kind, ns, obj.name_any()), e))?;
        Ok(with_types(created, ar))
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let updated = self
            .api(ar, &ns)
            .replace(&name, &self.post_params(), obj)
            .await
            .map_err(|e| Error::kube(format!("update {} {}/{}", ar.kind, ns, name), e))?;
        Ok(with_types(updated, ar))
    }

    async fn delete(&self, ar: &ApiResource, ns: &str, name: &str) -> Result<()> {
        match self.api(ar, ns).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::kube(format!("delete {} {}/{}", ar.kind, ns, name), e)),
        }
    }

    async fn patch_status(&self, ar: &ApiResource, ns: &str, name: &str, status: &Json) -> Result<()> {
        let patch = Patch::Merge(json!({ "status": status }));
        self.api(ar, ns)
            .patch_status(name, &self.patch_params(), &patch)
            .await
            .map_err(|e| Error::kube(format!("patch status {} {}/{}", ar.kind, ns, name), e))?;
        Ok(())
    }

    async fn set_finalizers(
        &self,
        ar: &ApiResource,
        ns: &str,
        name: &str,
        finalizers: &[String],
        resource_version: Option<&str>,
    ) -> Result<()> {
        let patch = Patch::Merge(finalizer_patch(finalizers, resource_version));
        match self.api(ar, ns).patch(name, &self.patch_params(), &patch).await {
            Ok(_) => Ok(()),
            // Object already gone after its last finalizer was dropped elsewhere.
            Err(e) if is_not_found(&e) && finalizers.is_empty() => Ok(()),
            Err(e) => Err(Error::kube(format!("set finalizers {} {}/{}", ar.kind, ns, name), e)),
        }
    }
}

fn finalizer_patch(finalizers: &[String], resource_version: Option<&str>) -> Json {
    let mut meta = json!({ "finalizers": finalizers });
    if let Some(rv) = resource_version {
        meta["resourceVersion"] = json!(rv);
    }
    json!({ "metadata": meta })
}

/// Build a client from kubeconfig or the in-cluster environment.
pub async fn get_kube_client() -> anyhow::Result<Client> {
    Client::try_default().await.context("building kube client")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Served resources of the requested groups, in a stable order.
pub async fn discover(client: Client, groups: &[&str]) -> anyhow::Result<Vec<DiscoveredResource>> {
    let mut discovery = Discovery::new(client);
    if !groups.is_empty() {
        discovery = discovery.filter(groups);
    }
    let discovery = discovery.run().await.context("running discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    info!(count = out.len(), "discovery finished");
    Ok(out)
}

/// Which of `wanted` are missing from `served`, as `group/version/Kind` keys.
pub fn missing_kinds(served: &[DiscoveredResource], wanted: &[GroupVersionKind]) -> Vec<String> {
    wanted
        .iter()
        .filter(|g| !served.iter().any(|s| s.group == g.group && s.version == g.version && s.kind == g.kind))
        .map(|g| DiscoveredResource { group: g.group.clone(), version: g.version.clone(), kind: g.kind.clone(), namespaced: true }.gvk_key())
        .collect()
}
