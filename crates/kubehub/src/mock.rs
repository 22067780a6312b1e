use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kestrel_core::{Error, Result};
use kube::{
    core::{ApiResource, DynamicObject, ErrorResponse, TypeMeta},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;

use crate::{ClusterClient, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
    PatchStatus,
    SetFinalizers,
}

impl Verb {
    pub fn is_write(self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Delete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    calls: Vec<Call>,
    failures: Vec<(Verb, String, u16)>,
    resource_version: u64,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn record(&mut self, verb: Verb, kind: &str, ns: &str, name: &str) -> Result<()> {
        self.calls.push(Call { verb, kind: kind.to_string(), namespace: ns.to_string(), name: name.to_string() });
        if let Some(i) = self.failures.iter().position(|(v, k, _)| *v == verb && k == kind) {
            let (_, _, code) = self.failures.remove(i);
            let err = kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: format!("injected failure for {:?} {}", verb, kind),
                reason: "InternalError".into(),
                code,
            });
            return Err(Error::kube(format!("{:?} {} {}/{}", verb, kind, ns, name), err));
        }
        Ok(())
    }
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse { status: "Failure".into(), message, reason: reason.into(), code })
}

const MAX_LABEL_VALUE: usize = 63;

fn check_labels(obj: &DynamicObject) -> std::result::Result<(), kube::Error> {
    match obj.labels().iter().find(|(_, v)| v.len() > MAX_LABEL_VALUE) {
        Some((k, v)) => Err(api_error(
            422,
            "Invalid",
            format!("metadata.labels: Invalid value: {:?}: {} must be no more than {} characters", v, k, MAX_LABEL_VALUE),
        )),
        None => Ok(()),
    }
}

/// In-memory cluster for tests.
///
/// Keeps objects per `(kind, namespace, name)`, assigns uids and resource
/// versions, logs every call and can fail the next call of a given verb and
/// kind. Deleting an object that still has finalizers only marks it as
/// deleting; it disappears once its finalizers are cleared. Label values
/// over 63 characters are rejected and status patches are merged, as the
/// API server does.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store an object without logging a call. Missing uid and
    /// resourceVersion are filled in.
    pub fn seed(&self, ar: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
        let mut st = self.lock();
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(st.next_rv());
        if obj.metadata.generation.is_none() {
            obj.metadata.generation = Some(1);
        }
        let key = (ar.kind.clone(), obj.namespace().unwrap_or_default(), obj.name_any());
        st.objects.insert(key, obj.clone());
        obj
    }

    pub fn seed_typed<K>(&self, obj: &K) -> anyhow::Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let ar = ApiResource::erase::<K>(&());
        let dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        let stored = self.seed(&ar, dynamic);
        Ok(serde_json::from_value(serde_json::to_value(stored)?)?)
    }

    pub fn object(&self, kind: &str, ns: &str, name: &str) -> Option<DynamicObject> {
        self.lock().objects.get(&(kind.to_string(), ns.to_string(), name.to_string())).cloned()
    }

    pub fn typed<K>(&self, ns: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let obj = self.object(&K::kind(&()), ns, name)?;
        serde_json::to_value(obj).ok().and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn objects_of(&self, kind: &str) -> Vec<DynamicObject> {
        self.lock().objects.iter().filter(|((k, _, _), _)| k == kind).map(|(_, o)| o.clone()).collect()
    }

    /// Mutate a stored object in place, as another actor would.
    pub fn modify(&self, kind: &str, ns: &str, name: &str, f: impl FnOnce(&mut DynamicObject)) -> bool {
        let mut st = self.lock();
        let rv = st.next_rv();
        match st.objects.get_mut(&(kind.to_string(), ns.to_string(), name.to_string())) {
            Some(obj) => {
                f(obj);
                obj.metadata.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, kind: &str, ns: &str, name: &str) -> Option<DynamicObject> {
        self.lock().objects.remove(&(kind.to_string(), ns.to_string(), name.to_string()))
    }

    pub fn fail_next(&self, verb: Verb, kind: &str, code: u16) {
        self.lock().failures.push((verb, kind.to_string(), code));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Create, update and delete calls only.
    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.verb.is_write()).collect()
    }

    pub fn count(&self, verb: Verb, kind: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.verb == verb && c.kind == kind).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get(&self, ar: &ApiResource, ns: &str, name: &str) -> Result<Option<DynamicObject>> {
        let mut st = self.lock();
        st.record(Verb::Get, &ar.kind, ns, name)?;
        Ok(st.objects.get(&(ar.kind.clone(), ns.to_string(), name.to_string())).cloned())
    }

    async fn list(&self, ar: &ApiResource, ns: &str, selector: &Selector) -> Result<Vec<DynamicObject>> {
        let mut st = self.lock();
        st.record(Verb::List, &ar.kind, ns, "")?;
        Ok(st
            .objects
            .iter()
            .filter(|((k, n, _), o)| *k == ar.kind && n == ns && selector.matches(o))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let mut st = self.lock();
        st.record(Verb::Create, &ar.kind, &ns, &name)?;
        let key = (ar.kind.clone(), ns.clone(), name.clone());
        if st.objects.contains_key(&key) {
            let e = api_error(409, "AlreadyExists", format!("{} {} already exists", ar.kind, name));
            return Err(Error::kube(format!("create {} {}/{}", ar.kind, ns, name), e));
        }
        check_labels(obj).map_err(|e| Error::kube(format!("create {} {}/{}", ar.kind, ns, name), e))?;
        let mut stored = obj.clone();
        stored.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some(st.next_rv());
        stored.metadata.generation = Some(1);
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let mut st = self.lock();
        st.record(Verb::Update, &ar.kind, &ns, &name)?;
        let key = (ar.kind.clone(), ns.clone(), name.clone());
        let Some(existing) = st.objects.get(&key).cloned() else {
            let e = api_error(404, "NotFound", format!("{} {} not found", ar.kind, name));
            return Err(Error::kube(format!("update {} {}/{}", ar.kind, ns, name), e));
        };
        if obj.metadata.resource_version.is_some() && obj.metadata.resource_version != existing.metadata.resource_version {
            let e = api_error(409, "Conflict", format!("{} {} has been modified", ar.kind, name));
            return Err(Error::kube(format!("update {} {}/{}", ar.kind, ns, name), e));
        }
        check_labels(obj).map_err(|e| Error::kube(format!("update {} {}/{}", ar.kind, ns, name), e))?;
        let mut stored = obj.clone();
        stored.types = existing.types.clone();
        stored.metadata.uid = existing.metadata.uid.clone();
        stored.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        stored.metadata.generation = existing.metadata.generation.map(|g| g + 1);
        stored.metadata.resource_version = Some(st.next_rv());
        // Status belongs to the subresource.
        if let Some(data) = stored.data.as_object_mut() {
            data.remove("status");
            if let Some(status) = existing.data.get("status") {
                data.insert("status".into(), status.clone());
            }
        }
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, ar: &ApiResource, ns: &str, name: &str) -> Result<()> {
        let mut st = self.lock();
        st.record(Verb::Delete, &ar.kind, ns, name)?;
        let key = (ar.kind.clone(), ns.to_string(), name.to_string());
        let gated = st.objects.get(&key).map(|o| !o.finalizers().is_empty()).unwrap_or(false);
        if gated {
            let rv = st.next_rv();
            if let Some(o) = st.objects.get_mut(&key) {
                o.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                o.metadata.resource_version = Some(rv);
            }
        } else {
            st.objects.remove(&key);
        }
        Ok(())
    }

    async fn patch_status(&self, ar: &ApiResource, ns: &str, name: &str, status: &Json) -> Result<()> {
        let mut st = self.lock();
        st.record(Verb::PatchStatus, &ar.kind, ns, name)?;
        let rv = st.next_rv();
        let key = (ar.kind.clone(), ns.to_string(), name.to_string());
        let Some(obj) = st.objects.get_mut(&key) else {
            let e = api_error(404, "NotFound", format!("{} {} not found", ar.kind, name));
            return Err(Error::kube(format!("patch status {} {}/{}", ar.kind, ns, name), e));
        };
        if let Some(data) = obj.data.as_object_mut() {
            kestrel_diff::merge_patch(data.entry("status").or_insert(Json::Null), status);
        }
        obj.metadata.resource_version = Some(rv);
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
        let mut st = self.lock();
        st.record(Verb::SetFinalizers, &ar.kind, ns, name)?;
        let rv = st.next_rv();
        let key = (ar.kind.clone(), ns.to_string(), name.to_string());
        let Some(obj) = st.objects.get_mut(&key) else {
            if finalizers.is_empty() {
                return Ok(());
            }
            let e = api_error(404, "NotFound", format!("{} {} not found", ar.kind, name));
            return Err(Error::kube(format!("set finalizers {} {}/{}", ar.kind, ns, name), e));
        };
        if resource_version.is_some() && resource_version != obj.metadata.resource_version.as_deref() {
            let e = api_error(409, "Conflict", format!("{} {} has been modified", ar.kind, name));
            return Err(Error::kube(format!("set finalizers {} {}/{}", ar.kind, ns, name), e));
        }
        obj.metadata.finalizers = if finalizers.is_empty() { None } else { Some(finalizers.to_vec()) };
        obj.metadata.resource_version = Some(rv);
        if finalizers.is_empty() && obj.metadata.deletion_timestamp.is_some() {
            st.objects.remove(&key);
        }
        Ok(())
    }
}
