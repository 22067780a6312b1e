//! `RemoteRole`: a security role kept in sync on an external search cluster.
//!
//! The cluster endpoint comes from a Secret named by `spec.endpointRef`
//! (keys `url`, `username`, `password`). How that endpoint is turned into a
//! client is up to the embedding binary through [`ClientFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kestrel_core::{Error, ManagedStatus, Result};
use kestrel_engine::remote::{Handler, HandlerResolver, RemoteKind, RemoteReconciler};
use kestrel_engine::{Cx, Pipeline};
use kestrel_index::FieldIndex;
use kestrel_kubehub::ClusterClient;
use kestrel_webhook::{ImmutableFieldValidator, UniqueFieldValidator, ValidationChain};
use kube::core::ApiResource;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use smallvec::smallvec;
use tracing::debug;

/// `<endpointRef>/<external name>`, unique per namespace.
pub const REMOTE_NAME_INDEX: &str = "remoteName";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kestrel.io",
    version = "v1alpha1",
    kind = "RemoteRole",
    namespaced,
    status = "ManagedStatus",
    printcolumn = r#"{"name":"Sync","type":"boolean","jsonPath":".status.isSync"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRoleSpec {
    /// Secret holding the endpoint of the remote cluster.
    pub endpoint_ref: String,
    /// Role name on the remote side. Defaults to the object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub cluster: Vec<String>,
    #[serde(default)]
    pub indices: Vec<IndexPrivileges>,
    /// Re-run the post-create call after every update.
    #[serde(default)]
    pub is_force_update: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexPrivileges {
    pub names: Vec<String>,
    pub privileges: Vec<String>,
}

kestrel_core::managed_object!(RemoteRole);

/// Body exchanged with the remote role API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleBody {
    #[serde(default)]
    pub cluster: Vec<String>,
    #[serde(default)]
    pub indices: Vec<IndexPrivileges>,
}

impl RemoteKind for RemoteRole {
    type Remote = RoleBody;

    fn spec_external_name(&self) -> Option<String> {
        self.spec.name.clone()
    }

    fn build(&self) -> anyhow::Result<RoleBody> {
        if let Some(bad) = self.spec.indices.iter().find(|i| i.names.is_empty()) {
            anyhow::bail!("index privileges {:?} name no index", bad.privileges);
        }
        Ok(RoleBody { cluster: self.spec.cluster.clone(), indices: self.spec.indices.clone() })
    }

    fn is_force_update(&self) -> bool {
        self.spec.is_force_update
    }
}

/// Connection settings read from the endpoint secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Endpoint {
    /// `None` until the secret carries a `url`.
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let read = |key: &str| data.get(key).and_then(|b| String::from_utf8(b.0.clone()).ok()).filter(|s| !s.is_empty());
        Some(Self { url: read("url")?, username: read("username"), password: read("password") })
    }
}

/// Builds a remote client for an endpoint.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Handler<RoleBody>>;
}

impl<F> ClientFactory for F
where
    F: Fn(&Endpoint) -> anyhow::Result<Handler<RoleBody>> + Send + Sync,
{
    fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Handler<RoleBody>> {
        self(endpoint)
    }
}

/// Resolves the endpoint secret in the object's namespace.
pub struct EndpointResolver<F> {
    factory: F,
}

impl<F: ClientFactory> EndpointResolver<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F: ClientFactory> HandlerResolver<RemoteRole> for EndpointResolver<F> {
    async fn resolve(&self, cx: &Cx<'_, RemoteRole>) -> Result<Option<Handler<RoleBody>>> {
        let ar = ApiResource::erase::<Secret>(&());
        let secret_name = &cx.obj.spec.endpoint_ref;
        let Some(found) = cx.cluster.get(&ar, &cx.namespace(), secret_name).await? else {
            debug!(key = %cx.target.key, secret = %secret_name, "endpoint secret missing");
            return Ok(None);
        };
        let secret: Secret = found.try_parse().map_err(|e| Error::build(format!("endpoint {}", secret_name), e.into()))?;
        let Some(endpoint) = Endpoint::from_secret(&secret) else {
            debug!(key = %cx.target.key, secret = %secret_name, "endpoint secret has no url");
            return Ok(None);
        };
        let client = self.factory.connect(&endpoint).map_err(|e| Error::remote(format!("connect {}", endpoint.url), e))?;
        Ok(Some(client))
    }
}

pub fn index() -> FieldIndex<RemoteRole> {
    FieldIndex::new().register(REMOTE_NAME_INDEX, |r: &RemoteRole| {
        smallvec![format!("{}/{}", r.spec.endpoint_ref, r.external_name())]
    })
}

/// Admission checks: one object per remote role, and no retargeting.
pub fn validator(index: Arc<FieldIndex<RemoteRole>>) -> ValidationChain<RemoteRole> {
    ValidationChain::new()
        .with(ImmutableFieldValidator::new(["/spec/endpointRef", "/spec/name"]))
        .with(UniqueFieldValidator::new(index, REMOTE_NAME_INDEX, "spec.name"))
}

pub fn reconciler<F: ClientFactory + 'static>(factory: F) -> RemoteReconciler<RemoteRole> {
    RemoteReconciler::new(EndpointResolver::new(factory))
}

pub fn pipeline<F: ClientFactory + 'static>(factory: F) -> Pipeline<RemoteRole, ()> {
    Pipeline::new().phase(reconciler(factory).phase())
}
