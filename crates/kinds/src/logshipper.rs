use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvFromSource, PodSpec, PodTemplateSpec, Secret,
    SecretEnvSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kestrel_core::{ManagedStatus, Result};
use kestrel_engine::{to_dynamic, Cx, Liveness, ObjectDependency, Phase, Pipeline};
use kestrel_index::FieldIndex;
use kestrel_kubehub::ClusterClient;
use kube::core::{ApiResource, DynamicObject, ObjectMeta};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use smallvec::smallvec;

/// Index of the output credentials secret each shipper reads.
pub const SECRET_INDEX: &str = "outputSecret";
pub const DEFAULT_PORT: i32 = 2020;
const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
const SECRET_VERSION_ANNOTATION: &str = "kestrel.io/secret-version";
const CONFIG_MOUNT: &str = "/etc/shipper";

/// A log shipper deployment: config, service and workload.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kestrel.io",
    version = "v1alpha1",
    kind = "LogShipper",
    namespaced,
    status = "ManagedStatus",
    shortname = "lship",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LogShipperSpec {
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Files rendered into the shipper's ConfigMap.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Extra labels for every child.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Secret holding output credentials, exposed as environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_secret_ref: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

kestrel_core::managed_object!(LogShipper);

#[derive(Debug, Default)]
pub struct ShipperScratch {
    /// resourceVersion of the output secret, rolled into the pod template.
    pub secret_version: Option<String>,
}

impl LogShipper {
    fn port(&self) -> i32 {
        self.spec.port.unwrap_or(DEFAULT_PORT)
    }

    fn config_name(&self) -> String {
        format!("{}-config", self.name_any())
    }

    fn selector(&self) -> BTreeMap<String, String> {
        [(INSTANCE_LABEL.to_string(), self.name_any())].into()
    }

    fn meta(&self, name: String) -> ObjectMeta {
        let mut labels = self.spec.labels.clone();
        labels.extend(self.selector());
        ObjectMeta { name: Some(name), namespace: self.namespace(), labels: Some(labels), ..Default::default() }
    }
}

pub fn index() -> FieldIndex<LogShipper> {
    FieldIndex::new().register(SECRET_INDEX, |ls: &LogShipper| {
        ls.spec.output_secret_ref.clone().map(|s| smallvec![s]).unwrap_or_default()
    })
}

pub fn config_maps(ls: &LogShipper, _: &ShipperScratch) -> anyhow::Result<Vec<DynamicObject>> {
    let cm = ConfigMap { metadata: ls.meta(ls.config_name()), data: Some(ls.spec.config.clone()), ..Default::default() };
    Ok(vec![to_dynamic(&cm)?])
}

pub fn service(ls: &LogShipper, _: &ShipperScratch) -> anyhow::Result<Vec<DynamicObject>> {
    let svc = Service {
        metadata: ls.meta(ls.name_any()),
        spec: Some(ServiceSpec {
            selector: Some(ls.selector()),
            ports: Some(vec![ServicePort { name: Some("http".into()), port: ls.port(), ..Default::default() }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(vec![to_dynamic(&svc)?])
}

pub fn deployment(ls: &LogShipper, scratch: &ShipperScratch) -> anyhow::Result<Vec<DynamicObject>> {
    anyhow::ensure!(!ls.spec.image.is_empty(), "spec.image is empty");
    anyhow::ensure!(ls.spec.replicas >= 0, "spec.replicas is negative");

    let mut template_meta = ls.meta(ls.name_any());
    template_meta.name = None;
    template_meta.namespace = None;
    if let Some(v) = &scratch.secret_version {
        template_meta.annotations = Some([(SECRET_VERSION_ANNOTATION.to_string(), v.clone())].into());
    }
    let env_from = ls.spec.output_secret_ref.as_ref().map(|name| {
        vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource { name: Some(name.clone()), optional: Some(false) }),
            ..Default::default()
        }]
    });
    let container = Container {
        name: "shipper".into(),
        image: Some(ls.spec.image.clone()),
        ports: Some(vec![ContainerPort { name: Some("http".into()), container_port: ls.port(), ..Default::default() }]),
        env_from,
        volume_mounts: Some(vec![VolumeMount { name: "config".into(), mount_path: CONFIG_MOUNT.into(), ..Default::default() }]),
        ..Default::default()
    };
    let deploy = Deployment {
        metadata: ls.meta(ls.name_any()),
        spec: Some(DeploymentSpec {
            replicas: Some(ls.spec.replicas),
            selector: LabelSelector { match_labels: Some(ls.selector()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(template_meta),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "config".into(),
                        config_map: Some(ConfigMapVolumeSource { name: Some(ls.config_name()), ..Default::default() }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(vec![to_dynamic(&deploy)?])
}

/// Live once the deployment reports every desired replica ready.
pub struct ReplicasReady;

#[async_trait]
impl Liveness<LogShipper, ShipperScratch> for ReplicasReady {
    async fn is_live(&self, cx: &Cx<'_, LogShipper>, _scratch: &ShipperScratch) -> Result<bool> {
        let ar = ApiResource::erase::<Deployment>(&());
        let Some(deploy) = cx.cluster.get(&ar, &cx.namespace(), &cx.name()).await? else {
            return Ok(false);
        };
        let ready = deploy.data.pointer("/status/readyReplicas").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(ready >= i64::from(cx.obj.spec.replicas))
    }
}

type ShipperPhase = Phase<LogShipper, ShipperScratch>;

/// ConfigMap, Service, Deployment. The output secret gates the first phase.
pub fn pipeline() -> Pipeline<LogShipper, ShipperScratch> {
    let secret = ObjectDependency::new(ApiResource::erase::<Secret>(&()), |ls: &LogShipper| ls.spec.output_secret_ref.clone())
        .on_found(|s: &mut ShipperScratch, found: &DynamicObject| s.secret_version = found.metadata.resource_version.clone());
    Pipeline::new()
        .phase(ShipperPhase::children("ConfigMap", ApiResource::erase::<ConfigMap>(&()), config_maps).depends_on(secret).build())
        .phase(
            ShipperPhase::children("Service", ApiResource::erase::<Service>(&()), service)
                .single()
                .ignore("/spec/clusterIP")
                .ignore("/spec/clusterIPs")
                .build(),
        )
        .phase(ShipperPhase::children("Deployment", ApiResource::erase::<Deployment>(&()), deployment).single().build())
        .liveness(ReplicasReady)
}

/// Child kinds the controller watches through owner references.
pub fn owned_kinds() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<ConfigMap>(&()),
        ApiResource::erase::<Service>(&()),
        ApiResource::erase::<Deployment>(&()),
    ]
}
