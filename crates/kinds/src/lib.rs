//! Kinds managed by Kestrel.
//!
//! [`LogShipper`] converges cluster-native children (ConfigMap, Service,
//! Deployment). [`RemoteRole`] keeps one entity on an external API in sync.

#![forbid(unsafe_code)]

pub mod logshipper;
pub mod remoterole;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use logshipper::{LogShipper, LogShipperSpec, ShipperScratch};
pub use remoterole::{ClientFactory, Endpoint, EndpointResolver, RemoteRole, RemoteRoleSpec, RoleBody};

/// CRDs of every managed kind, for installation.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![LogShipper::crd(), RemoteRole::crd()]
}
