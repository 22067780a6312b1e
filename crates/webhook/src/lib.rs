//! Kestrel admission validators.
//!
//! Validators are plain synchronous checks over decoded objects; [`review`]
//! adapts them to `AdmissionRequest`/`AdmissionResponse`. Serving HTTPS is
//! left to the embedding binary.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kestrel_index::{FieldIndex, ObjectKey};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::Resource;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} {value:?} is already used by {owner}")]
    Duplicate { field: String, value: String, owner: String },
    #[error("{field} is immutable")]
    Immutable { field: String },
    #[error("invalid {operation} request: {message}")]
    Malformed { operation: String, message: String },
}

pub type Verdict = Result<(), ValidationError>;

pub trait Validator<K>: Send + Sync {
    fn validate_create(&self, _obj: &K) -> Verdict {
        Ok(())
    }

    fn validate_update(&self, _old: &K, _new: &K) -> Verdict {
        Ok(())
    }

    fn validate_delete(&self, _obj: &K) -> Verdict {
        Ok(())
    }
}

/// Rejects objects whose indexed value is already taken by another object.
pub struct UniqueFieldValidator<K> {
    index: Arc<FieldIndex<K>>,
    index_name: String,
    field: String,
    per_namespace: bool,
}

impl<K: Resource> UniqueFieldValidator<K> {
    /// `field` is only used in the rejection message.
    pub fn new(index: Arc<FieldIndex<K>>, index_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self { index, index_name: index_name.into(), field: field.into(), per_namespace: true }
    }

    /// Enforce uniqueness across namespaces.
    pub fn cluster_wide(mut self) -> Self {
        self.per_namespace = false;
        self
    }

    fn check(&self, obj: &K) -> Verdict {
        let me = ObjectKey::of(obj);
        for value in self.index.extract(&self.index_name, obj) {
            let holders = if self.per_namespace {
                self.index.referencing(&self.index_name, &me.namespace, &value)
            } else {
                self.index.lookup(&self.index_name, &value)
            };
            if let Some(owner) = holders.into_iter().find(|k| *k != me) {
                return Err(ValidationError::Duplicate { field: self.field.clone(), value, owner: owner.to_string() });
            }
        }
        Ok(())
    }
}

impl<K: Resource> Validator<K> for UniqueFieldValidator<K> {
    fn validate_create(&self, obj: &K) -> Verdict {
        self.check(obj)
    }

    fn validate_update(&self, _old: &K, new: &K) -> Verdict {
        self.check(new)
    }
}

/// Rejects updates that change any of the given JSON pointers.
#[derive(Debug, Clone, Default)]
pub struct ImmutableFieldValidator {
    pointers: Vec<String>,
}

impl ImmutableFieldValidator {
    pub fn new<I, S>(pointers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { pointers: pointers.into_iter().map(Into::into).collect() }
    }
}

fn to_json<K: Serialize>(obj: &K, operation: &str) -> Result<Json, ValidationError> {
    serde_json::to_value(obj).map_err(|e| ValidationError::Malformed { operation: operation.into(), message: e.to_string() })
}

impl<K: Serialize> Validator<K> for ImmutableFieldValidator {
    fn validate_update(&self, old: &K, new: &K) -> Verdict {
        let old = to_json(old, "update")?;
        let new = to_json(new, "update")?;
        for p in &self.pointers {
            if old.pointer(p) != new.pointer(p) {
                return Err(ValidationError::Immutable { field: p.trim_start_matches('/').replace('/', ".") });
            }
        }
        Ok(())
    }
}

/// Runs validators in order; the first rejection wins.
pub struct ValidationChain<K> {
    validators: Vec<Box<dyn Validator<K>>>,
}

impl<K> Default for ValidationChain<K> {
    fn default() -> Self {
        Self { validators: Vec::new() }
    }
}

impl<K> ValidationChain<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, v: impl Validator<K> + 'static) -> Self {
        self.validators.push(Box::new(v));
        self
    }
}

impl<K> Validator<K> for ValidationChain<K> {
    fn validate_create(&self, obj: &K) -> Verdict {
        self.validators.iter().try_for_each(|v| v.validate_create(obj))
    }

    fn validate_update(&self, old: &K, new: &K) -> Verdict {
        self.validators.iter().try_for_each(|v| v.validate_update(old, new))
    }

    fn validate_delete(&self, obj: &K) -> Verdict {
        self.validators.iter().try_for_each(|v| v.validate_delete(obj))
    }
}

/// Answer an admission request with the validator's verdict.
pub fn review<K: Resource>(req: &AdmissionRequest<K>, validator: &dyn Validator<K>) -> AdmissionResponse {
    let verdict = match (&req.operation, &req.object, &req.old_object) {
        (Operation::Create, Some(obj), _) => validator.validate_create(obj),
        (Operation::Update, Some(new), Some(old)) => validator.validate_update(old, new),
        (Operation::Delete, _, Some(old)) => validator.validate_delete(old),
        (Operation::Connect, _, _) => Ok(()),
        (op, _, _) => Err(ValidationError::Malformed {
            operation: format!("{:?}", op).to_lowercase(),
            message: "object missing".into(),
        }),
    };
    let res = AdmissionResponse::from(req);
    match verdict {
        Ok(()) => res,
        Err(e) => {
            info!(name = %req.name, ns = ?req.namespace, reason = %e, "admission denied");
            res.deny(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::admission::AdmissionReview;
    use kube::core::ObjectMeta;
    use kube::ResourceExt;
    use serde_json::json;
    use smallvec::smallvec;

    fn cm(ns: &str, name: &str, target: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
            data: Some([("target".to_string(), target.to_string())].into()),
            ..Default::default()
        }
    }

    fn index() -> Arc<FieldIndex<ConfigMap>> {
        Arc::new(FieldIndex::new().register("target", |o: &ConfigMap| {
            o.data.as_ref().and_then(|d| d.get("target")).map(|t| smallvec![t.clone()]).unwrap_or_default()
        }))
    }

    #[test]
    fn unique_rejects_taken_value_but_not_self() {
        let idx = index();
        idx.upsert(&cm("ns", "a", "role-x"));
        let v = UniqueFieldValidator::new(idx.clone(), "target", "spec.name");

        let err = v.validate_create(&cm("ns", "b", "role-x")).unwrap_err();
        assert_eq!(err, ValidationError::Duplicate { field: "spec.name".into(), value: "role-x".into(), owner: "ns/a".into() });
        // updating the holder itself is fine
        assert!(v.validate_update(&cm("ns", "a", "role-x"), &cm("ns", "a", "role-x")).is_ok());
        // other namespaces are independent unless cluster wide
        assert!(v.validate_create(&cm("other", "c", "role-x")).is_ok());
        let wide = UniqueFieldValidator::new(idx, "target", "spec.name").cluster_wide();
        assert!(wide.validate_create(&cm("other", "c", "role-x")).is_err());
    }

    #[test]
    fn immutable_fields_cannot_change() {
        let v = ImmutableFieldValidator::new(["/data/target"]);
        let err = Validator::<ConfigMap>::validate_update(&v, &cm("ns", "a", "x"), &cm("ns", "a", "y")).unwrap_err();
        assert_eq!(err.to_string(), "data.target is immutable");
        assert!(Validator::<ConfigMap>::validate_update(&v, &cm("ns", "a", "x"), &cm("ns", "a", "x")).is_ok());
    }

    #[test]
    fn chain_stops_at_first_rejection() {
        let idx = index();
        idx.upsert(&cm("ns", "a", "role-x"));
        let chain = ValidationChain::new()
            .with(ImmutableFieldValidator::new(["/data/target"]))
            .with(UniqueFieldValidator::new(idx, "target", "spec.name"));
        let err = chain.validate_update(&cm("ns", "b", "role-y"), &cm("ns", "b", "role-x")).unwrap_err();
        assert!(matches!(err, ValidationError::Immutable { .. }));
        assert!(chain.validate_delete(&cm("ns", "a", "role-x")).is_ok());
    }

    fn request(operation: &str, object: Option<&ConfigMap>, old: Option<&ConfigMap>) -> AdmissionRequest<ConfigMap> {
        let review: AdmissionReview<ConfigMap> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "", "version": "v1", "kind": "ConfigMap" },
                "resource": { "group": "", "version": "v1", "resource": "configmaps" },
                "name": object.or(old).map(|o| o.name_any()).unwrap_or_default(),
                "namespace": "ns",
                "operation": operation,
                "userInfo": { "username": "admin" },
                "object": object,
                "oldObject": old,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn review_maps_verdicts_to_responses() {
        let idx = index();
        idx.upsert(&cm("ns", "a", "role-x"));
        let v = UniqueFieldValidator::new(idx, "target", "spec.name");

        let dup = cm("ns", "b", "role-x");
        let res = review(&request("CREATE", Some(&dup), None), &v);
        assert!(!res.allowed);
        assert!(res.result.message.contains("already used by ns/a"), "{}", res.result.message);

        let fresh = cm("ns", "c", "role-z");
        assert!(review(&request("CREATE", Some(&fresh), None), &v).allowed);
        assert!(review(&request("DELETE", None, Some(&fresh)), &v).allowed);
        assert!(!review(&request("UPDATE", Some(&fresh), None), &v).allowed);
    }
}
