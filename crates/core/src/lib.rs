//! Kestrel core types: managed status, conditions, pass outcomes and errors.

#![forbid(unsafe_code)]

use std::time::Duration;

use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

mod conditions;
mod error;

pub use conditions::{Condition, ConditionStatus};
pub use error::{Error, Result};

/// Owner uid stamped on every child so list calls can select them. Names can
/// outgrow the 63-character label value limit, uids cannot.
pub const OWNER_UID_LABEL: &str = "kestrel.io/owner-uid";
/// Kind of the owner; the controller's child watches select on it.
pub const OWNER_KIND_LABEL: &str = "kestrel.io/owner-kind";
/// Standard managed-by label value for children.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "kestrel";

/// Observed state shared by every managed kind.
///
/// Kinds declare it as their CRD status type; the reconciler is the only
/// writer and goes through the status subresource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedStatus {
    /// Current pipeline position (a phase name, `Starting` or `Running`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub is_error: bool,
    /// Remote kinds only: the external object matches the desired state.
    #[serde(default)]
    pub is_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<String>,
    /// Remote kinds only: JSON of the last object pushed to the external API,
    /// handed back to its diff call as the `original` baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_configuration: Option<String>,
}

impl ManagedStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
    }

    /// Insert or replace the condition of the same type.
    ///
    /// `lastTransitionTime` only moves when the status value changes, so
    /// re-recording the same outcome keeps the original timestamp.
    /// Returns true when anything observable changed.
    pub fn set_condition(&mut self, mut cond: Condition) -> bool {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition_time = existing.last_transition_time.clone();
                }
                if *existing == cond {
                    return false;
                }
                *existing = cond;
                true
            }
            None => {
                self.conditions.push(cond);
                true
            }
        }
    }
}

/// A custom resource driven by the engine.
///
/// Implemented for CRD types whose status is `Option<ManagedStatus>`, usually
/// through [`managed_object!`].
pub trait ManagedObject:
    Resource<DynamicType = ()> + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn managed_status(&self) -> Option<&ManagedStatus>;
    fn managed_status_mut(&mut self) -> &mut ManagedStatus;

    /// True once the API server has set a deletion timestamp.
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// `namespace/name`, used as log field and backoff key.
    fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

/// Implement [`ManagedObject`] for CRD types with a `status: Option<ManagedStatus>` field.
#[macro_export]
macro_rules! managed_object {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl $crate::ManagedObject for $kind {
                fn managed_status(&self) -> Option<&$crate::ManagedStatus> {
                    self.status.as_ref()
                }
                fn managed_status_mut(&mut self) -> &mut $crate::ManagedStatus {
                    self.status.get_or_insert_with(Default::default)
                }
            }
        )+
    };
}

/// Result of one reconcile pass that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; only the periodic resync remains.
    Done,
    /// A prerequisite is missing. Not an error: fixed delay, no backoff.
    Pending { after: Duration, reason: String },
    /// Converged but not live yet; re-check after a fixed delay.
    Requeue { after: Duration },
}

impl Outcome {
    pub fn pending(after: Duration, reason: impl Into<String>) -> Self {
        Outcome::Pending { after, reason: reason.into() }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending { .. })
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Outcome::Done => None,
            Outcome::Pending { after, .. } | Outcome::Requeue { after } => Some(*after),
        }
    }
}

/// RFC3339 timestamp used for condition transitions.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
