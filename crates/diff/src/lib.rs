//! Kestrel diff engine: classify children into create/update/delete and
//! compute three-way patches against the last-applied baseline.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kestrel_core::{Error, Result};
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;

/// Baseline annotation: the normalized expected object as last applied.
pub const LAST_APPLIED_ANNOTATION: &str = "kestrel.io/last-applied-configuration";

/// Classification of one diff run. `to_update` holds current objects with the
/// patch already merged in, ready to be sent as a replace.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub need_create: bool,
    pub need_update: bool,
    pub need_delete: bool,
    pub to_create: Vec<DynamicObject>,
    pub to_update: Vec<DynamicObject>,
    pub to_delete: Vec<DynamicObject>,
    /// One human-readable line per planned call.
    pub diff: String,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        !(self.need_create || self.need_update || self.need_delete)
    }

    pub fn calls(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }

    fn note(&mut self, line: String) {
        if !self.diff.is_empty() {
            self.diff.push('\n');
        }
        self.diff.push_str(&line);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Diffs children of one owner.
#[derive(Debug, Clone)]
pub struct Differ {
    owner: OwnerReference,
    namespace: String,
    noise: Vec<String>,
}

impl Differ {
    pub fn new(owner: OwnerReference, namespace: impl Into<String>) -> Self {
        Self { owner, namespace: namespace.into(), noise: Vec::new() }
    }

    /// Differ stamping children with a controller reference to `owner`.
    pub fn for_owner<K: Resource<DynamicType = ()>>(owner: &K) -> Result<Self> {
        let oref = owner.controller_owner_ref(&()).ok_or_else(|| Error::Build {
            what: "owner reference".into(),
            message: format!("{} has no uid yet", owner.name_any()),
        })?;
        Ok(Self::new(oref, owner.namespace().unwrap_or_default()))
    }

    /// Ignore a cluster-assigned field, given as a JSON pointer (`/spec/clusterIP`).
    pub fn ignore(mut self, pointer: impl Into<String>) -> Self {
        self.noise.push(pointer.into());
        self
    }

    pub fn ignore_all<I, S>(mut self, pointers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.noise.extend(pointers.into_iter().map(Into::into));
        self
    }

    pub fn diff_single(&self, current: Option<&DynamicObject>, expected: Option<DynamicObject>) -> Result<DiffResult> {
        let mut res = DiffResult::default();
        match (current, expected) {
            (None, None) => {}
            (None, Some(exp)) => self.push_create(&mut res, exp)?,
            (Some(cur), None) => self.push_delete(&mut res, cur.clone()),
            (Some(cur), Some(exp)) => self.push_compare(&mut res, cur, exp)?,
        }
        Ok(res)
    }

    /// Match by name. Walks `expected` in declared order and takes the first
    /// unmatched current item of the same name; leftovers are deleted in
    /// their listed order.
    pub fn diff_list(&self, current: &[DynamicObject], expected: Vec<DynamicObject>) -> Result<DiffResult> {
        let mut res = DiffResult::default();
        let mut matched = vec![false; current.len()];
        for exp in expected {
            let name = exp.name_any();
            let hit = current
                .iter()
                .enumerate()
                .find(|(i, cur)| !matched[*i] && cur.name_any() == name)
                .map(|(i, _)| i);
            match hit {
                Some(i) => {
                    matched[i] = true;
                    self.push_compare(&mut res, &current[i], exp)?;
                }
                None => self.push_create(&mut res, exp)?,
            }
        }
        for (cur, _) in current.iter().zip(matched.iter()).filter(|(_, m)| !**m) {
            self.push_delete(&mut res, cur.clone());
        }
        Ok(res)
    }

    fn push_create(&self, res: &mut DiffResult, expected: DynamicObject) -> Result<()> {
        let obj = self.prepare_create(expected)?;
        res.note(format!("create {}", describe(&obj)));
        res.need_create = true;
        res.to_create.push(obj);
        Ok(())
    }

    fn push_delete(&self, res: &mut DiffResult, current: DynamicObject) {
        res.note(format!("delete {}", describe(&current)));
        res.need_delete = true;
        res.to_delete.push(current);
    }

    fn push_compare(&self, res: &mut DiffResult, current: &DynamicObject, expected: DynamicObject) -> Result<()> {
        if let Some((obj, patch, s)) = self.compare(current, expected)? {
            res.note(format!("update {} (+{} ~{} -{}): {}", describe(&obj), s.adds, s.updates, s.removes, patch));
            res.need_update = true;
            res.to_update.push(obj);
        }
        Ok(())
    }

    fn prepare_create(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some(self.namespace.clone());
        }
        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == self.owner.uid) {
            refs.push(self.owner.clone());
        }
        let baseline = self.normalize(&to_json(&obj)?);
        set_last_applied(&mut obj, &baseline)?;
        Ok(obj)
    }

    fn compare(&self, current: &DynamicObject, mut expected: DynamicObject) -> Result<Option<(DynamicObject, Json, DiffSummary)>> {
        let name = expected.name_any();
        // List items may come back with or without type metadata; take the
        // server's view so apiVersion/kind never show up as a change.
        if let Some(types) = &current.types {
            expected.types = Some(types.clone());
        }
        let modified = self.normalize(&to_json(&expected)?);
        let current_raw = to_json(current)?;
        let live = self.normalize(&current_raw);
        let original = match current.annotations().get(LAST_APPLIED_ANNOTATION) {
            Some(s) => Some(serde_json::from_str::<Json>(s).map_err(|e| Error::diff(&name, e))?),
            None => None,
        };

        let patch = three_way_patch(original.as_ref(), &modified, &live);
        if is_empty_patch(&patch) {
            debug!(name = %name, "no drift");
            return Ok(None);
        }
        let summary = summarize(&patch, &live);

        let mut merged = current_raw;
        if let Some(obj) = merged.as_object_mut() {
            obj.remove("status");
        }
        if let Some(meta) = merged.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.remove("managedFields");
        }
        merge_patch(&mut merged, &patch);
        let mut obj: DynamicObject = serde_json::from_value(merged).map_err(|e| Error::diff(&name, e))?;
        if obj.types.is_none() {
            obj.types = expected.types.clone();
        }
        set_last_applied(&mut obj, &modified)?;
        Ok(Some((obj, patch, summary)))
    }

    fn normalize(&self, v: &Json) -> Json {
        let mut v = strip_noisy(v.clone());
        for pointer in &self.noise {
            remove_pointer(&mut v, pointer);
        }
        v
    }
}

fn describe(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("object");
    format!("{}/{}", kind, obj.name_any())
}

fn to_json(obj: &DynamicObject) -> Result<Json> {
    serde_json::to_value(obj).map_err(|e| Error::diff(obj.name_any(), e))
}

fn set_last_applied(obj: &mut DynamicObject, baseline: &Json) -> Result<()> {
    let s = serde_json::to_string(baseline).map_err(|e| Error::diff(obj.name_any(), e))?;
    obj.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), s);
    Ok(())
}

/// Drop everything the server owns or that never takes part in a diff:
/// status, generated metadata, ownership, type metadata and the baseline
/// annotation itself.
fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for key in [
            "managedFields",
            "resourceVersion",
            "uid",
            "generation",
            "creationTimestamp",
            "selfLink",
            "deletionTimestamp",
            "deletionGracePeriodSeconds",
            "ownerReferences",
        ] {
            meta.remove(key);
        }
        let empty = match meta.get_mut("annotations").and_then(Json::as_object_mut) {
            Some(annos) => {
                annos.remove(LAST_APPLIED_ANNOTATION);
                annos.is_empty()
            }
            None => false,
        };
        if empty {
            meta.remove("annotations");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
        obj.remove("apiVersion");
        obj.remove("kind");
    }
    v
}

fn remove_pointer(v: &mut Json, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else { return };
    let last = last.replace("~1", "/").replace("~0", "~");
    let target = if parent.is_empty() { Some(v) } else { v.pointer_mut(parent) };
    if let Some(obj) = target.and_then(Json::as_object_mut) {
        obj.remove(&last);
    }
}

/// JSON merge patch taking `current` to `modified`.
///
/// Keys only present in `current` are server defaults and left alone unless
/// `original` (the last applied baseline) had them, in which case the user
/// dropped them and they are nulled. Arrays are replaced wholesale when the
/// desired array changed since `original` or when `current` drifted from it.
pub fn three_way_patch(original: Option<&Json>, modified: &Json, current: &Json) -> Json {
    merge_diff(original, modified, Some(current)).unwrap_or_else(|| Json::Object(Map::new()))
}

fn merge_diff(original: Option<&Json>, modified: &Json, current: Option<&Json>) -> Option<Json> {
    match (modified, current) {
        (Json::Object(m), Some(Json::Object(c))) => {
            let orig = original.and_then(Json::as_object);
            let mut out = Map::new();
            for (k, mv) in m {
                if let Some(d) = merge_diff(orig.and_then(|o| o.get(k)), mv, c.get(k)) {
                    out.insert(k.clone(), d);
                }
            }
            if let Some(o) = orig {
                for k in o.keys() {
                    if !m.contains_key(k) && c.contains_key(k) {
                        out.insert(k.clone(), Json::Null);
                    }
                }
            }
            (!out.is_empty()).then_some(Json::Object(out))
        }
        (Json::Array(m), Some(Json::Array(c))) => {
            let desired_changed = original.map(|o| o != modified).unwrap_or(false);
            (desired_changed || !is_subset_array(m, c)).then(|| modified.clone())
        }
        (Json::Null, None) => None,
        (Json::Object(m), None) if m.is_empty() => None,
        (mv, Some(cv)) if is_subset(mv, cv) => None,
        (mv, _) => Some(mv.clone()),
    }
}

/// `m` is contained in `c`, ignoring keys `c` has on top (defaults).
fn is_subset(m: &Json, c: &Json) -> bool {
    match (m, c) {
        (Json::Object(mo), Json::Object(co)) => mo.iter().all(|(k, mv)| match co.get(k) {
            Some(cv) => is_subset(mv, cv),
            None => mv.is_null() || mv.as_object().map(Map::is_empty).unwrap_or(false),
        }),
        (Json::Array(ma), Json::Array(ca)) => is_subset_array(ma, ca),
        _ => m == c,
    }
}

fn is_subset_array(m: &[Json], c: &[Json]) -> bool {
    m.len() == c.len() && m.iter().zip(c).all(|(a, b)| is_subset(a, b))
}

pub fn is_empty_patch(patch: &Json) -> bool {
    match patch {
        Json::Null => true,
        Json::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// RFC 7386 merge: objects merge recursively, `null` removes, anything else replaces.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(po) => {
            if !target.is_object() {
                *target = Json::Object(Map::new());
            }
            if let Json::Object(t) = target {
                for (k, v) in po {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Count leaf changes a merge patch makes against `base`.
pub fn summarize(patch: &Json, base: &Json) -> DiffSummary {
    fn walk(p: &Json, b: Option<&Json>, s: &mut DiffSummary) {
        match (p, b) {
            (Json::Null, _) => s.removes += 1,
            (Json::Object(po), Some(Json::Object(bo))) => {
                for (k, v) in po {
                    walk(v, bo.get(k), s);
                }
            }
            (_, None) => s.adds += 1,
            _ => s.updates += 1,
        }
    }
    let mut s = DiffSummary::default();
    if let Json::Object(po) = patch {
        for (k, v) in po {
            walk(v, base.get(k), &mut s);
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "kestrel.io/v1alpha1".into(),
            kind: "LogShipper".into(),
            name: "demo".into(),
            uid: "2b9a6bb4-0000-4000-8000-000000000001".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn differ() -> Differ {
        Differ::new(owner(), "ns")
    }

    fn cm(name: &str, data: Json) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "ns", "labels": { "app": "demo" } },
            "data": data
        }))
        .unwrap()
    }

    /// What the API server hands back after creating `obj`.
    fn served(obj: &DynamicObject, rv: &str) -> DynamicObject {
        let mut v = serde_json::to_value(obj).unwrap();
        v["metadata"]["resourceVersion"] = json!(rv);
        v["metadata"]["uid"] = json!("11111111-0000-4000-8000-000000000000");
        v["metadata"]["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
        v["metadata"]["managedFields"] = json!([{ "manager": "kestrel" }]);
        serde_json::from_value(v).unwrap()
    }

    fn names(objs: &[DynamicObject]) -> Vec<String> {
        objs.iter().map(|o| o.name_any()).collect()
    }

    #[test]
    fn strip_noisy_prunes_generated_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "uid": "abc",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "annotations": { LAST_APPLIED_ANNOTATION: "{}" }
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        for key in ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "annotations"] {
            assert!(!meta.contains_key(key), "{} kept", key);
        }
        assert!(pruned.get("status").is_none());
        assert!(pruned.get("kind").is_none());
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn create_stamps_owner_and_baseline() {
        let res = differ().diff_single(None, Some(cm("a", json!({"k": "v"})))).unwrap();
        assert!(res.need_create && !res.need_update && !res.need_delete);
        let created = &res.to_create[0];
        let refs = created.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs[0].uid, owner().uid);
        assert_eq!(refs[0].controller, Some(true));
        let baseline: Json = serde_json::from_str(&created.annotations()[LAST_APPLIED_ANNOTATION]).unwrap();
        assert_eq!(baseline["data"]["k"], "v");
        assert!(baseline["metadata"].get("ownerReferences").is_none());
        assert!(res.diff.contains("create ConfigMap/a"), "diff={}", res.diff);
    }

    #[test]
    fn delete_and_noop_single() {
        let cur = cm("a", json!({}));
        let res = differ().diff_single(Some(&cur), None).unwrap();
        assert!(res.need_delete);
        assert_eq!(names(&res.to_delete), vec!["a"]);

        let res = differ().diff_single(None, None).unwrap();
        assert!(res.is_empty());
        assert!(res.diff.is_empty());
    }

    #[test]
    fn identical_objects_do_not_diff() {
        let exp = cm("a", json!({"k": "v"}));
        let res = differ().diff_single(Some(&exp.clone()), Some(exp.clone())).unwrap();
        assert!(res.is_empty(), "diff={}", res.diff);

        let res = differ().diff_list(&[exp.clone()], vec![exp]).unwrap();
        assert!(res.is_empty(), "diff={}", res.diff);
    }

    #[test]
    fn created_then_served_object_is_converged() {
        let d = differ();
        let created = d.diff_single(None, Some(cm("a", json!({"k": "v"})))).unwrap().to_create.remove(0);
        let live = served(&created, "7");
        let res = d.diff_single(Some(&live), Some(cm("a", json!({"k": "v"})))).unwrap();
        assert!(res.is_empty(), "diff={}", res.diff);
    }

    #[test]
    fn server_defaults_and_noise_are_ignored() {
        let d = differ().ignore("/spec/clusterIP");
        let expected: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": { "name": "svc" },
            "spec": { "ports": [ { "port": 80 } ] }
        }))
        .unwrap();
        let current: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": { "name": "svc", "namespace": "ns", "resourceVersion": "3" },
            "spec": {
                "clusterIP": "10.0.0.12",
                "sessionAffinity": "None",
                "ports": [ { "port": 80, "protocol": "TCP", "targetPort": 80 } ]
            },
            "status": { "loadBalancer": {} }
        }))
        .unwrap();
        let res = d.diff_single(Some(&current), Some(expected)).unwrap();
        assert!(res.is_empty(), "diff={}", res.diff);
    }

    #[test]
    fn label_change_updates_and_keeps_resource_version() {
        let d = differ();
        let created = d.diff_single(None, Some(cm("a", json!({"k": "v"})))).unwrap().to_create.remove(0);
        let live = served(&created, "42");

        let mut desired = cm("a", json!({"k": "v"}));
        desired.labels_mut().insert("tier".into(), "gold".into());
        let res = d.diff_single(Some(&live), Some(desired)).unwrap();
        assert!(res.need_update && !res.need_create && !res.need_delete);
        let updated = &res.to_update[0];
        assert_eq!(updated.labels()["tier"], "gold");
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(updated.metadata.owner_references.as_ref().unwrap()[0].uid, owner().uid);
        assert!(updated.metadata.managed_fields.is_none());
        let baseline: Json = serde_json::from_str(&updated.annotations()[LAST_APPLIED_ANNOTATION]).unwrap();
        assert_eq!(baseline["metadata"]["labels"]["tier"], "gold");
        assert!(res.diff.contains("update ConfigMap/a (+1 ~0 -0)"), "diff={}", res.diff);
    }

    #[test]
    fn key_dropped_from_desired_state_is_removed() {
        let d = differ();
        let created = d.diff_single(None, Some(cm("a", json!({"k": "v", "old": "x"})))).unwrap().to_create.remove(0);
        let live = served(&created, "5");
        let res = d.diff_single(Some(&live), Some(cm("a", json!({"k": "v"})))).unwrap();
        assert!(res.need_update);
        let updated = &res.to_update[0];
        assert!(updated.data["data"].get("old").is_none());
        assert_eq!(updated.data["data"]["k"], "v");
    }

    #[test]
    fn type_meta_is_taken_from_current() {
        let mut current = served(&cm("a", json!({"k": "v"})), "1");
        current.types = None;
        let res = differ().diff_single(Some(&current), Some(cm("a", json!({"k": "v2"})))).unwrap();
        assert!(res.need_update);
        assert_eq!(res.to_update[0].types.as_ref().unwrap().kind, "ConfigMap");

        let res = differ().diff_single(Some(&current), Some(cm("a", json!({"k": "v"})))).unwrap();
        assert!(res.is_empty(), "diff={}", res.diff);
    }

    #[test]
    fn list_set_algebra_by_name() {
        let d = differ();
        let current = vec![cm("b", json!({"k": "1"})), cm("c", json!({}))];
        let expected = vec![cm("a", json!({})), cm("b", json!({"k": "2"}))];
        let res = d.diff_list(&current, expected).unwrap();
        assert_eq!(names(&res.to_create), vec!["a"]);
        assert_eq!(names(&res.to_update), vec!["b"]);
        assert_eq!(names(&res.to_delete), vec!["c"]);
        assert_eq!(res.calls(), 3);
    }

    #[test]
    fn list_follows_expected_order() {
        let d = differ();
        let current = vec![cm("z", json!({})), cm("y", json!({}))];
        let expected = vec![cm("c", json!({})), cm("a", json!({})), cm("b", json!({}))];
        let res = d.diff_list(&current, expected).unwrap();
        assert_eq!(names(&res.to_create), vec!["c", "a", "b"]);
        assert_eq!(names(&res.to_delete), vec!["z", "y"]);
        let lines: Vec<_> = res.diff.lines().collect();
        assert_eq!(lines[0], "create ConfigMap/c");
        assert_eq!(lines[4], "delete ConfigMap/y");
    }

    #[test]
    fn corrupt_baseline_is_a_diff_error() {
        let mut current = cm("a", json!({}));
        current.annotations_mut().insert(LAST_APPLIED_ANNOTATION.into(), "{not json".into());
        let err = differ().diff_single(Some(&current), Some(cm("a", json!({})))).unwrap_err();
        assert!(matches!(err, Error::Diff { .. }), "err={}", err);
    }

    #[test]
    fn three_way_patch_shapes() {
        let original = json!({ "a": 1, "list": [1, 2], "gone": true });
        let modified = json!({ "a": 2, "list": [1, 2, 3], "new": { "x": 1 } });
        let current = json!({ "a": 1, "list": [1, 2], "gone": true, "defaulted": "yes" });
        let patch = three_way_patch(Some(&original), &modified, &current);
        assert_eq!(patch, json!({ "a": 2, "list": [1, 2, 3], "new": { "x": 1 }, "gone": null }));

        let s = summarize(&patch, &current);
        assert_eq!(s, DiffSummary { adds: 1, updates: 2, removes: 1 });
    }

    #[test]
    fn merge_patch_applies_nulls_and_nesting() {
        let mut target = json!({ "a": { "b": 1, "c": 2 }, "d": [1] });
        merge_patch(&mut target, &json!({ "a": { "b": null, "e": 3 }, "d": [2, 3] }));
        assert_eq!(target, json!({ "a": { "c": 2, "e": 3 }, "d": [2, 3] }));
    }
}
