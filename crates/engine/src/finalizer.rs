use kestrel_core::{ManagedObject, Result};
use kestrel_kubehub::ClusterClient;
use kube::core::ApiResource;
use kube::ResourceExt;
use tracing::debug;

pub fn has<K: ManagedObject>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

pub async fn add<K: ManagedObject>(cluster: &dyn ClusterClient, ar: &ApiResource, obj: &K, finalizer: &str) -> Result<()> {
    let mut list = obj.finalizers().to_vec();
    list.push(finalizer.to_string());
    debug!(key = %obj.key(), finalizer, "adding finalizer");
    let rv = obj.resource_version();
    cluster.set_finalizers(ar, &obj.namespace().unwrap_or_default(), &obj.name_any(), &list, rv.as_deref()).await
}

pub async fn remove<K: ManagedObject>(cluster: &dyn ClusterClient, ar: &ApiResource, obj: &K, finalizer: &str) -> Result<()> {
    let list: Vec<String> = obj.finalizers().iter().filter(|f| *f != finalizer).cloned().collect();
    debug!(key = %obj.key(), finalizer, "removing finalizer");
    let rv = obj.resource_version();
    cluster.set_finalizers(ar, &obj.namespace().unwrap_or_default(), &obj.name_any(), &list, rv.as_deref()).await
}
