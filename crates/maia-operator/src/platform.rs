//! Thin helpers over the Kubernetes API shared by both controllers.

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

pub const FIELD_MANAGER: &str = "maia-operator";

/// What [`create_or_update`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

/// Namespaced handle when a watch namespace is configured, cluster-wide otherwise.
pub fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Server-side apply owned by [`FIELD_MANAGER`].
pub async fn apply<K>(api: &Api<K>, name: &str, obj: &K) -> Result<K, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &params, &Patch::Apply(obj)).await
}

/// Fetches `name` (or starts from an empty object), runs `mutate`, and writes
/// the result back only if something changed.
///
/// `mutate` can tell a fresh object by `metadata.creation_timestamp` being
/// unset, which is how immutable fields get written once. Updates go through
/// `replace` with the fetched resourceVersion, so a concurrent writer turns
/// into a 409.
pub async fn create_or_update<K, F>(
    api: &Api<K>,
    name: &str,
    mutate: F,
) -> Result<(K, Outcome), kube::Error>
where
    K: Resource + Clone + Default + PartialEq + DeserializeOwned + Serialize + Debug,
    F: FnOnce(&mut K),
{
    let params = PostParams {
        field_manager: Some(FIELD_MANAGER.into()),
        ..Default::default()
    };
    match api.get_opt(name).await? {
        Some(current) => {
            let mut desired = current.clone();
            mutate(&mut desired);
            if desired == current {
                return Ok((current, Outcome::Unchanged));
            }
            let updated = api.replace(name, &params, &desired).await?;
            Ok((updated, Outcome::Updated))
        }
        None => {
            let mut obj = K::default();
            obj.meta_mut().name = Some(name.to_string());
            mutate(&mut obj);
            let created = api.create(&params, &obj).await?;
            Ok((created, Outcome::Created))
        }
    }
}

/// Returns `true` when the finalizer had to be added.
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    patch_finalizers(api, obj, finalizers).await?;
    Ok(true)
}

pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    match patch_finalizers(api, obj, finalizers).await {
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        other => other,
    }
}

async fn patch_finalizers<K>(
    api: &Api<K>,
    obj: &K,
    finalizers: Vec<String>,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    // resourceVersion makes the merge patch conditional on what we read.
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    let _ = api
        .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge-patches the status subresource.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<K, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let params = PatchParams {
        field_manager: Some(FIELD_MANAGER.into()),
        ..Default::default()
    };
    api.patch_status(name, &params, &Patch::Merge(json!({ "status": status })))
        .await
}

/// Deletes `name`, treating a missing object as success.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            debug!(name, "deleted");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Controller owner reference pointing at `owner`.
pub fn owner_references<K>(owner: &K) -> Option<Vec<OwnerReference>>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).map(|o| vec![o])
}

/// Publishes an event about `obj`. Failures are logged, never returned.
pub async fn publish<K>(
    recorder: &Recorder,
    obj: &K,
    type_: EventType,
    reason: &str,
    note: impl Into<String>,
) where
    K: Resource<DynamicType = ()>,
{
    let event = Event {
        type_,
        reason: reason.into(),
        note: Some(note.into()),
        action: "Reconcile".into(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &obj.object_ref(&())).await {
        warn!(error = ?e, reason, "failed to publish event");
    }
}
