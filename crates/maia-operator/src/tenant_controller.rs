use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use time::OffsetDateTime;
use tokio::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::admin::{AdminClient, TenantAdmin};
use crate::crds::common::{Condition, set_condition};
use crate::crds::instance::MaiaInstance;
use crate::crds::tenant::{MaiaTenant, MaiaTenantStatus, TenantApiKey, TenantPhase};
use crate::error::ReconcileError;
use crate::platform::{
    add_finalizer, create_or_update, owner_references, patch_status, publish, remove_finalizer,
    scoped_api,
};
use crate::tenant_sync::{KeySink, sync_tenant};

pub const FINALIZER: &str = "maia.cuemby.com/tenant-finalizer";
const RETRY: Duration = Duration::from_secs(30);
const RESYNC: Duration = Duration::from_secs(60);

pub struct Ctx {
    pub client: Client,
    pub recorder: Recorder,
    pub admin_timeout: Duration,
}

pub fn controller(client: Client, watch_namespace: Option<&str>) -> Controller<MaiaTenant> {
    let wc = watcher::Config::default();
    let controller = Controller::new(scoped_api::<MaiaTenant>(&client, watch_namespace), wc.clone());
    let tenants = controller.store();
    controller
        .owns(scoped_api::<Secret>(&client, watch_namespace), wc.clone())
        .watches(
            scoped_api::<MaiaInstance>(&client, watch_namespace),
            wc,
            move |inst| tenants_referencing(&tenants, &inst),
        )
        .shutdown_on_signal()
}

/// Tenants to wake up when `inst` changes.
fn tenants_referencing(tenants: &Store<MaiaTenant>, inst: &MaiaInstance) -> Vec<ObjectRef<MaiaTenant>> {
    let name = inst.name_any();
    let ns = inst.namespace().unwrap_or_default();
    tenants
        .state()
        .into_iter()
        .filter(|t| t.spec.instance_ref.name == name && t.instance_namespace() == ns)
        .map(|t| ObjectRef::from_obj(&*t))
        .collect()
}

#[instrument(skip_all, fields(kind = "MaiaTenant", namespace = ?tenant.namespace(), name = %tenant.name_any()))]
pub async fn reconcile(tenant: Arc<MaiaTenant>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let ns = tenant
        .namespace()
        .ok_or(ReconcileError::MissingField("metadata.namespace"))?;
    let name = tenant.name_any();
    let api: Api<MaiaTenant> = Api::namespaced(ctx.client.clone(), &ns);
    let now = OffsetDateTime::now_utc();

    let instances: Api<MaiaInstance> =
        Api::namespaced(ctx.client.clone(), &tenant.instance_namespace());
    let instance = instances.get_opt(&tenant.spec.instance_ref.name).await?;

    if tenant.metadata.deletion_timestamp.is_some() {
        if tenant.finalizers().iter().any(|f| f == FINALIZER) {
            finalize(&ctx, &tenant, instance.as_ref()).await;
            remove_finalizer(&api, &*tenant, FINALIZER).await?;
        }
        return Ok(Action::await_change());
    }

    let Some(instance) = instance else {
        let msg = format!(
            "MaiaInstance {}/{} not found",
            tenant.instance_namespace(),
            tenant.spec.instance_ref.name
        );
        return not_ready(&api, &tenant, "InstanceNotFound", msg, now).await;
    };
    if !instance.is_running() {
        return not_ready(
            &api,
            &tenant,
            "InstanceNotReady",
            "MaiaInstance is not in Running phase".to_string(),
            now,
        )
        .await;
    }
    let admin = match admin_client(&ctx, &instance).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build admin client");
            return not_ready(&api, &tenant, "ClientError", e.to_string(), now).await;
        }
    };

    if add_finalizer(&api, &*tenant, FINALIZER).await? {
        return Ok(Action::await_change());
    }

    let mut status = tenant.status.clone().unwrap_or_default();
    if status.phase.is_none() {
        status.phase = Some(TenantPhase::Pending);
        patch_status(&api, &name, &status).await?;
    }

    let sink = SecretKeySink {
        api: Api::namespaced(ctx.client.clone(), &ns),
        owner: owner_references(&*tenant).and_then(|mut o| o.pop()),
    };
    let report = sync_tenant(&admin, &sink, &tenant, &mut status, now).await;
    for ev in &report.events {
        publish(&ctx.recorder, &*tenant, ev.event_type(), ev.reason(), ev.note()).await;
    }
    if tenant.status.as_ref() != Some(&status) {
        patch_status(&api, &name, &status).await?;
    }

    match report.error {
        None => Ok(Action::requeue(RESYNC)),
        Some(ReconcileError::Step { reason, source })
            if matches!(reason, "SyncFailed" | "SuspendFailed" | "ActivateFailed") =>
        {
            warn!(reason, error = %source, "tenant pass incomplete, retrying");
            Ok(Action::requeue(RETRY))
        }
        Some(err) => Err(err),
    }
}

pub fn error_policy(_tenant: Arc<MaiaTenant>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    error!(error = ?err, "reconcile failed");
    if err.is_transient() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(RETRY)
    }
}

/// Records `Ready=False` and retries later. Not an error: the tenant is
/// waiting on its instance.
async fn not_ready(
    api: &Api<MaiaTenant>,
    tenant: &MaiaTenant,
    reason: &str,
    message: String,
    now: OffsetDateTime,
) -> Result<Action, ReconcileError> {
    info!(reason, %message, "tenant not ready");
    let mut status: MaiaTenantStatus = tenant.status.clone().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        Condition::new("Ready", false, reason, message).observed(tenant.metadata.generation),
        now,
    );
    if tenant.status.as_ref() != Some(&status) {
        patch_status(api, &tenant.name_any(), &status).await?;
    }
    Ok(Action::requeue(RETRY))
}

/// Best-effort removal of the remote tenant. The server is authoritative for
/// its own state, so failures are logged and the finalizer still goes.
async fn finalize(ctx: &Ctx, tenant: &MaiaTenant, instance: Option<&MaiaInstance>) {
    let Some(id) = tenant.tenant_id() else {
        return;
    };
    info!(tenant_id = id, "finalizing tenant");
    match instance {
        Some(inst) => match admin_client(ctx, inst).await {
            Ok(admin) => {
                if let Err(e) = admin.delete_tenant(id).await {
                    warn!(tenant_id = id, error = %e, "failed to delete tenant from MAIA");
                }
            }
            Err(e) => warn!(error = %e, "no admin client, leaving remote tenant"),
        },
        None => warn!(tenant_id = id, "instance gone, leaving remote tenant"),
    }
    publish(
        &ctx.recorder,
        tenant,
        EventType::Normal,
        "Deleted",
        "Tenant deleted from MAIA",
    )
    .await;
}

/// Admin client for `inst`, authenticated with the instance's API key
/// secret when one is configured.
async fn admin_client(ctx: &Ctx, inst: &MaiaInstance) -> Result<AdminClient, ReconcileError> {
    let endpoint = inst
        .endpoint()
        .ok_or(ReconcileError::MissingField("status.endpoint"))?;
    let mut builder = AdminClient::builder(endpoint).timeout(ctx.admin_timeout);

    if let Some(sel) = &inst.spec.security.api_key_secret_ref {
        let ns = inst
            .namespace()
            .ok_or(ReconcileError::MissingField("metadata.namespace"))?;
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
        let secret = secrets.get(&sel.name).await?;
        if let Some(bytes) = secret
            .data
            .as_ref()
            .and_then(|d| d.get(sel.key_or("api-key")))
        {
            builder = builder.api_key(String::from_utf8(bytes.0.clone())?);
        }
    }
    Ok(builder.build()?)
}

/// Writes raw keys into the Secret named by each key's `secretRef`,
/// controlled by the tenant.
struct SecretKeySink {
    api: Api<Secret>,
    owner: Option<OwnerReference>,
}

impl KeySink for SecretKeySink {
    async fn store_key(&self, key: &TenantApiKey, raw: &str) -> Result<(), ReconcileError> {
        let field = key.secret_ref.key_name().to_string();
        create_or_update(&self.api, &key.secret_ref.name, |secret: &mut Secret| {
            secret
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert(field, ByteString(raw.as_bytes().to_vec()));
            if let Some(owner) = &self.owner {
                let refs = secret.metadata.owner_references.get_or_insert_with(Vec::new);
                if !refs.iter().any(|r| r.uid == owner.uid) {
                    refs.push(owner.clone());
                }
            }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::instance::MaiaInstanceSpec;
    use crate::crds::tenant::MaiaTenantSpec;
    use kube::runtime::reflector;
    use kube::runtime::watcher::Event;

    fn tenant(name: &str, ns: &str, instance: &str, instance_ns: Option<&str>) -> MaiaTenant {
        let mut t = MaiaTenant::new(name, MaiaTenantSpec::default());
        t.metadata.namespace = Some(ns.into());
        t.spec.instance_ref.name = instance.into();
        t.spec.instance_ref.namespace = instance_ns.map(str::to_string);
        t
    }

    #[test]
    fn instance_changes_wake_referencing_tenants() {
        let (reader, mut writer) = reflector::store::<MaiaTenant>();
        for t in [
            tenant("a", "apps", "inst", None),
            tenant("b", "other", "inst", Some("apps")),
            tenant("c", "other", "inst", None),
            tenant("d", "apps", "second", None),
        ] {
            writer.apply_watcher_event(&Event::Apply(t));
        }

        let mut inst = MaiaInstance::new("inst", MaiaInstanceSpec::default());
        inst.metadata.namespace = Some("apps".into());
        let mut woken: Vec<String> = tenants_referencing(&reader, &inst)
            .into_iter()
            .map(|r| r.name)
            .collect();
        woken.sort();
        assert_eq!(woken, vec!["a", "b"]);
    }
}
