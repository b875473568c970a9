use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use time::OffsetDateTime;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::crds::common::{Condition, remove_condition, set_condition};
use crate::crds::instance::{InstancePhase, MaiaInstance, MaiaInstanceStatus};
use crate::crds::tenant::MaiaTenant;
use crate::error::ReconcileError;
use crate::instance_resources as res;
use crate::platform::{
    FIELD_MANAGER, add_finalizer, apply, create_or_update, delete_if_exists, patch_status,
    publish, remove_finalizer, scoped_api,
};

pub const FINALIZER: &str = "maia.cuemby.com/finalizer";
const REQUEUE: Duration = Duration::from_secs(30);

pub struct Ctx {
    pub client: Client,
    pub recorder: Recorder,
    /// `None` when watching the whole cluster.
    pub watch_namespace: Option<String>,
}

pub fn controller(client: Client, watch_namespace: Option<&str>) -> Controller<MaiaInstance> {
    let wc = watcher::Config::default();
    Controller::new(scoped_api::<MaiaInstance>(&client, watch_namespace), wc.clone())
        .owns(scoped_api::<Deployment>(&client, watch_namespace), wc.clone())
        .owns(scoped_api::<Service>(&client, watch_namespace), wc.clone())
        .owns(scoped_api::<ConfigMap>(&client, watch_namespace), wc.clone())
        .owns(scoped_api::<PersistentVolumeClaim>(&client, watch_namespace), wc.clone())
        .owns(scoped_api::<Ingress>(&client, watch_namespace), wc.clone())
        .owns(scoped_api::<CronJob>(&client, watch_namespace), wc)
        .shutdown_on_signal()
}

#[instrument(skip_all, fields(kind = "MaiaInstance", namespace = ?inst.namespace(), name = %inst.name_any()))]
pub async fn reconcile(inst: Arc<MaiaInstance>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let ns = inst
        .namespace()
        .ok_or(ReconcileError::MissingField("metadata.namespace"))?;
    let name = inst.name_any();
    let api: Api<MaiaInstance> = Api::namespaced(ctx.client.clone(), &ns);

    if inst.metadata.deletion_timestamp.is_some() {
        if inst.finalizers().iter().any(|f| f == FINALIZER) {
            // Children carry owner references; the garbage collector removes them.
            publish(
                &ctx.recorder,
                &*inst,
                EventType::Normal,
                "Finalizing",
                "Releasing instance; owned objects are garbage collected",
            )
            .await;
            remove_finalizer(&api, &*inst, FINALIZER).await?;
            info!("finalizer removed");
        }
        return Ok(Action::await_change());
    }

    if add_finalizer(&api, &*inst, FINALIZER).await? {
        return Ok(Action::await_change());
    }

    let now = OffsetDateTime::now_utc();
    let generation = inst.metadata.generation;
    let mut status = inst.status.clone().unwrap_or_default();
    if status.phase.is_none() {
        status.phase = Some(InstancePhase::Pending);
        patch_status(&api, &name, &status).await?;
    }

    let children = match ensure_children(&ctx.client, &inst, &ns).await {
        Ok(c) => c,
        Err(err) => {
            if let ReconcileError::Step { reason, source } = &err {
                set_condition(
                    &mut status.conditions,
                    Condition::new("Degraded", true, *reason, source.to_string())
                        .observed(generation),
                    now,
                );
                if let Err(e) = patch_status(&api, &name, &status).await {
                    warn!(error = ?e, "failed to record Degraded condition");
                }
            }
            return Err(err);
        }
    };

    remove_condition(&mut status.conditions, "Degraded");
    apply_workload_status(&mut status, &children.deployment, generation, now);
    status.endpoint = Some(res::endpoint(&name, &ns));
    status.version = Some(inst.spec.image.tag.clone()).filter(|t| !t.is_empty());
    status.last_backup = children.cron_job.as_ref().and_then(last_successful_backup);
    status.observed_generation = generation;

    let tenants = tenants_of(&ctx, &name, &ns).await?;
    apply_tenant_totals(&mut status, &tenants);

    if inst.status.as_ref() != Some(&status) {
        patch_status(&api, &name, &status).await?;
        debug!(phase = ?status.phase, "status updated");
    }
    Ok(Action::requeue(REQUEUE))
}

pub fn error_policy(_inst: Arc<MaiaInstance>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    error!(error = ?err, "reconcile failed");
    if err.is_transient() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(REQUEUE)
    }
}

struct Children {
    deployment: Deployment,
    cron_job: Option<CronJob>,
}

/// Writes every child in dependency order. Failures are tagged with the
/// reason that ends up on the Degraded condition.
async fn ensure_children(
    client: &Client,
    inst: &MaiaInstance,
    ns: &str,
) -> Result<Children, ReconcileError> {
    let name = inst.name_any();
    let spec = &inst.spec;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
    apply(&config_maps, &res::config_map_name(&name), &res::config_map(inst))
        .await
        .map_err(|e| ReconcileError::step("ConfigMapFailed", e))?;

    let claims: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), ns);
    create_or_update(&claims, &res::data_claim_name(&name), |pvc| {
        res::mutate_data_claim(pvc, inst)
    })
    .await
    .map_err(|e| ReconcileError::step("PVCFailed", e))?;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), ns);
    let deployment = apply(&deployments, &name, &res::deployment(inst))
        .await
        .map_err(|e| ReconcileError::step("DeploymentFailed", e))?;

    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    apply(&services, &name, &res::service(inst))
        .await
        .map_err(|e| ReconcileError::step("ServiceFailed", e))?;
    create_or_update(&services, &res::headless_service_name(&name), |svc| {
        res::mutate_headless_service(svc, inst)
    })
    .await
    .map_err(|e| ReconcileError::step("ServiceFailed", e))?;

    let ingresses: Api<Ingress> = Api::namespaced(client.clone(), ns);
    if spec.ingress.enabled {
        apply(&ingresses, &name, &res::ingress(inst)).await
    } else {
        delete_if_exists(&ingresses, &name).await.map(|_| Ingress::default())
    }
    .map_err(|e| ReconcileError::step("IngressFailed", e))?;

    let monitors = service_monitor_api(client, ns);
    if spec.metrics.enabled && spec.metrics.service_monitor.enabled {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        monitors
            .patch(&name, &params, &Patch::Apply(&res::service_monitor(inst)))
            .await
            .map(|_| ())
    } else {
        delete_if_exists(&monitors, &name).await
    }
    .map_err(|e| ReconcileError::step("ServiceMonitorFailed", e))?;

    let cron_jobs: Api<CronJob> = Api::namespaced(client.clone(), ns);
    let cron_job = if spec.backup.enabled {
        create_or_update(&claims, &res::backup_claim_name(&name), |pvc| {
            res::mutate_backup_claim(pvc, inst)
        })
        .await
        .map_err(|e| ReconcileError::step("BackupPVCFailed", e))?;
        let cj = apply(&cron_jobs, &res::backup_job_name(&name), &res::backup_cron_job(inst))
            .await
            .map_err(|e| ReconcileError::step("BackupCronJobFailed", e))?;
        Some(cj)
    } else {
        // The backup claim is kept so existing archives survive.
        delete_if_exists(&cron_jobs, &res::backup_job_name(&name))
            .await
            .map_err(|e| ReconcileError::step("BackupCronJobFailed", e))?;
        None
    };

    Ok(Children {
        deployment,
        cron_job,
    })
}

fn service_monitor_api(client: &Client, ns: &str) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor");
    Api::namespaced_with(client.clone(), ns, &ApiResource::from_gvk(&gvk))
}

/// Tenants whose `instanceRef` resolves to `name` in `ns`.
async fn tenants_of(ctx: &Ctx, name: &str, ns: &str) -> Result<Vec<MaiaTenant>, ReconcileError> {
    let api = scoped_api::<MaiaTenant>(&ctx.client, ctx.watch_namespace.as_deref());
    let list = api.list(&ListParams::default()).await?;
    Ok(list
        .items
        .into_iter()
        .filter(|t| t.spec.instance_ref.name == name && t.instance_namespace() == ns)
        .collect())
}

/// Tenant count plus memory and storage totals. Storage is a byte quantity.
pub fn apply_tenant_totals(status: &mut MaiaInstanceStatus, tenants: &[MaiaTenant]) {
    let observed = || tenants.iter().filter_map(|t| t.status.as_ref());
    status.tenant_count = tenants.len() as i32;
    status.total_memories = observed().map(|s| s.memory_count).sum();
    let bytes: i64 = observed().map(|s| s.storage_used).sum();
    status.storage_used = Some(bytes.to_string());
}

fn last_successful_backup(cj: &CronJob) -> Option<String> {
    let t = cj.status.as_ref()?.last_successful_time.as_ref()?;
    serde_json::to_value(t).ok()?.as_str().map(str::to_string)
}

/// Phase from the Deployment's observed vs. ready replicas.
pub fn workload_phase(replicas: i32, ready: i32) -> InstancePhase {
    if ready >= 1 && ready == replicas {
        InstancePhase::Running
    } else if ready < replicas {
        InstancePhase::Updating
    } else {
        InstancePhase::Pending
    }
}

/// Copies replica counts off the Deployment and sets phase plus the
/// Ready/Progressing conditions.
pub fn apply_workload_status(
    status: &mut MaiaInstanceStatus,
    deployment: &Deployment,
    generation: Option<i64>,
    now: OffsetDateTime,
) {
    let ds = deployment.status.clone().unwrap_or_default();
    let replicas = ds.replicas.unwrap_or(0);
    let ready = ds.ready_replicas.unwrap_or(0);
    status.replicas = replicas;
    status.ready_replicas = ready;

    let phase = workload_phase(replicas, ready);
    status.phase = Some(phase);
    let summary = format!("{ready}/{replicas} replicas ready");
    match phase {
        InstancePhase::Running => {
            set_condition(
                &mut status.conditions,
                Condition::new("Ready", true, "DeploymentReady", summary).observed(generation),
                now,
            );
            remove_condition(&mut status.conditions, "Progressing");
        }
        InstancePhase::Updating => {
            set_condition(
                &mut status.conditions,
                Condition::new("Progressing", true, "DeploymentProgressing", summary.clone())
                    .observed(generation),
                now,
            );
            set_condition(
                &mut status.conditions,
                Condition::new("Ready", false, "DeploymentNotReady", summary).observed(generation),
                now,
            );
        }
        _ => {
            set_condition(
                &mut status.conditions,
                Condition::new("Ready", false, "DeploymentNotReady", summary).observed(generation),
                now,
            );
        }
    }
}
