//! Desired child objects for a [`MaiaInstance`]. Pure functions; the
//! controller decides how each one is written.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    HTTPGetAction, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use serde_json::json;

use crate::crds::common::SecretKeySelector as SecretRef;
use crate::crds::instance::{EmbeddingModel, MaiaInstance, MaiaInstanceSpec, non_empty};
use crate::platform::owner_references;

pub const HTTP_PORT: i32 = 8080;
pub const GRPC_PORT: i32 = 9090;
pub const CONFIG_KEY: &str = "config.yaml";
const CONFIG_MOUNT: &str = "/config";
const BACKUP_MOUNT: &str = "/backup";
const RUN_AS: i64 = 1000;

pub fn config_map_name(name: &str) -> String {
    format!("{name}-config")
}

pub fn data_claim_name(name: &str) -> String {
    format!("{name}-data")
}

pub fn headless_service_name(name: &str) -> String {
    format!("{name}-headless")
}

pub fn backup_claim_name(name: &str) -> String {
    format!("{name}-backup")
}

pub fn backup_job_name(name: &str) -> String {
    format!("{name}-backup")
}

pub fn endpoint(name: &str, namespace: &str) -> String {
    format!("http://{name}.{namespace}.svc:{HTTP_PORT}")
}

/// Pod labels; also the selector for the Deployment and both Services.
pub fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "maia".to_string()),
        ("app.kubernetes.io/instance".to_string(), name.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "maia-operator".to_string(),
        ),
    ])
}

/// The subset used to select scrape targets.
fn monitor_selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "maia".to_string()),
        ("app.kubernetes.io/instance".to_string(), name.to_string()),
    ])
}

fn meta(inst: &MaiaInstance, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: inst.namespace(),
        labels: Some(labels(&inst.name_any())),
        owner_references: owner_references(inst),
        ..Default::default()
    }
}

/// Server configuration file mounted at `/config/config.yaml`.
pub fn config_yaml(spec: &MaiaInstanceSpec) -> String {
    let mut out = format!(
        "server:\n  port: {HTTP_PORT}\n  grpc_port: {GRPC_PORT}\n\n\
         storage:\n  data_dir: {}\n  sync_writes: {}\n  gc_interval: {}\n\n\
         logging:\n  level: {}\n  format: {}\n\n\
         embedding:\n  model: {}\n",
        non_empty(&spec.storage.data_dir, "/data"),
        spec.storage.sync_writes,
        non_empty(&spec.storage.gc_interval, "5m"),
        spec.logging.level.as_str(),
        spec.logging.format.as_str(),
        spec.embedding.model.as_str(),
    );
    if spec.tenancy.enabled {
        out.push_str(&format!(
            "\ntenant:\n  enabled: true\n  require_tenant: {}\n  default_tenant_id: {}\n  enforce_scopes_enabled: {}\n",
            spec.tenancy.require_tenant,
            non_empty(&spec.tenancy.default_tenant_id, "default"),
            spec.tenancy.enforce_scopes_enabled,
        ));
    }
    if spec.rate_limit.enabled {
        let rps = if spec.rate_limit.requests_per_second > 0 {
            spec.rate_limit.requests_per_second
        } else {
            100
        };
        let burst = if spec.rate_limit.burst > 0 {
            spec.rate_limit.burst
        } else {
            200
        };
        out.push_str(&format!(
            "\nrate_limit:\n  enabled: true\n  requests_per_second: {rps}\n  burst: {burst}\n"
        ));
    }
    if spec.metrics.enabled {
        out.push_str("\nmetrics:\n  enabled: true\n");
    }
    out
}

pub fn config_map(inst: &MaiaInstance) -> ConfigMap {
    ConfigMap {
        metadata: meta(inst, config_map_name(&inst.name_any())),
        data: Some(BTreeMap::from([(
            CONFIG_KEY.to_string(),
            config_yaml(&inst.spec),
        )])),
        ..Default::default()
    }
}

fn claim_spec(size: &str, storage_class: Option<String>) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".into()]),
        storage_class_name: storage_class,
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(size.to_string()),
            )])),
            limits: None,
        }),
        ..Default::default()
    }
}

/// Merges our labels and owner into `meta` without touching anything else.
fn adopt(meta: &mut ObjectMeta, inst: &MaiaInstance) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in self::labels(&inst.name_any()) {
        labels.insert(k, v);
    }
    if let Some(owner) = owner_references(inst).and_then(|mut o| o.pop())
        && !owned_by(meta, &owner)
    {
        meta.owner_references.get_or_insert_with(Vec::new).push(owner);
    }
}

fn owned_by(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.uid == owner.uid)
}

/// Mutation for the data claim. The claim spec is only written on creation.
pub fn mutate_data_claim(pvc: &mut PersistentVolumeClaim, inst: &MaiaInstance) {
    adopt(&mut pvc.metadata, inst);
    if pvc.metadata.creation_timestamp.is_none() {
        pvc.spec = Some(claim_spec(
            non_empty(&inst.spec.storage.size, "10Gi"),
            inst.spec.storage.storage_class_name.clone(),
        ));
    }
}

/// Mutation for the backup claim; same create-only rule as the data claim.
pub fn mutate_backup_claim(pvc: &mut PersistentVolumeClaim, inst: &MaiaInstance) {
    adopt(&mut pvc.metadata, inst);
    if pvc.metadata.creation_timestamp.is_none() {
        pvc.spec = Some(claim_spec(
            non_empty(&inst.spec.backup.storage_size, "20Gi"),
            inst.spec.storage.storage_class_name.clone(),
        ));
    }
}

fn secret_env(name: &str, sel: &SecretRef, default_key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: sel.name.clone(),
                key: sel.key_or(default_key).to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn env_vars(spec: &MaiaInstanceSpec) -> Vec<EnvVar> {
    let mut env = vec![EnvVar {
        name: "MAIA_CONFIG".into(),
        value: Some(format!("{CONFIG_MOUNT}/{CONFIG_KEY}")),
        ..Default::default()
    }];
    if let Some(sel) = &spec.security.api_key_secret_ref {
        env.push(secret_env("MAIA_API_KEY", sel, "api-key"));
    }
    match spec.embedding.model {
        EmbeddingModel::Openai => {
            if let Some(sel) = &spec.embedding.openai_secret_ref {
                env.push(secret_env("OPENAI_API_KEY", sel, "openai-api-key"));
            }
        }
        EmbeddingModel::Ollama => {
            if let Some(endpoint) = spec.embedding.ollama_endpoint.as_deref()
                && !endpoint.is_empty()
            {
                env.push(EnvVar {
                    name: "OLLAMA_ENDPOINT".into(),
                    value: Some(endpoint.to_string()),
                    ..Default::default()
                });
            }
        }
        EmbeddingModel::Local => {}
    }
    env
}

fn quantities(cpu: &Option<String>, memory: &Option<String>, defaults: (&str, &str)) -> BTreeMap<String, Quantity> {
    let pick = |v: &Option<String>, d: &str| {
        Quantity(v.as_deref().filter(|s| !s.is_empty()).unwrap_or(d).to_string())
    };
    BTreeMap::from([
        ("cpu".to_string(), pick(cpu, defaults.0)),
        ("memory".to_string(), pick(memory, defaults.1)),
    ])
}

pub fn resource_requirements(spec: &MaiaInstanceSpec) -> ResourceRequirements {
    let r = &spec.resources;
    ResourceRequirements {
        limits: Some(quantities(&r.limits.cpu, &r.limits.memory, ("1000m", "1Gi"))),
        requests: Some(quantities(&r.requests.cpu, &r.requests.memory, ("100m", "256Mi"))),
        ..Default::default()
    }
}

fn http_probe(path: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.into()),
            port: IntOrString::String("http".into()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

fn pod_security() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(RUN_AS),
        fs_group: Some(RUN_AS),
        ..Default::default()
    }
}

fn claim_volume(name: &str, claim: String, read_only: bool) -> Volume {
    Volume {
        name: name.into(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim,
            read_only: read_only.then_some(true),
        }),
        ..Default::default()
    }
}

pub fn deployment(inst: &MaiaInstance) -> Deployment {
    let name = inst.name_any();
    let spec = &inst.spec;
    let labels = labels(&name);
    let data_dir = non_empty(&spec.storage.data_dir, "/data").to_string();

    let container = Container {
        name: "maia".into(),
        image: Some(spec.image.reference()),
        image_pull_policy: Some(spec.image.pull_policy.as_str().into()),
        ports: Some(vec![
            ContainerPort {
                name: Some("http".into()),
                container_port: HTTP_PORT,
                protocol: Some("TCP".into()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("grpc".into()),
                container_port: GRPC_PORT,
                protocol: Some("TCP".into()),
                ..Default::default()
            },
        ]),
        env: Some(env_vars(spec)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".into(),
                mount_path: CONFIG_MOUNT.into(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "data".into(),
                mount_path: data_dir,
                ..Default::default()
            },
        ]),
        liveness_probe: Some(http_probe("/health", 10, 30)),
        readiness_probe: Some(http_probe("/ready", 5, 10)),
        resources: Some(resource_requirements(spec)),
        ..Default::default()
    };

    Deployment {
        metadata: meta(inst, name.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    security_context: Some(pod_security()),
                    volumes: Some(vec![
                        Volume {
                            name: "config".into(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: config_map_name(&name),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        claim_volume("data", data_claim_name(&name), false),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        port,
        target_port: Some(IntOrString::String(name.into())),
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

/// Cluster-IP service exposing http and grpc.
pub fn service(inst: &MaiaInstance) -> Service {
    let name = inst.name_any();
    Service {
        metadata: meta(inst, name.clone()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(labels(&name)),
            ports: Some(vec![
                service_port("http", HTTP_PORT),
                service_port("grpc", GRPC_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Mutation for the headless service. `clusterIP: None` can only be set on
/// creation; later passes leave it and any server-filled fields alone.
pub fn mutate_headless_service(svc: &mut Service, inst: &MaiaInstance) {
    adopt(&mut svc.metadata, inst);
    let creating = svc.metadata.creation_timestamp.is_none();
    let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
    if creating {
        spec.cluster_ip = Some("None".into());
    }
    let selector = labels(&inst.name_any());
    if spec.selector.as_ref() != Some(&selector) {
        spec.selector = Some(selector);
    }
    let desired = service_port("http", HTTP_PORT);
    let matches = match spec.ports.as_deref() {
        Some([p]) => p.name == desired.name && p.port == desired.port && p.target_port == desired.target_port,
        _ => false,
    };
    if !matches {
        spec.ports = Some(vec![desired]);
    }
}

pub fn ingress(inst: &MaiaInstance) -> Ingress {
    let name = inst.name_any();
    let cfg = &inst.spec.ingress;
    let host = (!cfg.host.is_empty()).then(|| cfg.host.clone());
    let mut metadata = meta(inst, name.clone());
    if !cfg.annotations.is_empty() {
        metadata.annotations = Some(cfg.annotations.clone());
    }
    Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: cfg.class_name.clone(),
            rules: Some(vec![IngressRule {
                host: host.clone(),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".into()),
                        path_type: "Prefix".into(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(HTTP_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls: cfg.tls.then(|| {
                vec![IngressTLS {
                    hosts: host.map(|h| vec![h]),
                    secret_name: Some(format!("{name}-tls")),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Prometheus-operator ServiceMonitor as an untyped manifest.
pub fn service_monitor(inst: &MaiaInstance) -> serde_json::Value {
    let name = inst.name_any();
    let sm = &inst.spec.metrics.service_monitor;
    let mut sm_labels = labels(&name);
    sm_labels.extend(sm.labels.clone());
    json!({
        "apiVersion": "monitoring.coreos.com/v1",
        "kind": "ServiceMonitor",
        "metadata": {
            "name": name,
            "namespace": inst.namespace(),
            "labels": sm_labels,
            "ownerReferences": owner_references(inst),
        },
        "spec": {
            "selector": { "matchLabels": monitor_selector(&name) },
            "endpoints": [{
                "port": "http",
                "path": "/metrics",
                "interval": non_empty(&sm.interval, "30s"),
            }],
        }
    })
}

/// Shell run by the backup job: archive, checksum, prune.
pub fn backup_script(spec: &MaiaInstanceSpec) -> String {
    let data_dir = non_empty(&spec.storage.data_dir, "/data");
    let (ext, tar_flags) = if spec.backup.compress {
        ("tar.gz", "-czf")
    } else {
        ("tar", "-cf")
    };
    let retention = spec.backup.retention_days.max(1);
    format!(
        "set -e\n\
         FILE={BACKUP_MOUNT}/maia-backup-$(date +%Y%m%d-%H%M%S).{ext}\n\
         tar {tar_flags} \"$FILE\" -C {data_dir} .\n\
         sha256sum \"$FILE\" > \"$FILE.sha256\"\n\
         find {BACKUP_MOUNT} -name 'maia-backup-*' -type f -mtime +{retention} -delete\n"
    )
}

pub fn backup_cron_job(inst: &MaiaInstance) -> CronJob {
    let name = inst.name_any();
    let spec = &inst.spec;
    let data_dir = non_empty(&spec.storage.data_dir, "/data").to_string();
    let container = Container {
        name: "backup".into(),
        image: Some("busybox:1.36".into()),
        command: Some(vec!["/bin/sh".into(), "-c".into(), backup_script(spec)]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "data".into(),
                mount_path: data_dir,
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "backup".into(),
                mount_path: BACKUP_MOUNT.into(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };
    CronJob {
        metadata: meta(inst, backup_job_name(&name)),
        spec: Some(CronJobSpec {
            schedule: non_empty(&spec.backup.schedule, "0 2 * * *").to_string(),
            concurrency_policy: Some("Forbid".into()),
            successful_jobs_history_limit: Some(3),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    backoff_limit: Some(2),
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels(&name)),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            restart_policy: Some("OnFailure".into()),
                            security_context: Some(pod_security()),
                            containers: vec![container],
                            volumes: Some(vec![
                                claim_volume("data", data_claim_name(&name), true),
                                claim_volume("backup", backup_claim_name(&name), false),
                            ]),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::instance::{MaiaInstanceSpec, PullPolicy};
    use crate::crds::common::SecretKeySelector as SecretRef;

    fn instance(spec: MaiaInstanceSpec) -> MaiaInstance {
        let mut inst = MaiaInstance::new("inst", spec);
        inst.metadata.namespace = Some("apps".into());
        inst.metadata.uid = Some("uid-1".into());
        inst
    }

    #[test]
    fn config_document_layout() {
        let yaml = config_yaml(&MaiaInstanceSpec::default());
        assert!(yaml.starts_with("server:\n  port: 8080\n  grpc_port: 9090\n"));
        assert!(yaml.contains("storage:\n  data_dir: /data\n  sync_writes: false\n  gc_interval: 5m\n"));
        assert!(yaml.contains("logging:\n  level: info\n  format: json\n"));
        assert!(yaml.contains("embedding:\n  model: local\n"));
        assert!(yaml.ends_with("\nmetrics:\n  enabled: true\n"));
        assert!(!yaml.contains("tenant:"));
        assert!(!yaml.contains("rate_limit:"));
    }

    #[test]
    fn tenancy_and_rate_limit_blocks() {
        let mut spec = MaiaInstanceSpec::default();
        spec.tenancy.enabled = true;
        spec.tenancy.require_tenant = true;
        spec.rate_limit.enabled = true;
        spec.rate_limit.requests_per_second = 50;
        spec.rate_limit.burst = 100;
        let yaml = config_yaml(&spec);
        assert!(yaml.contains("level: info"));
        assert!(yaml.contains(
            "\ntenant:\n  enabled: true\n  require_tenant: true\n  default_tenant_id: default\n  enforce_scopes_enabled: false\n"
        ));
        assert!(yaml.contains(
            "\nrate_limit:\n  enabled: true\n  requests_per_second: 50\n  burst: 100\n"
        ));

        let cm = config_map(&instance(spec));
        assert_eq!(cm.metadata.name.as_deref(), Some("inst-config"));
        assert_eq!(cm.data.unwrap()[CONFIG_KEY], yaml);
    }

    #[test]
    fn both_services_select_the_pods() {
        let inst = instance(MaiaInstanceSpec::default());
        let svc = service(&inst);
        let spec = svc.spec.unwrap();
        let ports: Vec<_> = spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![8080, 9090]);
        assert_eq!(spec.selector.unwrap(), labels("inst"));

        let mut headless = Service::default();
        mutate_headless_service(&mut headless, &inst);
        let hs = headless.spec.unwrap();
        assert_eq!(hs.ports.unwrap().len(), 1);
        assert_eq!(hs.selector.unwrap(), labels("inst"));
    }

    #[test]
    fn deployment_wires_image_ports_and_mounts() {
        let mut spec = MaiaInstanceSpec::default();
        spec.image.repository = "maia".into();
        spec.image.tag = "v1".into();
        spec.image.pull_policy = PullPolicy::Always;
        spec.storage.data_dir = "/var/maia".into();
        let dep = deployment(&instance(spec));

        let d = dep.spec.as_ref().unwrap();
        assert_eq!(d.replicas, Some(1));
        assert_eq!(d.selector.match_labels.as_ref().unwrap()["app.kubernetes.io/instance"], "inst");
        let pod = d.template.spec.as_ref().unwrap();
        assert_eq!(pod.security_context.as_ref().unwrap().fs_group, Some(1000));
        let c = &pod.containers[0];
        assert_eq!(c.name, "maia");
        assert_eq!(c.image.as_deref(), Some("maia:v1"));
        assert_eq!(c.image_pull_policy.as_deref(), Some("Always"));
        let ports: Vec<_> = c.ports.as_ref().unwrap().iter().map(|p| p.container_port).collect();
        assert_eq!(ports, vec![8080, 9090]);
        let mounts: Vec<_> = c
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert_eq!(mounts, vec!["/config", "/var/maia"]);
        let liveness = c.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.initial_delay_seconds, Some(10));
        assert_eq!(liveness.period_seconds, Some(30));
        let limits = c.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("1000m".into()));
        assert_eq!(limits["memory"], Quantity("1Gi".into()));
        assert_eq!(
            dep.metadata.owner_references.as_ref().unwrap()[0].uid,
            "uid-1"
        );
    }

    #[test]
    fn env_follows_embedding_model() {
        let mut spec = MaiaInstanceSpec::default();
        spec.security.api_key_secret_ref = Some(SecretRef {
            name: "maia-key".into(),
            key: None,
        });
        spec.embedding.model = EmbeddingModel::Ollama;
        spec.embedding.ollama_endpoint = Some("http://ollama:11434".into());
        spec.embedding.openai_secret_ref = Some(SecretRef {
            name: "oa".into(),
            key: None,
        });
        let env = env_vars(&spec);
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["MAIA_CONFIG", "MAIA_API_KEY", "OLLAMA_ENDPOINT"]);
        let key_ref = env[1].value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(key_ref.key, "api-key");

        spec.embedding.model = EmbeddingModel::Openai;
        let env = env_vars(&spec);
        let openai = env.iter().find(|e| e.name == "OPENAI_API_KEY").unwrap();
        let key_ref = openai.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(key_ref.name, "oa");
        assert_eq!(key_ref.key, "openai-api-key");
    }

    #[test]
    fn claim_spec_written_only_on_create() {
        let mut spec = MaiaInstanceSpec::default();
        spec.storage.size = "5Gi".into();
        let inst = instance(spec);

        let mut pvc = PersistentVolumeClaim::default();
        mutate_data_claim(&mut pvc, &inst);
        let requested = |p: &PersistentVolumeClaim| {
            p.spec.as_ref().unwrap().resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"].clone()
        };
        assert_eq!(requested(&pvc), Quantity("5Gi".into()));

        // Once the claim exists a new size is ignored.
        pvc.metadata.creation_timestamp = serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap();
        let before = pvc.clone();
        let mut bigger = inst.clone();
        bigger.spec.storage.size = "50Gi".into();
        mutate_data_claim(&mut pvc, &bigger);
        assert_eq!(pvc, before);
    }

    #[test]
    fn headless_service_keeps_server_fields() {
        let inst = instance(MaiaInstanceSpec::default());
        let mut svc = Service::default();
        mutate_headless_service(&mut svc, &inst);
        assert_eq!(svc.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("None"));

        svc.metadata.creation_timestamp = serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap();
        svc.spec.as_mut().unwrap().session_affinity = Some("None".into());
        let before = svc.clone();
        mutate_headless_service(&mut svc, &inst);
        assert_eq!(svc, before);
    }

    #[test]
    fn ingress_tls_and_class() {
        let mut spec = MaiaInstanceSpec::default();
        spec.ingress.enabled = true;
        spec.ingress.host = "maia.example.com".into();
        spec.ingress.class_name = Some("nginx".into());
        spec.ingress.tls = true;
        let ing = ingress(&instance(spec));
        let s = ing.spec.unwrap();
        assert_eq!(s.ingress_class_name.as_deref(), Some("nginx"));
        let tls_entries = s.tls.unwrap();
        let tls = &tls_entries[0];
        assert_eq!(tls.secret_name.as_deref(), Some("inst-tls"));
        assert_eq!(tls.hosts.as_ref().unwrap()[0], "maia.example.com");
        let rules = s.rules.unwrap();
        let path = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(path.backend.service.as_ref().unwrap().name, "inst");
    }

    #[test]
    fn service_monitor_merges_labels() {
        let mut spec = MaiaInstanceSpec::default();
        spec.metrics.service_monitor.enabled = true;
        spec.metrics.service_monitor.labels.insert("release".into(), "prom".into());
        let sm = service_monitor(&instance(spec));
        assert_eq!(sm["metadata"]["labels"]["release"], "prom");
        assert_eq!(sm["metadata"]["labels"]["app.kubernetes.io/name"], "maia");
        assert_eq!(sm["spec"]["endpoints"][0]["interval"], "30s");
        assert_eq!(sm["spec"]["endpoints"][0]["path"], "/metrics");
        assert_eq!(
            sm["spec"]["selector"]["matchLabels"],
            json!({"app.kubernetes.io/instance": "inst", "app.kubernetes.io/name": "maia"})
        );
    }

    #[test]
    fn backup_job_mounts_data_read_only() {
        let mut spec = MaiaInstanceSpec::default();
        spec.backup.enabled = true;
        spec.backup.compress = false;
        spec.backup.retention_days = 7;
        let cj = backup_cron_job(&instance(spec.clone()));
        let s = cj.spec.unwrap();
        assert_eq!(s.schedule, "0 2 * * *");
        assert_eq!(s.concurrency_policy.as_deref(), Some("Forbid"));
        let pod = s.job_template.spec.unwrap().template.spec.unwrap();
        let vols = pod.volumes.unwrap();
        assert_eq!(vols[0].persistent_volume_claim.as_ref().unwrap().claim_name, "inst-data");
        assert_eq!(vols[0].persistent_volume_claim.as_ref().unwrap().read_only, Some(true));
        assert_eq!(vols[1].persistent_volume_claim.as_ref().unwrap().claim_name, "inst-backup");

        let script = backup_script(&spec);
        assert!(script.contains(".tar\n"));
        assert!(script.contains("tar -cf"));
        assert!(script.contains("sha256sum"));
        assert!(script.contains("-mtime +7"));
    }
}
