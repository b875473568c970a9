use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{Condition, LocalObjectReference, SecretKeySelector};

/// A deployed MAIA server.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "maia.cuemby.com",
    version = "v1alpha1",
    kind = "MaiaInstance",
    plural = "maiainstances",
    namespaced,
    status = "MaiaInstanceStatus",
    shortname = "maia",
    shortname = "mi",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Tenants","type":"integer","jsonPath":".status.tenantCount"}"#,
    printcolumn = r#"{"name":"Memories","type":"integer","jsonPath":".status.totalMemories"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase", default)]
pub struct MaiaInstanceSpec {
    #[schemars(range(min = 1, max = 10))]
    pub replicas: i32,
    pub image: ImageSpec,
    pub storage: StorageSpec,
    pub security: SecuritySpec,
    pub embedding: EmbeddingSpec,
    pub tenancy: TenancySpec,
    pub rate_limit: RateLimitSpec,
    pub logging: LoggingSpec,
    pub metrics: MetricsSpec,
    pub ingress: IngressSpec,
    pub resources: ResourcesSpec,
    pub backup: BackupSpec,
}

impl Default for MaiaInstanceSpec {
    fn default() -> Self {
        Self {
            replicas: 1,
            image: ImageSpec::default(),
            storage: StorageSpec::default(),
            security: SecuritySpec::default(),
            embedding: EmbeddingSpec::default(),
            tenancy: TenancySpec::default(),
            rate_limit: RateLimitSpec::default(),
            logging: LoggingSpec::default(),
            metrics: MetricsSpec::default(),
            ingress: IngressSpec::default(),
            resources: ResourcesSpec::default(),
            backup: BackupSpec::default(),
        }
    }
}

pub const DEFAULT_REPOSITORY: &str = "ghcr.io/ar4mirez/maia";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSpec {
    pub repository: String,
    pub tag: String,
    pub pull_policy: PullPolicy,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            repository: DEFAULT_REPOSITORY.into(),
            tag: DEFAULT_TAG.into(),
            pull_policy: PullPolicy::IfNotPresent,
        }
    }
}

impl ImageSpec {
    /// `<repository>:<tag>`, with blanks falling back to the defaults.
    pub fn reference(&self) -> String {
        format!(
            "{}:{}",
            non_empty(&self.repository, DEFAULT_REPOSITORY),
            non_empty(&self.tag, DEFAULT_TAG)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSpec {
    /// Data volume size, e.g. "10Gi".
    #[schemars(regex(pattern = r"^[0-9]+(Gi|Mi|Ti)$"))]
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    pub data_dir: String,
    pub sync_writes: bool,
    /// Go-style duration, e.g. "5m".
    pub gc_interval: String,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: "10Gi".into(),
            storage_class_name: None,
            data_dir: "/data".into(),
            sync_writes: false,
            gc_interval: "5m".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SecuritySpec {
    /// Secret holding the server API key; `key` defaults to `api-key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_secret_ref: Option<SecretKeySelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret_ref: Option<LocalObjectReference>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingSpec {
    pub model: EmbeddingModel,
    /// Used when `model` is `openai`; `key` defaults to `openai-api-key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_secret_ref: Option<SecretKeySelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama_endpoint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingModel {
    #[default]
    Local,
    Openai,
    Ollama,
}

impl EmbeddingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingModel::Local => "local",
            EmbeddingModel::Openai => "openai",
            EmbeddingModel::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TenancySpec {
    pub enabled: bool,
    pub require_tenant: bool,
    pub default_tenant_id: String,
    pub enforce_scopes_enabled: bool,
    pub dedicated_storage: bool,
}

impl Default for TenancySpec {
    fn default() -> Self {
        Self {
            enabled: false,
            require_tenant: false,
            default_tenant_id: "default".into(),
            enforce_scopes_enabled: false,
            dedicated_storage: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSpec {
    pub enabled: bool,
    #[schemars(range(min = 0))]
    pub requests_per_second: i32,
    #[schemars(range(min = 0))]
    pub burst: i32,
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 100,
            burst: 200,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSpec {
    pub level: LogLevel,
    pub format: LogFormat,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSpec {
    pub enabled: bool,
    pub service_monitor: ServiceMonitorSpec,
}

impl Default for MetricsSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            service_monitor: ServiceMonitorSpec::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceMonitorSpec {
    pub enabled: bool,
    pub interval: String,
    /// Merged into the ServiceMonitor's own labels.
    pub labels: BTreeMap<String, String>,
}

impl Default for ServiceMonitorSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: "30s".into(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct IngressSpec {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub host: String,
    pub annotations: BTreeMap<String, String>,
    /// Terminate TLS using the `<name>-tls` secret.
    pub tls: bool,
}

/// Unset quantities fall back to limits 1000m/1Gi and requests 100m/256Mi.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourcesSpec {
    pub limits: ResourceQuantities,
    pub requests: ResourceQuantities,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceQuantities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupSpec {
    pub enabled: bool,
    /// Cron expression.
    pub schedule: String,
    #[schemars(range(min = 1))]
    pub retention_days: i32,
    #[schemars(regex(pattern = r"^[0-9]+(Gi|Mi|Ti)$"))]
    pub storage_size: String,
    pub compress: bool,
}

impl Default for BackupSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: "0 2 * * *".into(),
            retention_days: 30,
            storage_size: "20Gi".into(),
            compress: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum InstancePhase {
    Pending,
    Running,
    Failed,
    Updating,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MaiaInstanceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<InstancePhase>,
    pub conditions: Vec<Condition>,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub tenant_count: i32,
    pub total_memories: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_used: Option<String>,
    /// RFC 3339 time of the last successful backup job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MaiaInstance {
    pub fn phase(&self) -> Option<InstancePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Some(InstancePhase::Running)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.endpoint.as_deref())
            .filter(|e| !e.is_empty())
    }
}

pub(crate) fn non_empty<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_takes_documented_defaults() {
        let spec: MaiaInstanceSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.image.reference(), "ghcr.io/ar4mirez/maia:latest");
        assert_eq!(spec.image.pull_policy, PullPolicy::IfNotPresent);
        assert_eq!(spec.storage.size, "10Gi");
        assert_eq!(spec.storage.data_dir, "/data");
        assert_eq!(spec.storage.gc_interval, "5m");
        assert_eq!(spec.embedding.model, EmbeddingModel::Local);
        assert_eq!(spec.tenancy.default_tenant_id, "default");
        assert_eq!(spec.rate_limit.requests_per_second, 100);
        assert_eq!(spec.rate_limit.burst, 200);
        assert_eq!(spec.logging.level, LogLevel::Info);
        assert_eq!(spec.logging.format, LogFormat::Json);
        assert!(spec.metrics.enabled);
        assert_eq!(spec.metrics.service_monitor.interval, "30s");
        assert_eq!(spec.backup.schedule, "0 2 * * *");
        assert_eq!(spec.backup.retention_days, 30);
        assert!(spec.backup.compress);
    }

    #[test]
    fn partial_sections_keep_sibling_defaults() {
        let spec: MaiaInstanceSpec = serde_json::from_value(serde_json::json!({
            "image": {"repository": "maia", "tag": "v1"},
            "storage": {"size": "5Gi"},
            "embedding": {"model": "openai", "openaiSecretRef": {"name": "oa"}},
        }))
        .unwrap();
        assert_eq!(spec.image.reference(), "maia:v1");
        assert_eq!(spec.storage.size, "5Gi");
        assert_eq!(spec.storage.data_dir, "/data");
        assert_eq!(spec.embedding.model, EmbeddingModel::Openai);
        assert_eq!(
            spec.embedding.openai_secret_ref.unwrap().key_or("openai-api-key"),
            "openai-api-key"
        );
    }

    #[test]
    fn schema_bounds_replicas() {
        use kube::CustomResourceExt;
        let crd = serde_json::to_value(MaiaInstance::crd()).unwrap();
        let spec = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"];
        let replicas = &spec["properties"]["replicas"];
        assert_eq!(replicas["minimum"], 1.0);
        assert_eq!(replicas["maximum"], 10.0);
        assert_eq!(crd["spec"]["names"]["shortNames"], serde_json::json!(["maia", "mi"]));
        assert_eq!(crd["spec"]["group"], "maia.cuemby.com");
    }
}
