use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::Condition;

pub const DEFAULT_TOKEN_BUDGET: i32 = 4000;
pub const DEFAULT_MAX_TOKEN_BUDGET: i32 = 16000;

/// A tenant provisioned inside a running MaiaInstance.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "maia.cuemby.com",
    version = "v1alpha1",
    kind = "MaiaTenant",
    plural = "maiatenants",
    namespaced,
    status = "MaiaTenantStatus",
    shortname = "mt",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instanceRef.name"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".spec.plan"}"#,
    printcolumn = r#"{"name":"Memories","type":"integer","jsonPath":".status.memoryCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MaiaTenantSpec {
    pub instance_ref: InstanceReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub quotas: TenantQuotas,
    #[serde(default)]
    pub config: TenantConfig,
    #[serde(default)]
    pub api_keys: Vec<TenantApiKey>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct InstanceReference {
    pub name: String,
    /// Defaults to the tenant's own namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl Plan {
    /// Server-side plan name. `starter` and `professional` both land on
    /// `standard`, so the mapping does not round-trip.
    pub fn remote(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter | Plan::Professional => "standard",
            Plan::Enterprise => "premium",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantQuotas {
    #[schemars(range(min = 0))]
    pub max_memories: i64,
    #[schemars(range(min = 0))]
    pub max_storage_bytes: i64,
    #[schemars(range(min = 0))]
    pub max_namespaces: i32,
    #[schemars(range(min = 0))]
    pub requests_per_minute: i32,
    #[schemars(range(min = 0))]
    pub requests_per_day: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantConfig {
    pub default_token_budget: i32,
    pub max_token_budget: i32,
    pub allowed_embedding_models: Vec<String>,
    pub features: TenantFeatures,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            default_token_budget: DEFAULT_TOKEN_BUDGET,
            max_token_budget: DEFAULT_MAX_TOKEN_BUDGET,
            allowed_embedding_models: Vec::new(),
            features: TenantFeatures::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantFeatures {
    pub inference: bool,
    pub vector_search: bool,
    pub full_text_search: bool,
    pub context_assembly: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantApiKey {
    pub name: String,
    pub secret_ref: ApiKeySecretRef,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// RFC 3339 expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

fn default_scopes() -> Vec<String> {
    vec!["read".into(), "write".into()]
}

/// Where the raw key is written; `key` defaults to `api-key`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct ApiKeySecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ApiKeySecretRef {
    pub fn key_name(&self) -> &str {
        match self.key.as_deref() {
            Some(k) if !k.is_empty() => k,
            _ => "api-key",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum TenantPhase {
    Pending,
    Active,
    Suspended,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MaiaTenantStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<TenantPhase>,
    pub conditions: Vec<Condition>,
    /// Id assigned by the server; empty until the first successful create.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub memory_count: i64,
    pub namespace_count: i64,
    pub storage_used: i64,
    pub quota_usage: QuotaUsage,
    pub api_key_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MaiaTenantStatus {
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Percentages in `0..=100`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaUsage {
    pub memories: f64,
    pub storage: f64,
    pub requests_per_minute: f64,
    pub requests_per_day: f64,
}

impl MaiaTenant {
    pub fn instance_namespace(&self) -> String {
        match self.spec.instance_ref.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => self.namespace().unwrap_or_default(),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.tenant_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_mapping_collapses_paid_tiers() {
        assert_eq!(Plan::Free.remote(), "free");
        assert_eq!(Plan::Starter.remote(), "standard");
        assert_eq!(Plan::Professional.remote(), "standard");
        assert_eq!(Plan::Enterprise.remote(), "premium");
    }

    #[test]
    fn minimal_tenant_defaults() {
        let spec: MaiaTenantSpec = serde_json::from_value(serde_json::json!({
            "instanceRef": {"name": "inst"},
            "apiKeys": [{"name": "prod", "secretRef": {"name": "prod-key"}}],
        }))
        .unwrap();
        assert_eq!(spec.plan, Plan::Free);
        assert_eq!(spec.config.default_token_budget, 4000);
        assert_eq!(spec.config.max_token_budget, 16000);
        assert_eq!(spec.api_keys[0].scopes, vec!["read", "write"]);
        assert_eq!(spec.api_keys[0].secret_ref.key_name(), "api-key");
    }

    #[test]
    fn instance_namespace_falls_back_to_own() {
        let mut t = MaiaTenant::new("t", MaiaTenantSpec::default());
        t.metadata.namespace = Some("apps".into());
        t.spec.instance_ref.name = "inst".into();
        assert_eq!(t.instance_namespace(), "apps");
        t.spec.instance_ref.namespace = Some("maia".into());
        assert_eq!(t.instance_namespace(), "maia");
    }
}
