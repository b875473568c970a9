//! One pass of projecting a [`MaiaTenant`] onto its server.
//!
//! Everything here talks to the server through [`TenantAdmin`] and writes
//! key material through [`KeySink`], so the whole pass runs against fakes in
//! tests. The caller owns persistence of the status and publishing events.

use std::collections::{BTreeMap, HashSet};

use kube::ResourceExt;
use kube::runtime::events::EventType;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::admin::{self, CreateApiKeyRequest, CreateTenantRequest, TenantAdmin, UpdateTenantRequest};
use crate::crds::common::{Condition, find_condition, rfc3339, set_condition};
use crate::crds::tenant::{
    DEFAULT_MAX_TOKEN_BUDGET, DEFAULT_TOKEN_BUDGET, MaiaTenant, MaiaTenantStatus, TenantApiKey,
    TenantPhase,
};
use crate::error::ReconcileError;

pub const DEFAULT_SUSPEND_REASON: &str = "Suspended by operator";

/// Destination for freshly minted raw API keys.
#[allow(async_fn_in_trait)]
pub trait KeySink {
    async fn store_key(&self, key: &TenantApiKey, raw: &str) -> Result<(), ReconcileError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantEvent {
    Created,
    Updated,
    Suspended(String),
    Activated,
    ApiKeyCreated(String),
}

impl TenantEvent {
    pub fn reason(&self) -> &'static str {
        match self {
            TenantEvent::Created => "Created",
            TenantEvent::Updated => "Updated",
            TenantEvent::Suspended(_) => "Suspended",
            TenantEvent::Activated => "Activated",
            TenantEvent::ApiKeyCreated(_) => "APIKeyCreated",
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            TenantEvent::Suspended(_) => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    pub fn note(&self) -> String {
        match self {
            TenantEvent::Created => "Tenant created in MAIA".into(),
            TenantEvent::Updated => "Tenant updated in MAIA".into(),
            TenantEvent::Suspended(reason) => reason.clone(),
            TenantEvent::Activated => "Tenant has been activated".into(),
            TenantEvent::ApiKeyCreated(name) => format!("API key {name} created"),
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub events: Vec<TenantEvent>,
    /// The failure that cut the pass short, tagged with a step reason.
    pub error: Option<ReconcileError>,
}

pub fn desired_config(tenant: &MaiaTenant) -> admin::TenantConfig {
    let cfg = &tenant.spec.config;
    admin::TenantConfig {
        default_token_budget: if cfg.default_token_budget == 0 {
            DEFAULT_TOKEN_BUDGET
        } else {
            cfg.default_token_budget
        },
        max_token_budget: if cfg.max_token_budget == 0 {
            DEFAULT_MAX_TOKEN_BUDGET
        } else {
            cfg.max_token_budget
        },
        allowed_embedding_models: cfg.allowed_embedding_models.clone(),
        dedicated_storage: false,
    }
}

pub fn desired_quotas(tenant: &MaiaTenant) -> admin::TenantQuotas {
    let q = &tenant.spec.quotas;
    admin::TenantQuotas {
        max_memories: q.max_memories,
        max_storage_bytes: q.max_storage_bytes,
        max_namespaces: q.max_namespaces,
        requests_per_minute: q.requests_per_minute,
        requests_per_day: q.requests_per_day,
    }
}

fn tenant_metadata(tenant: &MaiaTenant) -> BTreeMap<String, serde_json::Value> {
    BTreeMap::from([
        (
            "kubernetes.namespace".to_string(),
            tenant.namespace().unwrap_or_default().into(),
        ),
        ("kubernetes.name".to_string(), tenant.name_any().into()),
    ])
}

fn percent(used: i64, limit: i64) -> f64 {
    if limit > 0 {
        used as f64 / limit as f64 * 100.0
    } else {
        0.0
    }
}

/// Runs create/update, suspension, key provisioning and the usage refresh.
/// `status` is updated in place even when the pass fails part way.
pub async fn sync_tenant<A: TenantAdmin, S: KeySink>(
    admin: &A,
    sink: &S,
    tenant: &MaiaTenant,
    status: &mut MaiaTenantStatus,
    now: OffsetDateTime,
) -> SyncReport {
    let mut report = SyncReport::default();
    let generation = tenant.metadata.generation;
    status.observed_generation = generation;

    if let Err(err) = upsert(admin, tenant, status, now, &mut report.events).await {
        warn!(error = %err, "tenant sync failed");
        set_condition(
            &mut status.conditions,
            Condition::new("Synced", false, "SyncFailed", err.to_string()).observed(generation),
            now,
        );
        status.phase = Some(TenantPhase::Failed);
        report.error = Some(ReconcileError::step("SyncFailed", err));
        return report;
    }
    set_condition(
        &mut status.conditions,
        Condition::new("Synced", true, "Synced", "Tenant is synced with MAIA").observed(generation),
        now,
    );

    let Some(id) = status.tenant_id().map(str::to_string) else {
        return report;
    };

    if let Err(err) = suspension(admin, tenant, &id, status, now, &mut report.events).await {
        warn!(error = %err, "suspension transition failed");
        report.error = Some(err);
        return report;
    }

    provision_keys(admin, sink, tenant, &id, &mut report.events).await;
    status.api_key_count = tenant.spec.api_keys.len() as i32;

    if let Err(err) = refresh_usage(admin, tenant, &id, status).await {
        warn!(error = %err, "usage refresh failed");
        report.error = Some(ReconcileError::step("UsageFailed", err));
    }

    if tenant.spec.suspended {
        status.phase = Some(TenantPhase::Suspended);
    } else {
        status.phase = Some(TenantPhase::Active);
        set_condition(
            &mut status.conditions,
            Condition::new("Ready", true, "Ready", "Tenant is active and ready").observed(generation),
            now,
        );
    }
    status.last_activity = Some(rfc3339(now));
    report
}

/// Creates the tenant when the server does not know it yet, updates it
/// otherwise. A stale id (server answers 404) leads to a fresh create.
async fn upsert<A: TenantAdmin>(
    admin: &A,
    tenant: &MaiaTenant,
    status: &mut MaiaTenantStatus,
    now: OffsetDateTime,
    events: &mut Vec<TenantEvent>,
) -> Result<(), admin::AdminError> {
    let existing = match status.tenant_id() {
        Some(id) => admin.get_tenant(id).await?,
        None => None,
    };
    let plan = tenant.spec.plan.remote().to_string();

    match existing {
        None => {
            let req = CreateTenantRequest {
                name: tenant.name_any(),
                plan,
                config: Some(desired_config(tenant)),
                quotas: Some(desired_quotas(tenant)),
                metadata: tenant_metadata(tenant),
            };
            let created = admin.create_tenant(&req).await?;
            info!(tenant_id = %created.id, "tenant created");
            status.tenant_id = Some(created.id);
            status.created_at = Some(rfc3339(created.created_at.unwrap_or(now)));
            events.push(TenantEvent::Created);
        }
        Some(remote) => {
            let req = UpdateTenantRequest {
                plan,
                config: Some(desired_config(tenant)),
                quotas: Some(desired_quotas(tenant)),
                metadata: BTreeMap::new(),
            };
            admin.update_tenant(&remote.id, &req).await?;
            events.push(TenantEvent::Updated);
        }
    }
    Ok(())
}

async fn suspension<A: TenantAdmin>(
    admin: &A,
    tenant: &MaiaTenant,
    id: &str,
    status: &mut MaiaTenantStatus,
    now: OffsetDateTime,
    events: &mut Vec<TenantEvent>,
) -> Result<(), ReconcileError> {
    let generation = tenant.metadata.generation;
    // The Suspended condition outlives a Failed phase.
    let currently_suspended = status.phase == Some(TenantPhase::Suspended)
        || find_condition(&status.conditions, "Suspended").is_some_and(Condition::is_true);

    if tenant.spec.suspended && !currently_suspended {
        let reason = tenant
            .spec
            .suspend_reason
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_SUSPEND_REASON);
        admin
            .suspend_tenant(id, reason)
            .await
            .map_err(|e| ReconcileError::step("SuspendFailed", e))?;
        status.phase = Some(TenantPhase::Suspended);
        set_condition(
            &mut status.conditions,
            Condition::new("Suspended", true, "Suspended", reason).observed(generation),
            now,
        );
        events.push(TenantEvent::Suspended(reason.to_string()));
    } else if !tenant.spec.suspended && currently_suspended {
        admin
            .activate_tenant(id)
            .await
            .map_err(|e| ReconcileError::step("ActivateFailed", e))?;
        status.phase = Some(TenantPhase::Active);
        set_condition(
            &mut status.conditions,
            Condition::new("Suspended", false, "Activated", "Tenant has been activated")
                .observed(generation),
            now,
        );
        events.push(TenantEvent::Activated);
    }
    Ok(())
}

/// Creates every requested key the server does not list yet. Failures are
/// logged per key and never abort the pass.
async fn provision_keys<A: TenantAdmin, S: KeySink>(
    admin: &A,
    sink: &S,
    tenant: &MaiaTenant,
    id: &str,
    events: &mut Vec<TenantEvent>,
) {
    if tenant.spec.api_keys.is_empty() {
        return;
    }
    let existing: HashSet<String> = match admin.list_api_keys(id).await {
        Ok(keys) => keys.into_iter().map(|k| k.name).collect(),
        Err(e) => {
            warn!(error = %e, "failed to list API keys");
            return;
        }
    };

    for key in tenant.spec.api_keys.iter().filter(|k| !existing.contains(&k.name)) {
        let expires_at = match key.expires_at.as_deref() {
            Some(raw) => match OffsetDateTime::parse(raw, &Rfc3339) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(name = %key.name, error = %e, "invalid expiresAt, skipping key");
                    continue;
                }
            },
            None => None,
        };
        let req = CreateApiKeyRequest {
            name: key.name.clone(),
            scopes: key.scopes.clone(),
            expires_at,
        };
        let created = match admin.create_api_key(id, &req).await {
            Ok(c) => c,
            Err(e) => {
                warn!(name = %key.name, error = %e, "failed to create API key");
                continue;
            }
        };
        info!(name = %key.name, secret = %key.secret_ref.name, "API key created");
        if let Err(e) = sink.store_key(key, &created.key).await {
            warn!(name = %key.name, error = %e, "failed to store API key");
            continue;
        }
        events.push(TenantEvent::ApiKeyCreated(key.name.clone()));
    }
}

async fn refresh_usage<A: TenantAdmin>(
    admin: &A,
    tenant: &MaiaTenant,
    id: &str,
    status: &mut MaiaTenantStatus,
) -> Result<(), admin::AdminError> {
    let usage = admin.tenant_usage(id).await?;
    let quotas = &tenant.spec.quotas;
    status.memory_count = usage.memory_count;
    status.namespace_count = usage.namespace_count;
    status.storage_used = usage.storage_bytes;
    status.quota_usage.memories = percent(usage.memory_count, quotas.max_memories);
    status.quota_usage.storage = percent(usage.storage_bytes, quotas.max_storage_bytes);
    status.quota_usage.requests_per_day = percent(usage.requests_today, quotas.requests_per_day);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::tenant::{MaiaTenantSpec, Plan};

    #[test]
    fn zero_budgets_take_defaults() {
        let mut t = MaiaTenant::new("t", MaiaTenantSpec::default());
        t.spec.config.default_token_budget = 0;
        t.spec.config.max_token_budget = 0;
        let cfg = desired_config(&t);
        assert_eq!(cfg.default_token_budget, 4000);
        assert_eq!(cfg.max_token_budget, 16000);

        t.spec.config.max_token_budget = 32000;
        assert_eq!(desired_config(&t).max_token_budget, 32000);
    }

    #[test]
    fn metadata_names_the_custom_resource() {
        let mut t = MaiaTenant::new("acme", MaiaTenantSpec::default());
        t.metadata.namespace = Some("apps".into());
        t.spec.plan = Plan::Enterprise;
        let md = tenant_metadata(&t);
        assert_eq!(md["kubernetes.namespace"], "apps");
        assert_eq!(md["kubernetes.name"], "acme");
    }

    #[test]
    fn percentages_need_a_limit() {
        assert_eq!(percent(250, 1000), 25.0);
        assert_eq!(percent(250, 0), 0.0);
    }

    #[test]
    fn suspended_event_is_a_warning() {
        let ev = TenantEvent::Suspended("payment".into());
        assert_eq!(ev.reason(), "Suspended");
        assert_eq!(ev.event_type(), EventType::Warning);
        assert_eq!(ev.note(), "payment");
        assert_eq!(TenantEvent::ApiKeyCreated("prod".into()).reason(), "APIKeyCreated");
    }
}
