//! Client for the MAIA server's admin API.
//!
//! JSON over HTTP. Every request carries `Content-Type` and `Accept` set to
//! `application/json`, plus `X-API-Key` when a key is configured. Failed
//! calls decode a `{code, message}` body when the server sends one.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("API error: status {status}, body: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
}

impl AdminError {
    pub fn status(&self) -> Option<u16> {
        match self {
            AdminError::Api { status, .. } | AdminError::Status { status, .. } => Some(*status),
            AdminError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            AdminError::Transport(_) => true,
            _ => matches!(self.status(), Some(409 | 429) | Some(500..=599)),
        }
    }
}

// ---- wire types ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TenantConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quotas: Option<TenantQuotas>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TenantUsage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub default_token_budget: i32,
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub max_token_budget: i32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_embedding_models: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dedicated_storage: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantQuotas {
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub max_memories: i64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub max_storage_bytes: i64,
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub max_namespaces: i32,
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub requests_per_minute: i32,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub requests_per_day: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantUsage {
    pub memory_count: i64,
    pub namespace_count: i64,
    pub storage_bytes: i64,
    pub requests_today: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateTenantRequest {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plan: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<TenantConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotas: Option<TenantQuotas>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateTenantRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plan: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<TenantConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotas: Option<TenantQuotas>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub tenant_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub expires_at: Option<OffsetDateTime>,
}

/// The raw `key` is only ever returned by the create call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateApiKeyResponse {
    #[serde(default)]
    pub api_key: Option<ApiKey>,
    pub key: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ApiKeyList {
    #[serde(default)]
    api_keys: Vec<ApiKey>,
}

#[derive(Serialize)]
struct SuspendBody<'a> {
    reason: &'a str,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

// ---- tenant operations as seen by the reconciler ----

/// Tenant-facing half of the admin API.
#[allow(async_fn_in_trait)]
pub trait TenantAdmin {
    async fn create_tenant(&self, req: &CreateTenantRequest) -> Result<Tenant, AdminError>;
    /// `Ok(None)` when the server answers 404.
    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>, AdminError>;
    async fn update_tenant(
        &self,
        id: &str,
        req: &UpdateTenantRequest,
    ) -> Result<Tenant, AdminError>;
    async fn delete_tenant(&self, id: &str) -> Result<(), AdminError>;
    async fn tenant_usage(&self, id: &str) -> Result<TenantUsage, AdminError>;
    async fn suspend_tenant(&self, id: &str, reason: &str) -> Result<(), AdminError>;
    async fn activate_tenant(&self, id: &str) -> Result<(), AdminError>;
    async fn create_api_key(
        &self,
        tenant_id: &str,
        req: &CreateApiKeyRequest,
    ) -> Result<CreateApiKeyResponse, AdminError>;
    async fn list_api_keys(&self, tenant_id: &str) -> Result<Vec<ApiKey>, AdminError>;
}

// ---- client ----

#[derive(Debug, Clone)]
pub struct AdminClient {
    base: Url,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct AdminClientBuilder {
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl AdminClientBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<AdminClient, AdminError> {
        let trimmed = self.endpoint.trim_end_matches('/');
        let base = Url::parse(trimmed)
            .ok()
            .filter(|u| !u.cannot_be_a_base())
            .ok_or_else(|| AdminError::InvalidEndpoint(self.endpoint.clone()))?;
        let http = reqwest::Client::builder().timeout(self.timeout).build()?;
        Ok(AdminClient {
            base,
            api_key: self.api_key,
            http,
        })
    }
}

impl AdminClient {
    pub fn builder(endpoint: impl Into<String>) -> AdminClientBuilder {
        AdminClientBuilder {
            endpoint: endpoint.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    pub async fn health(&self) -> Result<(), AdminError> {
        let rb = self.request(Method::GET, &["health"])?;
        expect(rb, &[StatusCode::OK]).await?;
        Ok(())
    }

    pub async fn revoke_api_key(&self, key: &str) -> Result<(), AdminError> {
        let rb = self.request(Method::DELETE, &["admin", "apikeys", key])?;
        expect(rb, &[StatusCode::OK, StatusCode::NO_CONTENT]).await?;
        Ok(())
    }

    /// Segments are percent-encoded individually.
    fn url(&self, segments: &[&str]) -> Result<Url, AdminError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AdminError::InvalidEndpoint(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, AdminError> {
        let url = self.url(segments)?;
        debug!(%method, %url, "admin request");
        let mut rb = self
            .http
            .request(method, url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if let Some(key) = &self.api_key {
            rb = rb.header(API_KEY_HEADER, key);
        }
        Ok(rb)
    }
}

impl TenantAdmin for AdminClient {
    async fn create_tenant(&self, req: &CreateTenantRequest) -> Result<Tenant, AdminError> {
        let rb = self.request(Method::POST, &["admin", "tenants"])?.json(req);
        decode(expect(rb, &[StatusCode::OK, StatusCode::CREATED]).await?).await
    }

    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>, AdminError> {
        let resp = self
            .request(Method::GET, &["admin", "tenants", id])?
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => decode(resp).await.map(Some),
            _ => Err(parse_error(resp).await),
        }
    }

    async fn update_tenant(
        &self,
        id: &str,
        req: &UpdateTenantRequest,
    ) -> Result<Tenant, AdminError> {
        let rb = self
            .request(Method::PUT, &["admin", "tenants", id])?
            .json(req);
        decode(expect(rb, &[StatusCode::OK]).await?).await
    }

    async fn delete_tenant(&self, id: &str) -> Result<(), AdminError> {
        let rb = self.request(Method::DELETE, &["admin", "tenants", id])?;
        expect(rb, &[StatusCode::OK, StatusCode::NO_CONTENT]).await?;
        Ok(())
    }

    async fn tenant_usage(&self, id: &str) -> Result<TenantUsage, AdminError> {
        let rb = self.request(Method::GET, &["admin", "tenants", id, "usage"])?;
        decode(expect(rb, &[StatusCode::OK]).await?).await
    }

    async fn suspend_tenant(&self, id: &str, reason: &str) -> Result<(), AdminError> {
        let rb = self
            .request(Method::POST, &["admin", "tenants", id, "suspend"])?
            .json(&SuspendBody { reason });
        expect(rb, &[StatusCode::OK]).await?;
        Ok(())
    }

    async fn activate_tenant(&self, id: &str) -> Result<(), AdminError> {
        let rb = self.request(Method::POST, &["admin", "tenants", id, "activate"])?;
        expect(rb, &[StatusCode::OK]).await?;
        Ok(())
    }

    async fn create_api_key(
        &self,
        tenant_id: &str,
        req: &CreateApiKeyRequest,
    ) -> Result<CreateApiKeyResponse, AdminError> {
        let rb = self
            .request(Method::POST, &["admin", "tenants", tenant_id, "apikeys"])?
            .json(req);
        decode(expect(rb, &[StatusCode::OK, StatusCode::CREATED]).await?).await
    }

    async fn list_api_keys(&self, tenant_id: &str) -> Result<Vec<ApiKey>, AdminError> {
        let rb = self.request(Method::GET, &["admin", "tenants", tenant_id, "apikeys"])?;
        let list: ApiKeyList = decode(expect(rb, &[StatusCode::OK]).await?).await?;
        Ok(list.api_keys)
    }
}

async fn expect(rb: RequestBuilder, ok: &[StatusCode]) -> Result<Response, AdminError> {
    let resp = rb.send().await?;
    if ok.contains(&resp.status()) {
        Ok(resp)
    } else {
        Err(parse_error(resp).await)
    }
}

async fn parse_error(resp: Response) -> AdminError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(e) if !e.message.is_empty() => AdminError::Api {
            status,
            code: e.code,
            message: e.message,
        },
        _ => AdminError::Status { status, body },
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, AdminError> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(AdminError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_trims_and_validates_endpoint() {
        let c = AdminClient::builder("http://inst.ns.svc:8080///")
            .build()
            .unwrap();
        assert_eq!(
            c.url(&["admin", "tenants", "a/b c"]).unwrap().as_str(),
            "http://inst.ns.svc:8080/admin/tenants/a%2Fb%20c"
        );
        assert!(matches!(
            AdminClient::builder("not a url").build(),
            Err(AdminError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn zero_values_are_omitted_on_the_wire() {
        let req = CreateTenantRequest {
            name: "t".into(),
            plan: "standard".into(),
            quotas: Some(TenantQuotas {
                max_memories: 1000,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            serde_json::json!({"name": "t", "plan": "standard", "quotas": {"max_memories": 1000}})
        );
    }

    #[test]
    fn transient_classification() {
        let status = |s| AdminError::Status {
            status: s,
            body: String::new(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(400).is_transient());
        assert!(!status(404).is_transient());
    }
}
