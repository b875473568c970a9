use std::time::Duration;

use anyhow::Context;
use rand::{Rng, distr::Alphanumeric};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Text,
    Json,
}

/// Operator settings read from the environment at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub operator_namespace: String,
    /// `None` watches every namespace.
    pub watch_namespace: Option<String>,
    /// Identity written into the leader lease.
    pub pod_name: String,
    pub leader_election: bool,
    pub lease_name: String,
    pub lease_duration: Duration,
    pub admin_timeout: Duration,
    pub log_output: LogOutput,
}

impl OperatorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let pod_name = get("POD_NAME")
            .or_else(|| get("HOSTNAME"))
            .unwrap_or_else(random_identity);
        let leader_election = match get("LEADER_ELECTION") {
            Some(v) => parse_bool(&v).with_context(|| format!("LEADER_ELECTION={v}"))?,
            None => true,
        };
        let lease_secs = parse_secs(get("LEADER_LEASE_SECONDS"), 15, "LEADER_LEASE_SECONDS")?;
        let admin_secs = parse_secs(get("ADMIN_TIMEOUT_SECONDS"), 30, "ADMIN_TIMEOUT_SECONDS")?;
        let log_output = match get("LOG_FORMAT").as_deref() {
            Some("json") => LogOutput::Json,
            _ => LogOutput::Text,
        };

        Ok(Self {
            operator_namespace: get("OPERATOR_NAMESPACE").unwrap_or_else(|| "maia-operator".into()),
            watch_namespace: get("WATCH_NAMESPACE"),
            pod_name,
            leader_election,
            lease_name: get("LEADER_LEASE_NAME").unwrap_or_else(|| "maia-operator-leader".into()),
            lease_duration: Duration::from_secs(lease_secs),
            admin_timeout: Duration::from_secs(admin_secs),
            log_output,
        })
    }
}

fn parse_bool(v: &str) -> anyhow::Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("expected a boolean"),
    }
}

fn parse_secs(v: Option<String>, default: u64, name: &str) -> anyhow::Result<u64> {
    let Some(v) = v else {
        return Ok(default);
    };
    let secs: u64 = v.parse().with_context(|| format!("{name}={v}"))?;
    anyhow::ensure!(secs > 0, "{name} must be positive");
    Ok(secs)
}

fn random_identity() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("maia-operator-{suffix}")
}
