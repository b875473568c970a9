//! Single-active-replica election over a `coordination.k8s.io/v1` Lease.
//!
//! The lease is read and written through JSON so timestamps stay in RFC 3339
//! strings handled by `time`.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::crds::common::rfc3339;
use crate::error::ReconcileError;

/// What the lease currently says, reduced to the fields election needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaseState {
    pub holder: Option<String>,
    pub renew_time: Option<OffsetDateTime>,
    pub duration: Duration,
    pub transitions: i32,
    pub acquire_time: Option<String>,
}

impl LeaseState {
    pub fn from_lease(lease: &Lease) -> Result<Self, serde_json::Error> {
        let spec = serde_json::to_value(&lease.spec)?;
        let text = |k: &str| spec.get(k).and_then(|v| v.as_str()).map(str::to_string);
        Ok(Self {
            holder: text("holderIdentity").filter(|h| !h.is_empty()),
            renew_time: text("renewTime").and_then(|t| OffsetDateTime::parse(&t, &Rfc3339).ok()),
            duration: Duration::from_secs(
                spec.get("leaseDurationSeconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            ),
            transitions: spec
                .get("leaseTransitions")
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32,
            acquire_time: text("acquireTime"),
        })
    }

    pub fn expired(&self, now: OffsetDateTime) -> bool {
        match self.renew_time {
            Some(renewed) => now > renewed + self.duration,
            None => true,
        }
    }

    /// Free, ours already, or abandoned.
    pub fn claimable(&self, identity: &str, now: OffsetDateTime) -> bool {
        match self.holder.as_deref() {
            None => true,
            Some(h) if h == identity => true,
            Some(_) => self.expired(now),
        }
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    duration: Duration,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        namespace: &str,
        lease_name: impl Into<String>,
        identity: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.into(),
            identity: identity.into(),
            duration,
        }
    }

    fn renew_interval(&self) -> Duration {
        (self.duration / 3).max(Duration::from_secs(1))
    }

    /// One election round. `Ok(true)` means we hold the lease afterwards.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, ReconcileError> {
        let now = OffsetDateTime::now_utc();
        let pp = PostParams::default();
        let Some(current) = self.api.get_opt(&self.lease_name).await? else {
            let lease = lease_object(&self.lease_name, &self.identity, self.duration, now, None, 0)?;
            return match self.api.create(&pp, &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let state = LeaseState::from_lease(&current)?;
        if !state.claimable(&self.identity, now) {
            debug!(holder = ?state.holder, "lease held elsewhere");
            return Ok(false);
        }
        let ours = state.holder.as_deref() == Some(self.identity.as_str());
        let (acquire_time, transitions) = if ours {
            (state.acquire_time, state.transitions)
        } else {
            (None, state.transitions + 1)
        };
        let mut lease = lease_object(
            &self.lease_name,
            &self.identity,
            self.duration,
            now,
            acquire_time,
            transitions,
        )?;
        lease.metadata.resource_version = current.resource_version();
        match self.api.replace(&self.lease_name, &pp, &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until this replica holds the lease.
    pub async fn acquire(&self) -> Result<(), ReconcileError> {
        info!(lease = %self.lease_name, identity = %self.identity, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(lease = %self.lease_name, "became leader");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!(error = ?e, "leader election round failed"),
            }
            tokio::time::sleep(self.renew_interval()).await;
        }
    }

    /// Keeps renewing. Returns once the lease could not be renewed before it
    /// would have expired.
    pub async fn hold(&self) -> Result<(), ReconcileError> {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.renew_interval()).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(lease = %self.lease_name, "leadership taken over");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = ?e, "lease renewal failed");
                    if last_renewed.elapsed() >= self.duration {
                        return Err(e);
                    }
                }
            }
        }
    }
}

fn lease_object(
    name: &str,
    identity: &str,
    duration: Duration,
    now: OffsetDateTime,
    acquire_time: Option<String>,
    transitions: i32,
) -> Result<Lease, serde_json::Error> {
    let now = micro_time(now);
    serde_json::from_value(json!({
        "apiVersion": "coordination.k8s.io/v1",
        "kind": "Lease",
        "metadata": { "name": name },
        "spec": {
            "holderIdentity": identity,
            "leaseDurationSeconds": duration.as_secs(),
            "acquireTime": acquire_time.unwrap_or_else(|| now.clone()),
            "renewTime": now,
            "leaseTransitions": transitions,
        }
    }))
}

/// Lease timestamps are MicroTime; drop anything below a microsecond.
fn micro_time(t: OffsetDateTime) -> String {
    let micros = t.nanosecond() / 1_000 * 1_000;
    rfc3339(t.replace_nanosecond(micros).unwrap_or(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn state(holder: Option<&str>, renewed: Option<OffsetDateTime>) -> LeaseState {
        LeaseState {
            holder: holder.map(str::to_string),
            renew_time: renewed,
            duration: Duration::from_secs(15),
            ..Default::default()
        }
    }

    #[test]
    fn claimable_rules() {
        let t = datetime!(2026-01-01 00:00:00 UTC);
        assert!(state(None, None).claimable("me", t));
        assert!(state(Some("me"), Some(t)).claimable("me", t));
        assert!(!state(Some("other"), Some(t)).claimable("me", t + time::Duration::seconds(10)));
        assert!(state(Some("other"), Some(t)).claimable("me", t + time::Duration::seconds(16)));
        assert!(state(Some("other"), None).claimable("me", t));
    }

    #[test]
    fn lease_round_trips_through_state() {
        let t = datetime!(2026-01-01 00:00:00.123456789 UTC);
        let lease = lease_object("l", "me", Duration::from_secs(15), t, None, 2).unwrap();
        let s = LeaseState::from_lease(&lease).unwrap();
        assert_eq!(s.holder.as_deref(), Some("me"));
        assert_eq!(s.duration, Duration::from_secs(15));
        assert_eq!(s.transitions, 2);
        assert_eq!(s.renew_time, Some(datetime!(2026-01-01 00:00:00.123456 UTC)));
        assert!(!s.expired(t));
    }
}
