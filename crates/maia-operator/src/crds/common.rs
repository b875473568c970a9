use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Reference to a key inside a Secret in the same namespace.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct SecretKeySelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SecretKeySelector {
    pub fn key_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.key.as_deref() {
            Some(k) if !k.is_empty() => k,
            _ => default,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Status condition in the usual Kubernetes shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    pub fn observed(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Upserts `cond` by type. The transition time is carried over unless the
/// status actually flipped.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition, now: OffsetDateTime) {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => {
            cond.last_transition_time = if existing.status == cond.status {
                existing.last_transition_time.take()
            } else {
                Some(rfc3339(now))
            };
            *existing = cond;
        }
        None => {
            cond.last_transition_time = Some(rfc3339(now));
            conditions.push(cond);
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let t0 = OffsetDateTime::UNIX_EPOCH;
        let t1 = t0 + Duration::minutes(1);
        let t2 = t0 + Duration::minutes(2);
        let mut conds = Vec::new();

        set_condition(&mut conds, Condition::new("Ready", false, "Waiting", ""), t0);
        set_condition(&mut conds, Condition::new("Ready", false, "StillWaiting", "x"), t1);
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].reason, "StillWaiting");
        assert_eq!(conds[0].last_transition_time.as_deref(), Some("1970-01-01T00:00:00Z"));

        set_condition(&mut conds, Condition::new("Ready", true, "Up", ""), t2);
        assert!(conds[0].is_true());
        assert_eq!(conds[0].last_transition_time.as_deref(), Some("1970-01-01T00:02:00Z"));
    }

    #[test]
    fn selector_key_defaults_when_blank() {
        let mut sel = SecretKeySelector {
            name: "s".into(),
            key: None,
        };
        assert_eq!(sel.key_or("api-key"), "api-key");
        sel.key = Some(String::new());
        assert_eq!(sel.key_or("api-key"), "api-key");
        sel.key = Some("token".into());
        assert_eq!(sel.key_or("api-key"), "token");
    }
}
