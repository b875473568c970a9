use thiserror::Error;

use crate::admin::AdminError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Admin(#[from] AdminError),
    /// A pipeline step failed; `reason` is what lands on the Degraded condition.
    #[error("{reason}: {source}")]
    Step {
        reason: &'static str,
        #[source]
        source: Box<ReconcileError>,
    },
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("object has no {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn step(reason: &'static str, err: impl Into<ReconcileError>) -> Self {
        ReconcileError::Step {
            reason,
            source: Box::new(err.into()),
        }
    }

    /// Conflicts, throttling, server-side failures and transport errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Kube(kube::Error::Api(ae)) => {
                ae.code == 409 || ae.code == 429 || ae.code >= 500
            }
            ReconcileError::Kube(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            ReconcileError::Admin(e) => e.is_transient(),
            ReconcileError::Step { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
