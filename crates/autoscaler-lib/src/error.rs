//! Error taxonomy for the scaling engine and its collaborators

use std::time::Duration;
use thiserror::Error;

/// Failure to assemble a consistent cluster snapshot. The tick is skipped.
#[derive(Debug, Error)]
pub enum StateFetchError {
    #[error("orchestrator unreachable: {0}")]
    Unreachable(String),

    #[error("malformed {kind} {name}: {reason}")]
    Malformed {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("instance type catalog unavailable: {0}")]
    Catalog(#[from] ProvisionError),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

/// Failure reported by the provisioning collaborator
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("provisioning API unavailable: {0}")]
    Unavailable(String),

    #[error("provisioning request rejected: {0}")]
    Rejected(String),

    /// The request may have been acted on but no usable answer came back.
    /// Never retried, since a second launch could double the capacity.
    #[error("provisioning outcome unknown: {0}")]
    Unconfirmed(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

impl ProvisionError {
    /// Errors worth retrying within the same tick
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisionError::Unavailable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProvisionError::Timeout { .. })
    }

    /// The provider may or may not have carried out the request
    pub fn is_unconfirmed(&self) -> bool {
        matches!(
            self,
            ProvisionError::Unconfirmed(_) | ProvisionError::Timeout { .. }
        )
    }
}

/// Failure of an orchestrator write (cordon, evict, status patch)
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("orchestrator API error: {0}")]
    Api(String),

    #[error("orchestrator rejected request: {0}")]
    Rejected(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

impl OrchestratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OrchestratorError::Api(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OrchestratorError::Timeout { .. })
    }
}

/// Invalid configuration detected at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{0} is required")]
    Missing(&'static str),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
