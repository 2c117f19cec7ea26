use thiserror::Error;

use wsgate_core::{ConfigError, GraphError, StageError};
use wsgate_state::StateError;

use crate::control::ControlError;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("graph incomplete: {0}")]
    GraphIncomplete(#[from] GraphError),

    #[error("control plane unavailable: {0}")]
    ControlPlaneUnavailable(String),

    #[error("reconciliation already in progress for {api_id}/{stage_name}")]
    ConflictingReconciliation { api_id: String, stage_name: String },

    #[error("control plane rejected request: {0}")]
    ControlPlaneRejected(String),

    #[error("missing context: {0}")]
    MissingContext(&'static str),

    /// The bind failed and putting the prior deployment back failed too.
    #[error("{original}; restoring the prior binding also failed: {restore}")]
    BindRestoreFailed {
        original: Box<ReconcileError>,
        restore: Box<ReconcileError>,
    },
}

/// Coarse classification used by callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileErrorKind {
    GraphIncomplete,
    ControlPlaneUnavailable,
    ConflictingReconciliation,
    ControlPlaneRejected,
    MissingContext,
}

impl ReconcileError {
    pub fn kind(&self) -> ReconcileErrorKind {
        match self {
            ReconcileError::GraphIncomplete(_) => ReconcileErrorKind::GraphIncomplete,
            ReconcileError::ControlPlaneUnavailable(_) => {
                ReconcileErrorKind::ControlPlaneUnavailable
            }
            ReconcileError::ConflictingReconciliation { .. } => {
                ReconcileErrorKind::ConflictingReconciliation
            }
            ReconcileError::ControlPlaneRejected(_) => ReconcileErrorKind::ControlPlaneRejected,
            ReconcileError::MissingContext(_) => ReconcileErrorKind::MissingContext,
            ReconcileError::BindRestoreFailed { original, .. } => original.kind(),
        }
    }

    /// Transient and coordination failures; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ReconcileErrorKind::ControlPlaneUnavailable
                | ReconcileErrorKind::ConflictingReconciliation
        )
    }
}

impl From<ControlError> for ReconcileError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Unavailable(msg) => ReconcileError::ControlPlaneUnavailable(msg),
            other => ReconcileError::ControlPlaneRejected(other.to_string()),
        }
    }
}

impl From<StageError> for ReconcileError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::MissingContext(field) => ReconcileError::MissingContext(field),
            other => ReconcileError::ControlPlaneRejected(other.to_string()),
        }
    }
}

/// Failure while writing a declared gateway into the state store.
#[derive(Debug, Error)]
pub enum SettleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type SettleResult<T> = Result<T, SettleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_failure_keeps_original_kind() {
        let err = ReconcileError::BindRestoreFailed {
            original: Box::new(ReconcileError::ControlPlaneRejected("bind".into())),
            restore: Box::new(ReconcileError::ControlPlaneUnavailable("restore".into())),
        };
        assert_eq!(err.kind(), ReconcileErrorKind::ControlPlaneRejected);
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.find("bind").unwrap() < msg.find("restore").unwrap());
    }

    #[test]
    fn retryable_kinds() {
        assert!(ReconcileError::ControlPlaneUnavailable("x".into()).is_retryable());
        assert!(
            ReconcileError::ConflictingReconciliation {
                api_id: "a".into(),
                stage_name: "s".into(),
            }
            .is_retryable()
        );
        assert!(!ReconcileError::MissingContext("region").is_retryable());
        assert!(!ReconcileError::from(GraphError::DuplicateRoute("x".into())).is_retryable());
    }

    #[test]
    fn control_errors_map_to_kinds() {
        assert_eq!(
            ReconcileError::from(ControlError::Unavailable("down".into())).kind(),
            ReconcileErrorKind::ControlPlaneUnavailable
        );
        assert_eq!(
            ReconcileError::from(ControlError::NotFound("stage".into())).kind(),
            ReconcileErrorKind::ControlPlaneRejected
        );
    }
}
