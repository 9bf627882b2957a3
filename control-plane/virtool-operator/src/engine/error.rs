use crate::collaborators::CollaboratorError;

/// A declared spec the engine refuses to act on. Reported as a condition,
/// never as a reconcile error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("unknown update strategy type {0:?} (expected RollingUpdate or Recreate)")]
    UnknownStrategy(String),

    #[error("invalid {field}: {value:?}")]
    MalformedIntOrPercent { field: &'static str, value: String },

    #[error("component {component}: replicas must not be negative (got {replicas})")]
    NegativeReplicas { component: String, replicas: i32 },

    #[error("component {component}: {field} must not be empty")]
    EmptyField {
        component: String,
        field: &'static str,
    },

    #[error("component name {0:?} is not a valid DNS-1123 label")]
    InvalidComponentName(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transient collaborator error: {0}")]
    Transient(#[from] CollaboratorError),

    #[error("status write lost {attempts} consecutive races")]
    ConflictRetriesExhausted { attempts: u32 },

    #[error("reconcile cancelled")]
    Cancelled,
}
