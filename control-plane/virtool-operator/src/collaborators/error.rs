#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("already dispatched: {0}")]
    AlreadyDispatched(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The request itself is invalid; repeating it unchanged fails again.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CollaboratorError {
    /// Errors that a later invocation may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Conflict(_) | CollaboratorError::Unavailable(_)
        )
    }
}

impl From<kube::Error> for CollaboratorError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) if ae.code == 404 => CollaboratorError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 => CollaboratorError::Conflict(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
                CollaboratorError::Rejected(ae.message.clone())
            }
            _ => CollaboratorError::Unavailable(e.to_string()),
        }
    }
}
