use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

impl DomainError {
    /// Rejections the caller can resolve by re-fetching current state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict | Self::StateConflict(_))
    }
}
