pub mod config;
pub mod coordinator;
mod locks;
pub mod store;
pub mod sweeper;
pub mod types;

pub use config::{
    ConfigService, ExtractionConfig, RetentionConfig, ServerConfig, ServiceConfig, StorageConfig,
};
pub use coordinator::ConversionService;
pub use store::{ArtifactDraft, ArtifactStore, StagingArea, StoreError};
pub use sweeper::{RetentionSweeper, SweepReport, SweeperHandle, SweeperState};
pub use types::{validate_id, ArtifactRecord, ArtifactState, ID_MAX_LENGTH};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("duplicate artifact id: {0}")]
    DuplicateId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidIdentifier(id) => ServiceError::InvalidIdentifier(id),
            StoreError::DuplicateId(id) => ServiceError::DuplicateId(id),
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::Io { .. } => ServiceError::Internal(err.to_string()),
        }
    }
}
