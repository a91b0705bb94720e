use crate::classification::ArtifactError;
use crate::config::ConfigError;
use crate::notify::NotifyError;
use crate::telemetry::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("notifier setup failed: {0}")]
    Notifier(#[from] NotifyError),
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}
