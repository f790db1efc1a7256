//! Application-level error type shared across commands.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::services::analysis::AnalysisError;
use crate::services::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Server(#[from] krisis_server::ServerError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("backend initialization failed: {0}")]
    Backend(String),
}
