use thiserror::Error;

/// Position tracker error types
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Innovation covariance is singular (det = {det:e}), update skipped")]
    SingularInnovation { det: f64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FusionError>;
