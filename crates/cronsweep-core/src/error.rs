use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronsweepError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CronsweepError {
    /// Short, stable error code used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CronsweepError::Config(_) => "CONFIG_ERROR",
            CronsweepError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CronsweepError>;
