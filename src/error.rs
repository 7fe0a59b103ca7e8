use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("config error: {0}")]
    Config(String),

    #[error("pattern compilation failed: {0}")]
    Pattern(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;
