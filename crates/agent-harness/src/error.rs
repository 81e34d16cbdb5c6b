use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("executable not found on PATH: {0}")]
    NotFound(String),

    #[error("agent did not finish within {secs}s and was killed")]
    Timeout { secs: u64 },

    #[error("process error: {0}")]
    Process(String),
}
