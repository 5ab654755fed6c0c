use thiserror::Error;

/// Failures while constructing a generation client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("environment variable {0} with the API key is not set")]
    MissingApiKey(String),
    #[error("failed to build HTTP client: {0}")]
    Http(String),
}
