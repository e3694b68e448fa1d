use thiserror::Error;

#[derive(Error, Debug)]
pub enum DuplicatorError {
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Element is detached from DOM: {0}")]
    ElementDetached(String),

    #[error("Simulated action failed: {0}")]
    ActionFailed(String),

    #[error("Extension bridge error: {0}")]
    Bridge(String),

    #[error("Script evaluation failed: {0}")]
    Script(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for DuplicatorError {
    fn from(err: serde_json::Error) -> Self {
        DuplicatorError::Script(format!("malformed script result: {err}"))
    }
}
