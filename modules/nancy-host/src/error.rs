use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to spawn plugin: {0}")]
    Spawn(std::io::Error),

    #[error("plugin stdin write failed: {0}")]
    Stdin(std::io::Error),

    #[error("plugin stdout read failed: {0}")]
    Stdout(std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("plugin process exited")]
    Exited,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("plugin {0} is not accepting requests")]
    NotReady(String),

    #[error("no plugin registered for file type {0:?}")]
    NoPluginForType(String),
}

impl HostError {
    /// Errors that justify a restart attempt rather than a terminal state.
    pub fn is_process_failure(&self) -> bool {
        matches!(
            self,
            HostError::Spawn(_)
                | HostError::Stdin(_)
                | HostError::Stdout(_)
                | HostError::Exited
                | HostError::Timeout(_)
        )
    }
}
