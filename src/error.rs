use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by an automation session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AutomationError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("element not found: {0}")]
    NotFound(String),

    #[error("stale element reference: {0}")]
    StaleElement(String),

    #[error("click intercepted: {0}")]
    ClickIntercepted(String),

    #[error("browser session lost: {0}")]
    SessionLost(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl AutomationError {
    /// Transient errors are handled by the refresh ladder; a lost session is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, AutomationError::SessionLost(_))
    }
}

/// Reasons a run refuses to start. No runner is created when one of these is returned.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("an automation run is already in progress")]
    AlreadyRunning,

    #[error("no persons selected")]
    NoPersonsSelected,

    #[error("no source images found")]
    NoSourceImages,

    #[error("selected persons have no face images")]
    NoFaces,

    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start scheduler thread: {0}")]
    Spawn(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AutomationError::Timeout("upload".into()).is_transient());
        assert!(AutomationError::StaleElement("thumb".into()).is_transient());
        assert!(!AutomationError::SessionLost("gone".into()).is_transient());
    }

    #[test]
    fn test_start_error_messages() {
        assert_eq!(StartError::NoPersonsSelected.to_string(), "no persons selected");
        assert_eq!(StartError::NoSourceImages.to_string(), "no source images found");
    }
}
