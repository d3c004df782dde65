use crate::media::OwnerId;
use crate::supervisor::ExitOutcome;

/// Everything that can go wrong while planning, starting or running a stream.
///
/// Every variant is scoped to one owner's session; none of them is fatal to
/// the engine itself.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("incomplete selection: {0}")]
    IncompleteSelection(String),

    #[error("invalid composition: {0}")]
    InvalidComposition(String),

    #[error("invalid destination: {0}")]
    DestinationInvalid(String),

    #[error("owner {0} already has an active session")]
    SessionAlreadyActive(OwnerId),

    #[error("owner {0} has no active session")]
    NoActiveSession(OwnerId),

    #[error("failed to spawn {program}: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder exited unexpectedly ({0})")]
    ProcessCrashed(ExitOutcome),

    #[error("upload rejected: {0}")]
    InvalidUpload(String),

    #[error("media catalog: {0}")]
    Catalog(#[from] anyhow::Error),
}

impl StreamError {
    /// Stable machine-readable name, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::IncompleteSelection(_) => "incomplete_selection",
            StreamError::InvalidComposition(_) => "invalid_composition",
            StreamError::DestinationInvalid(_) => "destination_invalid",
            StreamError::SessionAlreadyActive(_) => "session_already_active",
            StreamError::NoActiveSession(_) => "no_active_session",
            StreamError::SpawnFailure { .. } => "spawn_failure",
            StreamError::ProcessCrashed(_) => "process_crashed",
            StreamError::InvalidUpload(_) => "invalid_upload",
            StreamError::Catalog(_) => "catalog",
        }
    }

    /// Rejected before any session state was created.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            StreamError::IncompleteSelection(_)
                | StreamError::InvalidComposition(_)
                | StreamError::DestinationInvalid(_)
                | StreamError::InvalidUpload(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_kinds_are_classified() {
        assert!(StreamError::IncompleteSelection("x".into()).is_validation_error());
        assert!(StreamError::DestinationInvalid("x".into()).is_validation_error());
        assert!(!StreamError::NoActiveSession(OwnerId(1)).is_validation_error());
    }

    #[test]
    fn crash_message_carries_exit_status() {
        let err = StreamError::ProcessCrashed(ExitOutcome {
            code: Some(3),
            signal: None,
        });
        assert_eq!(err.kind(), "process_crashed");
        assert!(err.to_string().contains("exit code 3"));
    }
}
