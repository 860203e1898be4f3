use thiserror::Error;

/// Result of asking the refresh coordinator for a usable access token. Cloned
/// to every caller that waited on the same in-flight refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Fresh,
    Unauthenticated,
    TransientFailure(String),
}

impl RefreshOutcome {
    pub fn into_result(self) -> Result<(), SessionError> {
        match self {
            RefreshOutcome::Fresh => Ok(()),
            RefreshOutcome::Unauthenticated => Err(SessionError::Unauthenticated),
            RefreshOutcome::TransientFailure(reason) => Err(SessionError::TransientFailure(reason)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Terminal for the current session; credentials are gone and the caller
    /// must send the user back to login.
    #[error("session is no longer authenticated; sign in again")]
    Unauthenticated,
    #[error("temporary failure: {0}")]
    TransientFailure(String),
    #[error("rejected before sending: {0}")]
    ValidationRejected(String),
    #[error("send failed")]
    SendFailed,
    #[error("not connected to a room")]
    NotConnected,
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            return SessionError::Unauthenticated;
        }
        SessionError::TransientFailure(err.to_string())
    }
}
