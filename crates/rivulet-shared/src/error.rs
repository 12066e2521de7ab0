use thiserror::Error;

/// Errors surfaced to callers of the coordinator.
///
/// The type is `Clone` because one failed batch round trip is fanned out to
/// every caller that was coalesced into it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamsError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Streams coordinator has shut down")]
    Shutdown,
}

impl StreamsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamsError::NotFound(_))
    }
}

impl From<serde_json::Error> for StreamsError {
    fn from(e: serde_json::Error) -> Self {
        StreamsError::Decode(e.to_string())
    }
}

/// Malformed identity parameters, rejected before anything is sent.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("publisherId is empty")]
    EmptyPublisherId,

    #[error("streamName is empty")]
    EmptyStreamName,

    #[error("userId is empty")]
    EmptyUserId,

    #[error("unknown access level {0}")]
    UnknownLevel(i32),
}
