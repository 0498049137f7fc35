use std::fmt;

use switchboard_core::TopicError;

/// Errors from registering or removing subscriptions.
///
/// These are setup-time failures: they propagate to the registering code
/// instead of travelling through the response path.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("duplicate exclusive handler for {topic}:{group}")]
    DuplicateExclusiveHandler { topic: String, group: String },
    #[error("exclusive handler on {topic} requires a non-empty group")]
    MissingExclusiveGroup { topic: String },
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("isolated handlers cannot register subscriptions")]
    IsolatedRegistration,
    #[error("transport refused subscription to {topic}: {source}")]
    Transport {
        topic: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("backend is stopped")]
    BackendStopped,
}

/// Errors surfaced to handler code by [`HandlerContext`](super::HandlerContext).
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("backend is stopped")]
    BackendStopped,
    #[error("request to {topic} was relayed from an isolated worker; its response cannot reach the worker")]
    NoResponseInWorker { topic: String },
    #[error("isolation channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Handler-returnable error asking an isolated worker to exit with `status`
/// without answering.
///
/// Outside isolation this is an ordinary handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit(pub i32);

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker exit requested with status {}", self.0)
    }
}

impl std::error::Error for WorkerExit {}
