//! Status codes carried in the `code` field of response envelopes.
//!
//! Codes borrow HTTP semantics. Anything at or above 300 is an error class
//! and is eligible for the error broadcast channel.

/// Handler completed and answered (or was answered by default).
pub const OK: u16 = 200;

/// Subscriber confirmation was requested and nobody listens on the topic.
pub const NO_SUBSCRIBER: u16 = 404;

/// The caller's own wait budget ran out before any response arrived.
pub const SENDER_TIMEOUT: u16 = 499;

/// The handler failed: returned an error, panicked, or its worker crashed.
pub const HANDLER_ERROR: u16 = 500;

/// The handler exceeded its execution timeout.
pub const HANDLER_TIMEOUT: u16 = 504;

/// Lowest code treated as an error.
pub const ERROR_THRESHOLD: u16 = 300;

/// Returns `true` when `code` belongs to the error class.
#[must_use]
pub fn is_error(code: u16) -> bool {
    code >= ERROR_THRESHOLD
}
