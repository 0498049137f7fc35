//! Switchboard core: wire envelope, topic naming, status codes, and shared value types.
//!
//! Nothing in this crate touches a runtime or a transport; it is the
//! vocabulary shared by the server runtime and by anything that speaks the
//! same wire format.

pub mod codes;
pub mod envelope;
pub mod report;
pub mod topic;
pub mod types;

pub use envelope::{create_request, parse_request, parse_response, Envelope, ParsedRequest, ParsedResponse};
pub use report::ErrorReport;
pub use serde_json::Value;
pub use topic::{TopicError, TopicPattern, TopicSpace};
pub use types::{is_truthy, merge_template, CallerId, Reply};

