//! Switchboard runtime: request/response and fire-and-forget messaging over a
//! pluggable pub/sub transport, with exclusive dispatch, isolated handler
//! execution, and request pipelines.

pub mod backend;
pub mod isolation;
pub mod logging;
pub mod pipeline;
pub mod traits;
pub mod transport;

pub use backend::{
    Backend, BackendConfig, ContextError, ErrorBroadcast, HandlerContext, HandlerKind, RegistrationError,
    RequestOptions, SubscriptionId, SubscriptionOptions, WorkerExit,
};
pub use logging::{init_logging, LoggingConfig};
pub use pipeline::{Combinator, Pipeline, PipelineError, PipelineOutcome, Step};
pub use traits::{Delivery, LockStore, Transport};
pub use transport::MemoryBroker;
