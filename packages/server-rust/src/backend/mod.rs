//! Backend runtime: correlation, dispatch, exclusivity and execution.

pub mod config;
pub mod context;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod exclusive;
pub mod handler;
pub mod health;
pub mod lifecycle;
pub mod registry;
pub mod responder;

pub use config::{
    BackendConfig, ErrorBroadcast, RequestOptions, SubscriptionOptions, DEFAULT_EXECUTION_TIMEOUT,
    DEFAULT_NAMESPACE, DEFAULT_TIMEOUT,
};
pub use context::HandlerContext;
pub use correlator::{Correlator, ResponseCallback};
pub use dispatcher::{Backend, DEFAULT_REPLY_GROUP};
pub use error::{ContextError, RegistrationError, WorkerExit};
pub use exclusive::ExclusivityCoordinator;
pub use handler::{Handler, HandlerKind, Subscription, SubscriptionId};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use responder::{Call, ExecutionOutcome, Responder};
