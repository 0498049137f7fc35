//! Isolated handler execution.
//!
//! A subscription with `isolate` set runs each call on a dedicated worker
//! thread with its own runtime, connected to the parent by three
//! line-framed duplex channels: response, command relay, and log.

pub mod frame;
pub mod relay;
pub(crate) mod worker;

pub(crate) use relay::run_isolated;
pub use relay::WorkerStatus;
