//! Transport drivers.
//!
//! Only the in-process broker ships with the crate; network brokers plug in
//! through the [`Transport`](crate::traits::Transport) and
//! [`LockStore`](crate::traits::LockStore) traits.

pub mod memory;

pub use memory::{ConnectionId, MemoryBroker, MemoryLockStore, MemoryTransport};
