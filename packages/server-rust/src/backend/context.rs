//! Handler-facing API.
//!
//! A [`HandlerContext`] is what a handler receives for one call. Outbound
//! traffic goes through an [`Outbox`]: directly to the backend for in-process
//! handlers, or relayed over the command channel for isolated workers.

use switchboard_core::{Reply, Value};
use tracing::error;

use super::config::{RequestOptions, SubscriptionOptions};
use super::dispatcher::Backend;
use super::error::{ContextError, RegistrationError};
use super::handler::{Handler, SubscriptionId};
use super::responder::{Call, Responder};
use crate::isolation::frame::{CommandFrame, ResponseFrame};
use crate::isolation::worker::WorkerLink;

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Where a handler's outbound traffic goes.
#[derive(Clone)]
pub(crate) enum Outbox {
    /// In-process: straight to the backend.
    Direct(Backend),
    /// Isolated worker: serialized onto the parent's channels.
    Relay(WorkerLink),
}

impl Outbox {
    pub(crate) async fn send_response(&self, sender: &str, data: Value, code: u16) -> Result<(), ContextError> {
        match self {
            Self::Direct(backend) => Ok(backend.send_response(sender, data, code).await?),
            Self::Relay(link) => {
                link.send_response(&ResponseFrame {
                    sender: sender.to_string(),
                    data,
                    code,
                })
                .await
            }
        }
    }

    /// Publishes on a raw topic.
    pub(crate) async fn publish(&self, topic: &str, data: Value, code: Option<u16>) -> Result<(), ContextError> {
        match self {
            Self::Direct(backend) => Ok(backend.publish_envelope(topic, data, code).await?),
            Self::Relay(link) => {
                link.send_command(&CommandFrame::Publish {
                    topic: topic.to_string(),
                    data,
                    code,
                })
                .await
            }
        }
    }

    async fn signal(&self, topic: &str, data: Value) -> Result<(), ContextError> {
        match self {
            Self::Direct(backend) => Ok(backend.signal(data, topic).await?),
            Self::Relay(link) => {
                link.send_command(&CommandFrame::Signal {
                    topic: topic.to_string(),
                    data,
                })
                .await
            }
        }
    }

    async fn request(&self, topic: &str, data: Value, options: RequestOptions) -> Result<Reply, ContextError> {
        match self {
            Self::Direct(backend) => Ok(backend.request(data, topic, options).await),
            Self::Relay(link) => {
                link.send_command(&CommandFrame::request(topic, data, options.timeout))
                    .await?;
                error!(%topic, "request relayed from an isolated worker; its response cannot reach the worker");
                Err(ContextError::NoResponseInWorker {
                    topic: topic.to_string(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// One inbound call as seen by its handler.
#[derive(Clone)]
pub struct HandlerContext {
    responder: Responder,
}

impl HandlerContext {
    pub(crate) fn new(responder: Responder) -> Self {
        Self { responder }
    }

    fn call(&self) -> &Call {
        self.responder.call()
    }

    /// Concrete topic the message arrived on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.call().topic
    }

    /// Request body.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.call().body
    }

    /// Caller id, if the message carried one.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.call().sender.as_deref()
    }

    /// `true` inside an isolated worker.
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.responder.is_isolated()
    }

    /// The backend, unless running in an isolated worker.
    #[must_use]
    pub fn backend(&self) -> Option<&Backend> {
        match self.responder.outbox() {
            Outbox::Direct(backend) => Some(backend),
            Outbox::Relay(_) => None,
        }
    }

    /// Sets the response sent when the handler returns.
    pub fn respond(&self, data: Value, code: u16) {
        self.responder.respond(data, code);
    }

    /// Sets and sends the response immediately.
    ///
    /// Later calls, and the automatic response on return, are no-ops.
    pub async fn respond_now(&self, data: Value, code: u16) {
        self.responder.respond(data, code);
        self.responder.flush().await;
    }

    /// Keeps the call open after the handler returns, until
    /// [`respond_now`](Self::respond_now) is called.
    pub fn delay_response(&self) {
        self.responder.delay_response();
    }

    /// Publishes `data` on a raw topic, uncorrelated.
    pub async fn publish(&self, data: Value, topic: &str) -> Result<(), ContextError> {
        self.responder.outbox().publish(topic, data, None).await
    }

    /// Signals slot handlers on `topic`.
    pub async fn signal(&self, data: Value, topic: &str) -> Result<(), ContextError> {
        self.responder.outbox().signal(topic, data).await
    }

    /// Requests `topic` and waits for the reply.
    ///
    /// # Errors
    ///
    /// In an isolated worker the request is still sent, but
    /// [`ContextError::NoResponseInWorker`] is returned since the response is
    /// addressed to the parent.
    pub async fn request(&self, data: Value, topic: &str, options: RequestOptions) -> Result<Reply, ContextError> {
        self.responder.outbox().request(topic, data, options).await
    }

    /// Registers a reply handler from inside a handler.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::IsolatedRegistration`] in an isolated worker, or
    /// any error from [`Backend::reply_to`].
    pub async fn reply_to(
        &self,
        topic: &str,
        options: SubscriptionOptions,
        handler: impl Handler,
    ) -> Result<SubscriptionId, RegistrationError> {
        self.registering_backend(topic)?
            .reply_to(topic, options, handler)
            .await
    }

    /// Registers a slot handler from inside a handler.
    ///
    /// # Errors
    ///
    /// As for [`reply_to`](Self::reply_to).
    pub async fn slot(
        &self,
        topic: &str,
        options: SubscriptionOptions,
        handler: impl Handler,
    ) -> Result<SubscriptionId, RegistrationError> {
        self.registering_backend(topic)?
            .slot(topic, options, handler)
            .await
    }

    fn registering_backend(&self, topic: &str) -> Result<&Backend, RegistrationError> {
        self.backend().ok_or_else(|| {
            error!(%topic, "dynamic registration from an isolated worker is not supported");
            RegistrationError::IsolatedRegistration
        })
    }
}
