//! Per-call execution state.
//!
//! A [`Responder`] wraps one inbound call: it hands the request to the
//! handler, collects the response the handler sets, races the handler
//! against its execution timeout, and converts failures into responses.
//!
//! Idle -> Running -> {Completed | TimedOut | Failed} -> ResponseSent
//!
//! `ResponseSent` is reached through [`Responder::flush`], which is
//! idempotent: whichever of the handler, the timeout, or the failure path
//! flushes first wins and every later flush is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchboard_core::codes::{self, HANDLER_ERROR, HANDLER_TIMEOUT, OK};
use switchboard_core::report::now_millis;
use switchboard_core::{ErrorReport, Value};
use tracing::{debug, error, warn};

use super::context::{HandlerContext, Outbox};
use super::error::WorkerExit;
use super::handler::{Handler, HandlerKind};

/// How a handler execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The handler returned `Ok(())` within its execution timeout.
    Completed,
    /// The execution timeout elapsed first; a 504 was sent.
    TimedOut,
    /// The handler returned an error or panicked; a 500 was sent.
    Failed(String),
    /// An isolated handler asked its worker to exit with this status.
    Exited(i32),
}

/// The inbound call a responder serves.
#[derive(Debug, Clone)]
pub struct Call {
    /// Concrete topic the message arrived on.
    pub topic: String,
    pub body: Value,
    /// Caller id to answer, if the request carried one.
    pub sender: Option<String>,
    pub kind: HandlerKind,
}

#[derive(Debug, Default)]
struct PendingResponse {
    data: Value,
    code: Option<u16>,
    detail: Option<String>,
}

struct ResponderState {
    call: Call,
    isolated: bool,
    error_topic: Option<String>,
    outbox: Outbox,
    response: Mutex<PendingResponse>,
    deferred: AtomicBool,
    sent: AtomicBool,
}

/// Execution context of one inbound call. Cheap to clone.
#[derive(Clone)]
pub struct Responder {
    state: Arc<ResponderState>,
}

impl Responder {
    pub(crate) fn new(call: Call, outbox: Outbox, error_topic: Option<String>, isolated: bool) -> Self {
        Self {
            state: Arc::new(ResponderState {
                call,
                isolated,
                error_topic,
                outbox,
                response: Mutex::new(PendingResponse::default()),
                deferred: AtomicBool::new(false),
                sent: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn call(&self) -> &Call {
        &self.state.call
    }

    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.state.isolated
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.state.outbox
    }

    /// Sets the pending response without sending it.
    pub fn respond(&self, data: Value, code: u16) {
        if self.is_sent() {
            debug!(topic = %self.state.call.topic, code, "response already sent; ignoring");
            return;
        }
        let mut response = self.state.response.lock();
        response.data = data;
        response.code = Some(code);
    }

    /// Suppresses the automatic 200 on a clean return.
    pub fn delay_response(&self) {
        self.state.deferred.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.state.deferred.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.state.sent.load(Ordering::Acquire)
    }

    /// Runs `handler` under `timeout` and sends the resulting response.
    ///
    /// The handler runs in its own task; if the timeout wins, that task is
    /// left running and anything it sends later is discarded.
    pub async fn execute(&self, handler: Arc<dyn Handler>, timeout: Duration) -> ExecutionOutcome {
        let ctx = HandlerContext::new(self.clone());
        let task = tokio::spawn(async move { handler.call(ctx).await });

        let outcome = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => ExecutionOutcome::Completed,
            Ok(Ok(Err(err))) => match err.downcast_ref::<WorkerExit>() {
                Some(WorkerExit(status)) if self.state.isolated => ExecutionOutcome::Exited(*status),
                _ => ExecutionOutcome::Failed(format!("{err:#}")),
            },
            Ok(Err(join_err)) => ExecutionOutcome::Failed(panic_description(join_err)),
            Err(_elapsed) => ExecutionOutcome::TimedOut,
        };

        let topic = &self.state.call.topic;
        match &outcome {
            ExecutionOutcome::Completed => {
                if self.is_deferred() {
                    debug!(%topic, "response deferred by handler");
                    return outcome;
                }
                if self.state.call.kind == HandlerKind::Reply {
                    let mut response = self.state.response.lock();
                    response.code.get_or_insert(OK);
                }
            }
            ExecutionOutcome::TimedOut => {
                let description = format!("execution timed out after {}s", timeout.as_secs_f64());
                error!(%topic, sender = ?self.state.call.sender, timeout_ms = timeout.as_millis(), "handler timed out");
                self.fail(description, HANDLER_TIMEOUT, None);
            }
            ExecutionOutcome::Failed(description) => {
                error!(%topic, sender = ?self.state.call.sender, error = %description, "handler failed");
                self.fail(description.clone(), HANDLER_ERROR, Some(description.clone()));
            }
            ExecutionOutcome::Exited(status) => {
                warn!(%topic, status, "isolated handler requested worker exit");
                return outcome;
            }
        }

        self.flush().await;
        outcome
    }

    /// Overrides whatever the handler set with a failure response.
    ///
    /// A response that already went out is left alone.
    pub(crate) fn fail(&self, description: String, code: u16, detail: Option<String>) {
        if self.is_sent() {
            return;
        }
        let mut response = self.state.response.lock();
        response.data = Value::String(description);
        response.code = Some(code);
        response.detail = detail;
    }

    /// Sends the pending response once.
    ///
    /// Reply calls with a sender get a response envelope; error-class codes
    /// are broadcast when an error topic is configured. Returns `false` if
    /// the response had already been sent.
    pub async fn flush(&self) -> bool {
        if self.state.sent.swap(true, Ordering::AcqRel) {
            return false;
        }

        let (data, code, detail) = {
            let mut response = self.state.response.lock();
            (
                std::mem::take(&mut response.data),
                response.code,
                response.detail.take(),
            )
        };
        let call = &self.state.call;

        let code = match (call.kind, code) {
            (HandlerKind::Reply, code) => code.unwrap_or(OK),
            (HandlerKind::Slot, Some(code)) => code,
            (HandlerKind::Slot, None) => return true,
        };

        if codes::is_error(code) {
            metrics::counter!("switchboard_handler_errors_total", "code" => code.to_string()).increment(1);
            self.report_error(code, &data, detail).await;
        }

        if call.kind == HandlerKind::Reply {
            match &call.sender {
                Some(sender) => {
                    if let Err(err) = self.state.outbox.send_response(sender, data, code).await {
                        error!(topic = %call.topic, %sender, error = %err, "failed to send response");
                    }
                }
                None => warn!(topic = %call.topic, code, "reply call without a sender; response dropped"),
            }
        }
        true
    }

    async fn report_error(&self, code: u16, data: &Value, detail: Option<String>) {
        let Some(error_topic) = &self.state.error_topic else {
            return;
        };
        let call = &self.state.call;
        let report = ErrorReport {
            code,
            sender: call.sender.clone(),
            topic: call.topic.clone(),
            request_data: call.body.clone(),
            userdata: data.clone(),
            backtrace: detail,
            timestamp: now_millis(),
            multi_process: self.state.isolated,
        };
        let payload = match serde_json::to_value(&report) {
            Ok(payload) => payload,
            Err(err) => {
                error!(topic = %call.topic, error = %err, "failed to encode error report");
                return;
            }
        };
        if let Err(err) = self.state.outbox.publish(error_topic, payload, Some(code)).await {
            error!(topic = %call.topic, %error_topic, error = %err, "failed to broadcast error report");
        }
    }
}

fn panic_description(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "handler task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
