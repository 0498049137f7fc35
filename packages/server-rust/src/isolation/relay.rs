//! Parent side of isolated execution.
//!
//! Spawned -> WorkerRunning -> {WorkerExited(0) | WorkerExited(n) | WorkerCrashed}
//!
//! The parent relays the worker's outbound calls and log records while
//! waiting for its single response frame, then joins the worker thread. A
//! worker that exits nonzero or crashes without answering gets a synthesized
//! 500, sent through an in-process responder.

use std::sync::Arc;
use std::time::Duration;

use switchboard_core::codes::HANDLER_ERROR;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::frame::{CommandFrame, FrameReader, LineReader, LogFrame, ResponseFrame};
use super::worker::{self, WorkerJob};
use crate::backend::context::Outbox;
use crate::backend::handler::Subscription;
use crate::backend::responder::{Call, Responder};
use crate::backend::{Backend, RequestOptions};

/// Buffer size of each duplex channel.
const CHANNEL_CAPACITY: usize = 64 * 1024;

/// How long relay tasks may run after the worker is gone before being aborted.
const RELAY_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How a worker thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Exited(i32),
    /// The thread panicked or could not be joined.
    Crashed(String),
}

impl WorkerStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Exited(status) => format!("isolated worker exited with status {status}"),
            Self::Crashed(reason) => format!("isolated worker crashed: {reason}"),
        }
    }
}

/// Runs one call of `subscription` in an isolated worker.
pub(crate) async fn run_isolated(backend: &Backend, subscription: &Arc<Subscription>, call: Call) {
    let (responses_parent, responses_worker) = tokio::io::duplex(CHANNEL_CAPACITY);
    let (commands_parent, commands_worker) = tokio::io::duplex(CHANNEL_CAPACITY);
    let (logs_parent, logs_worker) = tokio::io::duplex(CHANNEL_CAPACITY);

    let topic = call.topic.clone();
    let job = WorkerJob {
        subscription: Arc::clone(subscription),
        call: call.clone(),
        error_topic: backend.error_topic().map(str::to_string),
        responses: responses_worker,
        commands: commands_worker,
        logs: logs_worker,
    };

    let thread = match worker::spawn(job) {
        Ok(thread) => thread,
        Err(err) => {
            let status = WorkerStatus::Crashed(format!("spawn failed: {err}"));
            report_crash(backend, call, &status).await;
            return;
        }
    };
    debug!(%topic, "isolated worker spawned");

    let command_relay = tokio::spawn(relay_commands(backend.clone(), commands_parent, topic.clone()));
    let log_relay = tokio::spawn(relay_logs(logs_parent, topic.clone()));

    let answered = forward_response(backend, responses_parent, &topic).await;

    let status = match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(status)) => WorkerStatus::Exited(status),
        Ok(Err(panic)) => WorkerStatus::Crashed(panic_message(panic.as_ref())),
        Err(err) => WorkerStatus::Crashed(err.to_string()),
    };

    join_relay(command_relay, "command", &topic).await;
    join_relay(log_relay, "log", &topic).await;

    if status.is_success() {
        debug!(%topic, "isolated worker exited cleanly");
    } else if answered {
        warn!(%topic, status = %status.describe(), "isolated worker failed after answering");
    } else {
        report_crash(backend, call, &status).await;
    }
}

/// Forwards the worker's response frame, if any. Returns `true` if one was sent.
async fn forward_response(backend: &Backend, io: DuplexStream, topic: &str) -> bool {
    let mut responses: FrameReader<_, ResponseFrame> = FrameReader::new(io);
    match responses.next().await {
        Some(Ok(frame)) => {
            if let Err(err) = backend.send_response(&frame.sender, frame.data, frame.code).await {
                error!(%topic, sender = %frame.sender, error = %err, "failed to forward isolated response");
            }
            true
        }
        Some(Err(err)) => {
            error!(%topic, error = %err, "unreadable response frame from isolated worker");
            false
        }
        None => false,
    }
}

/// Synthesizes the 500 for a worker that ended without answering.
///
/// The responder runs in-process, so the error report carries
/// `multi_process = false`; the subscription stays isolated.
async fn report_crash(backend: &Backend, call: Call, status: &WorkerStatus) {
    let description = status.describe();
    error!(topic = %call.topic, sender = ?call.sender, status = %description, "isolated worker failed without answering");
    metrics::counter!("switchboard_worker_crashes_total").increment(1);

    let responder = Responder::new(
        call,
        Outbox::Direct(backend.clone()),
        backend.error_topic().map(str::to_string),
        false,
    );
    responder.fail(description.clone(), HANDLER_ERROR, Some(description));
    responder.flush().await;
}

/// Performs the worker's outbound calls until the channel closes.
async fn relay_commands(backend: Backend, io: DuplexStream, worker_topic: String) {
    let mut commands: FrameReader<_, CommandFrame> = FrameReader::new(io);
    while let Some(frame) = commands.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%worker_topic, error = %err, "unreadable command frame from isolated worker");
                continue;
            }
        };
        let method = frame.method();
        let timeout = frame.timeout();
        let result = match frame {
            CommandFrame::Publish { topic, data, code } => backend.publish_envelope(&topic, data, code).await,
            CommandFrame::Signal { topic, data } => backend.signal(data, &topic).await,
            CommandFrame::Request { topic, data, .. } => {
                let mut options = RequestOptions::default();
                if let Some(timeout) = timeout {
                    options = options.with_timeout(timeout);
                }
                let target = topic.clone();
                backend
                    .request_with(
                        data,
                        &topic,
                        options,
                        Box::new(move |reply| {
                            debug!(topic = %target, code = reply.code, "response to relayed request discarded");
                        }),
                    )
                    .await;
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(%worker_topic, method, error = %err, "relayed call failed");
        }
    }
}

/// Re-emits the worker's log records at their original level.
async fn relay_logs(io: DuplexStream, worker_topic: String) {
    let mut lines = LineReader::new(io);
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => emit(&line, &worker_topic),
            Err(err) => {
                warn!(%worker_topic, error = %err, "log channel read failed");
                break;
            }
        }
    }
}

fn emit(line: &str, worker_topic: &str) {
    let Some(record) = LogFrame::parse(line) else {
        info!(isolated = true, %worker_topic, "{line}");
        return;
    };
    let message = record.message();
    let worker_target = record.target.as_str();
    let fields = serde_json::Value::Object(record.extra_fields());
    match record.level.as_str() {
        "ERROR" => error!(isolated = true, %worker_topic, worker_target, %fields, "{message}"),
        "WARN" => warn!(isolated = true, %worker_topic, worker_target, %fields, "{message}"),
        "INFO" => info!(isolated = true, %worker_topic, worker_target, %fields, "{message}"),
        "DEBUG" => debug!(isolated = true, %worker_topic, worker_target, %fields, "{message}"),
        _ => tracing::trace!(isolated = true, %worker_topic, worker_target, %fields, "{message}"),
    }
}

async fn join_relay(mut task: JoinHandle<()>, name: &str, topic: &str) {
    if tokio::time::timeout(RELAY_JOIN_TIMEOUT, &mut task).await.is_err() {
        warn!(%topic, relay = name, "relay did not finish; aborting");
        task.abort();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
