//! Worker side of isolated execution.
//!
//! A worker is a dedicated OS thread with its own tokio runtime. It has no
//! transport access: the response, outbound calls, and log records all leave
//! through the three duplex channels handed over by the parent. Tearing the
//! runtime down when the thread ends is the hard cutoff for any handler work
//! still running after the answer was sent.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::SinkExt;
use switchboard_core::codes::HANDLER_ERROR;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedWrite, LinesCodec};
use tracing::level_filters::LevelFilter;
use tracing::{error, warn};

use super::frame::{CommandFrame, FrameWriter, ResponseFrame, MAX_FRAME_LENGTH};
use crate::backend::context::Outbox;
use crate::backend::error::ContextError;
use crate::backend::handler::Subscription;
use crate::backend::responder::{Call, ExecutionOutcome, Responder};

/// How long the log pump may keep forwarding after the handler finished.
const LOG_GRACE: Duration = Duration::from_millis(100);

/// Response sent when an isolated handler returns with its answer deferred:
/// nothing can send it once the worker runtime is gone.
const DEFERRED_UNSENT: &str = "isolated handler returned without sending its deferred response";

/// Exit status of a worker whose runtime could not be built.
const RUNTIME_FAILURE_STATUS: i32 = 70;

// ---------------------------------------------------------------------------
// WorkerLink
// ---------------------------------------------------------------------------

/// The worker's handle on its response and command channels.
///
/// Writes are awaited inline so a relayed call is on the wire before the
/// handler continues.
#[derive(Clone)]
pub(crate) struct WorkerLink {
    responses: Arc<Mutex<FrameWriter<DuplexStream, ResponseFrame>>>,
    commands: Arc<Mutex<FrameWriter<DuplexStream, CommandFrame>>>,
}

impl WorkerLink {
    pub(crate) fn new(responses: DuplexStream, commands: DuplexStream) -> Self {
        Self {
            responses: Arc::new(Mutex::new(FrameWriter::new(responses))),
            commands: Arc::new(Mutex::new(FrameWriter::new(commands))),
        }
    }

    pub(crate) async fn send_response(&self, frame: &ResponseFrame) -> Result<(), ContextError> {
        self.responses.lock().await.send(frame).await.map_err(|err| {
            warn!(error = %err, "response channel write failed");
            ContextError::ChannelClosed
        })
    }

    pub(crate) async fn send_command(&self, frame: &CommandFrame) -> Result<(), ContextError> {
        self.commands.lock().await.send(frame).await.map_err(|err| {
            warn!(method = frame.method(), error = %err, "command channel write failed");
            ContextError::ChannelClosed
        })
    }
}

// ---------------------------------------------------------------------------
// Worker job
// ---------------------------------------------------------------------------

/// Everything a worker needs; moved onto the worker thread.
pub(crate) struct WorkerJob {
    pub subscription: Arc<Subscription>,
    pub call: Call,
    pub error_topic: Option<String>,
    pub responses: DuplexStream,
    pub commands: DuplexStream,
    pub logs: DuplexStream,
}

/// Starts a worker thread. Its result is the worker's exit status.
pub(crate) fn spawn(job: WorkerJob) -> io::Result<JoinHandle<i32>> {
    std::thread::Builder::new()
        .name("switchboard-worker".to_string())
        .spawn(move || run(job))
}

/// Sends each formatted log record as one line to the log pump.
#[derive(Clone)]
struct LogSink(mpsc::UnboundedSender<String>);

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in String::from_utf8_lossy(buf).lines() {
            if !line.is_empty() {
                let _ = self.0.send(line.to_string());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(job: WorkerJob) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(topic = %job.call.topic, error = %err, "failed to start worker runtime");
            return RUNTIME_FAILURE_STATUS;
        }
    };

    let WorkerJob {
        subscription,
        call,
        error_topic,
        responses,
        commands,
        logs,
    } = job;

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let sink = LogSink(line_tx);
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(LevelFilter::current())
        .with_writer(move || sink.clone())
        .finish();

    let pump = runtime.spawn(pump_logs(line_rx, logs));

    let status = {
        let _default = tracing::subscriber::set_default(subscriber);
        runtime.block_on(async move {
            let link = WorkerLink::new(responses, commands);
            let responder = Responder::new(call, Outbox::Relay(link), error_topic, true);
            let outcome = responder
                .execute(Arc::clone(&subscription.handler), subscription.execution_timeout)
                .await;
            match outcome {
                ExecutionOutcome::Exited(status) => status,
                _ => {
                    if responder.is_deferred() && !responder.is_sent() {
                        error!(topic = %responder.call().topic, "isolated handler returned with its response still deferred");
                        responder.fail(DEFERRED_UNSENT.to_string(), HANDLER_ERROR, None);
                        responder.flush().await;
                    }
                    0
                }
            }
        })
    };

    runtime.block_on(async {
        let _ = tokio::time::timeout(LOG_GRACE, pump).await;
    });
    runtime.shutdown_background();
    status
}

async fn pump_logs(mut lines: mpsc::UnboundedReceiver<String>, io: DuplexStream) {
    let mut writer = FramedWrite::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    while let Some(line) = lines.recv().await {
        if writer.send(line).await.is_err() {
            break;
        }
    }
}
