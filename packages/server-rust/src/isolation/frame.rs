//! Line-delimited JSON frames exchanged between a parent and its worker.
//!
//! Each of the three channels carries one frame type per line:
//! [`ResponseFrame`] (worker -> parent, at most once), [`CommandFrame`]
//! (worker -> parent, outbound calls), and log records (worker -> parent,
//! one `tracing-subscriber` JSON record per line, read as [`LogFrame`]).

use std::marker::PhantomData;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Longest accepted line on any channel.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame codec error: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// The worker's single answer to its call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub sender: String,
    pub data: Value,
    pub code: u16,
}

/// An outbound call made by an isolated handler, performed by the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum CommandFrame {
    /// Raw publish.
    Publish {
        topic: String,
        data: Value,
        #[serde(default)]
        code: Option<u16>,
    },
    /// Correlated request on a logical topic. The response stays with the parent.
    Request {
        topic: String,
        data: Value,
        /// Sender timeout in milliseconds.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Signal on a logical topic.
    Signal { topic: String, data: Value },
}

impl CommandFrame {
    #[must_use]
    pub fn request(topic: impl Into<String>, data: Value, timeout: Option<Duration>) -> Self {
        Self::Request {
            topic: topic.into(),
            data,
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Sender timeout carried by a request frame.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Request { timeout_ms, .. } => timeout_ms.map(Duration::from_millis),
            _ => None,
        }
    }

    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Publish { .. } => "publish",
            Self::Request { .. } => "request",
            Self::Signal { .. } => "signal",
        }
    }
}

/// One JSON log record written by the worker's `fmt` subscriber.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogFrame {
    pub level: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl LogFrame {
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    /// The record's `message` field, or an empty string.
    #[must_use]
    pub fn message(&self) -> &str {
        self.fields.get("message").and_then(Value::as_str).unwrap_or_default()
    }

    /// Every field except `message`.
    #[must_use]
    pub fn extra_fields(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(key, _)| key.as_str() != "message")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)
}

/// Typed writer over a line-framed byte stream.
pub struct FrameWriter<W, T> {
    inner: FramedWrite<W, LinesCodec>,
    _frame: PhantomData<fn(T)>,
}

impl<W: AsyncWrite + Unpin, T: Serialize> FrameWriter<W, T> {
    pub fn new(io: W) -> Self {
        Self {
            inner: FramedWrite::new(io, codec()),
            _frame: PhantomData,
        }
    }

    /// Writes and flushes one frame.
    ///
    /// # Errors
    ///
    /// Encoding failures, or the reading side having gone away.
    pub async fn send(&mut self, frame: &T) -> Result<(), FrameError> {
        let line = serde_json::to_string(frame)?;
        self.inner.send(line).await?;
        Ok(())
    }
}

/// Typed reader over a line-framed byte stream.
pub struct FrameReader<R, T> {
    inner: FramedRead<R, LinesCodec>,
    _frame: PhantomData<fn() -> T>,
}

impl<R: AsyncRead + Unpin, T: DeserializeOwned> FrameReader<R, T> {
    pub fn new(io: R) -> Self {
        Self {
            inner: FramedRead::new(io, codec()),
            _frame: PhantomData,
        }
    }

    /// Next frame, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<T, FrameError>> {
        let line = match self.inner.next().await? {
            Ok(line) => line,
            Err(err) => return Some(Err(err.into())),
        };
        Some(serde_json::from_str(&line).map_err(FrameError::from))
    }
}

/// Raw line reader, for the log channel.
pub struct LineReader<R> {
    inner: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            inner: FramedRead::new(io, codec()),
        }
    }

    pub async fn next(&mut self) -> Option<Result<String, FrameError>> {
        self.inner
            .next()
            .await
            .map(|line| line.map_err(FrameError::from))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn command_frame_wire_shape() {
        let frame = CommandFrame::Publish {
            topic: "audit".to_string(),
            data: json!({"a": 1}),
            code: None,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"method": "publish", "args": {"topic": "audit", "data": {"a": 1}, "code": null}})
        );

        let parsed: CommandFrame =
            serde_json::from_str(r#"{"method":"signal","args":{"topic":"t","data":3}}"#).unwrap();
        assert_eq!(parsed, CommandFrame::Signal { topic: "t".to_string(), data: json!(3) });
        assert_eq!(parsed.method(), "signal");
    }

    #[test]
    fn request_frame_keeps_sub_second_timeouts() {
        let frame = CommandFrame::request("echo", json!("ping"), Some(Duration::from_millis(500)));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"method": "request", "args": {"topic": "echo", "data": "ping", "timeout_ms": 500}})
        );
        assert_eq!(frame.timeout(), Some(Duration::from_millis(500)));

        let untimed: CommandFrame =
            serde_json::from_str(r#"{"method":"request","args":{"topic":"t","data":null}}"#).unwrap();
        assert_eq!(untimed.timeout(), None);
    }

    #[test]
    fn log_frame_reads_fmt_json_records() {
        let line = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"WARN","fields":{"message":"disk low","free":3},"target":"app"}"#;
        let frame = LogFrame::parse(line).unwrap();
        assert_eq!(frame.level, "WARN");
        assert_eq!(frame.target, "app");
        assert_eq!(frame.message(), "disk low");
        assert_eq!(frame.extra_fields().get("free"), Some(&json!(3)));

        assert!(LogFrame::parse("plain text").is_none());
    }

    #[tokio::test]
    async fn frames_cross_a_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer: FrameWriter<_, ResponseFrame> = FrameWriter::new(a);
        let mut reader: FrameReader<_, ResponseFrame> = FrameReader::new(b);

        let frame = ResponseFrame {
            sender: "abc".to_string(),
            data: json!("line\nbreak"),
            code: 200,
        };
        writer.send(&frame).await.unwrap();
        drop(writer);

        assert_eq!(reader.next().await.unwrap().unwrap(), frame);
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_frame_is_an_error_not_eof() {
        let (a, b) = tokio::io::duplex(1024);
        let mut raw = FramedWrite::new(a, codec());
        raw.send("not json".to_string()).await.unwrap();
        drop(raw);

        let mut reader: FrameReader<_, ResponseFrame> = FrameReader::new(b);
        assert!(matches!(reader.next().await, Some(Err(FrameError::Json(_)))));
        assert!(reader.next().await.is_none());
    }
}
