//! Pipeline steps.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use switchboard_core::codes::{HANDLER_ERROR, OK};
use switchboard_core::{is_truthy, merge_template, Reply, Value};

use super::combinator::Pipeline;
use crate::backend::{Backend, RequestOptions};

/// Errors from building a pipeline out of a declarative spec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline spec: {reason}")]
    InvalidPipelineSpec { reason: String },
}

impl PipelineError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidPipelineSpec {
            reason: reason.into(),
        }
    }
}

/// Pure function step. Success is a truthy output.
pub type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync + 'static>;

/// A request to one topic, with an optional message template.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestStep {
    /// Logical topic, without the request prefix.
    pub topic: String,
    /// Merged over (objects) or substituted for (anything else) the input.
    pub message: Option<Value>,
    /// `confirm_subscriber` defaults to `true` for pipeline requests.
    pub options: RequestOptions,
}

impl RequestStep {
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message: None,
            options: RequestOptions::default(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: Value) -> Self {
        self.message = Some(message);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    async fn execute(&self, backend: &Backend, input: Value) -> Reply {
        let message = merge_template(input, self.message.as_ref());
        let options = RequestOptions {
            confirm_subscriber: self.options.confirm_subscriber.or(Some(true)),
            ..self.options.clone()
        };
        backend.request(message, &self.topic, options).await
    }
}

/// One element of a pipeline.
#[derive(Clone)]
pub enum Step {
    Request(RequestStep),
    Transform(TransformFn),
    /// A nested pipeline, run with its own combinator and backend.
    Pipeline(Pipeline),
}

impl Step {
    /// Request step without a template.
    #[must_use]
    pub fn request(topic: impl Into<String>) -> Self {
        Self::Request(RequestStep::new(topic))
    }

    /// Request step with a message template.
    #[must_use]
    pub fn request_with(topic: impl Into<String>, message: Value) -> Self {
        Self::Request(RequestStep::new(topic).with_message(message))
    }

    #[must_use]
    pub fn transform(f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Self::Transform(Arc::new(f))
    }

    /// Parses `{"topic": str, "message": any?, "opts": {"timeout": secs?,
    /// "confirm_subscriber": bool?}?}`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidPipelineSpec`] for a non-object step, a
    /// missing or empty topic, non-object `opts`, or a wrongly typed option.
    pub fn from_json(spec: &Value) -> Result<Self, PipelineError> {
        let Value::Object(spec) = spec else {
            return Err(PipelineError::invalid("step must be an object"));
        };

        let topic = match spec.get("topic") {
            Some(Value::String(topic)) if !topic.is_empty() => topic.clone(),
            Some(Value::String(_)) | None | Some(Value::Null) => {
                return Err(PipelineError::invalid("request topic cannot be empty"));
            }
            Some(_) => return Err(PipelineError::invalid("request topic must be a string")),
        };

        let message = match spec.get("message") {
            None | Some(Value::Null) => None,
            Some(message) => Some(message.clone()),
        };

        let options = match spec.get("opts") {
            None | Some(Value::Null) => RequestOptions::default(),
            Some(Value::Object(opts)) => parse_options(opts)?,
            Some(_) => return Err(PipelineError::invalid("request opts must be an object")),
        };

        Ok(Self::Request(RequestStep {
            topic,
            message,
            options,
        }))
    }

    /// Runs the step on `input`.
    pub(crate) fn execute<'a>(&'a self, backend: &'a Backend, input: Value) -> BoxFuture<'a, Reply> {
        async move {
            match self {
                Self::Request(step) => step.execute(backend, input).await,
                Self::Transform(f) => {
                    let output = f(input);
                    let code = if is_truthy(&output) { OK } else { HANDLER_ERROR };
                    Reply::new(output, code)
                }
                Self::Pipeline(pipeline) => {
                    let outcome = pipeline.execute(input).await;
                    Reply::new(outcome.data, outcome.code.unwrap_or(OK))
                }
            }
        }
        .boxed()
    }
}

fn parse_options(opts: &serde_json::Map<String, Value>) -> Result<RequestOptions, PipelineError> {
    let mut options = RequestOptions::default();
    match opts.get("timeout") {
        None | Some(Value::Null) => {}
        Some(Value::Number(secs)) => {
            let timeout = secs
                .as_f64()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| PipelineError::invalid("timeout must be a non-negative number of seconds"))?;
            options.timeout = Some(timeout);
        }
        Some(_) => return Err(PipelineError::invalid("timeout must be a number of seconds")),
    }
    match opts.get("confirm_subscriber") {
        None | Some(Value::Null) => {}
        Some(Value::Bool(confirm)) => options.confirm_subscriber = Some(*confirm),
        Some(_) => return Err(PipelineError::invalid("confirm_subscriber must be a boolean")),
    }
    Ok(options)
}

impl From<RequestStep> for Step {
    fn from(step: RequestStep) -> Self {
        Self::Request(step)
    }
}

impl From<Pipeline> for Step {
    fn from(pipeline: Pipeline) -> Self {
        Self::Pipeline(pipeline)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(step) => f.debug_tuple("Request").field(step).finish(),
            Self::Transform(_) => f.write_str("Transform(..)"),
            Self::Pipeline(pipeline) => f.debug_tuple("Pipeline").field(pipeline).finish(),
        }
    }
}
