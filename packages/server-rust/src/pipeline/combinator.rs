//! Pipeline combinators.
//!
//! A [`Pipeline`] is an immutable value: a shared step list, the offset of
//! its first remaining step, a combinator tag, and the backend its request
//! steps go through. A continuation is the same pipeline with the offset
//! moved past the step that stopped it.

use std::fmt;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use switchboard_core::codes::OK;
use switchboard_core::Reply;
use tokio::task::JoinHandle;
use tracing::debug;

use super::step::{PipelineError, Step};
use crate::backend::Backend;

/// How a pipeline's steps are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// Each step's output is the next step's input; stops on the first non-200.
    Compose,
    /// Each step gets a fresh empty object; stops on the first non-200.
    AndAnd,
    /// Every step runs on a fresh empty object regardless of failures.
    Batch { record: bool },
    /// Every step runs concurrently on the same input.
    Parallel,
}

impl Combinator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compose => "compose",
            Self::AndAnd => "andand",
            Self::Batch { .. } => "batch",
            Self::Parallel => "parallel",
        }
    }
}

/// Result of running a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub data: Value,
    /// `None` only for an empty pipeline.
    pub code: Option<u16>,
    /// The unexecuted suffix when a short-circuiting pipeline stopped early.
    pub continuation: Option<Pipeline>,
}

impl PipelineOutcome {
    fn finished(data: Value, code: u16) -> Self {
        Self {
            data,
            code: Some(code),
            continuation: None,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == Some(OK)
    }
}

#[derive(Clone)]
pub struct Pipeline {
    backend: Backend,
    combinator: Combinator,
    steps: Arc<[Step]>,
    offset: usize,
}

impl Pipeline {
    #[must_use]
    pub fn new(backend: Backend, combinator: Combinator, steps: Vec<Step>) -> Self {
        Self {
            backend,
            combinator,
            steps: steps.into(),
            offset: 0,
        }
    }

    /// Builds a pipeline of request steps from a JSON array of step specs.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidPipelineSpec`] if `spec` is not an array or
    /// any element is not a valid step.
    pub fn from_json(backend: Backend, combinator: Combinator, spec: &Value) -> Result<Self, PipelineError> {
        let Value::Array(items) = spec else {
            return Err(PipelineError::InvalidPipelineSpec {
                reason: "pipeline must be an array of steps".to_string(),
            });
        };
        let steps = items.iter().map(Step::from_json).collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(backend, combinator, steps))
    }

    #[must_use]
    pub fn combinator(&self) -> Combinator {
        self.combinator
    }

    /// Steps not yet executed.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps[self.offset..]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps().is_empty()
    }

    /// Runs the pipeline on `input`.
    ///
    /// An empty pipeline yields `Value::Null` with no code. `AndAnd` and
    /// `Batch` ignore `input`.
    pub fn execute(&self, input: Value) -> BoxFuture<'static, PipelineOutcome> {
        let pipeline = self.clone();
        async move {
            if pipeline.is_empty() {
                return PipelineOutcome {
                    data: Value::Null,
                    code: None,
                    continuation: None,
                };
            }
            match pipeline.combinator {
                Combinator::Compose => pipeline.run_chain(input, true).await,
                Combinator::AndAnd => pipeline.run_chain(input, false).await,
                Combinator::Batch { record } => pipeline.run_batch(record).await,
                Combinator::Parallel => pipeline.run_parallel(input).await,
            }
        }
        .boxed()
    }

    /// Runs the pipeline on a spawned task and hands the outcome to `callback`.
    pub fn execute_with<F>(&self, input: Value, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(PipelineOutcome) + Send + 'static,
    {
        let run = self.execute(input);
        tokio::spawn(async move { callback(run.await) })
    }

    fn continuation(&self, executed: usize) -> Self {
        Self {
            backend: self.backend.clone(),
            combinator: self.combinator,
            steps: Arc::clone(&self.steps),
            offset: self.offset + executed,
        }
    }

    async fn run_chain(&self, input: Value, forward: bool) -> PipelineOutcome {
        let mut carried = input;
        for (index, step) in self.steps().iter().enumerate() {
            let step_input = if forward {
                std::mem::take(&mut carried)
            } else {
                fresh_input()
            };
            let reply = step.execute(&self.backend, step_input).await;
            if reply.code != OK {
                debug!(
                    combinator = self.combinator.as_str(),
                    step = index,
                    code = reply.code,
                    "pipeline stopped"
                );
                return PipelineOutcome {
                    data: reply.data,
                    code: Some(reply.code),
                    continuation: Some(self.continuation(index + 1)),
                };
            }
            carried = reply.data;
        }
        PipelineOutcome::finished(carried, OK)
    }

    async fn run_batch(&self, record: bool) -> PipelineOutcome {
        let mut results = Vec::new();
        let mut last = Reply::empty(OK);
        for step in self.steps() {
            let reply = step.execute(&self.backend, fresh_input()).await;
            if record {
                results.push(result_entry(&reply));
            }
            last = reply;
        }
        if record {
            PipelineOutcome::finished(Value::Array(results), last.code)
        } else {
            PipelineOutcome::finished(last.data, last.code)
        }
    }

    async fn run_parallel(&self, input: Value) -> PipelineOutcome {
        let mut pending: FuturesUnordered<_> = self
            .steps()
            .iter()
            .map(|step| step.execute(&self.backend, input.clone()))
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        let mut max_code = 0;
        while let Some(reply) = pending.next().await {
            max_code = max_code.max(reply.code);
            results.push(result_entry(&reply));
        }
        PipelineOutcome::finished(Value::Array(results), max_code)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("combinator", &self.combinator)
            .field("steps", &self.steps())
            .finish_non_exhaustive()
    }
}

fn fresh_input() -> Value {
    Value::Object(Map::new())
}

fn result_entry(reply: &Reply) -> Value {
    json!({"data": reply.data, "code": reply.code})
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::BackendConfig;
    use crate::transport::MemoryBroker;

    async fn backend() -> Backend {
        let broker = MemoryBroker::new();
        Backend::connect(
            BackendConfig {
                namespace: "sb".to_string(),
                ..BackendConfig::default()
            },
            Arc::new(broker.connect()),
            Arc::new(broker.lock_store()),
        )
        .await
        .unwrap()
    }

    fn add(key: &'static str) -> Step {
        Step::transform(move |mut value| {
            if let Value::Object(map) = &mut value {
                map.insert(key.to_string(), json!(key));
            }
            value
        })
    }

    fn fail() -> Step {
        Step::transform(|_| Value::Null)
    }

    #[tokio::test]
    async fn empty_pipeline_has_no_code() {
        let backend = backend().await;
        for pipeline in [
            backend.compose(vec![]),
            backend.andand(vec![]),
            backend.batch(vec![], true),
            backend.parallel(vec![]),
        ] {
            let outcome = pipeline.execute(json!({"x": 1})).await;
            assert_eq!(outcome.data, Value::Null);
            assert_eq!(outcome.code, None);
            assert!(outcome.continuation.is_none());
        }
    }

    #[tokio::test]
    async fn compose_threads_output() {
        let backend = backend().await;
        let outcome = backend
            .compose(vec![add("one"), add("two"), add("three")])
            .execute(json!({"seed": 0}))
            .await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.data, json!({"seed": 0, "one": "one", "two": "two", "three": "three"}));
        assert!(outcome.continuation.is_none());
    }

    #[tokio::test]
    async fn compose_stops_with_continuation() {
        let backend = backend().await;
        let outcome = backend
            .compose(vec![add("one"), fail(), add("three"), add("four")])
            .execute(json!({}))
            .await;
        assert_eq!(outcome.code, Some(500));
        assert_eq!(outcome.data, Value::Null);

        let rest = outcome.continuation.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest.combinator(), Combinator::Compose);
        let resumed = rest.execute(json!({"again": true})).await;
        assert_eq!(resumed.data, json!({"again": true, "three": "three", "four": "four"}));
        assert!(resumed.continuation.is_none());
    }

    #[tokio::test]
    async fn continuation_of_continuation_keeps_offsets() {
        let backend = backend().await;
        let first = backend
            .andand(vec![fail(), add("a"), fail(), add("b")])
            .execute(json!({}))
            .await;
        let second = first.continuation.unwrap().execute(json!({})).await;
        assert_eq!(second.code, Some(500));
        let third = second.continuation.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third.execute(json!({})).await.data, json!({"b": "b"}));
    }

    #[tokio::test]
    async fn andand_gives_each_step_fresh_input() {
        let backend = backend().await;
        let outcome = backend
            .andand(vec![add("one"), add("two")])
            .execute(json!({"ignored": 1}))
            .await;
        assert_eq!(outcome.data, json!({"two": "two"}));
        assert_eq!(outcome.code, Some(200));
    }

    #[tokio::test]
    async fn batch_runs_everything() {
        let backend = backend().await;
        let steps = vec![add("one"), fail(), add("three")];

        let outcome = backend.batch(steps.clone(), false).execute(json!({})).await;
        assert_eq!(outcome.data, json!({"three": "three"}));
        assert_eq!(outcome.code, Some(200));
        assert!(outcome.continuation.is_none());

        let recorded = backend.batch(steps, true).execute(json!({})).await;
        assert_eq!(
            recorded.data,
            json!([
                {"data": {"one": "one"}, "code": 200},
                {"data": null, "code": 500},
                {"data": {"three": "three"}, "code": 200},
            ])
        );
    }

    #[tokio::test]
    async fn parallel_collects_all_with_max_code() {
        let backend = backend().await;
        let outcome = backend
            .parallel(vec![add("one"), fail(), add("three")])
            .execute(json!({"shared": true}))
            .await;
        assert_eq!(outcome.code, Some(500));
        let Value::Array(results) = outcome.data else {
            panic!("expected an array");
        };
        assert_eq!(results.len(), 3);
        assert!(results.contains(&json!({"data": {"shared": true, "one": "one"}, "code": 200})));
        assert!(results.contains(&json!({"data": null, "code": 500})));
    }

    #[tokio::test]
    async fn nested_pipeline_is_a_step() {
        let backend = backend().await;
        let inner = backend.compose(vec![add("inner")]);
        let outcome = backend
            .compose(vec![add("outer"), inner.into(), add("last")])
            .execute(json!({}))
            .await;
        assert_eq!(outcome.data, json!({"outer": "outer", "inner": "inner", "last": "last"}));

        let failing = backend.andand(vec![fail()]);
        let outcome = backend.compose(vec![failing.into(), add("never")]).execute(json!({})).await;
        assert_eq!(outcome.code, Some(500));
        assert_eq!(outcome.continuation.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn request_step_without_subscriber_is_404() {
        let backend = backend().await;
        let outcome = backend
            .compose(vec![Step::request("nobody")])
            .execute(json!({}))
            .await;
        assert_eq!(outcome.code, Some(404));
    }

    #[tokio::test]
    async fn execute_with_delivers_outcome() {
        let backend = backend().await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        backend
            .compose(vec![add("one")])
            .execute_with(json!({}), move |outcome| {
                let _ = tx.send(outcome.data);
            })
            .await
            .unwrap();
        let data = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(data, json!({"one": "one"}));
    }

    #[tokio::test]
    async fn from_json_requires_an_array() {
        let backend = backend().await;
        let err = Pipeline::from_json(backend.clone(), Combinator::Compose, &json!({"topic": "a"})).unwrap_err();
        assert!(err.to_string().contains("array"));

        let pipeline = Pipeline::from_json(
            backend,
            Combinator::AndAnd,
            &json!([{"topic": "one"}, {"topic": "two", "message": {"k": 1}}]),
        )
        .unwrap();
        assert_eq!(pipeline.len(), 2);
        assert!(format!("{pipeline:?}").contains("AndAnd"));
    }
}
