//! Pipeline engine: compose request steps, transforms, and nested pipelines.

pub mod combinator;
pub mod step;

pub use combinator::{Combinator, Pipeline, PipelineOutcome};
pub use step::{PipelineError, RequestStep, Step, TransformFn};
