use crate::{PipelineError, StageError, WorkUnits};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// One named step of a pipeline. A stage sees the whole live collection and
/// either completes or fails as a unit; partial external effects inside a
/// failing stage are the stage's own business.
#[async_trait]
pub trait Stage<I, O>: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the args value handed to the following stage.
    async fn run(
        &self,
        args: Value,
        options: &O,
        units: &mut WorkUnits<I>,
    ) -> Result<Value, StageError>;
}

pub type SharedStage<I, O> = Arc<dyn Stage<I, O>>;

pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, StageError>> + Send + 'a>>;

/// Closure-backed stage.
pub struct FnStage<F> {
    name: String,
    run: F,
}

impl<F> FnStage<F> {
    pub fn new<I, O>(name: impl Into<String>, run: F) -> Self
    where
        F: for<'a> Fn(Value, &'a O, &'a mut WorkUnits<I>) -> StageFuture<'a>,
    {
        Self {
            name: name.into(),
            run,
        }
    }
}

#[async_trait]
impl<I, O, F> Stage<I, O> for FnStage<F>
where
    I: Send + Sync,
    O: Send + Sync,
    F: for<'a> Fn(Value, &'a O, &'a mut WorkUnits<I>) -> StageFuture<'a> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        args: Value,
        options: &O,
        units: &mut WorkUnits<I>,
    ) -> Result<Value, StageError> {
        (self.run)(args, options, units).await
    }
}

pub fn validate_stage_names<I, O>(stages: &[SharedStage<I, O>]) -> Result<(), PipelineError> {
    if stages.is_empty() {
        return Err(PipelineError::InvalidPipeline(
            "pipeline has no stages".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for stage in stages {
        let name = stage.name();
        if name.trim().is_empty() {
            return Err(PipelineError::InvalidPipeline(
                "stage name cannot be empty".to_string(),
            ));
        }
        if !seen.insert(name) {
            return Err(PipelineError::InvalidPipeline(format!(
                "duplicate stage name '{name}'"
            )));
        }
    }
    Ok(())
}
