//! Checkpoint trust and restoration hooks.
//!
//! The runner never decides on its own whether a checkpoint may be used. It
//! asks a [`CheckpointProtocol`] supplied by the caller, which keeps the runner
//! pipeline-agnostic. [`ReleaseProtocol`] is the stock implementation: a
//! checkpoint is trusted when the repository head is unchanged and the
//! checkpoint-relevant options diff is empty, and it is used only when the
//! operator asked to resume.

use crate::{
    Checkpoint, CheckpointOptions, CheckpointPayload, CheckpointRejection, HeadProvider,
    PipelineError, WorkItem, WorkUnit, WorkUnits, diff_options, merge_state, snapshot_state,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub trait CheckpointProtocol<I, O>: Send + Sync {
    /// Runs once before the first stage. An error aborts the run before any
    /// stage has side effects, so every collaborator that
    /// `build_checkpoint_payload` needs should be probed here.
    fn preflight(&self, _options: &O) -> Result<(), PipelineError> {
        Ok(())
    }

    /// `Ok(())` when the checkpoint can be trusted for this invocation.
    fn validate_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        options: &O,
    ) -> Result<(), CheckpointRejection>;

    /// Operator intent layered on top of validity.
    fn should_use_checkpoint(&self, options: &O) -> bool;

    fn build_checkpoint_payload(
        &self,
        stage: &str,
        units: &WorkUnits<I>,
        options: &O,
    ) -> Result<CheckpointPayload, PipelineError>;

    /// Repopulates `units` in place from the checkpoint state.
    fn restore_from_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        units: &mut WorkUnits<I>,
    ) -> RestoreSummary;

    /// Notification only; the run continues fresh afterwards.
    fn on_validation_failed(&self, checkpoint: &Checkpoint, rejection: &CheckpointRejection);
}

pub type SharedCheckpointProtocol<I, O> = Arc<dyn CheckpointProtocol<I, O>>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: Vec<String>,
    pub dropped: Vec<String>,
}

/// Looks items up by identity in the current universe.
pub trait ItemResolver<I>: Send + Sync {
    fn resolve(&self, id: &str) -> Option<I>;
}

#[derive(Clone, Debug)]
pub struct StaticResolver<I> {
    items: BTreeMap<String, I>,
}

impl<I: WorkItem> StaticResolver<I> {
    pub fn new(items: impl IntoIterator<Item = I>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|item| (item.id().to_string(), item))
                .collect(),
        }
    }
}

impl<I: WorkItem> ItemResolver<I> for StaticResolver<I> {
    fn resolve(&self, id: &str) -> Option<I> {
        self.items.get(id).cloned()
    }
}

#[derive(Clone)]
pub struct ReleaseProtocol<I> {
    head: Arc<dyn HeadProvider>,
    resolver: Arc<dyn ItemResolver<I>>,
}

impl<I: WorkItem> ReleaseProtocol<I> {
    pub fn new(head: Arc<dyn HeadProvider>, resolver: Arc<dyn ItemResolver<I>>) -> Self {
        Self { head, resolver }
    }
}

impl<I, O> CheckpointProtocol<I, O> for ReleaseProtocol<I>
where
    I: WorkItem,
    O: CheckpointOptions,
{
    fn validate_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        options: &O,
    ) -> Result<(), CheckpointRejection> {
        let actual = self
            .head
            .head()
            .map_err(|error| CheckpointRejection::HeadUnavailable(error.to_string()))?;
        if actual != checkpoint.payload.repo_mark {
            return Err(CheckpointRejection::HeadChanged {
                expected: checkpoint.payload.repo_mark.clone(),
                actual,
            });
        }

        let differences = diff_options(&checkpoint.payload.options, &options.checkpoint_relevant());
        if !differences.is_empty() {
            return Err(CheckpointRejection::OptionsChanged(differences));
        }
        Ok(())
    }

    fn preflight(&self, _options: &O) -> Result<(), PipelineError> {
        self.head.head().map(|_| ())
    }

    fn should_use_checkpoint(&self, options: &O) -> bool {
        if options.resume_requested() {
            return true;
        }
        warn!("a valid checkpoint exists but resume was not requested; starting fresh");
        false
    }

    fn build_checkpoint_payload(
        &self,
        _stage: &str,
        units: &WorkUnits<I>,
        options: &O,
    ) -> Result<CheckpointPayload, PipelineError> {
        Ok(CheckpointPayload {
            options: options.checkpoint_relevant(),
            repo_mark: self.head.head()?,
            state: snapshot_state(units),
        })
    }

    fn restore_from_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        units: &mut WorkUnits<I>,
    ) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        for (id, saved) in &checkpoint.payload.state {
            let Some(item) = self.resolver.resolve(id) else {
                info!(item = %id, "checkpointed item no longer exists; dropping its state");
                summary.dropped.push(id.clone());
                continue;
            };
            let mut unit = units
                .get(id)
                .cloned()
                .unwrap_or_else(|| WorkUnit::new(item));
            merge_state(&mut unit.state, saved);
            units.insert(unit);
            summary.restored.push(id.clone());
        }
        summary
    }

    fn on_validation_failed(&self, checkpoint: &Checkpoint, rejection: &CheckpointRejection) {
        warn!(
            last_completed_stage = %checkpoint.last_completed_stage,
            reason = %rejection,
            "checkpoint is incompatible with this run; starting fresh"
        );
    }
}
