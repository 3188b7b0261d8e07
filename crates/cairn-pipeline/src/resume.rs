use crate::{Checkpoint, SharedStage};
use tracing::warn;

/// Index of the first stage to run when resuming from `checkpoint`.
///
/// The stage after `last_completed_stage`; `stages.len()` when that was the
/// final stage; 0 when the name is not part of the current pipeline.
pub fn resume_index<I, O>(checkpoint: &Checkpoint, stages: &[SharedStage<I, O>]) -> usize {
    match stages
        .iter()
        .position(|stage| stage.name() == checkpoint.last_completed_stage)
    {
        Some(position) => position + 1,
        None => {
            warn!(
                last_completed_stage = %checkpoint.last_completed_stage,
                "checkpointed stage is not part of this pipeline; resuming from the first stage"
            );
            0
        }
    }
}
