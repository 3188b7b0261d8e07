use crate::{
    Checkpoint, CheckpointEvent, CheckpointStore, EXIT_STAGE_FAILURE, EXIT_SUCCESS,
    PipelineError, PipelineEvent, RunEvent, RunEventKind, RunEventSink, SharedCheckpointProtocol,
    SharedStage, StageEvent, StageFailure, WorkItem, WorkUnits, is_expired, now_millis,
    resume_index, validate_stage_names,
};
use serde_json::Value;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Clone, Default)]
pub struct RunConfig {
    /// Checkpoints older than this are treated as absent.
    pub expiration: Option<Duration>,
    pub events: RunEventSink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Success,
    Fail,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineRunResult<I> {
    pub status: PipelineStatus,
    /// `last_completed_stage` of the checkpoint this run resumed from.
    pub resumed_from: Option<String>,
    pub executed_stages: Vec<String>,
    pub failure: Option<StageFailure>,
    /// Args returned by the last successful stage, or the args handed to the
    /// stage that failed.
    pub args: Value,
    pub units: WorkUnits<I>,
}

impl<I> PipelineRunResult<I> {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            PipelineStatus::Success => EXIT_SUCCESS,
            PipelineStatus::Fail => EXIT_STAGE_FAILURE,
        }
    }
}

/// Sequences stages, consults the checkpoint protocol, and persists a
/// checkpoint after every stage that completes.
///
/// Mutual exclusion between concurrent runs against the same checkpoint file
/// is the caller's responsibility; the runner takes no locks.
pub struct PipelineRunner<I, O> {
    store: CheckpointStore,
    protocol: SharedCheckpointProtocol<I, O>,
    config: RunConfig,
}

impl<I, O> PipelineRunner<I, O>
where
    I: WorkItem,
    O: Send + Sync,
{
    pub fn new(store: CheckpointStore, protocol: SharedCheckpointProtocol<I, O>) -> Self {
        Self {
            store,
            protocol,
            config: RunConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    #[tracing::instrument(skip_all, fields(checkpoint = %self.store.path().display()))]
    pub async fn run(
        &self,
        initial_args: Value,
        options: &O,
        mut units: WorkUnits<I>,
        stages: &[SharedStage<I, O>],
    ) -> Result<PipelineRunResult<I>, PipelineError> {
        validate_stage_names(stages)?;
        let mut events = EventEmitter::new(&self.config.events);

        let resume = match self.store.load()? {
            Some(checkpoint) => {
                self.resume_check(&checkpoint, options, &mut units, stages, &mut events)
            }
            None => None,
        };
        let (start_index, resumed_from) = match resume {
            Some((index, stage)) => (index, Some(stage)),
            None => (0, None),
        };
        if let Err(error) = self.protocol.preflight(options) {
            error!(%error, "preflight failed; no stage was run");
            return Err(error);
        }

        info!(
            stage_count = stages.len(),
            start_index,
            resumed_from = resumed_from.as_deref().unwrap_or("<fresh>"),
            "pipeline started"
        );
        events.emit(RunEventKind::Pipeline(PipelineEvent::Started {
            stage_count: stages.len(),
            resumed_from: resumed_from.clone(),
        }));

        let mut args = initial_args;
        let mut executed_stages = Vec::new();
        for (index, stage) in stages.iter().enumerate().skip(start_index) {
            let name = stage.name().to_string();
            info!(stage = %name, index, "stage started");
            events.emit(RunEventKind::Stage(StageEvent::Started {
                stage: name.clone(),
                index,
            }));

            let next_args = match stage.run(args.clone(), options, &mut units).await {
                Ok(next_args) => next_args,
                Err(stage_error) => {
                    let failure = StageFailure {
                        stage: name.clone(),
                        message: stage_error.to_string(),
                    };
                    error!(stage = %name, index, error = %stage_error, "stage failed");
                    events.emit(RunEventKind::Stage(StageEvent::Failed {
                        stage: name.clone(),
                        index,
                        reason: failure.message.clone(),
                    }));
                    events.emit(RunEventKind::Pipeline(PipelineEvent::Failed {
                        stage: name,
                        reason: failure.message.clone(),
                    }));
                    return Ok(PipelineRunResult {
                        status: PipelineStatus::Fail,
                        resumed_from,
                        executed_stages,
                        failure: Some(failure),
                        args,
                        units,
                    });
                }
            };
            args = next_args;
            events.emit(RunEventKind::Stage(StageEvent::Completed {
                stage: name.clone(),
                index,
            }));

            let payload = self
                .protocol
                .build_checkpoint_payload(&name, &units, options)?;
            self.store.save(&Checkpoint::new(name.clone(), payload))?;
            info!(stage = %name, index, "stage completed; checkpoint saved");
            events.emit(RunEventKind::Checkpoint(CheckpointEvent::Saved {
                stage: name.clone(),
            }));
            executed_stages.push(name);
        }

        info!(executed = executed_stages.len(), "pipeline completed");
        events.emit(RunEventKind::Pipeline(PipelineEvent::Completed {
            executed_stages: executed_stages.len(),
        }));
        Ok(PipelineRunResult {
            status: PipelineStatus::Success,
            resumed_from,
            executed_stages,
            failure: None,
            args,
            units,
        })
    }

    /// Runs the pipeline and terminates the process: 0 on success, 2 when a
    /// stage fails, 3 on a corrupt checkpoint, 1 on any other error.
    pub async fn run_and_exit(
        &self,
        initial_args: Value,
        options: &O,
        units: WorkUnits<I>,
        stages: &[SharedStage<I, O>],
    ) -> Infallible {
        let code = match self.run(initial_args, options, units, stages).await {
            Ok(result) => result.exit_code(),
            Err(error) => {
                error!(%error, "pipeline aborted");
                error.exit_code()
            }
        };
        std::process::exit(code)
    }

    /// Decides whether `checkpoint` is resumed. Returns the start index and
    /// the checkpointed stage name when it is.
    fn resume_check(
        &self,
        checkpoint: &Checkpoint,
        options: &O,
        units: &mut WorkUnits<I>,
        stages: &[SharedStage<I, O>],
        events: &mut EventEmitter<'_>,
    ) -> Option<(usize, String)> {
        let last_completed_stage = checkpoint.last_completed_stage.clone();
        events.emit(RunEventKind::Checkpoint(CheckpointEvent::Loaded {
            last_completed_stage: last_completed_stage.clone(),
        }));

        if let Some(expiration) = self.config.expiration {
            if is_expired(checkpoint, expiration) {
                info!(
                    last_completed_stage = %last_completed_stage,
                    age_ms = now_millis().saturating_sub(checkpoint.timestamp),
                    "checkpoint expired; ignoring it"
                );
                events.emit(RunEventKind::Checkpoint(CheckpointEvent::Expired {
                    last_completed_stage,
                }));
                return None;
            }
        }

        if let Err(rejection) = self.protocol.validate_checkpoint(checkpoint, options) {
            self.protocol.on_validation_failed(checkpoint, &rejection);
            events.emit(RunEventKind::Checkpoint(CheckpointEvent::Rejected {
                reason: rejection.to_string(),
            }));
            return None;
        }

        if !self.protocol.should_use_checkpoint(options) {
            events.emit(RunEventKind::Checkpoint(CheckpointEvent::Declined));
            return None;
        }

        let summary = self.protocol.restore_from_checkpoint(checkpoint, units);
        if !summary.dropped.is_empty() {
            warn!(dropped = ?summary.dropped, "checkpoint state dropped for unknown items");
        }
        events.emit(RunEventKind::Checkpoint(CheckpointEvent::Restored {
            restored: summary.restored,
            dropped: summary.dropped,
        }));
        Some((resume_index(checkpoint, stages), last_completed_stage))
    }
}

struct EventEmitter<'a> {
    sink: &'a RunEventSink,
    next_sequence_no: u64,
}

impl<'a> EventEmitter<'a> {
    fn new(sink: &'a RunEventSink) -> Self {
        Self {
            sink,
            next_sequence_no: 1,
        }
    }

    fn emit(&mut self, kind: RunEventKind) {
        if !self.sink.is_enabled() {
            return;
        }
        self.sink.emit(RunEvent {
            sequence_no: self.next_sequence_no,
            timestamp: now_millis(),
            kind,
        });
        self.next_sequence_no += 1;
    }
}
