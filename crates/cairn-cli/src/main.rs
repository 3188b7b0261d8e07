mod manifest;

use cairn_pipeline::stages::CommandStage;
use cairn_pipeline::{
    CheckpointEvent, CheckpointStore, EXIT_RUNTIME_ERROR, GitHead, HeadProvider,
    InvocationOptions, NamedItem, PipelineError, PipelineEvent, PipelineRunner, ReleaseProtocol,
    RunConfig, RunEvent, RunEventKind, RunEventSink, SharedStage, StageEvent, StaticHead,
    StaticResolver, WorkUnits,
};
use clap::{ArgAction, Parser, Subcommand};
use manifest::{Manifest, parse_override};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "cairn-cli")]
#[command(about = "Resumable, checkpointed release pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    InspectCheckpoint(InspectCheckpointArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = "cairn.toml")]
    manifest: PathBuf,
    /// Continue after the last completed stage of a compatible checkpoint.
    #[arg(long, action = ArgAction::SetTrue)]
    resume: bool,
    /// Checkpoint-relevant override, `key=value`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    /// JSON args handed to the first stage.
    #[arg(long)]
    args: Option<String>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long, value_parser = humantime::parse_duration)]
    expire_after: Option<Duration>,
    /// Repository whose HEAD guards the checkpoint. Defaults to the manifest directory.
    #[arg(long)]
    repo: Option<PathBuf>,
    /// Fixed head identifier used instead of asking git.
    #[arg(long, conflicts_with = "repo")]
    head: Option<String>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    log_json: bool,
}

#[derive(clap::Args, Debug)]
struct InspectCheckpointArgs {
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => {
            init_tracing(args.log_json);
            run_command(args).await
        }
        Commands::InspectCheckpoint(args) => {
            init_tracing(false);
            inspect_checkpoint_command(args)
        }
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            exit_code(EXIT_RUNTIME_ERROR)
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let manifest = Manifest::load(&args.manifest)?;
    let base_dir = manifest_dir(&args.manifest);

    let stages: Vec<SharedStage<NamedItem, InvocationOptions>> = manifest
        .stages
        .iter()
        .map(|stage| {
            Arc::new(CommandStage::new(&stage.name, &stage.command).working_dir(&base_dir))
                as SharedStage<NamedItem, InvocationOptions>
        })
        .collect();

    let mut options = InvocationOptions::new().with_resume(args.resume);
    for (key, value) in &manifest.options {
        options.set_relevant(key.clone(), value.clone());
    }
    for raw in &args.overrides {
        let (key, value) = parse_override(raw)?;
        options.set_relevant(key, value);
    }

    let initial_args = match args.args.as_deref() {
        Some(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|e| format!("--args is not valid JSON: {e}"))?,
        None => Value::Null,
    };

    let head: Arc<dyn HeadProvider> = match (args.head, args.repo) {
        (Some(head), _) => Arc::new(StaticHead::new(head)),
        (None, Some(repo)) => Arc::new(GitHead::new(repo)),
        (None, None) => Arc::new(GitHead::new(base_dir.clone())),
    };
    let items = manifest.items.iter().map(NamedItem::new);
    let protocol = ReleaseProtocol::new(head, Arc::new(StaticResolver::new(items.clone())));

    let checkpoint = args
        .checkpoint
        .unwrap_or_else(|| manifest.checkpoint_path(&base_dir));
    let events = if args.no_stream_events {
        RunEventSink::default()
    } else {
        event_printer(args.event_json)
    };
    let runner = PipelineRunner::new(CheckpointStore::new(checkpoint), Arc::new(protocol))
        .with_config(RunConfig {
            expiration: args.expire_after.or(manifest.expire_after),
            events,
        });

    match runner
        .run_and_exit(initial_args, &options, WorkUnits::from_items(items), &stages)
        .await
    {}
}

fn inspect_checkpoint_command(args: InspectCheckpointArgs) -> Result<ExitCode, String> {
    let checkpoint = match CheckpointStore::new(&args.checkpoint).load() {
        Ok(Some(checkpoint)) => checkpoint,
        Ok(None) => {
            return Err(format!("no checkpoint at '{}'", args.checkpoint.display()));
        }
        Err(error @ PipelineError::CorruptCheckpoint { .. }) => {
            eprintln!("error: {error}");
            return Ok(exit_code(error.exit_code()));
        }
        Err(error) => return Err(error.to_string()),
    };

    if args.json {
        let json = serde_json::to_string_pretty(&checkpoint).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        println!("checkpoint: {}", args.checkpoint.display());
        println!("timestamp: {}", checkpoint.timestamp);
        println!("last_completed_stage: {}", checkpoint.last_completed_stage);
        println!("repo_mark: {}", checkpoint.payload.repo_mark);
        println!("options: {}", checkpoint.payload.options);
        println!("items: {}", checkpoint.payload.state.len());
        for (id, state) in &checkpoint.payload.state {
            let keys: Vec<&str> = state.keys().map(String::as_str).collect();
            println!("  {id}: {}", keys.join(", "));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn manifest_dir(manifest: &Path) -> PathBuf {
    match manifest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Prints events as they happen. `run_and_exit` ends the process, so the
/// printer cannot be a task draining a channel.
fn event_printer(event_json: bool) -> RunEventSink {
    RunEventSink::with_observer(Arc::new(move |event: &RunEvent| {
        if event_json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(_) => print_event_text(event),
            }
        } else {
            print_event_text(event);
        }
    }))
}

fn print_event_text(event: &RunEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        describe_event(&event.kind)
    );
}

fn describe_event(kind: &RunEventKind) -> String {
    match kind {
        RunEventKind::Pipeline(PipelineEvent::Started {
            stage_count,
            resumed_from,
        }) => match resumed_from {
            Some(stage) => format!("pipeline started ({stage_count} stages, resuming after {stage})"),
            None => format!("pipeline started ({stage_count} stages)"),
        },
        RunEventKind::Pipeline(PipelineEvent::Completed { executed_stages }) => {
            format!("pipeline completed ({executed_stages} stages run)")
        }
        RunEventKind::Pipeline(PipelineEvent::Failed { stage, reason }) => {
            format!("pipeline failed at {stage}: {reason}")
        }
        RunEventKind::Stage(StageEvent::Started { stage, index }) => {
            format!("stage {index} {stage} started")
        }
        RunEventKind::Stage(StageEvent::Completed { stage, index }) => {
            format!("stage {index} {stage} completed")
        }
        RunEventKind::Stage(StageEvent::Failed {
            stage,
            index,
            reason,
        }) => format!("stage {index} {stage} failed: {reason}"),
        RunEventKind::Checkpoint(CheckpointEvent::Loaded {
            last_completed_stage,
        }) => format!("checkpoint loaded (last completed {last_completed_stage})"),
        RunEventKind::Checkpoint(CheckpointEvent::Expired {
            last_completed_stage,
        }) => format!("checkpoint expired (last completed {last_completed_stage})"),
        RunEventKind::Checkpoint(CheckpointEvent::Rejected { reason }) => {
            format!("checkpoint rejected: {reason}")
        }
        RunEventKind::Checkpoint(CheckpointEvent::Declined) => {
            "checkpoint ignored; pass --resume to continue from it".to_string()
        }
        RunEventKind::Checkpoint(CheckpointEvent::Restored { restored, dropped }) => {
            if dropped.is_empty() {
                format!("checkpoint restored ({} items)", restored.len())
            } else {
                format!(
                    "checkpoint restored ({} items, dropped {})",
                    restored.len(),
                    dropped.join(", ")
                )
            }
        }
        RunEventKind::Checkpoint(CheckpointEvent::Saved { stage }) => {
            format!("checkpoint saved after {stage}")
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
