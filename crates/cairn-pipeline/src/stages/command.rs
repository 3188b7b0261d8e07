//! Stage backed by an external shell command.
//!
//! The command receives the stage input as JSON on stdin:
//! `{"stage", "args", "options", "units": {id: state}}`. A non-zero exit fails
//! the stage. Stdout, when it is a JSON object, may carry `args` for the next
//! stage and `state` (`{id: {key: value}}`) to merge into the live units.

use crate::{
    InvocationOptions, Stage, StageError, WorkItem, WorkUnits, merge_state, snapshot_state,
    state_from_value,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct CommandStage {
    name: String,
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn execute(&self, stdin_payload: &str, items: &str) -> Result<String, StageError> {
        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(&self.command)
            .env("CAIRN_STAGE", &self.name)
            .env("CAIRN_ITEMS", items)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.working_dir.as_ref() {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|error| StageError::from_source("failed to launch stage command", error))?;
        // Input is fed while output is drained; either pipe may fill first.
        let stdin = child.stdin.take();
        let feed_input = async move {
            let Some(mut stdin) = stdin else {
                return;
            };
            // A command that ignores stdin may close it early.
            if let Err(error) = stdin.write_all(stdin_payload.as_bytes()).await {
                debug!(stage = %self.name, %error, "stage command did not read stdin");
            }
        };
        let ((), output) = tokio::join!(feed_input, child.wait_with_output());
        let output = output
            .map_err(|error| StageError::from_source("failed waiting for stage command", error))?;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(StageError::new(if stderr.is_empty() {
                format!("command exited with {code}")
            } else {
                format!("command exited with {code}: {stderr}")
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl<I: WorkItem> Stage<I, InvocationOptions> for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        args: Value,
        options: &InvocationOptions,
        units: &mut WorkUnits<I>,
    ) -> Result<Value, StageError> {
        let input = json!({
            "stage": self.name,
            "args": args,
            "options": options.to_value(),
            "units": snapshot_state(units),
        });
        let items = units.ids().join(",");
        let stdout = self.execute(&input.to_string(), &items).await?;
        apply_command_output(&self.name, args, &stdout, units)
    }
}

fn apply_command_output<I: WorkItem>(
    stage: &str,
    args: Value,
    stdout: &str,
    units: &mut WorkUnits<I>,
) -> Result<Value, StageError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(args);
    }
    let Ok(Value::Object(mut report)) = serde_json::from_str::<Value>(trimmed) else {
        debug!(stage, "stage command output is not a JSON object; passing args through");
        return Ok(args);
    };

    if let Some(state) = report.remove("state") {
        let Value::Object(per_item) = state else {
            return Err(StageError::new("command output 'state' must be an object"));
        };
        for (id, bag) in per_item {
            let Some(bag) = state_from_value(&bag) else {
                return Err(StageError::new(format!(
                    "command output state for '{id}' must be an object"
                )));
            };
            match units.get_mut(&id) {
                Some(unit) => merge_state(&mut unit.state, &bag),
                None => warn!(stage, item = %id, "command reported state for unknown item"),
            }
        }
    }

    Ok(report.remove("args").unwrap_or(args))
}
