use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const MANIFEST: &str = r#"
items = ["pkg-a"]

[options]
registry = "https://registry.example"

[[stages]]
name = "bump"
command = '''cat >/dev/null; echo bump >> bump.log; echo '{"state":{"pkg-a":{"version":"1.2.0"}}}' '''

[[stages]]
name = "publish"
command = '''cat > publish-input.json; if [ -f fail-publish ]; then echo "registry unreachable" >&2; exit 1; fi; echo publish >> publish.log'''
"#;

fn write_manifest(dir: &Path) -> String {
    let path = dir.join("cairn.toml");
    std::fs::write(&path, MANIFEST).expect("manifest write should succeed");
    path.to_str().expect("manifest path should be utf8").to_string()
}

fn run_cli(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cairn-cli"))
        .args(args)
        .current_dir(cwd)
        .env("RUST_LOG", "warn")
        .output()
        .expect("cli process should start")
}

fn run_pipeline(manifest: &str, extra: &[&str], cwd: &Path) -> Output {
    let mut args = vec!["run", "--manifest", manifest, "--head", "head-1"];
    args.extend_from_slice(extra);
    run_cli(&args, cwd)
}

fn describe(output: &Output) -> String {
    format!(
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

fn saved_checkpoint(dir: &Path) -> Value {
    let bytes = std::fs::read(dir.join(".cairn").join("checkpoint.json"))
        .expect("checkpoint should exist");
    serde_json::from_slice(&bytes).expect("checkpoint should be JSON")
}

#[test]
fn run_command_expected_success_and_checkpoint_after_last_stage() {
    let temp = TempDir::new().expect("tempdir should create");
    let manifest = write_manifest(temp.path());

    let output = run_pipeline(&manifest, &[], temp.path());

    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("checkpoint saved after publish"), "{stdout}");
    let checkpoint = saved_checkpoint(temp.path());
    assert_eq!(checkpoint["lastCompletedStage"], "publish");
    assert_eq!(checkpoint["payload"]["repoMark"], "head-1");
    assert_eq!(
        checkpoint["payload"]["options"]["registry"],
        "https://registry.example"
    );
    assert_eq!(
        checkpoint["payload"]["state"]["pkg-a"]["version"],
        "1.2.0"
    );
}

#[test]
fn failed_stage_exits_2_and_resume_skips_completed_stage() {
    let temp = TempDir::new().expect("tempdir should create");
    let manifest = write_manifest(temp.path());
    std::fs::write(temp.path().join("fail-publish"), b"").expect("marker should write");

    let failed = run_pipeline(&manifest, &[], temp.path());
    assert_eq!(failed.status.code(), Some(2), "{}", describe(&failed));
    assert_eq!(saved_checkpoint(temp.path())["lastCompletedStage"], "bump");

    std::fs::remove_file(temp.path().join("fail-publish")).expect("marker should remove");
    let resumed = run_pipeline(&manifest, &["--resume"], temp.path());

    assert!(resumed.status.success(), "{}", describe(&resumed));
    assert_eq!(line_count(&temp.path().join("bump.log")), 1);
    assert_eq!(line_count(&temp.path().join("publish.log")), 1);
    let input: Value = serde_json::from_slice(
        &std::fs::read(temp.path().join("publish-input.json")).expect("publish input"),
    )
    .expect("publish input should be JSON");
    assert_eq!(input["stage"], "publish");
    assert_eq!(input["units"]["pkg-a"]["version"], "1.2.0");
}

#[test]
fn changed_relevant_option_on_resume_runs_from_first_stage() {
    let temp = TempDir::new().expect("tempdir should create");
    let manifest = write_manifest(temp.path());
    std::fs::write(temp.path().join("fail-publish"), b"").expect("marker should write");
    let failed = run_pipeline(&manifest, &[], temp.path());
    assert_eq!(failed.status.code(), Some(2), "{}", describe(&failed));
    std::fs::remove_file(temp.path().join("fail-publish")).expect("marker should remove");

    let rerun = run_pipeline(
        &manifest,
        &["--resume", "--set", "registry=https://mirror.example"],
        temp.path(),
    );

    assert!(rerun.status.success(), "{}", describe(&rerun));
    assert!(
        String::from_utf8_lossy(&rerun.stdout).contains("checkpoint rejected"),
        "{}",
        describe(&rerun)
    );
    assert_eq!(line_count(&temp.path().join("bump.log")), 2);
}

#[test]
fn event_json_lines_expected_valid_json_with_sequence_numbers() {
    let temp = TempDir::new().expect("tempdir should create");
    let manifest = write_manifest(temp.path());

    let output = run_pipeline(&manifest, &["--event-json"], temp.path());

    assert!(output.status.success(), "{}", describe(&output));
    let events: Vec<Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("event line should be JSON"))
        .collect();
    assert!(!events.is_empty());
    let sequence: Vec<u64> = events
        .iter()
        .map(|event| event["sequence_no"].as_u64().expect("sequence_no"))
        .collect();
    assert_eq!(sequence, (1..=events.len() as u64).collect::<Vec<_>>());
    assert_eq!(events[0]["kind"]["category"], "pipeline");
    assert_eq!(events[0]["kind"]["kind"], "started");
}

#[test]
fn inspect_checkpoint_text_and_json_outputs() {
    let temp = TempDir::new().expect("tempdir should create");
    let manifest = write_manifest(temp.path());
    let run = run_pipeline(&manifest, &[], temp.path());
    assert!(run.status.success(), "{}", describe(&run));
    let checkpoint = temp.path().join(".cairn").join("checkpoint.json");
    let checkpoint = checkpoint.to_str().expect("checkpoint path should be utf8");

    let text = run_cli(&["inspect-checkpoint", "--checkpoint", checkpoint], temp.path());
    assert!(text.status.success(), "{}", describe(&text));
    let stdout = String::from_utf8_lossy(&text.stdout);
    assert!(stdout.contains("last_completed_stage: publish"), "{stdout}");
    assert!(stdout.contains("pkg-a: version"), "{stdout}");

    let json = run_cli(
        &["inspect-checkpoint", "--checkpoint", checkpoint, "--json"],
        temp.path(),
    );
    assert!(json.status.success(), "{}", describe(&json));
    let value: Value = serde_json::from_slice(&json.stdout).expect("json output");
    assert_eq!(value["lastCompletedStage"], "publish");
}

#[test]
fn corrupt_checkpoint_exits_3_for_run_and_inspect() {
    let temp = TempDir::new().expect("tempdir should create");
    let manifest = write_manifest(temp.path());
    std::fs::create_dir_all(temp.path().join(".cairn")).expect("dir should create");
    let checkpoint = temp.path().join(".cairn").join("checkpoint.json");
    std::fs::write(&checkpoint, b"{ truncated").expect("fixture should write");

    let run = run_pipeline(&manifest, &["--resume"], temp.path());
    assert_eq!(run.status.code(), Some(3), "{}", describe(&run));
    assert!(!temp.path().join("bump.log").exists());

    let inspect = run_cli(
        &[
            "inspect-checkpoint",
            "--checkpoint",
            checkpoint.to_str().expect("checkpoint path should be utf8"),
        ],
        temp.path(),
    );
    assert_eq!(inspect.status.code(), Some(3), "{}", describe(&inspect));
}

#[test]
fn inspect_missing_checkpoint_exits_1() {
    let temp = TempDir::new().expect("tempdir should create");

    let output = run_cli(
        &["inspect-checkpoint", "--checkpoint", "absent.json"],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no checkpoint"));
}
