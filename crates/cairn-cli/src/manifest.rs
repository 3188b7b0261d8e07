use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CHECKPOINT: &str = ".cairn/checkpoint.json";

/// Pipeline manifest, usually `cairn.toml`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub items: Vec<String>,
    pub checkpoint: Option<PathBuf>,
    #[serde(default, with = "humantime_serde")]
    pub expire_after: Option<Duration>,
    /// Checkpoint-relevant option values.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    pub stages: Vec<StageSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub name: String,
    pub command: String,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, String> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| format!("failed reading manifest '{}': {e}", path.display()))?;
        Self::parse(&source).map_err(|e| format!("invalid manifest '{}': {e}", path.display()))
    }

    pub fn parse(source: &str) -> Result<Self, String> {
        let manifest: Manifest = toml::from_str(source).map_err(|e| e.to_string())?;
        if manifest.stages.is_empty() {
            return Err("manifest declares no [[stages]]".to_string());
        }
        Ok(manifest)
    }

    /// Checkpoint path, resolved against `base_dir` when relative.
    pub fn checkpoint_path(&self, base_dir: &Path) -> PathBuf {
        let path = self
            .checkpoint
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT));
        if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        }
    }
}

/// Parses a `--set key=value` override. The value is read as JSON when it
/// parses, otherwise kept as a string.
pub fn parse_override(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option name in '{raw}'"));
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_manifest_expected_stages_options_and_duration() {
        let manifest = Manifest::parse(
            r#"
            items = ["pkg-a", "pkg-b"]
            expire_after = "7days"

            [options]
            registry = "https://registry.example"
            channels = ["stable"]

            [[stages]]
            name = "bump"
            command = "./scripts/bump.sh"

            [[stages]]
            name = "publish"
            command = "./scripts/publish.sh"
            "#,
        )
        .expect("manifest should parse");

        assert_eq!(manifest.items, vec!["pkg-a", "pkg-b"]);
        assert_eq!(
            manifest.expire_after,
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        assert_eq!(manifest.options["channels"], json!(["stable"]));
        assert_eq!(manifest.stages.len(), 2);
        assert_eq!(manifest.stages[1].name, "publish");
        assert_eq!(
            manifest.checkpoint_path(Path::new("/work")),
            PathBuf::from("/work/.cairn/checkpoint.json")
        );
    }

    #[test]
    fn parse_manifest_without_stages_expected_error() {
        let error = Manifest::parse("items = []\nstages = []\n").expect_err("no stages");
        assert!(error.contains("no [[stages]]"));
    }

    #[test]
    fn parse_manifest_unknown_field_expected_error() {
        let error = Manifest::parse(
            "resume = true\n[[stages]]\nname = \"a\"\ncommand = \"true\"\n",
        )
        .expect_err("unknown field");
        assert!(error.contains("resume"));
    }

    #[test]
    fn parse_override_json_and_plain_values() {
        assert_eq!(
            parse_override("dry_run=true").expect("override"),
            ("dry_run".to_string(), json!(true))
        );
        assert_eq!(
            parse_override("registry=https://mirror").expect("override"),
            ("registry".to_string(), json!("https://mirror"))
        );
        assert_eq!(
            parse_override("note=a=b").expect("override"),
            ("note".to_string(), json!("a=b"))
        );
        assert!(parse_override("no-equals").is_err());
        assert!(parse_override("=1").is_err());
    }
}
