use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const RESUME_OPTION: &str = "resume";

/// Invocation options as seen by the checkpoint protocol.
pub trait CheckpointOptions: Send + Sync {
    /// The subset of options whose change makes a prior checkpoint unusable.
    fn checkpoint_relevant(&self) -> Value;

    /// Operator asked to continue from a prior checkpoint.
    fn resume_requested(&self) -> bool;
}

/// String-keyed options with an explicit checkpoint-relevant subset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationOptions {
    values: BTreeMap<String, Value>,
    checkpoint_keys: BTreeSet<String>,
}

impl InvocationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value that does not affect checkpoint compatibility.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        let key = key.into();
        self.checkpoint_keys.remove(&key);
        self.values.insert(key, value);
        self
    }

    /// Sets a checkpoint-relevant value. The resume flag is never relevant.
    pub fn set_relevant(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        let key = key.into();
        if key != RESUME_OPTION {
            self.checkpoint_keys.insert(key.clone());
        }
        self.values.insert(key, value);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.set(RESUME_OPTION, Value::Bool(resume));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn is_checkpoint_relevant(&self, key: &str) -> bool {
        self.checkpoint_keys.contains(key)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl CheckpointOptions for InvocationOptions {
    fn checkpoint_relevant(&self) -> Value {
        let relevant: Map<String, Value> = self
            .values
            .iter()
            .filter(|(key, _)| self.checkpoint_keys.contains(*key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(relevant)
    }

    fn resume_requested(&self) -> bool {
        self.flag(RESUME_OPTION)
    }
}

/// One entry of a structural diff. `None` on a side means the path is absent there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionDifference {
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Structural diff of two option snapshots. Objects are compared key by key
/// with dotted paths; any other value (arrays included) is compared whole.
pub fn diff_options(before: &Value, after: &Value) -> Vec<OptionDifference> {
    let mut differences = Vec::new();
    diff_at("", Some(before), Some(after), &mut differences);
    differences
}

fn diff_at(
    path: &str,
    before: Option<&Value>,
    after: Option<&Value>,
    out: &mut Vec<OptionDifference>,
) {
    match (before, after) {
        (Some(Value::Object(left)), Some(Value::Object(right))) => {
            let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                diff_at(&child, left.get(key), right.get(key), out);
            }
        }
        (left, right) if left == right => {}
        (left, right) => out.push(OptionDifference {
            path: if path.is_empty() {
                "<root>".to_string()
            } else {
                path.to_string()
            },
            before: left.cloned(),
            after: right.cloned(),
        }),
    }
}
