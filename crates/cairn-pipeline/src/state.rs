//! Per-item state bags carried across stages.
//!
//! A bag is a JSON object tree. Cloning it is a full structural copy, so a
//! snapshot never aliases the live bag it was taken from. Live handles or
//! other non-serializable values cannot be stored here.

use crate::{WorkItem, WorkUnits};
use serde_json::Value;
use std::collections::BTreeMap;

pub type StateBag = BTreeMap<String, Value>;

/// Persisted form of every unit's state, keyed by item identity.
pub type StateSnapshot = BTreeMap<String, StateBag>;

pub fn snapshot_state<I: WorkItem>(units: &WorkUnits<I>) -> StateSnapshot {
    units
        .iter()
        .map(|unit| (unit.id().to_string(), unit.state.clone()))
        .collect()
}

/// Shallow merge: top-level keys of `overlay` replace those in `base`.
pub fn merge_state(base: &mut StateBag, overlay: &StateBag) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// Converts a JSON object into a bag. Anything else yields `None`.
pub fn state_from_value(value: &Value) -> Option<StateBag> {
    value
        .as_object()
        .map(|object| object.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}
