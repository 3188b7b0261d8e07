use crate::StateBag;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An externally owned package or item the pipeline acts on.
pub trait WorkItem: Clone + Send + Sync {
    fn id(&self) -> &str;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedItem {
    pub name: String,
}

impl NamedItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl WorkItem for NamedItem {
    fn id(&self) -> &str {
        &self.name
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkUnit<I> {
    pub item: I,
    pub state: StateBag,
}

impl<I: WorkItem> WorkUnit<I> {
    pub fn new(item: I) -> Self {
        Self {
            item,
            state: StateBag::new(),
        }
    }

    pub fn with_state(item: I, state: StateBag) -> Self {
        Self { item, state }
    }

    pub fn id(&self) -> &str {
        self.item.id()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }
}

/// The live collection every stage receives. Order follows insertion;
/// identities are unique.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkUnits<I> {
    units: Vec<WorkUnit<I>>,
}

impl<I> Default for WorkUnits<I> {
    fn default() -> Self {
        Self { units: Vec::new() }
    }
}

impl<I: WorkItem> WorkUnits<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = I>) -> Self {
        let mut units = Self::new();
        for item in items {
            units.insert(WorkUnit::new(item));
        }
        units
    }

    /// Adds a unit, replacing any existing unit with the same identity in place.
    pub fn insert(&mut self, unit: WorkUnit<I>) {
        match self.units.iter_mut().find(|u| u.id() == unit.id()) {
            Some(existing) => *existing = unit,
            None => self.units.push(unit),
        }
    }

    pub fn get(&self, id: &str) -> Option<&WorkUnit<I>> {
        self.units.iter().find(|unit| unit.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkUnit<I>> {
        self.units.iter_mut().find(|unit| unit.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn retain(&mut self, keep: impl FnMut(&WorkUnit<I>) -> bool) {
        self.units.retain(keep);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkUnit<I>> {
        self.units.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkUnit<I>> {
        self.units.iter_mut()
    }

    pub fn ids(&self) -> Vec<String> {
        self.units.iter().map(|unit| unit.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
