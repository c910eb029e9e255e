use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub type OwnerKey = String;

/// Owners directory keyed by owner key, in the order the user wrote them.
pub type Owners = IndexMap<OwnerKey, OwnerInfo>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task(Value);

impl Task {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_record(&self) -> bool {
        self.0.is_object()
    }

    pub fn id(&self) -> Option<String> {
        match self.field("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.field("name").and_then(Value::as_str)
    }

    pub fn owner(&self) -> Option<&str> {
        self.field("owner").and_then(Value::as_str)
    }

    pub fn start(&self) -> Option<f64> {
        self.field("start").and_then(Value::as_f64)
    }

    /// Explicit `end` wins; otherwise `start + duration`.
    pub fn end(&self) -> Option<f64> {
        if let Some(end) = self.field("end").and_then(Value::as_f64) {
            return Some(end);
        }
        let duration = self.field("duration").and_then(Value::as_f64)?;
        Some(self.start()? + duration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerInfo(Value);

impl OwnerInfo {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    /// Avatar reference, only when it is a non-empty string.
    pub fn avatar(&self) -> Option<&str> {
        self.0
            .get("avatar")
            .and_then(Value::as_str)
            .filter(|avatar| !avatar.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub tasks: Vec<Task>,
    pub owners: Owners,
}

impl AppState {
    pub fn new(tasks: Vec<Task>, owners: Owners) -> Self {
        Self { tasks, owners }
    }

    pub fn with_tasks(&self, tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            owners: self.owners.clone(),
        }
    }

    pub fn with_owners(&self, owners: Owners) -> Self {
        Self {
            tasks: self.tasks.clone(),
            owners,
        }
    }
}

/// Version token of the owners mapping. Every replacement of the owners
/// mapping gets a fresh generation, even when the content is value-equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    pub const INITIAL: Generation = Generation(1);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

pub fn default_state() -> AppState {
    let tasks = vec![
        json!({
            "id": 1,
            "name": "Write project brief",
            "owner": "alice",
            "start": 0,
            "duration": 3
        }),
        json!({
            "id": 2,
            "name": "Sketch chart layout",
            "owner": "bob",
            "start": 2,
            "duration": 4,
            "dependency": 1
        }),
        json!({
            "id": 3,
            "name": "Wire up share links",
            "owner": "carol",
            "start": 5,
            "duration": 3,
            "dependency": 2
        }),
        json!({
            "id": 4,
            "name": "Review and ship",
            "owner": "alice",
            "start": 8,
            "duration": 2,
            "dependency": 3
        }),
    ];

    let owners = [
        ("alice", json!({ "name": "Alice" })),
        ("bob", json!({ "name": "Bob" })),
        ("carol", json!({ "name": "Carol" })),
    ];

    AppState {
        tasks: tasks.into_iter().map(Task::new).collect(),
        owners: owners
            .into_iter()
            .map(|(key, info)| (key.to_string(), OwnerInfo::new(info)))
            .collect(),
    }
}
