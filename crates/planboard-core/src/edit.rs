use std::fmt;

use tracing::debug;

use crate::codec::{self, CodecError};
use crate::store::{Snapshot, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditTarget {
    Tasks,
    Owners,
}

impl fmt::Display for EditTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditTarget::Tasks => f.write_str("tasks"),
            EditTarget::Owners => f.write_str("owners"),
        }
    }
}

impl std::str::FromStr for EditTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tasks" | "task" => Ok(EditTarget::Tasks),
            "owners" | "owner" | "team" => Ok(EditTarget::Owners),
            other => Err(anyhow::anyhow!("unknown dataset: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    Applied { revision: u64 },
    /// The text did not parse or had the wrong shape. Canonical state is
    /// unchanged; the editor keeps showing the in-progress text.
    Rejected(CodecError),
}

impl EditOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, EditOutcome::Applied { .. })
    }
}

pub fn editor_text(snapshot: &Snapshot, target: EditTarget) -> String {
    match target {
        EditTarget::Tasks => codec::encode(&snapshot.state.tasks),
        EditTarget::Owners => codec::encode(&snapshot.state.owners),
    }
}

/// Feeds one editor change into the store. Parse and shape errors are
/// reported as [`EditOutcome::Rejected`]; only persistence failures are `Err`.
#[tracing::instrument(skip(store, text), fields(len = text.len()))]
pub fn apply_edit(
    store: &StateStore,
    target: EditTarget,
    text: &str,
) -> anyhow::Result<EditOutcome> {
    let snapshot = match target {
        EditTarget::Tasks => match codec::decode_tasks(text) {
            Ok(tasks) => store.replace_tasks(tasks)?,
            Err(error) => return Ok(rejected(target, error)),
        },
        EditTarget::Owners => match codec::decode_owners(text) {
            Ok(owners) => store.replace_owners(owners)?,
            Err(error) => return Ok(rejected(target, error)),
        },
    };

    Ok(EditOutcome::Applied {
        revision: snapshot.revision,
    })
}

fn rejected(target: EditTarget, error: CodecError) -> EditOutcome {
    debug!(%target, %error, "edit rejected; keeping last accepted value");
    EditOutcome::Rejected(error)
}
