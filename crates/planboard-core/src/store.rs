use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::location::StateLocation;
use crate::model::{AppState, Generation, Owners, Task};
use crate::share::{decode_token, encode_token};

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: AppState,
    pub owners_generation: Generation,
    pub revision: u64,
}

/// Owner of the canonical state. Every replacement is persisted to the
/// location before it becomes visible to readers.
pub struct StateStore {
    location: Box<dyn StateLocation>,
    default: AppState,
    write_lock: Mutex<()>,
    tx: watch::Sender<Arc<Snapshot>>,
}

impl StateStore {
    #[tracing::instrument(skip_all)]
    pub fn open(location: Box<dyn StateLocation>, default: AppState) -> Self {
        let initial = match location.read_token() {
            Ok(Some(token)) => match decode_token(&token) {
                Ok(state) => {
                    info!(
                        tasks = state.tasks.len(),
                        owners = state.owners.len(),
                        "restored state from url"
                    );
                    state
                }
                Err(error) => {
                    warn!(%error, "persisted state is corrupt; using default");
                    default.clone()
                }
            },
            Ok(None) => {
                debug!("no persisted state; using default");
                default.clone()
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "could not read persisted state; using default");
                default.clone()
            }
        };

        let (tx, _rx) = watch::channel(Arc::new(Snapshot {
            state: initial,
            owners_generation: Generation::INITIAL,
            revision: 0,
        }));

        Self {
            location,
            default,
            write_lock: Mutex::new(()),
            tx,
        }
    }

    pub fn get(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    pub fn default_state(&self) -> &AppState {
        &self.default
    }

    pub fn location(&self) -> &dyn StateLocation {
        self.location.as_ref()
    }

    pub fn set(&self, state: AppState) -> anyhow::Result<Arc<Snapshot>> {
        self.commit(|_| state, true)
    }

    pub fn replace_tasks(&self, tasks: Vec<Task>) -> anyhow::Result<Arc<Snapshot>> {
        self.commit(|current| current.with_tasks(tasks), false)
    }

    pub fn replace_owners(&self, owners: Owners) -> anyhow::Result<Arc<Snapshot>> {
        self.commit(|current| current.with_owners(owners), true)
    }

    pub fn reset(&self) -> anyhow::Result<Arc<Snapshot>> {
        info!("resetting state to default dataset");
        self.set(self.default.clone())
    }

    #[tracing::instrument(skip(self, build))]
    fn commit<F>(&self, build: F, new_generation: bool) -> anyhow::Result<Arc<Snapshot>>
    where
        F: FnOnce(&AppState) -> AppState,
    {
        let _guard = self.write_lock.lock();
        let current = self.get();
        let state = build(&current.state);

        let token = encode_token(&state).context("failed to encode state")?;
        self.location
            .write_token(&token)
            .context("failed to persist state")?;

        let owners_generation = if new_generation {
            current.owners_generation.next()
        } else {
            current.owners_generation
        };
        let snapshot = Arc::new(Snapshot {
            state,
            owners_generation,
            revision: current.revision + 1,
        });
        self.tx.send_replace(snapshot.clone());

        debug!(
            revision = snapshot.revision,
            generation = %owners_generation,
            tasks = snapshot.state.tasks.len(),
            owners = snapshot.state.owners.len(),
            token_len = token.len(),
            "committed state"
        );
        Ok(snapshot)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.get();
        f.debug_struct("StateStore")
            .field("revision", &snapshot.revision)
            .field("owners_generation", &snapshot.owners_generation)
            .finish_non_exhaustive()
    }
}
