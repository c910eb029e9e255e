use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::{Generation, Owners, Task};
use crate::preload::{CacheReady, ImageCache, ImageCacheEntry, ImagePreloadCache};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy)]
pub struct RenderFrame<'a> {
    pub tasks: &'a [Task],
    pub owners: &'a Owners,
    pub owners_generation: Generation,
    pub images: Option<&'a ImageCache>,
    pub preload_counter: u64,
    pub width: u16,
}

impl RenderFrame<'_> {
    /// Preloaded avatar of `owner_key`. Misses while the avatar is still
    /// loading, failed to load, or belongs to another owners generation.
    pub fn avatar(&self, owner_key: &str) -> Option<ImageCacheEntry> {
        let images = self.images?;
        if images.generation() != self.owners_generation {
            return None;
        }
        images.get(owner_key)
    }
}

pub trait ChartRenderer {
    fn draw(&mut self, frame: &RenderFrame<'_>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Drawn,
    /// The renderer faulted; the chart is replaced by this message until
    /// [`RenderGate::recover`] runs.
    Fallback { message: String },
}

pub struct RenderGate<R> {
    store: Arc<StateStore>,
    preload: Arc<ImagePreloadCache>,
    renderer: R,
    ready_rx: broadcast::Receiver<CacheReady>,
    preload_counter: u64,
    counted: Option<Generation>,
    fault: Option<String>,
}

impl<R: ChartRenderer> RenderGate<R> {
    pub fn new(store: Arc<StateStore>, preload: Arc<ImagePreloadCache>, renderer: R) -> Self {
        let ready_rx = preload.subscribe();
        Self {
            store,
            preload,
            renderer,
            ready_rx,
            preload_counter: 0,
            counted: None,
            fault: None,
        }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn preload_counter(&self) -> u64 {
        self.preload_counter
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn sync_assets(&self) -> Option<JoinHandle<()>> {
        let snapshot = self.store.get();
        self.preload
            .preload(snapshot.owners_generation, &snapshot.state.owners)
    }

    pub fn poll_ready(&mut self) -> bool {
        let mut bumped = false;
        if let Some(event) = self.preload.current().and_then(|cache| cache.ready()) {
            bumped |= self.count_ready(event);
        }
        loop {
            match self.ready_rx.try_recv() {
                Ok(event) => bumped |= self.count_ready(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed ready events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        bumped
    }

    pub async fn wait_ready(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        self.sync_assets();
        self.poll_ready();
        let target = self.store.get().owners_generation;
        let deadline = Instant::now() + timeout;

        while self.counted != Some(target) {
            match tokio::time::timeout_at(deadline, self.ready_rx.recv()).await {
                Err(_) => {
                    debug!(%target, "timed out waiting for avatars");
                    return Ok(false);
                }
                Ok(Ok(event)) => {
                    self.count_ready(event);
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "missed ready events");
                    self.poll_ready();
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(anyhow!("image preload cache shut down"));
                }
            }
        }
        Ok(true)
    }

    fn count_ready(&mut self, event: CacheReady) -> bool {
        let current = self.store.get().owners_generation;
        if event.generation != current {
            debug!(ready = %event.generation, %current, "ignoring ready event of stale generation");
            return false;
        }
        if self.counted == Some(event.generation) {
            return false;
        }
        self.counted = Some(event.generation);
        self.preload_counter += 1;
        debug!(
            generation = %event.generation,
            counter = self.preload_counter,
            "avatars ready; redraw requested"
        );
        true
    }

    /// Draws the current state. A renderer error or panic is caught here and
    /// turns the gate into its fallback until [`RenderGate::recover`].
    #[tracing::instrument(skip(self))]
    pub fn render(&mut self, width: u16) -> RenderOutcome {
        if let Some(message) = &self.fault {
            return RenderOutcome::Fallback {
                message: message.clone(),
            };
        }

        self.sync_assets();
        self.poll_ready();

        let snapshot = self.store.get();
        let images = self.preload.current();
        let frame = RenderFrame {
            tasks: &snapshot.state.tasks,
            owners: &snapshot.state.owners,
            owners_generation: snapshot.owners_generation,
            images: images.as_deref(),
            preload_counter: self.preload_counter,
            width,
        };

        let renderer = &mut self.renderer;
        let message = match panic::catch_unwind(AssertUnwindSafe(|| renderer.draw(&frame))) {
            Ok(Ok(())) => return RenderOutcome::Drawn,
            Ok(Err(error)) => format!("{error:#}"),
            Err(payload) => panic_message(payload.as_ref()),
        };

        warn!(revision = snapshot.revision, %message, "chart renderer faulted");
        self.fault = Some(message.clone());
        RenderOutcome::Fallback { message }
    }

    pub fn recover(&mut self) -> anyhow::Result<()> {
        self.store
            .reset()
            .context("failed to reset to the default dataset")?;
        self.fault = None;
        self.sync_assets();
        info!("recovered from render fault");
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "renderer panicked".to_string()
    }
}
