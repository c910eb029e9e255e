use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use crate::model::{Generation, OwnerKey, Owners};

#[derive(Debug, Clone)]
pub struct ImageCacheEntry {
    pub bitmap: Arc<DynamicImage>,
    pub natural_width: u32,
    pub natural_height: u32,
}

impl ImageCacheEntry {
    pub fn new(bitmap: DynamicImage) -> Self {
        Self {
            natural_width: bitmap.width(),
            natural_height: bitmap.height(),
            bitmap: Arc::new(bitmap),
        }
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, source: &str) -> anyhow::Result<ImageCacheEntry>;
}

#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("planboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }

    async fn read_bytes(&self, source: &str) -> anyhow::Result<Vec<u8>> {
        let Ok(url) = Url::parse(source) else {
            return tokio::fs::read(source)
                .await
                .with_context(|| format!("failed reading {source}"));
        };

        match url.scheme() {
            "http" | "https" => {
                let response = self
                    .client
                    .get(source)
                    .send()
                    .await
                    .with_context(|| format!("request to {source} failed"))?
                    .error_for_status()?;
                Ok(response.bytes().await?.to_vec())
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| anyhow!("invalid file url: {source}"))?;
                tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed reading {}", path.display()))
            }
            other => Err(anyhow!("unsupported avatar scheme: {other}")),
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, source: &str) -> anyhow::Result<ImageCacheEntry> {
        let bytes = self.read_bytes(source).await?;
        let bitmap = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .context("image decode task failed")?
            .with_context(|| format!("failed to decode image from {source}"))?;
        Ok(ImageCacheEntry::new(bitmap))
    }
}

#[derive(Debug, Clone)]
pub struct PreloadPolicy {
    pub fetch_timeout: Duration,
    pub max_concurrent: usize,
}

impl Default for PreloadPolicy {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            max_concurrent: 8,
        }
    }
}

impl PreloadPolicy {
    /// Worst case for `fetches` avatars, plus one timeout of slack.
    pub fn settle_bound(&self, fetches: usize) -> Duration {
        let rounds = fetches.div_ceil(self.max_concurrent.max(1)).max(1);
        let rounds = u32::try_from(rounds).unwrap_or(u32::MAX);
        self.fetch_timeout
            .saturating_mul(rounds.saturating_add(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheReady {
    pub generation: Generation,
    pub loaded: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct ImageCache {
    generation: Generation,
    slots: RwLock<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    sealed: bool,
    ready: Option<CacheReady>,
    entries: HashMap<OwnerKey, ImageCacheEntry>,
}

impl ImageCache {
    fn new(generation: Generation) -> Self {
        Self {
            generation,
            slots: RwLock::new(Slots::default()),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn get(&self, owner_key: &str) -> Option<ImageCacheEntry> {
        self.slots.read().entries.get(owner_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.slots.read().sealed
    }

    pub fn ready(&self) -> Option<CacheReady> {
        self.slots.read().ready
    }

    fn insert(&self, owner_key: OwnerKey, entry: ImageCacheEntry) -> bool {
        let mut slots = self.slots.write();
        if slots.sealed {
            return false;
        }
        slots.entries.insert(owner_key, entry);
        true
    }

    fn seal(&self) {
        self.slots.write().sealed = true;
    }
}

pub struct ImagePreloadCache {
    fetcher: Arc<dyn ImageFetcher>,
    policy: PreloadPolicy,
    current: Mutex<Option<Arc<ImageCache>>>,
    ready_tx: broadcast::Sender<CacheReady>,
}

impl ImagePreloadCache {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, policy: PreloadPolicy) -> Self {
        let (ready_tx, _rx) = broadcast::channel(64);
        Self {
            fetcher,
            policy,
            current: Mutex::new(None),
            ready_tx,
        }
    }

    pub fn current(&self) -> Option<Arc<ImageCache>> {
        self.current.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheReady> {
        self.ready_tx.subscribe()
    }

    #[tracing::instrument(skip(self, owners), fields(owners = owners.len()))]
    pub fn preload(&self, generation: Generation, owners: &Owners) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available; avatars not preloaded");
            return None;
        };

        let cache = {
            let mut current = self.current.lock();
            if let Some(existing) = current.as_ref()
                && existing.generation >= generation
            {
                debug!(current = %existing.generation, "generation already started");
                return None;
            }

            let cache = Arc::new(ImageCache::new(generation));
            if let Some(previous) = current.replace(cache.clone()) {
                previous.seal();
                debug!(superseded = %previous.generation, "sealed previous image cache");
            }
            cache
        };

        let requests: Vec<(OwnerKey, String)> = owners
            .iter()
            .filter_map(|(key, info)| {
                info.avatar()
                    .map(|avatar| (key.clone(), avatar.to_string()))
            })
            .collect();

        let span = info_span!("preload_generation", %generation, requested = requests.len());
        let job = settle_generation(
            self.fetcher.clone(),
            self.policy.clone(),
            cache,
            requests,
            self.ready_tx.clone(),
        );
        Some(runtime.spawn(job.instrument(span)))
    }
}

async fn settle_generation(
    fetcher: Arc<dyn ImageFetcher>,
    policy: PreloadPolicy,
    cache: Arc<ImageCache>,
    requests: Vec<(OwnerKey, String)>,
    ready_tx: broadcast::Sender<CacheReady>,
) {
    let requested = requests.len();
    let fetch_timeout = policy.fetch_timeout;

    let settled: Vec<bool> = stream::iter(requests)
        .map(|(owner, source)| {
            let fetcher = fetcher.clone();
            let cache = cache.clone();
            async move {
                match tokio::time::timeout(fetch_timeout, fetcher.fetch(&source)).await {
                    Ok(Ok(entry)) => {
                        let (width, height) = (entry.natural_width, entry.natural_height);
                        if cache.insert(owner.clone(), entry) {
                            debug!(%owner, width, height, "avatar loaded");
                        } else {
                            debug!(%owner, "discarding avatar of superseded generation");
                        }
                        true
                    }
                    Ok(Err(error)) => {
                        warn!(%owner, %source, error = %format!("{error:#}"), "avatar failed to load");
                        false
                    }
                    Err(_) => {
                        warn!(
                            %owner,
                            %source,
                            timeout_ms = fetch_timeout.as_millis() as u64,
                            "avatar fetch timed out"
                        );
                        false
                    }
                }
            }
        })
        .buffer_unordered(policy.max_concurrent.max(1))
        .collect()
        .await;

    let loaded = settled.iter().filter(|ok| **ok).count();
    let event = CacheReady {
        generation: cache.generation,
        loaded,
        failed: requested - loaded,
    };

    let mut slots = cache.slots.write();
    if slots.sealed {
        debug!("generation superseded before it settled; ready withheld");
        return;
    }
    slots.ready = Some(event);
    if ready_tx.send(event).is_err() {
        debug!("no ready subscribers");
    }
    info!(loaded = event.loaded, failed = event.failed, "avatar cache ready");
}
