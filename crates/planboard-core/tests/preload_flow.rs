use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use image::DynamicImage;
use parking_lot::Mutex;
use planboard_core::chart::TextChart;
use planboard_core::edit::{EditTarget, apply_edit, editor_text};
use planboard_core::location::MemoryLocation;
use planboard_core::model::{Generation, OwnerInfo, Owners, default_state};
use planboard_core::preload::{
    CacheReady, ImageCacheEntry, ImageFetcher, ImagePreloadCache, PreloadPolicy,
};
use planboard_core::render::{ChartRenderer, RenderFrame, RenderGate, RenderOutcome};
use planboard_core::store::StateStore;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::oneshot;
use url::Url;

const AVATAR_A: &str = "https://img.test/a.png";
const AVATAR_B: &str = "https://img.test/b.png";

/// Fetcher whose fetches resolve only when the test says so.
#[derive(Default)]
struct ScriptedFetcher {
    pending: Mutex<HashMap<String, VecDeque<oneshot::Receiver<(u32, u32)>>>>,
}

impl ScriptedFetcher {
    fn expect(&self, source: &str) -> oneshot::Sender<(u32, u32)> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .entry(source.to_string())
            .or_default()
            .push_back(rx);
        tx
    }
}

#[async_trait]
impl ImageFetcher for ScriptedFetcher {
    async fn fetch(&self, source: &str) -> anyhow::Result<ImageCacheEntry> {
        let rx = self
            .pending
            .lock()
            .get_mut(source)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("unexpected fetch of {source}"))?;
        let (width, height) = rx
            .await
            .map_err(|_| anyhow!("fetch of {source} abandoned"))?;
        Ok(ImageCacheEntry::new(DynamicImage::new_rgba8(width, height)))
    }
}

fn two_owners() -> Owners {
    [
        ("a", json!({ "name": "A", "avatar": AVATAR_A })),
        ("b", json!({ "name": "B", "avatar": AVATAR_B })),
    ]
    .into_iter()
    .map(|(key, info)| (key.to_string(), OwnerInfo::new(info)))
    .collect()
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn ready_fires_once_and_only_after_every_avatar() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let a = fetcher.expect(AVATAR_A);
    let b = fetcher.expect(AVATAR_B);
    let cache = ImagePreloadCache::new(fetcher.clone(), PreloadPolicy::default());
    let mut ready = cache.subscribe();

    let job = cache
        .preload(Generation::INITIAL, &two_owners())
        .expect("preload starts");
    settle().await;

    a.send((32, 32)).expect("resolve a");
    settle().await;
    assert!(matches!(ready.try_recv(), Err(TryRecvError::Empty)));

    b.send((64, 48)).expect("resolve b");
    job.await.expect("join");

    assert_eq!(
        ready.try_recv().expect("ready after both"),
        CacheReady {
            generation: Generation::INITIAL,
            loaded: 2,
            failed: 0,
        }
    );
    assert!(matches!(ready.try_recv(), Err(TryRecvError::Empty)));

    let images = cache.current().expect("cache");
    let b_entry = images.get("b").expect("b cached");
    assert_eq!((b_entry.natural_width, b_entry.natural_height), (64, 48));
    assert_eq!(images.len(), 2);
}

#[tokio::test]
async fn superseded_generation_cannot_touch_the_new_one() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let cache = ImagePreloadCache::new(fetcher.clone(), PreloadPolicy::default());
    let mut ready = cache.subscribe();
    let owners = two_owners();
    let first = Generation::INITIAL;
    let second = first.next();

    let old_a = fetcher.expect(AVATAR_A);
    let old_b = fetcher.expect(AVATAR_B);
    let old_job = cache.preload(first, &owners).expect("first generation");
    settle().await;
    let old_cache = cache.current().expect("first cache");

    let new_a = fetcher.expect(AVATAR_A);
    let new_b = fetcher.expect(AVATAR_B);
    let new_job = cache.preload(second, &owners).expect("second generation");
    settle().await;
    assert!(old_cache.is_sealed());

    old_a.send((1, 1)).expect("late a");
    old_b.send((1, 1)).expect("late b");
    old_job.await.expect("join old");
    assert!(matches!(ready.try_recv(), Err(TryRecvError::Empty)));
    assert!(old_cache.is_empty());
    assert_eq!(old_cache.ready(), None);

    let new_cache = cache.current().expect("second cache");
    assert_eq!(new_cache.generation(), second);
    assert!(new_cache.get("a").is_none());

    new_a.send((8, 8)).expect("new a");
    new_b.send((9, 9)).expect("new b");
    new_job.await.expect("join new");

    let event = ready.try_recv().expect("second generation ready");
    assert_eq!(event.generation, second);
    assert_eq!(event.loaded, 2);
    assert_eq!(new_cache.get("a").expect("a cached").natural_width, 8);
}

#[tokio::test(start_paused = true)]
async fn stalled_avatar_times_out_instead_of_blocking_readiness() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let _never = fetcher.expect(AVATAR_A);
    let b = fetcher.expect(AVATAR_B);
    let policy = PreloadPolicy {
        fetch_timeout: Duration::from_millis(500),
        max_concurrent: 4,
    };
    let cache = ImagePreloadCache::new(fetcher.clone(), policy);
    let mut ready = cache.subscribe();

    let job = cache
        .preload(Generation::INITIAL, &two_owners())
        .expect("preload starts");
    b.send((16, 16)).expect("resolve b");
    job.await.expect("join");

    let event = ready.try_recv().expect("ready despite the stall");
    assert_eq!((event.loaded, event.failed), (1, 1));
    let images = cache.current().expect("cache");
    assert!(images.get("a").is_none());
    assert!(images.get("b").is_some());
}

fn gate_parts(fetcher: Arc<ScriptedFetcher>) -> (Arc<StateStore>, Arc<ImagePreloadCache>) {
    let location = MemoryLocation::new(Url::parse("https://planboard.app/").expect("url"), "data");
    let store = Arc::new(StateStore::open(Box::new(location), default_state()));
    let preload = Arc::new(ImagePreloadCache::new(fetcher, PreloadPolicy::default()));
    (store, preload)
}

/// Records what it was handed on each draw.
#[derive(Default)]
struct RecordingRenderer {
    draws: usize,
    counters: Vec<u64>,
    avatar_widths: Vec<Option<u32>>,
}

impl ChartRenderer for RecordingRenderer {
    fn draw(&mut self, frame: &RenderFrame<'_>) -> anyhow::Result<()> {
        self.draws += 1;
        self.counters.push(frame.preload_counter);
        self.avatar_widths
            .push(frame.avatar("a").map(|entry| entry.natural_width));
        Ok(())
    }
}

#[tokio::test]
async fn counter_moves_once_per_ready_generation() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let (store, preload) = gate_parts(fetcher.clone());
    let mut gate = RenderGate::new(store.clone(), preload, RecordingRenderer::default());

    let owners_text = serde_json::to_string(&two_owners()).expect("owners json");
    let a = fetcher.expect(AVATAR_A);
    let b = fetcher.expect(AVATAR_B);
    apply_edit(&store, EditTarget::Owners, &owners_text).expect("owners edit");

    assert_eq!(gate.render(80), RenderOutcome::Drawn);
    assert_eq!(gate.preload_counter(), 0);

    a.send((40, 40)).expect("a");
    b.send((20, 20)).expect("b");
    assert!(gate.wait_ready(Duration::from_secs(5)).await.expect("wait"));
    assert_eq!(gate.preload_counter(), 1);

    assert_eq!(gate.render(80), RenderOutcome::Drawn);
    assert_eq!(gate.render(80), RenderOutcome::Drawn);
    assert_eq!(gate.preload_counter(), 1);

    // Same content, new generation: fresh cache, fresh join.
    let a2 = fetcher.expect(AVATAR_A);
    let b2 = fetcher.expect(AVATAR_B);
    let same = editor_text(&store.get(), EditTarget::Owners);
    apply_edit(&store, EditTarget::Owners, &same).expect("same owners");
    assert_eq!(gate.render(80), RenderOutcome::Drawn);

    a2.send((41, 41)).expect("a2");
    b2.send((21, 21)).expect("b2");
    assert!(gate.wait_ready(Duration::from_secs(5)).await.expect("wait"));
    assert_eq!(gate.render(80), RenderOutcome::Drawn);
    assert_eq!(gate.preload_counter(), 2);

    let renderer = gate.renderer();
    assert_eq!(renderer.draws, 5);
    assert_eq!(renderer.counters, vec![0, 1, 1, 1, 2]);
    assert_eq!(
        renderer.avatar_widths,
        vec![None, Some(40), Some(40), None, Some(41)]
    );
}

#[tokio::test]
async fn gate_created_after_readiness_still_counts_the_generation() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let (store, preload) = gate_parts(fetcher.clone());
    let owners_text = serde_json::to_string(&two_owners()).expect("owners json");
    let a = fetcher.expect(AVATAR_A);
    let b = fetcher.expect(AVATAR_B);
    apply_edit(&store, EditTarget::Owners, &owners_text).expect("owners edit");

    let mut first = RenderGate::new(store.clone(), preload.clone(), RecordingRenderer::default());
    first.sync_assets().expect("preload starts");
    a.send((40, 40)).expect("a");
    b.send((20, 20)).expect("b");
    assert!(first.wait_ready(Duration::from_secs(5)).await.expect("wait"));
    assert_eq!(first.preload_counter(), 1);

    let mut second = RenderGate::new(store.clone(), preload.clone(), RecordingRenderer::default());
    assert!(second.sync_assets().is_none());
    assert!(second.wait_ready(Duration::from_millis(50)).await.expect("wait"));
    assert_eq!(second.preload_counter(), 1);

    assert_eq!(second.render(80), RenderOutcome::Drawn);
    assert!(!second.poll_ready());
    let renderer = second.renderer();
    assert_eq!(renderer.counters, vec![1]);
    assert_eq!(renderer.avatar_widths, vec![Some(40)]);
    assert_eq!(
        preload.current().expect("cache").ready(),
        Some(CacheReady {
            generation: store.get().owners_generation,
            loaded: 2,
            failed: 0,
        })
    );
}

#[tokio::test]
async fn render_fault_shows_fallback_until_recovery_restores_default() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let (store, preload) = gate_parts(fetcher);
    let mut gate = RenderGate::new(store.clone(), preload, TextChart::new(false));
    assert_eq!(gate.render(80), RenderOutcome::Drawn);

    apply_edit(&store, EditTarget::Tasks, r#"[{"id":1,"start":"soon"}]"#).expect("edit");
    apply_edit(&store, EditTarget::Owners, r#"{"x":{"name":7}}"#).expect("edit");
    let malformed = store.get();

    let outcome = gate.render(80);
    assert_eq!(
        outcome,
        RenderOutcome::Fallback {
            message: "task 1 has no numeric start".to_string(),
        }
    );
    assert_eq!(store.get(), malformed);
    assert_eq!(gate.fault(), Some("task 1 has no numeric start"));
    assert!(matches!(gate.render(80), RenderOutcome::Fallback { .. }));

    gate.recover().expect("recover");
    assert_eq!(store.get().state, default_state());
    assert_eq!(gate.fault(), None);
    assert_eq!(gate.render(80), RenderOutcome::Drawn);
    assert!(gate.renderer().output().contains("Write project brief"));
}

struct PanickingRenderer;

impl ChartRenderer for PanickingRenderer {
    fn draw(&mut self, frame: &RenderFrame<'_>) -> anyhow::Result<()> {
        panic!("layout overflow with {} tasks", frame.tasks.len());
    }
}

#[tokio::test]
async fn renderer_panics_are_contained() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let (store, preload) = gate_parts(fetcher);
    let mut gate = RenderGate::new(store.clone(), preload, PanickingRenderer);
    let before = store.get();

    match gate.render(80) {
        RenderOutcome::Fallback { message } => assert_eq!(message, "layout overflow with 4 tasks"),
        RenderOutcome::Drawn => panic!("panicking renderer cannot draw"),
    }
    assert_eq!(store.get(), before);

    gate.recover().expect("recover");
    assert_eq!(store.get().state, default_state());
    assert_eq!(store.get().revision, before.revision + 1);
}
