//! Harvest coordinator state machine under paused Tokio time
//!
//! The secondary context is simulated by launchers that write to the shared
//! in-memory store after a delay (or never). The coordinator only sees the
//! store, exactly as with real child processes.

use async_trait::async_trait;
use mcn_common::dataset::{CACHE_DATA_KEY, CACHE_EXPIRATION_KEY};
use mcn_common::store::{read_cached_data, write_envelope, MemoryStore};
use mcn_common::{time, CacheEnvelope, Dataset, PersistentStore};
use mcn_sync::fetcher::DatasetSource;
use mcn_sync::harvest::{HarvestEvents, HarvestTiming};
use mcn_sync::launcher::{subject_from_url, ContextLauncher, InProcessLauncher};
use mcn_sync::observer::{ExtractionObserver, HttpProfilePage, PageLoader, ProfilePage};
use mcn_sync::{
    FetchError, HarvestCoordinator, HarvestOutcome, HarvestStart, LaunchError, ObserverError,
    ReconciliationEngine,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

const PROFILE_BASE: &str = "https://www.zhihu.com/people";

/// Simulated secondary context that records an affiliation after `delay`
struct DelayedWriter {
    store: MemoryStore,
    delay: Option<Duration>,
    opens: AtomicUsize,
}

impl DelayedWriter {
    fn writing_after(store: &MemoryStore, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            store: store.clone(),
            delay: Some(delay),
            opens: AtomicUsize::new(0),
        })
    }

    /// Opens a context that never produces a record
    fn silent(store: &MemoryStore) -> Arc<Self> {
        Arc::new(Self {
            store: store.clone(),
            delay: None,
            opens: AtomicUsize::new(0),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextLauncher for DelayedWriter {
    async fn open(&self, target: &Url) -> Result<(), LaunchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let subject_id = subject_from_url(target).unwrap();
        if let Some(delay) = self.delay {
            let store = self.store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                store.set(&subject_id, "星光传媒").await.unwrap();
            });
        }
        Ok(())
    }
}

struct RefusingLauncher;

#[async_trait]
impl ContextLauncher for RefusingLauncher {
    async fn open(&self, target: &Url) -> Result<(), LaunchError> {
        Err(LaunchError::InvalidTarget(target.to_string()))
    }
}

#[derive(Default)]
struct CountingEvents {
    started: AtomicUsize,
    completed: AtomicUsize,
    timed_out: AtomicUsize,
    launch_failed: AtomicUsize,
}

impl HarvestEvents for CountingEvents {
    fn on_started(&self, _subject_id: &str) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_completed(&self, _subject_id: &str) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_timed_out(&self, _subject_id: &str) {
        self.timed_out.fetch_add(1, Ordering::SeqCst);
    }

    fn on_launch_failed(&self, _subject_id: &str, _error: &str) {
        self.launch_failed.fetch_add(1, Ordering::SeqCst);
    }
}

struct NoRemote;

#[async_trait]
impl DatasetSource for NoRemote {
    async fn fetch(&self) -> Result<Dataset, FetchError> {
        Err(FetchError::Network("offline".to_string()))
    }
}

fn coordinator(
    store: &MemoryStore,
    launcher: Arc<dyn ContextLauncher>,
    events: Arc<CountingEvents>,
) -> HarvestCoordinator {
    HarvestCoordinator::new(
        Arc::new(store.clone()),
        launcher,
        events,
        HarvestTiming {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        },
        PROFILE_BASE,
    )
}

fn engine(store: &MemoryStore) -> ReconciliationEngine {
    ReconciliationEngine::new(
        Arc::new(store.clone()),
        Arc::new(NoRemote),
        Duration::from_secs(86_400),
    )
}

#[tokio::test(start_paused = true)]
async fn test_harvest_completes_when_entry_appears() {
    let store = MemoryStore::new();
    let launcher = DelayedWriter::writing_after(&store, Duration::from_millis(1_200));
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, launcher.clone(), events.clone());

    let start = Instant::now();
    let outcome = coordinator.harvest("zhang-san").outcome().await;

    assert_eq!(outcome, Some(HarvestOutcome::Completed));
    // Detected on the first poll after the write
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1_200), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_200 + 500 + 50), "elapsed {elapsed:?}");
    assert!(!coordinator.is_pending("zhang-san"));
    assert_eq!(events.started.load(Ordering::SeqCst), 1);
    assert_eq!(events.completed.load(Ordering::SeqCst), 1);
    assert_eq!(events.timed_out.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_harvest_is_a_noop() {
    let store = MemoryStore::new();
    let launcher = DelayedWriter::writing_after(&store, Duration::from_secs(2));
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, launcher.clone(), events.clone());

    let first = coordinator.harvest("zhang-san");
    let second = coordinator.harvest("zhang-san");

    assert!(first.is_started());
    assert!(matches!(second, HarvestStart::AlreadyPending));
    assert_eq!(coordinator.pending().len(), 1);
    assert_eq!(second.outcome().await, None);

    assert_eq!(first.outcome().await, Some(HarvestOutcome::Completed));
    assert_eq!(launcher.opens(), 1, "Second call must not open another context");
    assert_eq!(events.started.load(Ordering::SeqCst), 1);
    assert_eq!(events.completed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_subjects_harvest_concurrently() {
    let store = MemoryStore::new();
    let launcher = DelayedWriter::writing_after(&store, Duration::from_secs(1));
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, launcher.clone(), events.clone());

    let a = coordinator.harvest("zhang-san");
    let b = coordinator.harvest("li-si");
    assert_eq!(coordinator.pending().len(), 2);

    assert_eq!(a.outcome().await, Some(HarvestOutcome::Completed));
    assert_eq!(b.outcome().await, Some(HarvestOutcome::Completed));
    assert!(coordinator.pending().is_empty());
    assert_eq!(launcher.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_harvest_times_out_and_can_be_retried() {
    let store = MemoryStore::new();
    let launcher = DelayedWriter::silent(&store);
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, launcher.clone(), events.clone());

    let start = Instant::now();
    let outcome = coordinator.harvest("zhang-san").outcome().await;

    assert_eq!(outcome, Some(HarvestOutcome::TimedOut));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(10_050), "elapsed {elapsed:?}");
    assert!(!coordinator.is_pending("zhang-san"));
    assert_eq!(events.timed_out.load(Ordering::SeqCst), 1);
    assert_eq!(events.completed.load(Ordering::SeqCst), 0);

    let retry = coordinator.harvest("zhang-san");
    assert!(retry.is_started(), "A timed-out subject must not stay blocked");
    assert_eq!(retry.outcome().await, Some(HarvestOutcome::TimedOut));
    assert_eq!(launcher.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_write_after_timeout_is_visible_on_lookup() {
    let store = MemoryStore::new();
    let launcher = DelayedWriter::writing_after(&store, Duration::from_secs(15));
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, launcher, events.clone());
    let engine = engine(&store);

    assert_eq!(
        coordinator.harvest("zhang-san").outcome().await,
        Some(HarvestOutcome::TimedOut)
    );
    assert_eq!(engine.lookup("zhang-san").await, None);

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(engine.lookup("zhang-san").await, Some("星光传媒".to_string()));
    assert_eq!(events.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_releases_pending_slot() {
    let store = MemoryStore::new();
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, Arc::new(RefusingLauncher), events.clone());

    let outcome = coordinator.harvest("zhang-san").outcome().await;

    assert!(matches!(outcome, Some(HarvestOutcome::LaunchFailed(_))));
    assert!(coordinator.pending().is_empty());
    assert_eq!(events.launch_failed.load(Ordering::SeqCst), 1);
    assert_eq!(events.timed_out.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_subject_id_fails_without_blocking() {
    let store = MemoryStore::new();
    let launcher = DelayedWriter::silent(&store);
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, launcher.clone(), events.clone());

    let outcome = coordinator.harvest("a/b").outcome().await;

    assert!(matches!(outcome, Some(HarvestOutcome::LaunchFailed(_))));
    assert_eq!(launcher.opens(), 0);
    assert!(!coordinator.is_pending("a/b"));
}

/// Launcher whose context never finishes opening
struct HangingLauncher;

#[async_trait]
impl ContextLauncher for HangingLauncher {
    async fn open(&self, _target: &Url) -> Result<(), LaunchError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_covers_a_launch_that_never_returns() {
    let store = MemoryStore::new();
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, Arc::new(HangingLauncher), events.clone());

    let start = Instant::now();
    let outcome = coordinator.harvest("zhang-san").outcome().await;

    assert_eq!(outcome, Some(HarvestOutcome::TimedOut));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(10_050), "elapsed {elapsed:?}");
    assert!(!coordinator.is_pending("zhang-san"));
    assert_eq!(events.timed_out.load(Ordering::SeqCst), 1);
    assert_eq!(events.launch_failed.load(Ordering::SeqCst), 0);

    assert!(coordinator.harvest("zhang-san").is_started(), "Retry must be accepted");
}

#[tokio::test(start_paused = true)]
async fn test_reserved_cache_keys_are_never_harvested() {
    let store = MemoryStore::new();
    let mut cached = Dataset::new();
    cached.insert("alice".to_string(), "MCN A".to_string());
    write_envelope(&store, &CacheEnvelope::new(cached.clone(), time::now(), Duration::from_secs(60)))
        .await
        .unwrap();
    let launcher = DelayedWriter::silent(&store);
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, launcher.clone(), events.clone());

    for key in [CACHE_DATA_KEY, CACHE_EXPIRATION_KEY] {
        let outcome = coordinator.harvest(key).outcome().await;
        assert!(matches!(outcome, Some(HarvestOutcome::LaunchFailed(_))), "{key}: {outcome:?}");
        assert!(!coordinator.is_pending(key));
    }

    assert_eq!(launcher.opens(), 0);
    assert_eq!(events.completed.load(Ordering::SeqCst), 0);
    assert_eq!(read_cached_data(&store).await, Some(cached));
}

/// Serves a fixed profile page for any target
struct StaticPages {
    html: &'static str,
}

#[async_trait]
impl PageLoader for StaticPages {
    async fn load(&self, _target: &Url) -> Result<Box<dyn ProfilePage>, ObserverError> {
        Ok(Box::new(HttpProfilePage::from_html(self.html)))
    }
}

#[tokio::test(start_paused = true)]
async fn test_in_process_harvest_round_trip_without_refresh() {
    let store = MemoryStore::new();
    let observer = Arc::new(ExtractionObserver::new(
        Arc::new(store.clone()),
        Duration::from_secs(1),
    ));
    let loader = Arc::new(StaticPages {
        html: r#"<div class="ProfileHeader-detailItem">
                   <span>MCN 机构</span>
                   <div class="ProfileHeader-detailValue">星光传媒</div>
                 </div>"#,
    });
    let launcher = Arc::new(InProcessLauncher::new(observer, loader));
    let events = Arc::new(CountingEvents::default());
    let coordinator = coordinator(&store, launcher, events.clone());
    let engine = engine(&store);
    engine.load_cache().await;

    let outcome = coordinator.harvest("zhang-san").outcome().await;

    assert_eq!(outcome, Some(HarvestOutcome::Completed));
    assert_eq!(engine.lookup("zhang-san").await, Some("星光传媒".to_string()));
    assert_eq!(read_cached_data(&store).await.unwrap()["zhang-san"], "星光传媒");
    assert_eq!(events.completed.load(Ordering::SeqCst), 1);
}
