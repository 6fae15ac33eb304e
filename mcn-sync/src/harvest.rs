//! Background harvest coordination
//!
//! A harvest moves one subject through `Idle → Pending → {Completed |
//! TimedOut}`:
//!
//! 1. The subject is inserted into the pending set; if it was already
//!    there the call is a no-op.
//! 2. A watchdog task starts waiting for the deadline and a secondary
//!    context is opened on the subject's profile page.
//! 3. A poll task checks the shared store at a fixed interval.
//! 4. Whichever fires first settles the attempt: it cancels the other
//!    task, releases the pending slot and notifies the caller.
//!
//! The watchdog only forgets the attempt locally. The secondary context
//! may still finish and write afterwards; that late write is simply seen
//! by the next lookup.

use mcn_common::config::HarvestConfig;
use mcn_common::store::absent_on_error;
use mcn_common::PersistentStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::launcher::{harvest_target, ContextLauncher};

/// Terminal state of one harvest attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestOutcome {
    /// The store gained an entry for the subject
    Completed,
    /// Deadline reached without seeing an entry
    TimedOut,
    /// The secondary context could not be opened
    LaunchFailed(String),
}

/// Result of asking for a harvest
#[derive(Debug)]
pub enum HarvestStart {
    /// A new attempt is running; awaiting the handle is optional
    Started(JoinHandle<HarvestOutcome>),
    /// The subject already has an attempt in flight
    AlreadyPending,
}

impl HarvestStart {
    pub fn is_started(&self) -> bool {
        matches!(self, HarvestStart::Started(_))
    }

    /// Wait for the attempt to settle; `None` for a de-duplicated call
    pub async fn outcome(self) -> Option<HarvestOutcome> {
        match self {
            HarvestStart::Started(handle) => match handle.await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(error = %e, "Harvest task did not finish");
                    None
                }
            },
            HarvestStart::AlreadyPending => None,
        }
    }
}

/// UI hooks for harvest progress
///
/// All methods default to no-ops.
pub trait HarvestEvents: Send + Sync {
    /// Attempt accepted (disable the trigger, show "fetching")
    fn on_started(&self, _subject_id: &str) {}

    /// Entry observed; annotations should be re-rendered
    fn on_completed(&self, _subject_id: &str) {}

    /// Deadline reached; reset the trigger
    fn on_timed_out(&self, _subject_id: &str) {}

    /// Context could not be opened; reset the trigger
    fn on_launch_failed(&self, _subject_id: &str, _error: &str) {}
}

/// Events sink that only logs
pub struct LoggingEvents;

impl HarvestEvents for LoggingEvents {
    fn on_started(&self, subject_id: &str) {
        info!(subject_id, "Fetching MCN info");
    }

    fn on_completed(&self, subject_id: &str) {
        info!(subject_id, "MCN info recorded");
    }

    fn on_timed_out(&self, subject_id: &str) {
        info!(subject_id, "MCN harvest timed out");
    }

    fn on_launch_failed(&self, subject_id: &str, error: &str) {
        warn!(subject_id, error, "MCN harvest could not start");
    }
}

/// Subjects with a harvest in flight
///
/// Process-local and never persisted.
#[derive(Debug, Default)]
pub struct PendingHarvestSet {
    subjects: Mutex<HashSet<String>>,
}

impl PendingHarvestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-and-insert under one lock; false if already present
    pub fn try_insert(&self, subject_id: &str) -> bool {
        self.lock().insert(subject_id.to_string())
    }

    pub fn remove(&self, subject_id: &str) -> bool {
        self.lock().remove(subject_id)
    }

    pub fn contains(&self, subject_id: &str) -> bool {
        self.lock().contains(subject_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry (fresh process state)
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A panic while holding the lock cannot leave the set half-updated
        self.subjects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single-fire flag shared by the poll and watchdog of one attempt
#[derive(Debug, Default)]
pub struct SettleGuard {
    settled: AtomicBool,
}

impl SettleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for exactly one caller over the guard's lifetime
    pub fn try_settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// Poll interval and deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestTiming {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for HarvestTiming {
    fn default() -> Self {
        Self::from(&HarvestConfig::default())
    }
}

impl From<&HarvestConfig> for HarvestTiming {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// One in-flight attempt
struct HarvestAttempt {
    subject_id: String,
    guard: SettleGuard,
    cancel: CancellationToken,
    pending: Arc<PendingHarvestSet>,
    events: Arc<dyn HarvestEvents>,
}

impl HarvestAttempt {
    /// Apply the terminal transition; no-op for every caller but the first
    fn settle(&self, outcome: &HarvestOutcome) -> bool {
        if !self.guard.try_settle() {
            return false;
        }

        self.cancel.cancel();
        self.pending.remove(&self.subject_id);

        match outcome {
            HarvestOutcome::Completed => self.events.on_completed(&self.subject_id),
            HarvestOutcome::TimedOut => self.events.on_timed_out(&self.subject_id),
            HarvestOutcome::LaunchFailed(error) => self.events.on_launch_failed(&self.subject_id, error),
        }
        debug!(subject_id = %self.subject_id, ?outcome, "Harvest settled");
        true
    }
}

pub struct HarvestCoordinator {
    store: Arc<dyn PersistentStore>,
    launcher: Arc<dyn ContextLauncher>,
    events: Arc<dyn HarvestEvents>,
    pending: Arc<PendingHarvestSet>,
    timing: HarvestTiming,
    profile_base_url: String,
}

impl HarvestCoordinator {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        launcher: Arc<dyn ContextLauncher>,
        events: Arc<dyn HarvestEvents>,
        timing: HarvestTiming,
        profile_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            launcher,
            events,
            pending: Arc::new(PendingHarvestSet::new()),
            timing,
            profile_base_url: profile_base_url.into(),
        }
    }

    /// Start harvesting one subject in the background
    ///
    /// Must be called from within a Tokio runtime. A subject already in
    /// flight is not harvested twice.
    pub fn harvest(&self, subject_id: &str) -> HarvestStart {
        if !self.pending.try_insert(subject_id) {
            debug!(subject_id, "Harvest already pending, ignoring request");
            return HarvestStart::AlreadyPending;
        }

        let attempt = Arc::new(HarvestAttempt {
            subject_id: subject_id.to_string(),
            guard: SettleGuard::new(),
            cancel: CancellationToken::new(),
            pending: Arc::clone(&self.pending),
            events: Arc::clone(&self.events),
        });
        self.events.on_started(subject_id);

        let store = Arc::clone(&self.store);
        let launcher = Arc::clone(&self.launcher);
        let timing = self.timing;
        let target = harvest_target(&self.profile_base_url, subject_id);

        HarvestStart::Started(tokio::spawn(async move {
            // The deadline runs from insertion, so it also bounds the launch
            let watchdog = tokio::spawn(watchdog(Arc::clone(&attempt), timing.timeout));

            let opened = match target {
                Ok(target) => tokio::select! {
                    _ = attempt.cancel.cancelled() => None,
                    opened = launcher.open(&target) => Some(opened),
                },
                Err(e) => Some(Err(e)),
            };

            let polled = match opened {
                Some(Ok(())) => tokio::spawn(poll_for_entry(Arc::clone(&attempt), store, timing.poll_interval))
                    .await
                    .ok()
                    .flatten(),
                Some(Err(e)) => launch_failed(&attempt, e),
                // Watchdog fired while the context was still opening
                None => None,
            };
            let timed_out = watchdog.await.ok().flatten();

            match polled.or(timed_out) {
                Some(outcome) => outcome,
                // Nothing settled (tasks aborted on runtime shutdown); release the slot
                None => {
                    let outcome = HarvestOutcome::TimedOut;
                    attempt.settle(&outcome);
                    outcome
                }
            }
        }))
    }

    pub fn is_pending(&self, subject_id: &str) -> bool {
        self.pending.contains(subject_id)
    }

    pub fn pending(&self) -> &PendingHarvestSet {
        &self.pending
    }
}

/// Settle as `LaunchFailed` unless the watchdog got there first
fn launch_failed(attempt: &HarvestAttempt, error: LaunchError) -> Option<HarvestOutcome> {
    warn!(subject_id = %attempt.subject_id, error = %error, "Failed to open harvest context");
    let outcome = HarvestOutcome::LaunchFailed(error.to_string());
    attempt.settle(&outcome).then_some(outcome)
}

/// Poll the store until an entry for the subject appears or the attempt settles
async fn poll_for_entry(
    attempt: Arc<HarvestAttempt>,
    store: Arc<dyn PersistentStore>,
    poll_interval: Duration,
) -> Option<HarvestOutcome> {
    let mut tick = interval_at(Instant::now() + poll_interval, poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = attempt.cancel.cancelled() => return None,
            _ = tick.tick() => {}
        }

        let entry = absent_on_error(store.get(&attempt.subject_id).await, &attempt.subject_id);
        if entry.is_some() {
            let outcome = HarvestOutcome::Completed;
            return attempt.settle(&outcome).then_some(outcome);
        }
    }
}

/// Hard deadline for the attempt
async fn watchdog(attempt: Arc<HarvestAttempt>, timeout: Duration) -> Option<HarvestOutcome> {
    tokio::select! {
        _ = attempt.cancel.cancelled() => None,
        _ = sleep(timeout) => {
            let outcome = HarvestOutcome::TimedOut;
            attempt.settle(&outcome).then_some(outcome)
        }
    }
}
