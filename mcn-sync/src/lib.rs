//! mcn-sync library
//!
//! Reconciles the shared MCN dataset with locally harvested observations
//! and coordinates background harvests of single authors.

pub mod error;
pub mod export;
pub mod fetcher;
pub mod harvest;
pub mod launcher;
pub mod observer;
pub mod reconcile;

pub use crate::error::{FetchError, LaunchError, ObserverError};
pub use crate::harvest::{HarvestCoordinator, HarvestOutcome, HarvestStart};
pub use crate::reconcile::{ReconciliationEngine, RefreshOutcome};

use mcn_common::Dataset;
use std::sync::Arc;

/// Consumer-facing surface used by the page annotation layer
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub coordinator: Arc<HarvestCoordinator>,
}

impl AppState {
    pub fn new(engine: Arc<ReconciliationEngine>, coordinator: Arc<HarvestCoordinator>) -> Self {
        Self { engine, coordinator }
    }

    pub async fn lookup(&self, subject_id: &str) -> Option<String> {
        self.engine.lookup(subject_id).await
    }

    pub fn harvest(&self, subject_id: &str) -> HarvestStart {
        self.coordinator.harvest(subject_id)
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        self.engine.refresh().await
    }

    pub async fn export_all(&self) -> Dataset {
        self.engine.export_all().await
    }
}
