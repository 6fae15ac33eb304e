//! Secondary harvest contexts
//!
//! A harvest opens the subject's profile page in a separate context that
//! runs the extraction observer. The coordinator never talks to that
//! context again: it only watches the shared store.

use async_trait::async_trait;
use mcn_common::dataset::is_reserved_key;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::LaunchError;
use crate::observer::{ExtractionObserver, PageLoader};

/// Query marker telling the observer it was opened by a harvest
pub const AUTO_OPENED_PARAM: &str = "autoOpened";

/// Profile URL for a subject, carrying the auto-opened marker
///
/// Reserved cache keys are never valid subject ids.
pub fn harvest_target(profile_base_url: &str, subject_id: &str) -> Result<Url, LaunchError> {
    if subject_id.is_empty() || subject_id.contains(['/', '?', '#']) || is_reserved_key(subject_id) {
        return Err(LaunchError::InvalidTarget(subject_id.to_string()));
    }

    let mut url = Url::parse(&format!("{}/{}", profile_base_url.trim_end_matches('/'), subject_id))
        .map_err(|e| LaunchError::InvalidTarget(format!("{subject_id}: {e}")))?;
    url.query_pairs_mut().append_pair(AUTO_OPENED_PARAM, "true");
    Ok(url)
}

/// True when the navigation target carries `autoOpened=true`
pub fn is_auto_opened(target: &Url) -> bool {
    target
        .query_pairs()
        .any(|(k, v)| k == AUTO_OPENED_PARAM && v == "true")
}

/// Subject id of a profile URL: its last non-empty path segment
pub fn subject_from_url(target: &Url) -> Option<String> {
    target
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

/// Opens a secondary context for a harvest target
#[async_trait]
pub trait ContextLauncher: Send + Sync {
    /// Start the context; returns once it is running, not when it finishes
    async fn open(&self, target: &Url) -> Result<(), LaunchError>;
}

/// Runs each harvest context as a child process (`<program> ... observe <url>`)
pub struct ProcessLauncher {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, leading_args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Re-invoke the running binary
    pub fn current_exe(leading_args: Vec<OsString>) -> Result<Self, LaunchError> {
        Ok(Self::new(std::env::current_exe()?, leading_args))
    }
}

#[async_trait]
impl ContextLauncher for ProcessLauncher {
    async fn open(&self, target: &Url) -> Result<(), LaunchError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.leading_args)
            .arg("observe")
            .arg(target.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?;

        debug!(pid = ?child.id(), url = %target, "Harvest context spawned");

        // Reap the child; its exit status does not affect the harvest
        let target = target.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!(url = %target, "Harvest context exited"),
                Ok(status) => warn!(url = %target, %status, "Harvest context exited with failure"),
                Err(e) => warn!(url = %target, error = %e, "Failed to wait for harvest context"),
            }
        });

        Ok(())
    }
}

/// Runs each harvest context as a task in this process
pub struct InProcessLauncher {
    observer: Arc<ExtractionObserver>,
    loader: Arc<dyn PageLoader>,
}

impl InProcessLauncher {
    pub fn new(observer: Arc<ExtractionObserver>, loader: Arc<dyn PageLoader>) -> Self {
        Self { observer, loader }
    }
}

#[async_trait]
impl ContextLauncher for InProcessLauncher {
    async fn open(&self, target: &Url) -> Result<(), LaunchError> {
        let observer = Arc::clone(&self.observer);
        let loader = Arc::clone(&self.loader);
        let target = target.clone();

        tokio::spawn(async move {
            match observer.run(loader.as_ref(), &target).await {
                Ok(observation) => info!(
                    subject_id = %observation.subject_id,
                    found = observation.record.is_some(),
                    "Harvest context finished"
                ),
                Err(e) => warn!(url = %target, error = %e, "Harvest context failed"),
            }
        });

        Ok(())
    }
}
