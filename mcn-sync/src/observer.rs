//! Extraction observer
//!
//! Runs inside a secondary context pointed at one author's profile page.
//! After letting the page settle it expands the profile details, looks for
//! the MCN detail item, and persists the value both as the subject's own
//! store entry and folded into the cached dataset.
//!
//! When the target carries the auto-opened marker the observer closes its
//! context afterwards, match or no match, and also when the page never
//! loaded or names no valid subject.

use async_trait::async_trait;
use mcn_common::dataset::is_reserved_key;
use mcn_common::store::fold_into_cached_data;
use mcn_common::{PersistentStore, Record};
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ObserverError;
use crate::launcher::{is_auto_opened, subject_from_url};

/// Label of the detail item carrying the affiliation
pub const MCN_LABEL: &str = "MCN 机构";

const DETAIL_ITEM_SELECTOR: &str = ".ProfileHeader-detailItem";
const DETAIL_VALUE_SELECTOR: &str = ".ProfileHeader-detailValue";

/// One rendered profile detail row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailItem {
    /// Full text of the row (label and value)
    pub text: String,
    /// Text of the value element, if the row has one
    pub value: Option<String>,
}

/// A loaded profile page
#[async_trait]
pub trait ProfilePage: Send + Sync {
    /// Trigger the "expand details" affordance; no-op when absent
    async fn expand_details(&mut self) -> Result<(), ObserverError>;

    /// Currently rendered detail rows
    async fn detail_items(&self) -> Result<Vec<DetailItem>, ObserverError>;

    /// Ask for this context to be closed
    async fn close(&mut self);
}

/// Opens profile pages for the observer
#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load(&self, target: &Url) -> Result<Box<dyn ProfilePage>, ObserverError>;

    /// Ask for the context to be closed when its page never loaded
    async fn abandon(&self, _target: &Url) {}
}

/// What one observation produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub subject_id: String,
    pub record: Option<Record>,
    pub closed: bool,
}

pub struct ExtractionObserver {
    store: Arc<dyn PersistentStore>,
    settle_delay: Duration,
}

impl ExtractionObserver {
    pub fn new(store: Arc<dyn PersistentStore>, settle_delay: Duration) -> Self {
        Self { store, settle_delay }
    }

    /// Load the target page and observe it
    pub async fn run(&self, loader: &dyn PageLoader, target: &Url) -> Result<Observation, ObserverError> {
        let mut page = match loader.load(target).await {
            Ok(page) => page,
            Err(e) => {
                if is_auto_opened(target) {
                    loader.abandon(target).await;
                }
                return Err(e);
            }
        };
        self.observe(target, page.as_mut()).await
    }

    /// Extract and persist the affiliation shown on `page`
    pub async fn observe(&self, target: &Url, page: &mut dyn ProfilePage) -> Result<Observation, ObserverError> {
        let auto_opened = is_auto_opened(target);
        let Some(subject_id) = subject_from_url(target).filter(|id| !is_reserved_key(id)) else {
            if auto_opened {
                page.close().await;
            }
            return Err(ObserverError::InvalidUrl(target.to_string()));
        };

        tokio::time::sleep(self.settle_delay).await;
        if let Err(e) = page.expand_details().await {
            warn!(subject_id = %subject_id, error = %e, "Could not expand profile details");
        }
        tokio::time::sleep(self.settle_delay).await;

        let result = self.extract_and_persist(&subject_id, &*page).await;

        let closed = if auto_opened {
            page.close().await;
            true
        } else {
            false
        };

        let record = result?;
        if record.is_none() {
            debug!(subject_id = %subject_id, "No MCN detail item on profile");
        }

        Ok(Observation {
            subject_id,
            record,
            closed,
        })
    }

    async fn extract_and_persist(
        &self,
        subject_id: &str,
        page: &dyn ProfilePage,
    ) -> Result<Option<Record>, ObserverError> {
        let items = page.detail_items().await?;
        let Some(affiliation) = find_affiliation(&items) else {
            return Ok(None);
        };

        let record = Record::new(subject_id, affiliation);
        self.store.set(&record.subject_id, &record.affiliation).await?;
        fold_into_cached_data(self.store.as_ref(), &record).await?;

        info!(subject_id = %record.subject_id, affiliation = %record.affiliation, "Saved MCN info");
        Ok(Some(record))
    }
}

/// First labelled item that actually has a value element
///
/// An empty value still counts as a match.
pub fn find_affiliation(items: &[DetailItem]) -> Option<String> {
    items
        .iter()
        .filter(|item| item.text.contains(MCN_LABEL))
        .find_map(|item| item.value.as_ref().map(|v| v.trim().to_string()))
}

/// Detail rows of a profile page's HTML
pub fn parse_detail_items(html: &str) -> Result<Vec<DetailItem>, ObserverError> {
    let item_selector = Selector::parse(DETAIL_ITEM_SELECTOR)
        .map_err(|e| ObserverError::Page(format!("bad selector: {e}")))?;
    let value_selector = Selector::parse(DETAIL_VALUE_SELECTOR)
        .map_err(|e| ObserverError::Page(format!("bad selector: {e}")))?;

    let document = Html::parse_document(html);
    let items = document
        .select(&item_selector)
        .map(|item| DetailItem {
            text: item.text().collect::<String>(),
            value: item
                .select(&value_selector)
                .next()
                .map(|v| v.text().collect::<String>()),
        })
        .collect();

    Ok(items)
}

/// Profile page fetched over HTTP
///
/// Server-rendered HTML already contains the collapsed detail rows, so
/// expanding is a no-op.
pub struct HttpProfilePage {
    body: String,
}

impl HttpProfilePage {
    pub fn from_html(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

#[async_trait]
impl ProfilePage for HttpProfilePage {
    async fn expand_details(&mut self) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn detail_items(&self) -> Result<Vec<DetailItem>, ObserverError> {
        parse_detail_items(&self.body)
    }

    async fn close(&mut self) {
        debug!("Closing harvest context");
    }
}

pub struct HttpPageLoader {
    http_client: reqwest::Client,
}

impl HttpPageLoader {
    pub fn new() -> Result<Self, ObserverError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("mcn-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ObserverError::Page(e.to_string()))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl PageLoader for HttpPageLoader {
    async fn load(&self, target: &Url) -> Result<Box<dyn ProfilePage>, ObserverError> {
        let response = self
            .http_client
            .get(target.clone())
            .send()
            .await
            .map_err(|e| ObserverError::Page(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ObserverError::Page(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ObserverError::Page(e.to_string()))?;
        Ok(Box::new(HttpProfilePage::from_html(body)))
    }

    async fn abandon(&self, target: &Url) {
        debug!(url = %target, "Closing harvest context without a page");
    }
}
