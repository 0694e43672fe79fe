//! Per-crawl context handed to every pipeline hook.
//!
//! The crawl session owns the shared handles (membership cache, persistent
//! store) and passes them to pipelines through this context, so no pipeline
//! reaches for a process-wide client.

use crate::error::PipelineError;
use crate::membership::MembershipCache;
use crate::store::PersistentStore;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct CrawlContext {
    crawl_id: String,
    membership: Option<Arc<dyn MembershipCache>>,
    store: Option<Arc<dyn PersistentStore>>,
}

impl CrawlContext {
    /// Creates a context for the crawl identified by `crawl_id` (usually the spider name).
    pub fn new(crawl_id: impl Into<String>) -> Self {
        Self {
            crawl_id: crawl_id.into(),
            membership: None,
            store: None,
        }
    }

    pub fn with_membership(mut self, membership: Arc<dyn MembershipCache>) -> Self {
        self.membership = Some(membership);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn crawl_id(&self) -> &str {
        &self.crawl_id
    }

    /// The membership cache, or a fatal error if the session was built without one.
    pub fn membership(&self) -> Result<&Arc<dyn MembershipCache>, PipelineError> {
        self.membership.as_ref().ok_or_else(|| {
            PipelineError::ResourceUnavailable(format!(
                "crawl '{}' has no membership cache configured",
                self.crawl_id
            ))
        })
    }

    /// The persistent store, or a fatal error if the session was built without one.
    pub fn store(&self) -> Result<&Arc<dyn PersistentStore>, PipelineError> {
        self.store.as_ref().ok_or_else(|| {
            PipelineError::ResourceUnavailable(format!(
                "crawl '{}' has no persistent store configured",
                self.crawl_id
            ))
        })
    }
}

impl fmt::Debug for CrawlContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlContext")
            .field("crawl_id", &self.crawl_id)
            .field("membership", &self.membership.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}
