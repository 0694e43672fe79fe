//! Item Pipeline for deduplicating crawled items.
//!
//! This module provides the `DeduplicationPipeline`, which stops items that
//! were already seen, before they reach filtering or storage pipelines.
//!
//! The pipeline works by:
//! - Building a dedup key from the item's `url` field (`url:<url>`).
//! - Asking the session's [`MembershipCache`](crate::membership::MembershipCache)
//!   whether the key exists, rejecting the item as `"duplicate"` if it does.
//! - Recording the key without expiry otherwise, so the membership outlives
//!   the crawl and later runs skip the same pages.
//!
//! The existence check and the write are two separate calls; two concurrent
//! sessions racing on the same url may both let it through once.

use crate::context::CrawlContext;
use crate::error::PipelineError;
use crate::item::Item;
use crate::pipeline::{ItemOutcome, Pipeline};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

pub const DUPLICATE_REASON: &str = "duplicate";

/// A pipeline that rejects items whose url has been recorded before.
pub struct DeduplicationPipeline {
    key_field: String,
    key_prefix: String,
    ttl: Option<Duration>,
}

impl DeduplicationPipeline {
    /// Creates a `DeduplicationPipeline` keyed on `url`, with no expiry.
    pub fn new() -> Self {
        info!("Initializing DeduplicationPipeline keyed on 'url'");
        DeduplicationPipeline {
            key_field: "url".to_string(),
            key_prefix: "url:".to_string(),
            ttl: None,
        }
    }

    /// Expires recorded keys after `ttl` instead of keeping them forever.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn dedup_key(&self, item: &Item) -> Result<String, PipelineError> {
        let value = item.get_str(&self.key_field).ok_or_else(|| {
            PipelineError::ItemError(format!(
                "Item for deduplication has no string field '{}'.",
                self.key_field
            ))
        })?;
        Ok(format!("{}{}", self.key_prefix, value))
    }
}

impl Default for DeduplicationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for DeduplicationPipeline {
    fn name(&self) -> &str {
        "DeduplicationPipeline"
    }

    async fn open(&self, ctx: &CrawlContext) -> Result<(), PipelineError> {
        ctx.membership()?;
        Ok(())
    }

    async fn process_item(
        &self,
        item: Item,
        ctx: &CrawlContext,
    ) -> Result<ItemOutcome, PipelineError> {
        debug!("DeduplicationPipeline processing item.");
        let key = self.dedup_key(&item)?;
        let membership = ctx.membership()?;

        if membership.exists(&key).await? {
            debug!("Duplicate item detected, dropping: {}", key);
            return Ok(ItemOutcome::rejected(DUPLICATE_REASON));
        }

        membership.set(&key, "1", self.ttl).await?;
        debug!("Unique item, passing through: {}", key);
        Ok(ItemOutcome::Continue(item))
    }
}
