//! Trait for defining item processing pipelines.
//!
//! This module provides the `Pipeline` trait, the unit of post-processing for
//! `Item`s after they have been extracted by a crawler. Pipelines allow for a
//! modular approach to handling crawled data, enabling operations such as:
//! - Storing items in databases or files.
//! - Filtering out unwanted content.
//! - Deduplicating entries.
//! - Attaching data produced by other subsystems (e.g. downloaded images).
//!
//! Implementors define `process_item`, which receives an `Item` and either
//! passes it on (possibly modified) or rejects it with a reason. `open` and
//! `close` bracket a crawl session and own any resources the pipeline needs.

use crate::context::CrawlContext;
use crate::error::PipelineError;
use crate::item::Item;
use async_trait::async_trait;

/// What a pipeline decided about one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Hand the (possibly transformed) item to the next pipeline.
    Continue(Item),
    /// Stop propagation of this item. Later items are unaffected.
    Rejected(String),
}

impl ItemOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ItemOutcome::Rejected(reason.into())
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ItemOutcome::Rejected(_))
    }
}

/// The `Pipeline` trait defines the contract for item processing pipelines.
///
/// A single pipeline instance may be shared by several concurrent crawl
/// sessions; state that belongs to one crawl must be keyed by
/// [`CrawlContext::crawl_id`].
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Returns the name of the pipeline.
    fn name(&self) -> &str;

    /// Called when a crawl session starts, before any item is processed.
    ///
    /// An error here is fatal to the whole session.
    async fn open(&self, _ctx: &CrawlContext) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Processes a single item.
    ///
    /// Returning `ItemOutcome::Rejected` drops the item without affecting the
    /// session. Returning an error drops the item too, and additionally stops the
    /// session if the error is fatal (see [`PipelineError::is_fatal`]).
    async fn process_item(
        &self,
        item: Item,
        ctx: &CrawlContext,
    ) -> Result<ItemOutcome, PipelineError>;

    /// Called when the crawl session ends, whether it finished or was aborted.
    ///
    /// This method releases whatever `open` acquired, such as file handles or
    /// database connections.
    async fn close(&self, _ctx: &CrawlContext) -> Result<(), PipelineError> {
        Ok(())
    }
}
