//! # crawl-pipeline
//!
//! Item pipelines for crawled data: the chain that runs them for a crawl
//! session, and built-in pipelines that deduplicate, filter, export and store
//! items.
//!
//! A crawl session opens every pipeline, pushes each item through them in
//! order, and closes them when the crawl ends or is aborted. Any pipeline may
//! reject an item, which stops that item without affecting the others.
//!
//! ## Example
//!
//! ```rust,ignore
//! use crawl_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! let chain = Chain::new()
//!     .add_pipeline(DeduplicationPipeline::new())
//!     .add_pipeline(FilterWordsPipeline::new(&["pilgrim"]))
//!     .add_pipeline(JsonlWriterPipeline::new("items.jsonl")?)
//!     .add_pipeline(NewsDatabasePipeline::new());
//!
//! let ctx = CrawlContext::new("huxiu")
//!     .with_membership(Arc::new(InMemoryMembershipCache::new()))
//!     .with_store(Arc::new(SqliteStore::new("news.db")?));
//!
//! let (items_tx, items_rx) = kanal::unbounded_async();
//! let report = CrawlSession::new(Arc::new(chain), ctx).run(items_rx).await?;
//! ```

pub mod chain;
pub mod context;
pub mod database;
pub mod deduplication;
pub mod error;
pub mod filter_words;
pub mod images;
pub mod item;
pub mod membership;
pub mod pipeline;
pub mod session;
pub mod settings;
pub mod store;
pub mod utils;

// Optional pipelines (feature-gated)
#[cfg(feature = "pipeline-jsonl")]
pub mod jsonl_writer;

#[cfg(feature = "pipeline-stream-json")]
pub mod streaming_json_writer;

pub mod prelude {
    pub use crate::chain::{Chain, Disposition};
    pub use crate::context::CrawlContext;
    pub use crate::database::{ArticleDatabasePipeline, NewsDatabasePipeline};
    pub use crate::deduplication::DeduplicationPipeline;
    pub use crate::error::{ChainError, PipelineError};
    pub use crate::filter_words::FilterWordsPipeline;
    pub use crate::images::{ImageFetcher, ImageInfo, ImageResult, ImagesPipeline};
    pub use crate::item::Item;
    pub use crate::membership::{InMemoryMembershipCache, MembershipCache};
    pub use crate::pipeline::{ItemOutcome, Pipeline};
    pub use crate::session::{CrawlReport, CrawlSession};
    pub use crate::settings::PipelineSettings;
    pub use crate::store::{PersistentStore, StoredRecord};

    #[cfg(feature = "pipeline-jsonl")]
    pub use crate::jsonl_writer::JsonlWriterPipeline;
    #[cfg(feature = "pipeline-sqlite")]
    pub use crate::store::SqliteStore;
    #[cfg(feature = "pipeline-stream-json")]
    pub use crate::streaming_json_writer::StreamingJsonWriterPipeline;
}
