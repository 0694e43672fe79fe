//! Declarative pipeline selection.
//!
//! `PipelineSettings` lists the pipelines of a chain with an `order` priority;
//! lower values run first, entries with equal priority keep their listed order.
//! Settings are plain serde data and can be loaded from any format serde
//! supports, e.g.
//!
//! ```json
//! {
//!   "pipelines": [
//!     { "type": "deduplication", "order": 100 },
//!     { "type": "filter_words", "order": 200, "words": ["pilgrim"] },
//!     { "type": "jsonl", "order": 300, "path": "out/items.jsonl" }
//!   ]
//! }
//! ```
//!
//! Image pipelines need an [`ImageFetcher`](crate::images::ImageFetcher) and are
//! added to the chain in code instead.

use crate::chain::Chain;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub pipelines: Vec<PipelineEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEntry {
    pub order: u32,
    #[serde(flatten)]
    pub kind: PipelineKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineKind {
    Deduplication {
        /// Seconds before a recorded url may be crawled again.
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    FilterWords {
        words: Vec<String>,
        #[serde(default)]
        fields: Option<Vec<String>>,
    },
    Jsonl {
        path: PathBuf,
    },
    StreamJson {
        dir: PathBuf,
        #[serde(default)]
        batch_size: Option<usize>,
    },
    ArticleDatabase,
    NewsDatabase {
        #[serde(default)]
        window_days: Option<i64>,
    },
}

impl PipelineSettings {
    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Builds a chain with the configured pipelines in priority order.
    pub fn build_chain(&self) -> Result<Chain, PipelineError> {
        let mut entries: Vec<&PipelineEntry> = self.pipelines.iter().collect();
        entries.sort_by_key(|entry| entry.order);

        let mut chain = Chain::new();
        for entry in entries {
            chain = add_entry(chain, &entry.kind)?;
        }
        info!("Built pipeline chain: {:?}", chain.names());
        Ok(chain)
    }
}

fn add_entry(chain: Chain, kind: &PipelineKind) -> Result<Chain, PipelineError> {
    let chain = match kind {
        PipelineKind::Deduplication { ttl_secs } => {
            let mut pipeline = crate::deduplication::DeduplicationPipeline::new();
            if let Some(secs) = ttl_secs {
                pipeline = pipeline.with_ttl(std::time::Duration::from_secs(*secs));
            }
            chain.add_pipeline(pipeline)
        }
        PipelineKind::FilterWords { words, fields } => {
            let mut pipeline = crate::filter_words::FilterWordsPipeline::new(words.as_slice());
            if let Some(fields) = fields {
                pipeline = pipeline.with_fields(fields.as_slice());
            }
            chain.add_pipeline(pipeline)
        }
        #[cfg(feature = "pipeline-jsonl")]
        PipelineKind::Jsonl { path } => {
            chain.add_pipeline(crate::jsonl_writer::JsonlWriterPipeline::new(path)?)
        }
        #[cfg(feature = "pipeline-stream-json")]
        PipelineKind::StreamJson { dir, batch_size } => {
            let pipeline = match batch_size {
                Some(size) => {
                    crate::streaming_json_writer::StreamingJsonWriterPipeline::with_batch_size(
                        dir, *size,
                    )?
                }
                None => crate::streaming_json_writer::StreamingJsonWriterPipeline::new(dir)?,
            };
            chain.add_pipeline(pipeline)
        }
        PipelineKind::ArticleDatabase => {
            chain.add_pipeline(crate::database::ArticleDatabasePipeline::new())
        }
        PipelineKind::NewsDatabase { window_days } => {
            let pipeline = match window_days {
                Some(days) => crate::database::NewsDatabasePipeline::with_window_days(*days),
                None => crate::database::NewsDatabasePipeline::new(),
            };
            chain.add_pipeline(pipeline)
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(PipelineError::Other(format!(
                "pipeline {:?} is not enabled in this build",
                other
            )))
        }
    };
    Ok(chain)
}
