//! Item Pipeline for exporting crawled items to JSON Lines (.jsonl) files.
//!
//! This module provides the `JsonlWriterPipeline`, an item pipeline that
//! stores each `Item` as a single JSON object followed by a newline character.
//! The output file is created (or truncated) when the crawl session opens the
//! pipeline and released when it is closed, so a crawl that is aborted midway
//! still leaves a file of complete records.
//!
//! Writes are flushed per record and performed on the blocking thread pool to
//! avoid stalling the event loop.

use crate::context::CrawlContext;
use crate::error::PipelineError;
use crate::item::Item;
use crate::pipeline::{ItemOutcome, Pipeline};
use async_trait::async_trait;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct OutputState {
    writer: Option<BufWriter<File>>,
    sessions: usize,
}

/// A pipeline that writes each item to a JSON Lines (.jsonl) file.
///
/// Sessions sharing one instance share the file; it stays open until the last
/// of them closes the pipeline.
pub struct JsonlWriterPipeline {
    path: PathBuf,
    state: Arc<Mutex<OutputState>>,
}

impl JsonlWriterPipeline {
    /// Creates a new `JsonlWriterPipeline` that will write to the specified file path.
    pub fn new(file_path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        crate::utils::validate_output_dir(&file_path)?;
        let path = file_path.as_ref().to_path_buf();
        info!("Initializing JsonlWriterPipeline for file: {:?}", path);
        Ok(JsonlWriterPipeline {
            path,
            state: Arc::new(Mutex::new(OutputState::default())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Pipeline for JsonlWriterPipeline {
    fn name(&self) -> &str {
        "JsonlWriterPipeline"
    }

    async fn open(&self, ctx: &CrawlContext) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        if state.writer.is_none() {
            info!(
                "Opening {:?} for crawl '{}'",
                self.path,
                ctx.crawl_id()
            );
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            state.writer = Some(BufWriter::new(file));
        }
        state.sessions += 1;
        Ok(())
    }

    async fn process_item(
        &self,
        item: Item,
        _ctx: &CrawlContext,
    ) -> Result<ItemOutcome, PipelineError> {
        debug!("JsonlWriterPipeline processing item.");
        let serialized_item = serde_json::to_string(&item)?;
        let state = Arc::clone(&self.state);

        tokio::task::spawn_blocking(move || {
            let mut state = state.blocking_lock();
            let writer = state.writer.as_mut().ok_or_else(|| {
                PipelineError::ResourceUnavailable("JSON Lines output is not open".to_string())
            })?;
            writeln!(writer, "{}", serialized_item)?;
            writer.flush()?;
            Ok::<(), PipelineError>(())
        })
        .await??;

        Ok(ItemOutcome::Continue(item))
    }

    async fn close(&self, ctx: &CrawlContext) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        state.sessions = state.sessions.saturating_sub(1);
        if state.sessions > 0 {
            debug!(
                "Crawl '{}' closed; {} session(s) still writing {:?}",
                ctx.crawl_id(),
                state.sessions,
                self.path
            );
            return Ok(());
        }
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
            info!("JsonlWriterPipeline closed {:?}", self.path);
        }
        Ok(())
    }
}
