//! Streaming Item Pipeline for exporting crawled items to per-crawl JSON files.
//!
//! This module provides the `StreamingJsonWriterPipeline`, an item pipeline
//! that streams `Item`s into a JSON array without collecting them in memory.
//! Each crawl identity gets its own file, `<dir>/<crawl_id>.json`, and its own
//! exporter task, so several crawls can share one pipeline instance without
//! writing into each other's output.
//!
//! Key features include:
//! - Exporter sessions: opening a crawl writes the array's opening bracket,
//!   closing it writes the closing bracket and releases the file
//! - Streaming processing: items are written as they arrive
//! - Chunked writing: items are written in batches to improve I/O performance
//! - Proper JSON formatting: the exporter owns separators and framing

use crate::context::CrawlContext;
use crate::error::PipelineError;
use crate::item::Item;
use crate::pipeline::{ItemOutcome, Pipeline};
use crate::utils::file_stem_for;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kanal::unbounded_async;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

const DEFAULT_BATCH_SIZE: usize = 100;

enum ExportCommand {
    Write(Value),
    Shutdown(kanal::AsyncSender<Result<(), PipelineError>>),
}

/// A pipeline that streams each crawl's items into its own JSON array file.
pub struct StreamingJsonWriterPipeline {
    output_dir: PathBuf,
    batch_size: usize,
    exporters: DashMap<String, kanal::AsyncSender<ExportCommand>>,
}

impl StreamingJsonWriterPipeline {
    /// Creates a new `StreamingJsonWriterPipeline` writing into `output_dir`, with default batch size.
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self, PipelineError> {
        Self::with_batch_size(output_dir, DEFAULT_BATCH_SIZE)
    }

    /// Creates a new `StreamingJsonWriterPipeline` with a specified batch size.
    pub fn with_batch_size(
        output_dir: impl AsRef<Path>,
        batch_size: usize,
    ) -> Result<Self, PipelineError> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;
        info!(
            "Initializing StreamingJsonWriterPipeline in directory: {:?}",
            output_dir
        );
        Ok(StreamingJsonWriterPipeline {
            output_dir,
            batch_size: batch_size.max(1),
            exporters: DashMap::new(),
        })
    }

    /// The file a given crawl's items are exported to.
    pub fn output_path(&self, crawl_id: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.json", file_stem_for(crawl_id)))
    }

    /// Number of crawls with an open exporter session.
    pub fn active_exports(&self) -> usize {
        self.exporters.len()
    }

    fn exporter_for(
        &self,
        crawl_id: &str,
    ) -> Result<kanal::AsyncSender<ExportCommand>, PipelineError> {
        self.exporters
            .get(crawl_id)
            .map(|sender| sender.clone())
            .ok_or_else(|| {
                PipelineError::ResourceUnavailable(format!(
                    "no JSON export session open for crawl '{}'",
                    crawl_id
                ))
            })
    }
}

struct Exporter {
    writer: BufWriter<File>,
    items_buffer: Vec<Value>,
    first_item: bool,
    error: Option<PipelineError>,
}

impl Exporter {
    fn start(path: &Path) -> Result<Self, PipelineError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(b"[")?;
        Ok(Exporter {
            writer,
            items_buffer: Vec::new(),
            first_item: true,
            error: None,
        })
    }

    fn flush_items(&mut self) -> Result<(), PipelineError> {
        for item in self.items_buffer.drain(..) {
            let prefix = if self.first_item {
                self.first_item = false;
                "\n"
            } else {
                ",\n"
            };

            let item_str = serde_json::to_string(&item)?;
            self.writer
                .write_all(format!("{}  {}", prefix, item_str).as_bytes())?;
        }

        self.writer.flush().map_err(PipelineError::from)
    }

    fn record_failure(&mut self, result: Result<(), PipelineError>) {
        if let Err(e) = result {
            error!("JSON export write failed: {}", e);
            self.error.get_or_insert(e);
        }
    }

    fn finish(mut self) -> Result<(), PipelineError> {
        let flushed = self.flush_items();
        self.record_failure(flushed);
        let closing: &[u8] = if self.first_item { b"]\n" } else { b"\n]\n" };
        let finished = self
            .writer
            .write_all(closing)
            .and_then(|_| self.writer.flush())
            .map_err(PipelineError::from);
        self.record_failure(finished);
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Pipeline for StreamingJsonWriterPipeline {
    fn name(&self) -> &str {
        "StreamingJsonWriterPipeline"
    }

    async fn open(&self, ctx: &CrawlContext) -> Result<(), PipelineError> {
        let crawl_id = ctx.crawl_id().to_string();
        let vacant = match self.exporters.entry(crawl_id.clone()) {
            Entry::Occupied(_) => {
                return Err(PipelineError::Other(format!(
                    "JSON export for crawl '{}' is already open",
                    crawl_id
                )))
            }
            Entry::Vacant(vacant) => vacant,
        };

        let path_buf = self.output_path(&crawl_id);
        let mut exporter = Exporter::start(&path_buf)?;
        let batch_size = self.batch_size;
        let (command_sender, command_receiver) = unbounded_async::<ExportCommand>();
        vacant.insert(command_sender);

        tokio::task::spawn(async move {
            info!(
                "StreamingJsonWriterPipeline exporter started for file: {:?}",
                path_buf
            );

            while let Ok(command) = command_receiver.recv().await {
                match command {
                    ExportCommand::Write(value) => {
                        exporter.items_buffer.push(value);

                        if exporter.items_buffer.len() >= batch_size {
                            let flushed = exporter.flush_items();
                            exporter.record_failure(flushed);
                        }
                    }
                    ExportCommand::Shutdown(responder) => {
                        let result = exporter.finish();
                        if responder.send(result).await.is_err() {
                            error!("Failed to send shutdown response.");
                        }
                        info!(
                            "StreamingJsonWriterPipeline exporter for file: {:?} finished.",
                            path_buf
                        );
                        return;
                    }
                }
            }

            // Every sender was dropped without a shutdown; still close the array.
            if let Err(e) = exporter.finish() {
                error!("Failed to finish {:?}: {}", path_buf, e);
            }
        });

        Ok(())
    }

    async fn process_item(
        &self,
        item: Item,
        ctx: &CrawlContext,
    ) -> Result<ItemOutcome, PipelineError> {
        debug!("StreamingJsonWriterPipeline processing item.");
        let sender = self.exporter_for(ctx.crawl_id())?;

        sender
            .send(ExportCommand::Write(item.to_json_value()))
            .await
            .map_err(|e| {
                PipelineError::ResourceUnavailable(format!("Failed to send Write command: {}", e))
            })?;

        Ok(ItemOutcome::Continue(item))
    }

    async fn close(&self, ctx: &CrawlContext) -> Result<(), PipelineError> {
        let Some((_, sender)) = self.exporters.remove(ctx.crawl_id()) else {
            debug!(
                "No JSON export session to close for crawl '{}'",
                ctx.crawl_id()
            );
            return Ok(());
        };
        info!(
            "Closing StreamingJsonWriterPipeline export for crawl '{}'.",
            ctx.crawl_id()
        );

        let (tx, rx) = kanal::unbounded_async();
        sender
            .send(ExportCommand::Shutdown(tx))
            .await
            .map_err(|e| PipelineError::Other(format!("Failed to send Shutdown command: {}", e)))?;

        rx.recv().await.map_err(|e| {
            PipelineError::Other(format!("Failed to receive shutdown response: {}", e))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn news(crawl: &str, n: usize) -> Item {
        Item::new()
            .with("link", format!("http://{}.example/{}", crawl, n))
            .with("title", format!("{} #{}", crawl, n))
    }

    fn read_array(path: &Path) -> Vec<Item> {
        let content = fs::read_to_string(path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn writes_a_json_array_per_crawl() {
        let tmp = TempDir::new().unwrap();
        let pipeline = StreamingJsonWriterPipeline::with_batch_size(tmp.path(), 2).unwrap();
        let ctx = CrawlContext::new("huxiu");

        pipeline.open(&ctx).await.unwrap();
        let items: Vec<Item> = (0..5).map(|n| news("huxiu", n)).collect();
        for item in &items {
            pipeline.process_item(item.clone(), &ctx).await.unwrap();
        }
        pipeline.close(&ctx).await.unwrap();

        assert_eq!(read_array(&tmp.path().join("huxiu.json")), items);
        assert_eq!(pipeline.active_exports(), 0);
    }

    #[tokio::test]
    async fn empty_crawl_produces_empty_array() {
        let tmp = TempDir::new().unwrap();
        let pipeline = StreamingJsonWriterPipeline::new(tmp.path()).unwrap();
        let ctx = CrawlContext::new("quiet");

        pipeline.open(&ctx).await.unwrap();
        pipeline.close(&ctx).await.unwrap();

        assert!(read_array(&pipeline.output_path("quiet")).is_empty());
    }

    #[tokio::test]
    async fn concurrent_crawls_do_not_cross_write() {
        let tmp = TempDir::new().unwrap();
        let pipeline = StreamingJsonWriterPipeline::new(tmp.path()).unwrap();
        let a = CrawlContext::new("a");
        let b = CrawlContext::new("b");

        pipeline.open(&a).await.unwrap();
        pipeline.open(&b).await.unwrap();
        assert_eq!(pipeline.active_exports(), 2);
        for n in 0..3 {
            pipeline.process_item(news("a", n), &a).await.unwrap();
            pipeline.process_item(news("b", n), &b).await.unwrap();
        }
        pipeline.close(&a).await.unwrap();
        pipeline.process_item(news("b", 3), &b).await.unwrap();
        pipeline.close(&b).await.unwrap();

        let a_items = read_array(&pipeline.output_path("a"));
        let b_items = read_array(&pipeline.output_path("b"));
        assert_eq!(a_items.len(), 3);
        assert_eq!(b_items.len(), 4);
        assert!(a_items
            .iter()
            .all(|item| item.get_str("title").unwrap().starts_with("a #")));
    }

    #[tokio::test]
    async fn unopened_crawl_is_fatal_and_close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pipeline = StreamingJsonWriterPipeline::new(tmp.path()).unwrap();
        let ctx = CrawlContext::new("never-opened");

        let err = pipeline.process_item(news("x", 1), &ctx).await.unwrap_err();
        assert!(err.is_fatal());
        pipeline.close(&ctx).await.unwrap();

        pipeline.open(&ctx).await.unwrap();
        assert!(pipeline.open(&ctx).await.is_err());
        pipeline.close(&ctx).await.unwrap();
        pipeline.close(&ctx).await.unwrap();
    }
}
