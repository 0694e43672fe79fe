//! Item Pipeline adapting an image download subsystem.
//!
//! The pipeline reads the item's `image_urls`, hands them to an
//! [`ImageFetcher`], and keeps the item only if at least one image was stored.
//! The local paths of stored images are attached as `image_paths`.

use crate::context::CrawlContext;
use crate::error::PipelineError;
use crate::item::Item;
use crate::pipeline::{ItemOutcome, Pipeline};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const NO_IMAGES_REASON: &str = "no images";

/// Metadata of one fetched image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub url: String,
    /// Path of the stored file, relative to the image store.
    pub path: String,
    pub checksum: Option<String>,
}

/// Outcome of fetching one image; `info` is meaningful only when `ok`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    pub ok: bool,
    pub info: ImageInfo,
}

impl ImageResult {
    pub fn stored(info: ImageInfo) -> Self {
        Self { ok: true, info }
    }

    pub fn failed(url: impl Into<String>) -> Self {
        Self {
            ok: false,
            info: ImageInfo {
                url: url.into(),
                ..Default::default()
            },
        }
    }
}

/// The external subsystem that downloads images and stores them locally.
#[async_trait]
pub trait ImageFetcher: Send + Sync + 'static {
    async fn fetch(&self, urls: &[String], ctx: &CrawlContext) -> Vec<ImageResult>;
}

pub struct ImagesPipeline<F: ImageFetcher> {
    fetcher: F,
    urls_field: String,
    paths_field: String,
}

impl<F: ImageFetcher> ImagesPipeline<F> {
    pub fn new(fetcher: F) -> Self {
        ImagesPipeline {
            fetcher,
            urls_field: "image_urls".to_string(),
            paths_field: "image_paths".to_string(),
        }
    }

    /// Completion step: keep the item only if some image was stored.
    pub fn item_completed(&self, results: &[ImageResult], mut item: Item) -> ItemOutcome {
        let image_paths: Vec<Value> = results
            .iter()
            .filter(|result| result.ok)
            .map(|result| Value::String(result.info.path.clone()))
            .collect();

        if image_paths.is_empty() {
            return ItemOutcome::rejected(NO_IMAGES_REASON);
        }
        debug!(
            "Item {} has {} stored image(s)",
            item.identity(),
            image_paths.len()
        );
        item.set(self.paths_field.clone(), Value::Array(image_paths));
        ItemOutcome::Continue(item)
    }

    fn image_urls(&self, item: &Item) -> Vec<String> {
        match item.get(&self.urls_field) {
            Some(Value::Array(urls)) => urls
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(url)) => vec![url.clone()],
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl<F: ImageFetcher> Pipeline for ImagesPipeline<F> {
    fn name(&self) -> &str {
        "ImagesPipeline"
    }

    async fn process_item(
        &self,
        item: Item,
        ctx: &CrawlContext,
    ) -> Result<ItemOutcome, PipelineError> {
        let urls = self.image_urls(&item);
        let results = if urls.is_empty() {
            Vec::new()
        } else {
            self.fetcher.fetch(&urls, ctx).await
        };
        let failed = results.iter().filter(|r| !r.ok).count();
        if failed > 0 {
            warn!(
                "{} of {} image(s) failed for item {}",
                failed,
                results.len(),
                item.identity()
            );
        }
        Ok(self.item_completed(&results, item))
    }
}
