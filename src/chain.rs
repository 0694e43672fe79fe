//! Ordered composition of pipelines.
//!
//! A [`Chain`] drives its pipelines against each item and against the two
//! lifecycle events of a crawl session. Items visit pipelines strictly in
//! order; a rejection stops that item only. Closing is best-effort across all
//! pipelines, with failures reported together at the end.

use crate::context::CrawlContext;
use crate::error::{ChainError, PipelineError};
use crate::item::Item;
use crate::pipeline::{ItemOutcome, Pipeline};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Final result of sending one item through the chain.
#[derive(Debug)]
pub enum Disposition {
    /// Every pipeline let the item through.
    Passed(Item),
    /// A pipeline rejected the item.
    Rejected { stage: String, reason: String },
    /// A pipeline failed on this item; the item was dropped.
    Failed { stage: String, error: PipelineError },
}

#[derive(Default)]
pub struct Chain {
    pipelines: Vec<Arc<dyn Pipeline>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pipeline; items reach it after every pipeline added before.
    pub fn add_pipeline(mut self, pipeline: impl Pipeline) -> Self {
        self.pipelines.push(Arc::new(pipeline));
        self
    }

    /// Appends a pipeline instance that may also be part of other chains.
    pub fn add_shared(mut self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.pipelines.iter().map(|p| p.name()).collect()
    }

    /// Opens every pipeline in order.
    ///
    /// If one fails, the pipelines already opened are closed again and the
    /// failure is returned as [`ChainError::Startup`].
    pub async fn open(&self, ctx: &CrawlContext) -> Result<(), ChainError> {
        info!(
            "Opening {} pipeline(s) for crawl '{}'",
            self.pipelines.len(),
            ctx.crawl_id()
        );
        for (idx, pipeline) in self.pipelines.iter().enumerate() {
            debug!("Opening pipeline {}", pipeline.name());
            if let Err(source) = pipeline.open(ctx).await {
                error!(
                    "Pipeline {} failed to open for crawl '{}': {}",
                    pipeline.name(),
                    ctx.crawl_id(),
                    source
                );
                let opened = &self.pipelines[..idx];
                if let Err(close_err) = close_all(opened, ctx).await {
                    warn!("While unwinding startup: {}", close_err);
                }
                return Err(ChainError::Startup {
                    stage: pipeline.name().to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Sends one item through the pipelines.
    ///
    /// Rejections and ordinary failures are per-item outcomes. Only an error the
    /// pipeline marks as fatal is returned as `Err`.
    pub async fn process_item(
        &self,
        item: Item,
        ctx: &CrawlContext,
    ) -> Result<Disposition, ChainError> {
        let mut current = item;
        for pipeline in &self.pipelines {
            let identity = current.identity().to_string();
            match pipeline.process_item(current, ctx).await {
                Ok(ItemOutcome::Continue(next)) => current = next,
                Ok(ItemOutcome::Rejected(reason)) => {
                    info!(
                        "Item {} rejected by {}: {}",
                        identity,
                        pipeline.name(),
                        reason
                    );
                    return Ok(Disposition::Rejected {
                        stage: pipeline.name().to_string(),
                        reason,
                    });
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        "Pipeline {} is unusable (item {}): {}",
                        pipeline.name(),
                        identity,
                        e
                    );
                    return Err(ChainError::StageUnusable {
                        stage: pipeline.name().to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "Item {} dropped after {} failed: {}",
                        identity,
                        pipeline.name(),
                        e
                    );
                    return Ok(Disposition::Failed {
                        stage: pipeline.name().to_string(),
                        error: e,
                    });
                }
            }
        }
        Ok(Disposition::Passed(current))
    }

    /// Closes every pipeline in order, even after failures.
    pub async fn close(&self, ctx: &CrawlContext) -> Result<(), ChainError> {
        info!("Closing pipelines for crawl '{}'", ctx.crawl_id());
        close_all(&self.pipelines, ctx).await
    }
}

async fn close_all(pipelines: &[Arc<dyn Pipeline>], ctx: &CrawlContext) -> Result<(), ChainError> {
    let mut failures = Vec::new();
    for pipeline in pipelines {
        if let Err(e) = pipeline.close(ctx).await {
            error!("Pipeline {} failed to close: {}", pipeline.name(), e);
            failures.push((pipeline.name().to_string(), e));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ChainError::Shutdown(failures))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every hook call into a shared journal.
    pub(crate) struct Recorder {
        pub name: &'static str,
        pub journal: Arc<Mutex<Vec<String>>>,
        pub fail_open: bool,
        pub fail_close: bool,
        pub reject_url: Option<&'static str>,
        pub error: Option<fn() -> PipelineError>,
    }

    impl Recorder {
        pub fn new(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Recorder {
                name,
                journal: Arc::clone(journal),
                fail_open: false,
                fail_close: false,
                reject_url: None,
                error: None,
            }
        }

        fn log(&self, event: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event));
        }
    }

    #[async_trait]
    impl Pipeline for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn open(&self, _ctx: &CrawlContext) -> Result<(), PipelineError> {
            self.log("open");
            if self.fail_open {
                return Err(PipelineError::ResourceUnavailable("no db".into()));
            }
            Ok(())
        }

        async fn process_item(
            &self,
            mut item: Item,
            _ctx: &CrawlContext,
        ) -> Result<ItemOutcome, PipelineError> {
            self.log(&format!("process {}", item.identity()));
            if let Some(make_error) = self.error {
                return Err(make_error());
            }
            if self.reject_url.is_some() && item.url() == self.reject_url {
                return Ok(ItemOutcome::rejected("unwanted"));
            }
            item.set(self.name, true);
            Ok(ItemOutcome::Continue(item))
        }

        async fn close(&self, _ctx: &CrawlContext) -> Result<(), PipelineError> {
            self.log("close");
            if self.fail_close {
                return Err(PipelineError::IoError("flush failed".into()));
            }
            Ok(())
        }
    }

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(journal: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn items_visit_pipelines_in_order() {
        let j = journal();
        let chain = Chain::new()
            .add_pipeline(Recorder::new("A", &j))
            .add_pipeline(Recorder::new("B", &j));
        let ctx = CrawlContext::new("test");

        let disposition = chain
            .process_item(Item::new().with("url", "u1"), &ctx)
            .await
            .unwrap();
        match disposition {
            Disposition::Passed(item) => {
                assert_eq!(item.get("A"), Some(&serde_json::json!(true)));
                assert_eq!(item.get("B"), Some(&serde_json::json!(true)));
            }
            other => panic!("unexpected disposition: {:?}", other),
        }
        assert_eq!(entries(&j), vec!["A:process u1", "B:process u1"]);
    }

    #[tokio::test]
    async fn rejection_stops_only_that_item() {
        let j = journal();
        let mut first = Recorder::new("A", &j);
        first.reject_url = Some("bad");
        let chain = Chain::new()
            .add_pipeline(first)
            .add_pipeline(Recorder::new("B", &j));
        let ctx = CrawlContext::new("test");

        let rejected = chain
            .process_item(Item::new().with("url", "bad"), &ctx)
            .await
            .unwrap();
        assert!(matches!(
            rejected,
            Disposition::Rejected { ref stage, ref reason } if stage == "A" && reason == "unwanted"
        ));
        let passed = chain
            .process_item(Item::new().with("url", "good"), &ctx)
            .await
            .unwrap();
        assert!(matches!(passed, Disposition::Passed(_)));
        assert_eq!(
            entries(&j),
            vec!["A:process bad", "A:process good", "B:process good"]
        );
    }

    #[tokio::test]
    async fn ordinary_errors_drop_the_item_and_fatal_errors_surface() {
        let j = journal();
        let mut failing = Recorder::new("A", &j);
        failing.error = Some(|| PipelineError::DatabaseError("locked".into()));
        let chain = Chain::new().add_pipeline(failing);
        let ctx = CrawlContext::new("test");
        let outcome = chain
            .process_item(Item::new().with("url", "u"), &ctx)
            .await
            .unwrap();
        assert!(matches!(outcome, Disposition::Failed { ref stage, .. } if stage == "A"));

        let mut broken = Recorder::new("B", &j);
        broken.error = Some(|| PipelineError::ResourceUnavailable("closed".into()));
        let chain = Chain::new().add_pipeline(broken);
        let err = chain
            .process_item(Item::new().with("url", "u"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::StageUnusable { ref stage, .. } if stage == "B"));
    }

    #[tokio::test]
    async fn failed_open_unwinds_opened_pipelines() {
        let j = journal();
        let mut failing = Recorder::new("B", &j);
        failing.fail_open = true;
        let chain = Chain::new()
            .add_pipeline(Recorder::new("A", &j))
            .add_pipeline(failing)
            .add_pipeline(Recorder::new("C", &j));

        let err = chain.open(&CrawlContext::new("test")).await.unwrap_err();
        assert!(matches!(err, ChainError::Startup { ref stage, .. } if stage == "B"));
        assert_eq!(entries(&j), vec!["A:open", "B:open", "A:close"]);
    }

    #[tokio::test]
    async fn close_continues_past_failures_and_aggregates() {
        let j = journal();
        let mut a = Recorder::new("A", &j);
        a.fail_close = true;
        let mut c = Recorder::new("C", &j);
        c.fail_close = true;
        let chain = Chain::new()
            .add_pipeline(a)
            .add_pipeline(Recorder::new("B", &j))
            .add_pipeline(c);

        let err = chain.close(&CrawlContext::new("test")).await.unwrap_err();
        match err {
            ChainError::Shutdown(failures) => {
                let stages: Vec<_> = failures.iter().map(|(s, _)| s.as_str()).collect();
                assert_eq!(stages, vec!["A", "C"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(entries(&j), vec!["A:close", "B:close", "C:close"]);
    }
}
