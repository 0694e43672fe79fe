//! A crawl session: the producer side that opens, feeds and closes a [`Chain`].

use crate::chain::{Chain, Disposition};
use crate::context::CrawlContext;
use crate::error::{ChainError, PipelineError};
use crate::item::Item;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Counts of item outcomes for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub passed: usize,
    pub rejected: usize,
    pub failed: usize,
    /// True when the session stopped before the item feed was exhausted.
    pub aborted: bool,
}

impl CrawlReport {
    pub fn processed(&self) -> usize {
        self.passed + self.rejected + self.failed
    }
}

/// Closes the chain from a spawned task if the session future is dropped
/// between a successful open and its own close.
struct CloseOnDrop {
    chain: Arc<Chain>,
    ctx: CrawlContext,
    armed: bool,
}

impl CloseOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let crawl_id = self.ctx.crawl_id().to_string();
        warn!("Crawl '{}' was cancelled, closing pipelines in the background", crawl_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let chain = Arc::clone(&self.chain);
                let ctx = self.ctx.clone();
                handle.spawn(async move {
                    if let Err(e) = chain.close(&ctx).await {
                        error!("Crawl '{}' failed to close after cancellation: {}", crawl_id, e);
                    }
                });
            }
            Err(_) => error!(
                "Crawl '{}' was dropped outside a runtime, pipelines were not closed",
                crawl_id
            ),
        }
    }
}

pub struct CrawlSession {
    chain: Arc<Chain>,
    ctx: CrawlContext,
}

impl CrawlSession {
    pub fn new(chain: Arc<Chain>, ctx: CrawlContext) -> Self {
        Self { chain, ctx }
    }

    pub fn context(&self) -> &CrawlContext {
        &self.ctx
    }

    /// Runs until the item channel is closed by the crawler.
    pub async fn run(&self, items: kanal::AsyncReceiver<Item>) -> Result<CrawlReport, ChainError> {
        self.run_until(items, std::future::pending()).await
    }

    /// Runs until the item channel is closed or `abort` resolves.
    ///
    /// Pipelines are always closed before this returns, however the session
    /// ended. A fatal pipeline error takes precedence over close failures, which
    /// are then only logged. If the returned future is dropped after the chain
    /// opened, closing continues on a spawned task.
    pub async fn run_until<F>(
        &self,
        items: kanal::AsyncReceiver<Item>,
        abort: F,
    ) -> Result<CrawlReport, ChainError>
    where
        F: Future<Output = ()> + Send,
    {
        let crawl_id = self.ctx.crawl_id();
        self.chain.open(&self.ctx).await?;
        let mut guard = CloseOnDrop {
            chain: Arc::clone(&self.chain),
            ctx: self.ctx.clone(),
            armed: true,
        };
        info!("Crawl '{}' started", crawl_id);

        let mut report = CrawlReport::default();
        let fed = self.feed(&items, abort, &mut report).await;

        // From here the close runs on its own task so dropping this future
        // cannot interrupt it.
        guard.disarm();
        let chain = Arc::clone(&self.chain);
        let ctx = self.ctx.clone();
        let closed = match tokio::spawn(async move { chain.close(&ctx).await }).await {
            Ok(closed) => closed,
            Err(join_err) => Err(ChainError::Shutdown(vec![(
                "close task".to_string(),
                PipelineError::from(join_err),
            )])),
        };

        info!(
            "Crawl '{}' finished: {} passed, {} rejected, {} failed{}",
            crawl_id,
            report.passed,
            report.rejected,
            report.failed,
            if report.aborted { " (aborted)" } else { "" }
        );

        match (fed, closed) {
            (Err(fatal), Err(close_err)) => {
                error!("Crawl '{}' also failed to close: {}", crawl_id, close_err);
                Err(fatal)
            }
            (Err(fatal), Ok(())) => Err(fatal),
            (Ok(()), Err(close_err)) => Err(close_err),
            (Ok(()), Ok(())) => Ok(report),
        }
    }

    async fn feed<F>(
        &self,
        items: &kanal::AsyncReceiver<Item>,
        abort: F,
        report: &mut CrawlReport,
    ) -> Result<(), ChainError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(abort);
        loop {
            let item = tokio::select! {
                biased;
                _ = &mut abort => {
                    warn!("Crawl '{}' aborted", self.ctx.crawl_id());
                    report.aborted = true;
                    return Ok(());
                }
                received = items.recv() => match received {
                    Ok(item) => item,
                    Err(_) => return Ok(()),
                },
            };

            match self.chain.process_item(item, &self.ctx).await {
                Ok(Disposition::Passed(_)) => report.passed += 1,
                Ok(Disposition::Rejected { .. }) => report.rejected += 1,
                Ok(Disposition::Failed { .. }) => report.failed += 1,
                Err(fatal) => {
                    report.failed += 1;
                    report.aborted = true;
                    return Err(fatal);
                }
            }
        }
    }
}
