//! Item Pipelines for persisting crawled items to a relational store.
//!
//! Two pipelines are provided:
//! - `ArticleDatabasePipeline` stores every item as a row of the `articles`
//!   table.
//! - `NewsDatabasePipeline` stores items in the `news` table, but skips links
//!   the same crawl already stored within a trailing window (30 days by
//!   default). The recent links are loaded once when the crawl opens the
//!   pipeline and grow as new rows are inserted.
//!
//! Both obtain the store from the crawl's [`CrawlContext`] and insert each item
//! in its own transaction, so a failure affects that item only. All store calls
//! run on the blocking thread pool.

use crate::context::CrawlContext;
use crate::error::PipelineError;
use crate::item::Item;
use crate::pipeline::{ItemOutcome, Pipeline};
use crate::store::{PersistentStore, StoredRecord, ARTICLES_TABLE, NEWS_TABLE};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use log::{debug, info, trace};
use std::collections::HashSet;
use std::sync::Arc;

const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Checks the store is reachable and creates `table` if needed.
async fn prepare_table(
    store: &Arc<dyn PersistentStore>,
    table: &'static str,
) -> Result<(), PipelineError> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || {
        store.ping()?;
        store.ensure_schema(table)
    })
    .await?
}

async fn insert(
    store: &Arc<dyn PersistentStore>,
    table: &'static str,
    record: StoredRecord,
) -> Result<(), PipelineError> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.insert_record(table, &record)).await?
}

/// A pipeline that saves every item as an article row.
pub struct ArticleDatabasePipeline;

impl ArticleDatabasePipeline {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ArticleDatabasePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for ArticleDatabasePipeline {
    fn name(&self) -> &str {
        "ArticleDatabasePipeline"
    }

    async fn open(&self, ctx: &CrawlContext) -> Result<(), PipelineError> {
        info!("ArticleDatabasePipeline preparing table '{}'", ARTICLES_TABLE);
        prepare_table(ctx.store()?, ARTICLES_TABLE).await
    }

    async fn process_item(
        &self,
        item: Item,
        ctx: &CrawlContext,
    ) -> Result<ItemOutcome, PipelineError> {
        trace!("ArticleDatabasePipeline processing item");
        let record = StoredRecord::article_from_item(&item);
        insert(ctx.store()?, ARTICLES_TABLE, record).await?;
        debug!("Saved article {}", item.identity());
        Ok(ItemOutcome::Continue(item))
    }
}

/// A pipeline that saves news items whose link was not stored recently.
pub struct NewsDatabasePipeline {
    window: Duration,
    recent_links: DashMap<String, HashSet<String>>,
}

impl NewsDatabasePipeline {
    /// Creates a pipeline with a 30 day window.
    pub fn new() -> Self {
        Self::with_window_days(DEFAULT_WINDOW_DAYS)
    }

    pub fn with_window_days(days: i64) -> Self {
        NewsDatabasePipeline {
            window: Duration::days(days),
            recent_links: DashMap::new(),
        }
    }

    /// The links currently considered recent for a crawl, sorted.
    pub fn recent_links(&self, crawl_id: &str) -> Vec<String> {
        let mut links: Vec<String> = self
            .recent_links
            .get(crawl_id)
            .map(|links| links.iter().cloned().collect())
            .unwrap_or_default();
        links.sort();
        links
    }

    /// Reserves `link` for this crawl. False if it is already recent.
    fn reserve(&self, crawl_id: &str, link: &str) -> Result<bool, PipelineError> {
        let mut links = self.recent_links.get_mut(crawl_id).ok_or_else(|| {
            PipelineError::ResourceUnavailable(format!(
                "NewsDatabasePipeline was not opened for crawl '{}'",
                crawl_id
            ))
        })?;
        Ok(links.insert(link.to_string()))
    }

    fn release(&self, crawl_id: &str, link: &str) {
        if let Some(mut links) = self.recent_links.get_mut(crawl_id) {
            links.remove(link);
        }
    }
}

impl Default for NewsDatabasePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for NewsDatabasePipeline {
    fn name(&self) -> &str {
        "NewsDatabasePipeline"
    }

    async fn open(&self, ctx: &CrawlContext) -> Result<(), PipelineError> {
        let store = ctx.store()?;
        prepare_table(store, NEWS_TABLE).await?;

        let crawl_id = ctx.crawl_id().to_string();
        let since = Utc::now().naive_utc() - self.window;
        let links = {
            let store = Arc::clone(store);
            let crawl_id = crawl_id.clone();
            tokio::task::spawn_blocking(move || store.links_since(NEWS_TABLE, &crawl_id, since))
                .await??
        };

        info!(
            "NewsDatabasePipeline loaded {} recent link(s) for crawl '{}'",
            links.len(),
            crawl_id
        );
        self.recent_links
            .insert(crawl_id, links.into_iter().collect());
        Ok(())
    }

    async fn process_item(
        &self,
        item: Item,
        ctx: &CrawlContext,
    ) -> Result<ItemOutcome, PipelineError> {
        let crawl_id = ctx.crawl_id();
        let link = item
            .link()
            .ok_or_else(|| PipelineError::ItemError("News item has no 'link' field.".to_string()))?
            .to_string();
        trace!("NewsDatabasePipeline processing {}", link);

        if !self.reserve(crawl_id, &link)? {
            debug!("Link {} already stored recently, skipping insert", link);
            return Ok(ItemOutcome::Continue(item));
        }

        let record = StoredRecord::news_from_item(&item, crawl_id);
        let store = match ctx.store() {
            Ok(store) => store,
            Err(e) => {
                self.release(crawl_id, &link);
                return Err(e);
            }
        };
        if let Err(e) = insert(store, NEWS_TABLE, record).await {
            self.release(crawl_id, &link);
            return Err(e);
        }
        debug!("Saved news {}", link);
        Ok(ItemOutcome::Continue(item))
    }

    async fn close(&self, ctx: &CrawlContext) -> Result<(), PipelineError> {
        if let Some((crawl_id, links)) = self.recent_links.remove(ctx.crawl_id()) {
            debug!(
                "Dropping {} recent link(s) for crawl '{}'",
                links.len(),
                crawl_id
            );
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "pipeline-sqlite"))]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use rusqlite::Connection;
    use std::path::Path;
    use tempfile::TempDir;

    fn context(crawl_id: &str, path: &Path) -> CrawlContext {
        let store = SqliteStore::new(path).unwrap();
        CrawlContext::new(crawl_id).with_store(Arc::new(store))
    }

    fn count_rows(path: &Path, table: &str, link: Option<&str>) -> i64 {
        let conn = Connection::open(path).unwrap();
        match link {
            Some(link) => conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {} WHERE link = ?1", table),
                    [link],
                    |row| row.get(0),
                )
                .unwrap(),
            None => conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .unwrap(),
        }
    }

    fn seed(path: &Path, link: &str, crawlkey: &str, days_ago: i64) {
        let store = SqliteStore::new(path).unwrap();
        store.ensure_schema(NEWS_TABLE).unwrap();
        let record = StoredRecord {
            link: Some(link.to_string()),
            crawlkey: Some(crawlkey.to_string()),
            pubdate: Some(Utc::now().naive_utc() - Duration::days(days_ago)),
            ..Default::default()
        };
        store.insert_record(NEWS_TABLE, &record).unwrap();
    }

    #[tokio::test]
    async fn article_rows_are_inserted_and_items_pass() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("articles.db");
        let ctx = context("blog", &path);
        let pipeline = ArticleDatabasePipeline::new();

        pipeline.open(&ctx).await.unwrap();
        let item = Item::new()
            .with("url", "http://blog/1")
            .with("title", " Hello ")
            .with("body", "  indented code\r\n    line2\n")
            .with("publish_time", "2024-01-01")
            .with("source_site", "blog");
        let outcome = pipeline.process_item(item.clone(), &ctx).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Continue(item));
        pipeline.close(&ctx).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let (url, title, body): (String, String, String) = conn
            .query_row("SELECT url, title, body FROM articles", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!(url, "http://blog/1");
        assert_eq!(title, " Hello ");
        assert_eq!(body, "  indented code\r\n    line2\n");
    }

    #[tokio::test]
    async fn open_without_store_is_fatal() {
        let err = ArticleDatabasePipeline::new()
            .open(&CrawlContext::new("blog"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn recent_links_are_skipped_and_new_ones_inserted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("news.db");
        seed(&path, "linkX", "huxiu", 1);
        let ctx = context("huxiu", &path);
        let pipeline = NewsDatabasePipeline::new();

        pipeline.open(&ctx).await.unwrap();
        assert_eq!(pipeline.recent_links("huxiu"), vec!["linkX".to_string()]);

        let skipped = Item::new().with("link", "linkX").with("title", "old");
        let outcome = pipeline.process_item(skipped.clone(), &ctx).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Continue(skipped));
        assert_eq!(count_rows(&path, NEWS_TABLE, Some("linkX")), 1);

        let fresh = Item::new().with("link", "linkY").with("title", "new");
        pipeline.process_item(fresh.clone(), &ctx).await.unwrap();
        assert_eq!(count_rows(&path, NEWS_TABLE, Some("linkY")), 1);
        assert_eq!(
            pipeline.recent_links("huxiu"),
            vec!["linkX".to_string(), "linkY".to_string()]
        );

        pipeline.process_item(fresh, &ctx).await.unwrap();
        assert_eq!(count_rows(&path, NEWS_TABLE, Some("linkY")), 1);
    }

    #[tokio::test]
    async fn seeding_respects_window_and_crawlkey_and_is_repeatable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("news.db");
        seed(&path, "recent", "huxiu", 3);
        seed(&path, "ancient", "huxiu", 45);
        seed(&path, "elsewhere", "sina", 1);
        let ctx = context("huxiu", &path);
        let pipeline = NewsDatabasePipeline::new();

        pipeline.open(&ctx).await.unwrap();
        let first = pipeline.recent_links("huxiu");
        pipeline.close(&ctx).await.unwrap();
        assert!(pipeline.recent_links("huxiu").is_empty());

        pipeline.open(&ctx).await.unwrap();
        assert_eq!(pipeline.recent_links("huxiu"), first);
        assert_eq!(first, vec!["recent".to_string()]);
    }

    #[tokio::test]
    async fn crawls_keep_separate_caches() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("news.db");
        let huxiu = context("huxiu", &path);
        let sina = context("sina", &path);
        let pipeline = NewsDatabasePipeline::new();

        pipeline.open(&huxiu).await.unwrap();
        pipeline.open(&sina).await.unwrap();
        let item = Item::new().with("link", "shared");
        pipeline.process_item(item.clone(), &huxiu).await.unwrap();
        pipeline.process_item(item, &sina).await.unwrap();

        assert_eq!(count_rows(&path, NEWS_TABLE, Some("shared")), 2);
        assert_eq!(count_rows(&path, NEWS_TABLE, None), 2);
    }

    #[tokio::test]
    async fn failed_insert_does_not_poison_the_cache() {
        struct BrokenStore;

        impl PersistentStore for BrokenStore {
            fn ping(&self) -> Result<(), PipelineError> {
                Ok(())
            }
            fn ensure_schema(&self, _table: &str) -> Result<(), PipelineError> {
                Ok(())
            }
            fn insert_record(&self, _: &str, _: &StoredRecord) -> Result<(), PipelineError> {
                Err(PipelineError::DatabaseError("constraint failed".into()))
            }
            fn links_since(
                &self,
                _: &str,
                _: &str,
                _: chrono::NaiveDateTime,
            ) -> Result<Vec<String>, PipelineError> {
                Ok(Vec::new())
            }
        }

        let ctx = CrawlContext::new("huxiu").with_store(Arc::new(BrokenStore));
        let pipeline = NewsDatabasePipeline::new();
        pipeline.open(&ctx).await.unwrap();

        let err = pipeline
            .process_item(Item::new().with("link", "linkZ"), &ctx)
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
        assert!(pipeline.recent_links("huxiu").is_empty());
    }
}
