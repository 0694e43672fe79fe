//! Relational storage used by the database pipelines.
//!
//! [`PersistentStore`] is the seam to the external storage engine. Methods are
//! blocking; pipelines call them from `tokio::task::spawn_blocking`.
//! [`SqliteStore`] (feature `pipeline-sqlite`) is the bundled implementation.

use crate::error::PipelineError;
use crate::item::Item;
use chrono::{NaiveDateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ARTICLES_TABLE: &str = "articles";
pub const NEWS_TABLE: &str = "news";

const PUBDATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Persisted form of an accepted item. Never updated after insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub url: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub publish_time: Option<String>,
    pub source_site: Option<String>,
    pub link: Option<String>,
    pub crawlkey: Option<String>,
    pub pubdate: Option<NaiveDateTime>,
}

impl StoredRecord {
    /// Article row: the page's url and descriptive text fields.
    pub fn article_from_item(item: &Item) -> Self {
        StoredRecord {
            url: canonical_text(item, "url"),
            title: canonical_text(item, "title"),
            body: canonical_text(item, "body"),
            publish_time: canonical_text(item, "publish_time"),
            source_site: canonical_text(item, "source_site"),
            ..Default::default()
        }
    }

    /// News row: every known column, with `crawlkey` defaulting to the crawl
    /// identity and `pubdate` to the current time.
    pub fn news_from_item(item: &Item, crawl_id: &str) -> Self {
        let pubdate = match item.get_str("pubdate") {
            Some(raw) => parse_pubdate(raw).unwrap_or_else(|| {
                warn!(
                    "Item {} has unparseable pubdate {:?}, storing insertion time instead",
                    item.identity(),
                    raw
                );
                Utc::now().naive_utc()
            }),
            None => Utc::now().naive_utc(),
        };
        StoredRecord {
            link: canonical_text(item, "link"),
            crawlkey: canonical_text(item, "crawlkey").or_else(|| Some(crawl_id.to_string())),
            pubdate: Some(pubdate),
            ..Self::article_from_item(item)
        }
    }
}

/// Reads a field as UTF-8 text, exactly as the item holds it. Non-string values
/// are kept as their JSON text.
fn canonical_text(item: &Item, field: &str) -> Option<String> {
    match item.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM:SS` (taken as UTC).
pub fn parse_pubdate(raw: &str) -> Option<NaiveDateTime> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, PUBDATE_FORMAT))
        .ok()
}

pub trait PersistentStore: Send + Sync + 'static {
    /// Checks that a session can be acquired.
    fn ping(&self) -> Result<(), PipelineError>;

    /// Creates `table` if it does not exist yet.
    fn ensure_schema(&self, table: &str) -> Result<(), PipelineError>;

    /// Inserts one record in its own transaction.
    fn insert_record(&self, table: &str, record: &StoredRecord) -> Result<(), PipelineError>;

    /// Links of rows with `crawlkey == crawlkey` and `pubdate >= since`.
    fn links_since(
        &self,
        table: &str,
        crawlkey: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<String>, PipelineError>;
}

#[cfg(feature = "pipeline-sqlite")]
pub use sqlite::{session_scope, SqliteStore};

#[cfg(feature = "pipeline-sqlite")]
mod sqlite {
    use super::{PersistentStore, StoredRecord, ARTICLES_TABLE, NEWS_TABLE, PUBDATE_FORMAT};
    use crate::error::PipelineError;
    use chrono::NaiveDateTime;
    use log::{debug, error, trace};
    use rusqlite::{params, Connection, Transaction};
    use std::path::{Path, PathBuf};

    /// Runs `body` inside a transaction on a freshly acquired connection.
    ///
    /// Commits when `body` succeeds, rolls back when it fails, and releases the
    /// connection on every path.
    pub fn session_scope<T, F>(path: &Path, body: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, PipelineError>,
    {
        let mut conn = Connection::open(path).map_err(|e| {
            PipelineError::ResourceUnavailable(format!(
                "cannot open SQLite database {:?}: {}",
                path, e
            ))
        })?;
        let tx = conn.transaction()?;
        let result = match body(&tx) {
            Ok(value) => tx.commit().map(|_| value).map_err(PipelineError::from),
            Err(e) => {
                error!("Rolling back SQLite transaction: {}", e);
                if let Err(rollback_err) = tx.rollback() {
                    error!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        };
        if let Err((_, e)) = conn.close() {
            error!("Error closing SQLite connection for {:?}: {}", path, e);
        }
        result
    }

    /// SQLite-backed store. Each operation acquires its own connection.
    pub struct SqliteStore {
        path: PathBuf,
    }

    impl SqliteStore {
        pub fn new(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
            let path = path.as_ref().to_path_buf();
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Ok(SqliteStore { path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    fn check_table(table: &str) -> Result<(), PipelineError> {
        if table == ARTICLES_TABLE || table == NEWS_TABLE {
            Ok(())
        } else {
            Err(PipelineError::DatabaseError(format!(
                "unknown table '{}'",
                table
            )))
        }
    }

    impl PersistentStore for SqliteStore {
        fn ping(&self) -> Result<(), PipelineError> {
            session_scope(&self.path, |tx| {
                tx.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
        }

        fn ensure_schema(&self, table: &str) -> Result<(), PipelineError> {
            check_table(table)?;
            let schema_sql = format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    url TEXT,
                    title TEXT,
                    body TEXT,
                    publish_time TEXT,
                    source_site TEXT,
                    link TEXT,
                    crawlkey TEXT,
                    pubdate TEXT
                )",
                table
            );
            debug!("Ensuring table '{}' exists", table);
            session_scope(&self.path, |tx| {
                tx.execute(&schema_sql, [])?;
                tx.execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS \"{0}_crawlkey_pubdate\" ON \"{0}\" (crawlkey, pubdate)",
                        table
                    ),
                    [],
                )?;
                Ok(())
            })
        }

        fn insert_record(&self, table: &str, record: &StoredRecord) -> Result<(), PipelineError> {
            check_table(table)?;
            let insert_sql = format!(
                "INSERT INTO \"{}\" (url, title, body, publish_time, source_site, link, crawlkey, pubdate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                table
            );
            trace!("Inserting record into '{}': {:?}", table, record.url);
            session_scope(&self.path, |tx| {
                tx.execute(
                    &insert_sql,
                    params![
                        record.url,
                        record.title,
                        record.body,
                        record.publish_time,
                        record.source_site,
                        record.link,
                        record.crawlkey,
                        record.pubdate.map(|d| d.format(PUBDATE_FORMAT).to_string()),
                    ],
                )?;
                Ok(())
            })
        }

        fn links_since(
            &self,
            table: &str,
            crawlkey: &str,
            since: NaiveDateTime,
        ) -> Result<Vec<String>, PipelineError> {
            check_table(table)?;
            let query_sql = format!(
                "SELECT link FROM \"{}\" WHERE crawlkey = ?1 AND pubdate >= ?2 AND link IS NOT NULL ORDER BY id",
                table
            );
            let since = since.format(PUBDATE_FORMAT).to_string();
            session_scope(&self.path, |tx| {
                let mut stmt = tx.prepare(&query_sql)?;
                let links = stmt
                    .query_map(params![crawlkey, since], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(links)
            })
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_stored_as_given() {
        let item = Item::new()
            .with("url", "http://a")
            .with("title", "  Hello\r\nworld ")
            .with("body", "  indented code\r\n    line2\n")
            .with("publish_time", 2024);
        let record = StoredRecord::article_from_item(&item);
        assert_eq!(record.title.as_deref(), Some("  Hello\r\nworld "));
        assert_eq!(record.body.as_deref(), Some("  indented code\r\n    line2\n"));
        assert_eq!(record.publish_time.as_deref(), Some("2024"));
        assert_eq!(record.link, None);
    }

    #[test]
    fn news_record_defaults_crawlkey_and_pubdate() {
        let item = Item::new().with("link", "http://l");
        let record = StoredRecord::news_from_item(&item, "huxiu");
        assert_eq!(record.crawlkey.as_deref(), Some("huxiu"));
        assert!(record.pubdate.is_some());

        let item = Item::new()
            .with("link", "http://l")
            .with("crawlkey", "sina")
            .with("pubdate", "2024-05-01 08:00:00");
        let record = StoredRecord::news_from_item(&item, "huxiu");
        assert_eq!(record.crawlkey.as_deref(), Some("sina"));
        assert_eq!(
            record.pubdate,
            NaiveDateTime::parse_from_str("2024-05-01 08:00:00", PUBDATE_FORMAT).ok()
        );
    }

    #[test]
    fn unparseable_pubdate_falls_back_to_insertion_time() {
        let before = Utc::now().naive_utc();
        let item = Item::new().with("link", "http://l").with("pubdate", "last tuesday");
        let record = StoredRecord::news_from_item(&item, "huxiu");
        let pubdate = record.pubdate.unwrap();
        assert!(pubdate >= before - chrono::Duration::seconds(1));
        assert!(pubdate <= Utc::now().naive_utc());
    }

    #[test]
    fn pubdate_accepts_rfc3339() {
        let parsed = parse_pubdate("2024-05-01T10:00:00+02:00").unwrap();
        assert_eq!(parsed.format(PUBDATE_FORMAT).to_string(), "2024-05-01 08:00:00");
        assert!(parse_pubdate("yesterday").is_none());
    }
}
