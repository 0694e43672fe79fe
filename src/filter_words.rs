//! Item Pipeline that drops items mentioning forbidden words.

use crate::context::CrawlContext;
use crate::error::PipelineError;
use crate::item::Item;
use crate::pipeline::{ItemOutcome, Pipeline};
use async_trait::async_trait;
use tracing::{debug, info};

/// Rejects items whose text fields contain any configured word, ignoring case.
///
/// Matching is by substring, so `pilgrim` also matches `pilgrims` and `Pilgrim's`.
pub struct FilterWordsPipeline {
    words: Vec<String>,
    fields: Vec<String>,
}

impl FilterWordsPipeline {
    /// Creates a pipeline checking the `title` and `body` fields.
    pub fn new<S: AsRef<str>>(words: &[S]) -> Self {
        let words: Vec<String> = words
            .iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        info!("Initializing FilterWordsPipeline with words: {:?}", words);
        FilterWordsPipeline {
            words,
            fields: vec!["title".to_string(), "body".to_string()],
        }
    }

    /// Replaces the set of fields inspected.
    pub fn with_fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.fields = fields.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    fn forbidden_word_in(&self, item: &Item) -> Option<&str> {
        let texts: Vec<String> = self
            .fields
            .iter()
            .filter_map(|field| item.get_str(field))
            .map(str::to_lowercase)
            .collect();
        self.words
            .iter()
            .find(|word| texts.iter().any(|text| text.contains(word.as_str())))
            .map(String::as_str)
    }
}

#[async_trait]
impl Pipeline for FilterWordsPipeline {
    fn name(&self) -> &str {
        "FilterWordsPipeline"
    }

    async fn process_item(
        &self,
        item: Item,
        _ctx: &CrawlContext,
    ) -> Result<ItemOutcome, PipelineError> {
        if let Some(word) = self.forbidden_word_in(&item) {
            debug!("Item {} contains forbidden word '{}'", item.identity(), word);
            return Ok(ItemOutcome::Rejected(format!(
                "contains forbidden word: {}",
                word
            )));
        }
        Ok(ItemOutcome::Continue(item))
    }
}
