//! The record type that flows through pipelines.
//!
//! An [`Item`] is an ordered mapping from field name to JSON value, produced once
//! per crawled page. Pipelines treat it as immutable apart from explicit field
//! rewrites (for example attaching downloaded image paths).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A crawled item: named fields holding JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item {
    fields: Map<String, Value>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Sets a field, returning the previous value if there was one.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns the field if it holds a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn url(&self) -> Option<&str> {
        self.get_str("url")
    }

    pub fn link(&self) -> Option<&str> {
        self.get_str("link")
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// A short label used when logging the item.
    pub fn identity(&self) -> &str {
        self.url().or_else(|| self.link()).unwrap_or("<unidentified item>")
    }

    pub fn to_json_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl From<Map<String, Value>> for Item {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl TryFrom<Value> for Item {
    type Error = crate::error::PipelineError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(crate::error::PipelineError::ItemError(format!(
                "Item must be a JSON object, got: {}",
                other
            ))),
        }
    }
}
