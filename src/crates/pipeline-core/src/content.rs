//! Content items flowing between execution units
//!
//! A [`ContentItem`] is an identifier pair plus a JSON data bag. The data sits
//! behind an `Arc` and has no mutating accessor: units build new items with
//! [`ContentItem::with_field`] and friends, so parallel branches can share the
//! same upstream item without locking.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Key/value payload carried by a [`ContentItem`]
pub type ContentData = Map<String, Value>;

/// Immutable unit of data passed between execution units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    unique_id: String,
    canonical_id: String,
    data: Arc<ContentData>,
}

impl ContentItem {
    /// New item whose canonical id equals its fresh unique id
    pub fn new(data: ContentData) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            unique_id: id.clone(),
            canonical_id: id,
            data: Arc::new(data),
        }
    }

    /// New item with a caller-chosen canonical id (e.g. a document path)
    pub fn with_id(canonical_id: impl Into<String>, data: ContentData) -> Self {
        Self {
            unique_id: Uuid::new_v4().to_string(),
            canonical_id: canonical_id.into(),
            data: Arc::new(data),
        }
    }

    /// Objects become the data bag directly; any other value is stored under `value`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self::new(map)
            }
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Id shared by every item derived from the same source, used to
    /// deduplicate across fan-out/fan-in.
    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    pub fn data(&self) -> &ContentData {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Looks up a dotted path such as `metadata.language`; numeric segments
    /// index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.data.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// New item with a fresh unique id and the same canonical id
    pub fn derive(&self, data: ContentData) -> Self {
        Self {
            unique_id: Uuid::new_v4().to_string(),
            canonical_id: self.canonical_id.clone(),
            data: Arc::new(data),
        }
    }

    /// Copy of this item with one field added or replaced
    pub fn with_field(&self, key: impl Into<String>, value: Value) -> Self {
        self.with_fields([(key.into(), value)])
    }

    /// Copy of this item with several fields added or replaced
    pub fn with_fields<I>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut data = (*self.data).clone();
        data.extend(fields);
        self.derive(data)
    }

    pub fn to_value(&self) -> Value {
        Value::Object((*self.data).clone())
    }

    pub fn into_data(self) -> ContentData {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| (*shared).clone())
    }
}
