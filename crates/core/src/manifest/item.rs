//! Items and item-sets
//!
//! An item is a named thing declared in the manifest: a unique `ref`, a set
//! of tags, and extension fields attached by context modules. Items are
//! shared between the master table, the per-tag item-sets, and the contexts
//! that enclose them, so they live behind `Rc<RefCell<_>>`.

use crate::command::types::CommandRecord;
use crate::context::transaction::Transaction;
use indexmap::IndexMap;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

pub type SharedItem = Rc<RefCell<Item>>;

/// An insertion-ordered `ref -> item` table
pub type ItemSet = IndexMap<String, SharedItem>;

/// A tag mutation observed by the manifest walker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEvent {
    Added(String),
    Removed(String),
}

/// Tag mapping with mutation events
///
/// Every add/remove is recorded; the walker drains the events after each
/// mutation point and re-indexes the owning item into the implicit per-tag
/// item-sets, keeping the indexes consistent with the tags at every
/// observable point.
#[derive(Debug, Clone, Default)]
pub struct Tags {
    tags: IndexMap<String, Option<String>>,
    events: Vec<TagEvent>,
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        self.tags.insert(name.clone(), value);
        self.events.push(TagEvent::Added(name));
    }

    pub fn remove(&mut self, name: &str) {
        if self.tags.shift_remove(name).is_some() {
            self.events.push(TagEvent::Removed(name.to_string()));
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    /// The value of a tag, if the tag is present and carries one
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.tags.get(name).and_then(|v| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<String>)> {
        self.tags.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.tags.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Drain the pending mutation events
    pub fn take_events(&mut self) -> Vec<TagEvent> {
        std::mem::take(&mut self.events)
    }
}

/// A named declaration from the manifest
///
/// Well-known extensions installed by context modules get typed fields;
/// anything else goes into the open `extra` map.
#[derive(Debug, Default)]
pub struct Item {
    pub item_ref: String,
    pub tags: Tags,

    // Well-known extension fields
    pub command: Option<CommandRecord>,
    pub cache: Option<CacheConfig>,
    pub tool: Option<IndexMap<String, Option<String>>>,
    pub subjects: Option<Vec<String>>,
    pub primary_subject: Option<String>,
    pub id: Option<String>,
    pub dependencies: Vec<String>,
    pub path: Option<String>,
    pub remote: Option<String>,
    pub transaction: Option<Transaction>,

    /// Open extension fields for context modules the core knows nothing about
    pub extra: IndexMap<String, Value>,
}

impl Item {
    pub fn new(item_ref: impl Into<String>) -> Self {
        Self {
            item_ref: item_ref.into(),
            ..Self::default()
        }
    }

    pub fn shared(self) -> SharedItem {
        Rc::new(RefCell::new(self))
    }

    /// Items carrying any `__`-prefixed tag are exempt from context-module
    /// validation (templating escape hatch).
    pub fn is_validation_exempt(&self) -> bool {
        self.tags.names().any(|name| name.starts_with("__"))
    }

    /// Summarise the item as a JSON object (for CLI output and entities)
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("ref".into(), Value::String(self.item_ref.clone()));
        map.insert(
            "tags".into(),
            Value::Object(
                self.tags
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.clone(),
                            value
                                .as_ref()
                                .map(|v| Value::String(v.clone()))
                                .unwrap_or(Value::Null),
                        )
                    })
                    .collect(),
            ),
        );
        if let Some(id) = &self.id {
            map.insert("id".into(), Value::String(id.clone()));
        }
        if let Some(subjects) = &self.subjects {
            map.insert(
                "subjects".into(),
                Value::Array(subjects.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(primary) = &self.primary_subject {
            map.insert("primarySubject".into(), Value::String(primary.clone()));
        }
        if let Some(path) = &self.path {
            map.insert("path".into(), Value::String(path.clone()));
        }
        if let Some(remote) = &self.remote {
            map.insert("remote".into(), Value::String(remote.clone()));
        }
        if let Some(transaction) = &self.transaction {
            if let Ok(value) = serde_json::to_value(transaction) {
                map.insert("transaction".into(), value);
            }
        }
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

/// Cache behaviour attached to an item by the `cache` context module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub retention: Retention,
}

/// How long a cached command result outlives the batch that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Evicted when the producing batch finishes draining
    #[default]
    Batch,
    /// Kept until the cache is flushed at module stop
    Session,
}

impl std::str::FromStr for Retention {
    type Err = crate::errors::LimarError;

    fn from_str(s: &str) -> crate::errors::Result<Self> {
        match s {
            "batch" => Ok(Retention::Batch),
            "session" => Ok(Retention::Session),
            other => Err(crate::errors::LimarError::manifest(format!(
                "Unknown cache retention '{other}' (expected 'batch' or 'session')"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_record_events() {
        let mut tags = Tags::new();
        tags.add("x", None);
        tags.add("y", Some("1".into()));
        tags.remove("x");
        tags.remove("missing");

        assert_eq!(
            tags.take_events(),
            vec![
                TagEvent::Added("x".into()),
                TagEvent::Added("y".into()),
                TagEvent::Removed("x".into()),
            ]
        );
        assert!(tags.take_events().is_empty());
        assert!(!tags.has("x"));
        assert_eq!(tags.value_of("y"), Some("1"));
    }

    #[test]
    fn test_validation_exemption() {
        let mut item = Item::new("a");
        assert!(!item.is_validation_exempt());
        item.tags.add("__template", None);
        assert!(item.is_validation_exempt());
    }
}
