//! `tags` context handler

use super::ContextHandler;
use crate::errors::Result;
use crate::manifest::item::SharedItem;
use crate::manifest::walker::ContextFrame;

/// Merges the options of every enclosing context into the item's tag set
#[derive(Default)]
pub struct Tags;

impl ContextHandler for Tags {
    fn context_type(&self) -> &'static str {
        "tags"
    }

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let mut item = item.borrow_mut();
        for context in contexts {
            for (name, value) in &context.opts {
                item.tags.add(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}
