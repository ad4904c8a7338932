//! `subjects`, `subject`, and `primary-subject` context handlers

use super::ContextHandler;
use crate::errors::{LimarError, Result};
use crate::manifest::item::{ItemSet, SharedItem};
use crate::manifest::walker::ContextFrame;
use indexmap::IndexMap;

/// Records which subjects a command is about
///
/// The subject set is the union of the options of every enclosing context;
/// each subject also becomes a tag.
#[derive(Default)]
pub struct Subjects;

impl ContextHandler for Subjects {
    fn context_type(&self) -> &'static str {
        "subjects"
    }

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let mut subjects: IndexMap<String, ()> = IndexMap::new();
        for context in contexts {
            if context.context_type != "subjects" {
                continue;
            }
            for name in context.opts.keys() {
                subjects.insert(name.clone(), ());
            }
        }
        let subjects: Vec<String> = subjects.into_keys().collect();

        let mut item = item.borrow_mut();
        for subject in &subjects {
            item.tags.add(subject.clone(), None);
        }
        item.subjects = Some(subjects);
        Ok(())
    }
}

/// Marks the single subject a command's entities should be keyed by
#[derive(Default)]
pub struct PrimarySubject {
    current: Option<String>,
}

impl ContextHandler for PrimarySubject {
    fn context_type(&self) -> &'static str {
        "primary-subject"
    }

    fn on_enter_context(&mut self, context: &ContextFrame) -> Result<()> {
        let primary = context.opts.keys().next().cloned().ok_or_else(|| {
            LimarError::manifest(
                "A @primary-subject context must name a subject".to_string(),
            )
        })?;

        if let Some(current) = &self.current {
            return Err(LimarError::manifest(format!(
                "Can only have one nested @primary-subject context: tried to nest '{primary}' inside '{current}'"
            )));
        }

        self.current = Some(primary);
        Ok(())
    }

    fn on_exit_context(
        &mut self,
        _context: &ContextFrame,
        _items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        self.current = None;
        Ok(())
    }

    fn on_declare_item(&mut self, _contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        item.borrow_mut().primary_subject = self.current.clone();
        Ok(())
    }
}

/// Declares subject items: things entities can be about
///
/// A subject must carry an `id` tag naming the entity field it is keyed by,
/// and accumulates subject dependencies from its `/`-prefixed tags.
#[derive(Default)]
pub struct Subject;

impl ContextHandler for Subject {
    fn context_type(&self) -> &'static str {
        "subject"
    }

    fn on_declare_item(&mut self, _contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let mut item = item.borrow_mut();
        item.tags.add("subject", None);

        if item.is_validation_exempt() {
            return Ok(());
        }

        let id = item.tags.value_of("id").map(str::to_string);
        match id {
            Some(id) => item.id = Some(id),
            None => {
                return Err(LimarError::manifest(format!(
                    "@subject '{}' missing 'id' tag",
                    item.item_ref
                )))
            }
        }

        let dependencies: Vec<String> = item
            .tags
            .iter()
            .filter(|(name, value)| value.is_none() && name.starts_with('/'))
            .map(|(name, _)| name.clone())
            .collect();
        item.dependencies = dependencies;
        Ok(())
    }
}
