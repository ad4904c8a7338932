//! Context-module protocol and built-in context handlers
//!
//! A context handler attaches semantics to items as they are declared under
//! a manifest context of its type. Handlers are created fresh for every
//! parse by a factory, react to the walker's lifecycle hooks, and
//! communicate through the shared item record.

use crate::errors::Result;
use crate::manifest::item::{ItemSet, SharedItem};
use crate::manifest::walker::ContextFrame;
use indexmap::IndexMap;

pub mod cache;
pub mod command;
pub mod subjects;
pub mod tags;
pub mod tool;
pub mod transaction;
pub mod uris;

/// A plug-in reacting to manifest walker hooks
///
/// All hooks default to no-ops; a handler implements the subset it needs.
/// An error from any hook aborts the walk.
pub trait ContextHandler {
    /// The context type this handler reacts to
    fn context_type(&self) -> &'static str;

    /// Whether this handler also applies to top-level declarations outside
    /// any context
    fn can_be_root(&self) -> bool {
        false
    }

    fn on_enter_manifest(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_enter_context(&mut self, _context: &ContextFrame) -> Result<()> {
        Ok(())
    }

    /// Called once per enclosing recognised context of this handler's type
    /// (or once with no contexts, for root-capable handlers at top level)
    fn on_declare_item(&mut self, _contexts: &[ContextFrame], _item: &SharedItem) -> Result<()> {
        Ok(())
    }

    fn on_declare_item_set(
        &mut self,
        _contexts: &[ContextFrame],
        _name: &str,
        _item_set: &ItemSet,
    ) -> Result<()> {
        Ok(())
    }

    fn on_exit_context(
        &mut self,
        _context: &ContextFrame,
        _items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_exit_manifest(
        &mut self,
        _items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        Ok(())
    }
}

/// A set of factories producing fresh context handlers for one parse
#[derive(Default)]
pub struct ContextModuleSet {
    factories: Vec<Box<dyn Fn() -> Box<dyn ContextHandler>>>,
}

impl ContextModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn ContextHandler> + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    /// Instantiate one handler per registered factory
    pub fn instantiate(&self) -> Vec<Box<dyn ContextHandler>> {
        self.factories.iter().map(|factory| factory()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
