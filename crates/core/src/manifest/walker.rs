//! Manifest walker
//!
//! Walks a parsed manifest document, building the item and item-set tables
//! and dispatching lifecycle hooks to the registered context handlers.
//!
//! The walker maintains a stack of active contexts; declarations are
//! recorded globally, in every enclosing recognised context, and in the
//! implicit item-set of each of their tags. Unknown context types are
//! accepted but their hooks are suppressed, for forward compatibility.
//! Handlers may mutate item tags during their hooks; the walker drains the
//! resulting tag events after every dispatch so the tag indexes stay
//! consistent at every observable point.

use super::ast::{Document, Node, SetExpr, SetOp};
use super::item::{Item, ItemSet, TagEvent};
use crate::context::ContextHandler;
use crate::errors::{LimarError, Result};
use indexmap::IndexMap;
use tracing::warn;

/// One recognised context on the walker's stack
#[derive(Debug, Default)]
pub struct ContextFrame {
    pub context_type: String,
    pub opts: IndexMap<String, Option<String>>,
    pub items: ItemSet,
    pub item_sets: IndexMap<String, ItemSet>,
}

impl ContextFrame {
    pub fn has_opt(&self, name: &str) -> bool {
        self.opts.contains_key(name)
    }

    /// The value of an option, if present and given one
    pub fn opt(&self, name: &str) -> Option<&str> {
        self.opts.get(name).and_then(|v| v.as_deref())
    }
}

/// The walker's output: the full item and item-set tables
#[derive(Debug, Default)]
pub struct WalkOutput {
    pub items: ItemSet,
    pub item_sets: IndexMap<String, ItemSet>,
}

/// Evaluate an item-set expression against the given item-set table
///
/// Undefined names evaluate to the empty set. `&` intersects by ref keeping
/// the left operand's order; `|` unions, left operand's members first, then
/// right-only members in their order.
pub fn eval_set_expr(expr: &SetExpr, item_sets: &IndexMap<String, ItemSet>) -> ItemSet {
    match expr {
        SetExpr::Operand(name) => item_sets.get(name).cloned().unwrap_or_default(),
        SetExpr::Op { op, left, right } => {
            let left = eval_set_expr(left, item_sets);
            let right = eval_set_expr(right, item_sets);
            match op {
                SetOp::And => left
                    .into_iter()
                    .filter(|(ref_name, _)| right.contains_key(ref_name))
                    .collect(),
                SetOp::Or => {
                    let mut result = left;
                    for (ref_name, item) in right {
                        result.entry(ref_name).or_insert(item);
                    }
                    result
                }
            }
        }
    }
}

struct HandlerEntry {
    context_type: &'static str,
    can_be_root: bool,
    handler: Box<dyn ContextHandler>,
}

pub struct Walker {
    handlers: Vec<HandlerEntry>,
    /// The recognised frames of the context stack, in stack order;
    /// unrecognised contexts contribute no frame
    frames: Vec<ContextFrame>,
    items: ItemSet,
    item_sets: IndexMap<String, ItemSet>,
}

impl Walker {
    pub fn new(handlers: Vec<Box<dyn ContextHandler>>) -> Self {
        Self {
            handlers: handlers
                .into_iter()
                .map(|handler| HandlerEntry {
                    context_type: handler.context_type(),
                    can_be_root: handler.can_be_root(),
                    handler,
                })
                .collect(),
            frames: Vec::new(),
            items: ItemSet::new(),
            item_sets: IndexMap::new(),
        }
    }

    /// Walk a document and return the item/item-set tables
    pub fn walk(mut self, document: &Document) -> Result<WalkOutput> {
        for entry in self.handlers.iter_mut() {
            entry.handler.on_enter_manifest()?;
        }

        self.walk_nodes(&document.nodes)?;

        for i in 0..self.handlers.len() {
            self.handlers[i]
                .handler
                .on_exit_manifest(&self.items, &self.item_sets)?;
            self.sync_tag_indexes()?;
        }

        Ok(WalkOutput {
            items: self.items,
            item_sets: self.item_sets,
        })
    }

    fn walk_nodes(&mut self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            match node {
                Node::Item { ref_name, tags } => self.declare_item(ref_name, tags)?,
                Node::ItemSet { ref_name, expr } => self.declare_item_set(ref_name, expr)?,
                Node::Context {
                    context_type,
                    opts,
                    body,
                } => self.walk_context(context_type, opts, body)?,
            }
        }
        Ok(())
    }

    fn walk_context(
        &mut self,
        context_type: &str,
        opts: &[(String, Option<String>)],
        body: &[Node],
    ) -> Result<()> {
        let recognised = self
            .handlers
            .iter()
            .any(|entry| entry.context_type == context_type);

        if !recognised {
            warn!(context_type, "unsupported context type found, ignoring context");
            self.walk_nodes(body)?;
            return Ok(());
        }

        self.frames.push(ContextFrame {
            context_type: context_type.to_string(),
            opts: opts.iter().cloned().collect(),
            items: ItemSet::new(),
            item_sets: IndexMap::new(),
        });

        for i in 0..self.handlers.len() {
            if self.handlers[i].context_type == context_type {
                let frame = self.frames.last().expect("frame was just pushed");
                self.handlers[i].handler.on_enter_context(frame)?;
            }
        }

        self.walk_nodes(body)?;

        let frame = self.frames.pop().expect("recognised frame on exit");
        for i in 0..self.handlers.len() {
            if self.handlers[i].context_type == frame.context_type {
                self.handlers[i]
                    .handler
                    .on_exit_context(&frame, &frame.items, &frame.item_sets)?;
                self.sync_tag_indexes()?;
            }
        }

        Ok(())
    }

    fn declare_item(&mut self, ref_name: &str, tags: &[(String, Option<String>)]) -> Result<()> {
        if self.items.contains_key(ref_name) {
            return Err(LimarError::manifest(format!(
                "Duplicate declaration of item '{ref_name}'"
            )));
        }

        let mut item = Item::new(ref_name);
        for (name, value) in tags {
            item.tags.add(name.clone(), value.clone());
        }
        let item = item.shared();

        self.items.insert(ref_name.to_string(), item.clone());
        for frame in self.frames.iter_mut() {
            frame.items.insert(ref_name.to_string(), item.clone());
        }
        self.sync_tag_indexes()?;

        // Dispatch once per enclosing recognised context, to the handlers of
        // that context's type; at top level, to the root-capable handlers.
        if self.frames.is_empty() {
            for i in 0..self.handlers.len() {
                if self.handlers[i].can_be_root {
                    self.handlers[i].handler.on_declare_item(&[], &item)?;
                    self.sync_tag_indexes()?;
                }
            }
        } else {
            for frame_index in 0..self.frames.len() {
                let frame_type = self.frames[frame_index].context_type.clone();
                for i in 0..self.handlers.len() {
                    if self.handlers[i].context_type == frame_type {
                        self.handlers[i]
                            .handler
                            .on_declare_item(&self.frames, &item)?;
                        self.sync_tag_indexes()?;
                    }
                }
            }
        }

        Ok(())
    }

    fn declare_item_set(&mut self, ref_name: &str, expr: &SetExpr) -> Result<()> {
        let item_set = eval_set_expr(expr, &self.item_sets);

        self.item_sets.insert(ref_name.to_string(), item_set.clone());
        for frame in self.frames.iter_mut() {
            frame
                .item_sets
                .insert(ref_name.to_string(), item_set.clone());
        }

        if self.frames.is_empty() {
            for i in 0..self.handlers.len() {
                if self.handlers[i].can_be_root {
                    self.handlers[i]
                        .handler
                        .on_declare_item_set(&[], ref_name, &item_set)?;
                }
            }
        } else {
            for frame_index in 0..self.frames.len() {
                let frame_type = self.frames[frame_index].context_type.clone();
                for i in 0..self.handlers.len() {
                    if self.handlers[i].context_type == frame_type {
                        self.handlers[i].handler.on_declare_item_set(
                            &self.frames,
                            ref_name,
                            &item_set,
                        )?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Drain pending tag events from every item and update the implicit
    /// per-tag item-sets accordingly
    fn sync_tag_indexes(&mut self) -> Result<()> {
        let refs: Vec<String> = self.items.keys().cloned().collect();
        for ref_name in refs {
            let item = self.items[&ref_name].clone();
            let events = item.borrow_mut().tags.take_events();
            for event in events {
                match event {
                    TagEvent::Added(tag) => {
                        self.item_sets
                            .entry(tag)
                            .or_default()
                            .insert(ref_name.clone(), item.clone());
                    }
                    TagEvent::Removed(tag) => {
                        if let Some(set) = self.item_sets.get_mut(&tag) {
                            set.shift_remove(&ref_name);
                            if set.is_empty() {
                                self.item_sets.shift_remove(&tag);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
