//! Manifest language and evaluator
//!
//! The manifest DSL declares items (named, tagged things) and item-sets
//! (expressions over the implicit per-tag sets), optionally scoped under
//! contexts that attach extra semantics via context handlers.

pub mod ast;
pub mod item;
pub mod parser;
pub mod walker;

pub use item::{CacheConfig, Item, ItemSet, Retention, SharedItem, Tags};
pub use walker::{ContextFrame, WalkOutput, Walker};
