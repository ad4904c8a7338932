//! Command engine
//!
//! The structured command form ([`types`]), the string transformer
//! ([`transformer`]), cache key/memoisation helpers ([`cache_utils`]), and
//! the dependency-ordered execution machinery ([`runner`], [`batch`]).

pub mod batch;
pub mod cache_utils;
pub mod runner;
pub mod transformer;
pub mod types;

pub use batch::CommandBatch;
pub use runner::CommandRunner;
pub use types::{CommandRecord, CommandSpec, CommandType, Subquery};
