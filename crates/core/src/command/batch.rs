//! Command batches
//!
//! A batch queues commands for one subject and drains them in dependency
//! order, sharing cache-invalidation semantics: cacheable transitive
//! dependencies of requested commands run (or at least hit their cache) in
//! topological position, so recomputed nodes invalidate their dependants
//! correctly.

use crate::command::cache_utils;
use crate::command::runner::CommandRunner;
use crate::command::transformer::{self, EntityKey};
use crate::command::types::Entity;
use crate::errors::{LimarError, Result};
use crate::manifest::item::Retention;
use crate::orchestrator::ModuleContext;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, trace};

pub struct CommandBatch<'r> {
    runner: &'r CommandRunner,
    subject: Vec<String>,

    run_queue: BTreeSet<(usize, String)>,
    directly_requested: HashSet<String>,
    // Assumes the batch caches command output by ref only; commands with
    // dynamic input need their cache disabled.
    cacheable: HashSet<String>,
}

impl<'r> CommandBatch<'r> {
    pub(crate) fn new(runner: &'r CommandRunner, subject: Vec<String>) -> Self {
        Self {
            runner,
            subject,
            run_queue: BTreeSet::new(),
            directly_requested: HashSet::new(),
            cacheable: HashSet::new(),
        }
    }

    /// Add the commands for the given refs to the batch
    ///
    /// Cacheable transitive dependencies are also queued, at their
    /// topological position and without duplicates, to keep cache
    /// invalidation ordered correctly.
    pub fn add(&mut self, refs: &[String]) -> Result<()> {
        for ref_name in refs {
            if self.directly_requested.contains(ref_name) {
                continue;
            }
            self.directly_requested.insert(ref_name.clone());

            let item = self
                .runner
                .command_items()
                .get(ref_name)
                .ok_or_else(|| {
                    LimarError::batch(format!("Unknown command ref '{ref_name}'"))
                })?;

            let (is_cacheable, transitive_dependencies) = {
                let item = item.borrow();
                let command = item.command.as_ref().ok_or_else(|| {
                    LimarError::batch(format!("Item '{ref_name}' carries no command"))
                })?;
                (
                    cache_utils::is_enabled(&item),
                    command.transitive_dependencies.clone(),
                )
            };

            if !is_cacheable || !self.cacheable.contains(ref_name) {
                self.queue(ref_name)?;
            }
            if is_cacheable {
                self.cacheable.insert(ref_name.clone());
            }

            for dep_ref in &transitive_dependencies {
                let dep_item = self
                    .runner
                    .command_items()
                    .get(dep_ref)
                    .ok_or_else(|| {
                        LimarError::batch(format!("Unknown command ref '{dep_ref}'"))
                    })?;
                if cache_utils::is_enabled(&dep_item.borrow())
                    && !self.cacheable.contains(dep_ref)
                {
                    self.queue(dep_ref)?;
                    self.cacheable.insert(dep_ref.clone());
                }
            }
        }
        Ok(())
    }

    fn queue(&mut self, ref_name: &str) -> Result<()> {
        let index = self.runner.order_index(ref_name).ok_or_else(|| {
            LimarError::batch(format!("Command ref '{ref_name}' has no topological position"))
        })?;
        self.run_queue.insert((index, ref_name.to_string()));
        Ok(())
    }

    /// Drain the queue in topological order and return the merged entities
    /// of the directly-requested commands, keyed by the subject's id(s)
    pub fn process(&mut self, ctx: &ModuleContext) -> Result<IndexMap<EntityKey, Entity>> {
        let mut command_outputs: Vec<Entity> = Vec::new();
        let mut refs_with_batch_retention: HashSet<String> = HashSet::new();

        while let Some((index, command_ref)) = self.run_queue.iter().next().cloned() {
            self.run_queue.remove(&(index, command_ref.clone()));

            let item = self
                .runner
                .command_items()
                .get(&command_ref)
                .ok_or_else(|| {
                    LimarError::batch(format!("Unknown command ref '{command_ref}'"))
                })?;
            let (cacheable, retention) = {
                let item = item.borrow();
                (
                    cache_utils::is_enabled(&item),
                    cache_utils::retention_of(&item),
                )
            };
            if cacheable && retention == Retention::Batch {
                refs_with_batch_retention.insert(command_ref.clone());
            }

            // Runs directly, or through the cache (with dependant
            // invalidation) when the command is cacheable
            let output = self.runner.run_ref(ctx, &command_ref)?;
            trace!(command_ref, "command output collected");

            if self.directly_requested.contains(&command_ref) && !output.is_null() {
                match output {
                    Value::Array(entities) => command_outputs.extend(entities),
                    other => command_outputs.push(other),
                }
            }
        }

        self.directly_requested.clear();
        self.cacheable.clear();

        // Batch-retention cache entries do not outlive the batch
        if !refs_with_batch_retention.is_empty() {
            let keys: Vec<Value> = refs_with_batch_retention
                .iter()
                .map(|ref_name| self.runner.key_for_ref(ref_name).map(Value::String))
                .collect::<Result<_>>()?;
            ctx.call("cache", "delete", &keys)?;
        }

        debug!(outputs = command_outputs.len(), "merging batch entities");
        transformer::merge_entities(
            self.runner.subject_items(),
            &command_outputs,
            &self.subject,
        )
    }
}
