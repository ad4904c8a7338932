//! `command`, `query`, and `action` context handlers
//!
//! A command-carrying context (`@command`, `@query`, or `@action` with a
//! `command` option) parses that option into the structured subcommand form
//! and attaches it to the items declared under it. The `query`/`action`
//! handlers then set the command's type; queries additionally take a `parse`
//! expression applied to the command's aggregated output.
//!
//! At exit-manifest the command topology is derived: a command depends on
//! the command refs named as arguments of its subqueries and LIMAR
//! subcommands that target the command engine (`command.run_refs(...)`).

use super::ContextHandler;
use crate::command::transformer;
use crate::command::types::{
    CommandRecord, CommandSpec, CommandType, Part, SubcommandData, Subquery,
};
use crate::errors::{LimarError, Result};
use crate::manifest::item::{ItemSet, SharedItem};
use crate::manifest::walker::ContextFrame;
use indexmap::{IndexMap, IndexSet};

const COMMAND_CARRYING_TYPES: [&str; 3] = ["command", "query", "action"];

/// Parses and attaches the `command` option of its context type
///
/// One instance exists per command-carrying context type; the `command`
/// instance additionally validates and finalises the topology at
/// exit-manifest.
pub struct CommandContext {
    context_type: &'static str,
    finalises: bool,
    current: Option<CommandSpec>,
}

impl CommandContext {
    pub fn command() -> Self {
        Self {
            context_type: "command",
            finalises: true,
            current: None,
        }
    }

    pub fn query() -> Self {
        Self {
            context_type: "query",
            finalises: false,
            current: None,
        }
    }

    pub fn action() -> Self {
        Self {
            context_type: "action",
            finalises: false,
            current: None,
        }
    }
}

impl ContextHandler for CommandContext {
    fn context_type(&self) -> &'static str {
        self.context_type
    }

    fn can_be_root(&self) -> bool {
        self.context_type == "command"
    }

    fn on_enter_context(&mut self, context: &ContextFrame) -> Result<()> {
        match context.opt("command") {
            Some(raw_command) => {
                self.current = Some(transformer::parse(raw_command).map_err(|e| {
                    LimarError::manifest(format!(
                        "Invalid command in @{} context: {e}",
                        self.context_type
                    ))
                })?);
            }
            None => {
                // A requirement context (no options) declares that items need
                // a command without providing one.
                if self.context_type == "command" && !context.opts.is_empty() {
                    return Err(LimarError::manifest(
                        "A declaration @command context must be given a `command` to execute"
                            .to_string(),
                    ));
                }
                self.current = None;
            }
        }
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

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let command_carrying = contexts
            .iter()
            .filter(|frame| {
                COMMAND_CARRYING_TYPES.contains(&frame.context_type.as_str())
                    && frame.has_opt("command")
            })
            .count();
        if command_carrying > 1 {
            return Err(LimarError::manifest(format!(
                "Can only have one command-carrying context: item '{}' is nested under {command_carrying}",
                item.borrow().item_ref
            )));
        }

        let mut item = item.borrow_mut();
        if let Some(spec) = &self.current {
            item.tags.add("command", None);
            item.command = Some(CommandRecord {
                spec: spec.clone(),
                ..CommandRecord::default()
            });
        } else if self.context_type == "command" && !contexts.is_empty() {
            // A requirement context marks its items as needing a command
            // without providing one; exit-manifest validation enforces it.
            item.tags.add("command", None);
        }
        Ok(())
    }

    fn on_exit_manifest(
        &mut self,
        items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        if !self.finalises {
            return Ok(());
        }

        // Items required to carry a command must have one
        for item in items.values() {
            let item = item.borrow();
            if item.tags.has("command") && item.command.is_none() && !item.is_validation_exempt()
            {
                return Err(LimarError::manifest(format!(
                    "@command context requires a command to be declared for item '{}'",
                    item.item_ref
                )));
            }
        }

        finalise_topology(items)
    }
}

/// Sets `command.type` to `query` and attaches the `parse` expression
#[derive(Default)]
pub struct QueryType;

impl ContextHandler for QueryType {
    fn context_type(&self) -> &'static str {
        "query"
    }

    fn on_enter_context(&mut self, context: &ContextFrame) -> Result<()> {
        if !context.opts.is_empty() && !context.has_opt("parse") {
            return Err(LimarError::manifest(
                "A @query context must be given a `parse` expression".to_string(),
            ));
        }
        Ok(())
    }

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let mut item = item.borrow_mut();
        item.tags.add("query", None);

        if let Some(command) = &mut item.command {
            command.command_type = Some(CommandType::Query);
            command.parse = nearest_opt(contexts, "parse");
        }
        Ok(())
    }
}

/// Sets `command.type` to `action`, with an optional `parse` expression
#[derive(Default)]
pub struct ActionType;

impl ContextHandler for ActionType {
    fn context_type(&self) -> &'static str {
        "action"
    }

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let mut item = item.borrow_mut();
        item.tags.add("action", None);

        if let Some(command) = &mut item.command {
            command.command_type = Some(CommandType::Action);
            command.parse = nearest_opt(contexts, "parse");
        }
        Ok(())
    }
}

/// The value of the nearest enclosing context's option with the given name
fn nearest_opt(contexts: &[ContextFrame], name: &str) -> Option<String> {
    contexts
        .iter()
        .rev()
        .find_map(|frame| frame.opt(name).map(str::to_string))
}

// Topology
// --------------------

fn finalise_topology(items: &ItemSet) -> Result<()> {
    let command_refs: IndexSet<String> = items
        .iter()
        .filter(|(_, item)| item.borrow().command.is_some())
        .map(|(ref_name, _)| ref_name.clone())
        .collect();

    // Direct dependencies from engine-targeting subqueries and subcommands
    let mut dependencies: IndexMap<String, Vec<String>> = IndexMap::new();
    for ref_name in &command_refs {
        let item = items[ref_name].borrow();
        let command = item.command.as_ref().expect("filtered to command items");

        let mut deps: Vec<String> = Vec::new();
        for subquery in &command.spec.parameters {
            collect_engine_refs(subquery, &command_refs, &mut deps);
        }
        for subcommand in &command.spec.subcommands {
            if let SubcommandData::Limar(call) = &subcommand.data {
                if call.module == "command" && call.method == "run_refs" {
                    for group in &call.args {
                        if let Some(arg) = literal_group(group) {
                            if command_refs.contains(&arg) && !deps.contains(&arg) {
                                deps.push(arg);
                            }
                        }
                    }
                }
            }
        }
        dependencies.insert(ref_name.clone(), deps);
    }

    // Reverse edges
    let mut dependants: IndexMap<String, Vec<String>> = command_refs
        .iter()
        .map(|ref_name| (ref_name.clone(), Vec::new()))
        .collect();
    for (ref_name, deps) in &dependencies {
        for dep in deps {
            dependants
                .get_mut(dep)
                .expect("dependency is a known command")
                .push(ref_name.clone());
        }
    }

    // Transitive closures (cycle-tolerant; cycles surface at topo-sort time)
    let transitive_deps: IndexMap<String, Vec<String>> = command_refs
        .iter()
        .map(|ref_name| (ref_name.clone(), closure(ref_name, &dependencies)))
        .collect();
    let transitive_dependants: IndexMap<String, Vec<String>> = command_refs
        .iter()
        .map(|ref_name| (ref_name.clone(), closure(ref_name, &dependants)))
        .collect();

    for ref_name in &command_refs {
        let item = &items[ref_name];
        let mut item = item.borrow_mut();
        let command = item.command.as_mut().expect("filtered to command items");
        command.dependencies = dependencies[ref_name].clone();
        command.dependants = dependants[ref_name].clone();
        command.transitive_dependencies = transitive_deps[ref_name].clone();
        command.transitive_dependants = transitive_dependants[ref_name].clone();
    }

    Ok(())
}

fn collect_engine_refs(
    subquery: &Subquery,
    command_refs: &IndexSet<String>,
    deps: &mut Vec<String>,
) {
    if subquery.module != "command" || subquery.method != "run_refs" {
        return;
    }
    for arg in &subquery.args {
        if command_refs.contains(arg) && !deps.contains(arg) {
            deps.push(arg.clone());
        }
    }
}

/// A group that is pure literal text
fn literal_group(group: &[Part]) -> Option<String> {
    let mut text = String::new();
    for part in group {
        match part {
            Part::Fragment(fragment) => text.push_str(fragment),
            Part::Parameter(_) => return None,
        }
    }
    Some(text)
}

fn closure(start: &str, edges: &IndexMap<String, Vec<String>>) -> Vec<String> {
    let mut seen: IndexSet<String> = IndexSet::new();
    let mut stack: Vec<String> = edges.get(start).cloned().unwrap_or_default();
    stack.reverse();

    while let Some(next) = stack.pop() {
        if next == start || !seen.insert(next.clone()) {
            continue;
        }
        if let Some(deps) = edges.get(&next) {
            for dep in deps.iter().rev() {
                stack.push(dep.clone());
            }
        }
    }

    seen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parser::parse;
    use crate::manifest::Walker;

    fn handlers() -> Vec<Box<dyn ContextHandler>> {
        vec![
            Box::new(CommandContext::command()),
            Box::new(CommandContext::query()),
            Box::new(CommandContext::action()),
            Box::new(QueryType),
            Box::new(ActionType),
        ]
    }

    #[test]
    fn test_query_context_attaches_typed_command() -> anyhow::Result<()> {
        let walker = Walker::new(handlers());
        let output = walker.walk(&parse(
            "@query (command: \"echo hi && echo bye\", parse: .) {\n  q\n}\n",
        )?)?;

        let item = output.items["q"].borrow();
        let command = item.command.as_ref().unwrap();
        assert_eq!(command.command_type, Some(CommandType::Query));
        assert_eq!(command.parse.as_deref(), Some("."));
        assert_eq!(command.spec.subcommands.len(), 2);
        assert!(item.tags.has("command") && item.tags.has("query"));
        assert!(output.item_sets["command"].contains_key("q"));
        Ok(())
    }

    #[test]
    fn test_action_inside_command_context() -> anyhow::Result<()> {
        let walker = Walker::new(handlers());
        let output = walker.walk(&parse(
            "@command (command: \"touch /tmp/x\") {\n  @action {\n    a\n  }\n}\n",
        )?)?;

        let item = output.items["a"].borrow();
        let command = item.command.as_ref().unwrap();
        assert_eq!(command.command_type, Some(CommandType::Action));
        assert_eq!(command.parse, None);
        Ok(())
    }

    #[test]
    fn test_nested_command_carrying_contexts_fail() -> anyhow::Result<()> {
        let walker = Walker::new(handlers());
        let err = walker
            .walk(&parse(
                "@command (command: \"echo a\") {\n  @query (command: \"echo b\", parse: .) {\n    q\n  }\n}\n",
            )?)
            .unwrap_err();
        assert!(err.to_string().contains("command-carrying"));
        Ok(())
    }

    #[test]
    fn test_command_required_for_tagged_items() -> anyhow::Result<()> {
        let walker = Walker::new(handlers());
        let err = walker
            .walk(&parse("@command {\n  missing\n}\n")?)
            .unwrap_err();
        assert!(err.to_string().contains("requires a command"));

        // Double-underscore tags exempt items from the requirement
        let walker = Walker::new(handlers());
        assert!(walker
            .walk(&parse("@command {\n  templated (__partial)\n}\n")?)
            .is_ok());
        Ok(())
    }

    #[test]
    fn test_topology_from_engine_subqueries() -> anyhow::Result<()> {
        let manifest = "\
@query (command: \"echo base\", parse: .) {
  base
}
@query (command: \"echo {{ command.run_refs(base) : . }}\", parse: .) {
  mid
}
@query (command: \"echo {{ command.run_refs(mid) : . }}\", parse: .) {
  top
}
";
        let walker = Walker::new(handlers());
        let output = walker.walk(&parse(manifest)?)?;

        let base = output.items["base"].borrow();
        let mid = output.items["mid"].borrow();
        let top = output.items["top"].borrow();

        let base_cmd = base.command.as_ref().unwrap();
        let mid_cmd = mid.command.as_ref().unwrap();
        let top_cmd = top.command.as_ref().unwrap();

        assert!(base_cmd.dependencies.is_empty());
        assert_eq!(mid_cmd.dependencies, vec!["base"]);
        assert_eq!(top_cmd.dependencies, vec!["mid"]);
        assert_eq!(top_cmd.transitive_dependencies, vec!["mid", "base"]);
        assert_eq!(base_cmd.dependants, vec!["mid"]);

        let mut base_trans = base_cmd.transitive_dependants.clone();
        base_trans.sort();
        assert_eq!(base_trans, vec!["mid", "top"]);
        Ok(())
    }
}
