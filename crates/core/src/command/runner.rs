//! Command runner
//!
//! Executes query and action commands: evaluates their parameters through
//! the orchestrator facade, runs each subcommand (host process or LIMAR
//! service call), and applies the query's parse expression to the
//! aggregated output. The runner also owns the dependency ordering of the
//! whole command item set, cached against the manifest digest.

use crate::command::batch::CommandBatch;
use crate::command::types::{
    CommandRecord, CommandType, GroupedInterpolatable, LimarCall, SubcommandData,
    SubcommandResult, Subquery,
};
use crate::command::{cache_utils, transformer};
use crate::errors::{LimarError, Result};
use crate::manifest::item::ItemSet;
use crate::orchestrator::{self, ModuleContext};
use crate::query;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Command as SystemCommand;
use tracing::{debug, instrument, trace};

pub struct CommandRunner {
    subject_items: ItemSet,
    command_items: ItemSet,
    command_order: Vec<String>,
}

impl CommandRunner {
    /// Build the runner, deriving (and caching) the dependency order of the
    /// given command items
    pub fn new(
        ctx: &ModuleContext,
        subject_items: ItemSet,
        command_items: ItemSet,
        command_items_digest: &str,
    ) -> Result<Self> {
        let graph_key = cache_utils::key(&[
            "command_runner",
            &format!("dependency_graph.{command_items_digest}"),
        ]);
        let graph_value = cache_utils::with_caching(
            ctx,
            &graph_key,
            || {
                let graph: serde_json::Map<String, Value> = command_items
                    .iter()
                    .map(|(ref_name, item)| {
                        let deps = item
                            .borrow()
                            .command
                            .as_ref()
                            .map(|command| command.dependencies.clone())
                            .unwrap_or_default();
                        (
                            ref_name.clone(),
                            Value::Array(deps.into_iter().map(Value::String).collect()),
                        )
                    })
                    .collect();
                Ok(Value::Object(graph))
            },
            &[],
        )?;

        let graph: IndexMap<String, Vec<String>> = graph_value
            .as_object()
            .ok_or_else(|| LimarError::internal("malformed cached dependency graph"))?
            .iter()
            .map(|(ref_name, deps)| {
                let deps = deps
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                (ref_name.clone(), deps)
            })
            .collect();

        let command_order = orchestrator::topological_sort(&graph).map_err(|e| {
            LimarError::dependency(format!(
                "Cannot resolve dependencies while running commands: {e}"
            ))
        })?;

        Ok(Self {
            subject_items,
            command_items,
            command_order,
        })
    }

    pub fn subject_items(&self) -> &ItemSet {
        &self.subject_items
    }

    pub fn command_items(&self) -> &ItemSet {
        &self.command_items
    }

    pub fn order_index(&self, ref_name: &str) -> Option<usize> {
        self.command_order.iter().position(|r| r == ref_name)
    }

    pub fn new_batch(&self, subject: Vec<String>) -> CommandBatch<'_> {
        CommandBatch::new(self, subject)
    }

    // Command runners
    // --------------------

    /// Run a query command and parse its aggregated output into entities
    #[instrument(skip_all, fields(ref_name = %ref_name))]
    pub fn run_query(
        &self,
        ctx: &ModuleContext,
        ref_name: &str,
        command: &CommandRecord,
    ) -> Result<Value> {
        let outputs = self.run_command(ctx, ref_name, command)?;

        let parse = command.parse.as_deref().ok_or_else(|| {
            LimarError::command_run(format!("Query '{ref_name}' has no parse expression"))
        })?;
        trace!(parse, "applying query parser");

        let stdouts = Value::Array(outputs.iter().map(|o| o.stdout.clone()).collect());
        let parsed = query::query_first(parse, &stdouts)?;
        debug!(output = %parsed, "query output");
        Ok(parsed)
    }

    /// Run an action command; its output is parsed only when a parse
    /// expression was declared
    #[instrument(skip_all, fields(ref_name = %ref_name))]
    pub fn run_action(
        &self,
        ctx: &ModuleContext,
        ref_name: &str,
        command: &CommandRecord,
    ) -> Result<Value> {
        let outputs = self.run_command(ctx, ref_name, command)?;

        match command.parse.as_deref() {
            Some(parse) => {
                trace!(parse, "applying action parser");
                let stdouts = Value::Array(outputs.iter().map(|o| o.stdout.clone()).collect());
                query::query_first(parse, &stdouts)
            }
            None => {
                debug!("action '{ref_name}' has no parse expression, ignoring its output");
                Ok(Value::Null)
            }
        }
    }

    fn run_command(
        &self,
        ctx: &ModuleContext,
        ref_name: &str,
        command: &CommandRecord,
    ) -> Result<Vec<SubcommandResult>> {
        // Evaluate parameters to interpolation arguments
        let mut command_args: HashMap<Subquery, String> = HashMap::new();
        for param in &command.spec.parameters {
            let result = self.invoke_limar(
                ctx,
                &param.module,
                &param.method,
                &param.args,
                param.jq_transform.as_deref(),
                param.pq_transform.as_deref(),
            );
            if result.status != 0 {
                return Err(LimarError::command_run(format!(
                    "Evaluation of command parameter '{{{{ {} }}}}' failed: {}",
                    transformer::format_subquery(param),
                    result.stderr
                )));
            }
            let Value::String(text) = result.stdout else {
                return Err(LimarError::command_run(format!(
                    "Evaluation of command parameter '{{{{ {} }}}}' did not return a string; cannot interpolate non-string values",
                    transformer::format_subquery(param)
                )));
            };
            command_args.insert(param.clone(), text);
        }
        trace!(?command_args, "command arguments");

        debug!(
            command = %transformer::format_text(&command.spec),
            "running command '{ref_name}'"
        );

        let mut outputs = Vec::with_capacity(command.spec.subcommands.len());
        for subcommand in &command.spec.subcommands {
            let output = match &subcommand.data {
                SubcommandData::System(grouped) => self.run_system_subcommand(
                    grouped,
                    &command_args,
                    subcommand.allowed_to_fail,
                )?,
                SubcommandData::Limar(call) => self.run_limar_subcommand(
                    ctx,
                    call,
                    &command_args,
                    subcommand.allowed_to_fail,
                )?,
            };
            trace!(status = output.status, "subcommand finished");
            outputs.push(output);
        }

        Ok(outputs)
    }

    // Subcommand and subquery runners
    // --------------------

    /// Spawn a host process from the interpolated argv and capture its
    /// output
    fn run_system_subcommand(
        &self,
        grouped: &GroupedInterpolatable,
        data: &HashMap<Subquery, String>,
        allowed_to_fail: bool,
    ) -> Result<SubcommandResult> {
        let argv = transformer::interpolate_grouped(grouped, data)?;
        trace!(?argv, "system subcommand argv");

        let program = argv
            .first()
            .ok_or_else(|| LimarError::command_run("Empty system subcommand".to_string()))?;

        let output = SystemCommand::new(program)
            .args(&argv[1..])
            .output()
            .map_err(|e| {
                LimarError::command_run(format!("Failed to spawn process {argv:?}: {e}"))
            })?;

        let status = output.status.code().unwrap_or(-1);
        if status != 0 && !allowed_to_fail {
            return Err(LimarError::command_run(format!(
                "Process run with arguments {argv:?} failed with return code '{status}'"
            )));
        }

        Ok(SubcommandResult {
            status,
            stdout: Value::String(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Call another LIMAR module's service method with interpolated args
    fn run_limar_subcommand(
        &self,
        ctx: &ModuleContext,
        call: &LimarCall,
        data: &HashMap<Subquery, String>,
        allowed_to_fail: bool,
    ) -> Result<SubcommandResult> {
        debug!(
            subcommand = %transformer::format_limar_call(call),
            "running limar subcommand"
        );
        let args = transformer::interpolate_grouped(&call.args, data)?;

        let output = self.invoke_limar(
            ctx,
            &call.module,
            &call.method,
            &args,
            call.jq_transform.as_deref(),
            call.pq_transform.as_deref(),
        );

        if output.status != 0 && !allowed_to_fail {
            return Err(LimarError::command_run(format!(
                "LIMAR call '{}.{}' with arguments {args:?} failed: {}",
                call.module, call.method, output.stderr
            )));
        }

        Ok(output)
    }

    /// Invoke a module's service method, applying the jq/pq transform
    ///
    /// Failures are folded into the result rather than raised, so callers
    /// can honour allowed-to-fail markers. Calls targeting the command
    /// engine itself (`command.run_refs`) are served inline from this
    /// runner: the referenced commands are this command's dependencies, so
    /// they have already run (or are cached) by the time the call is made,
    /// and routing them through the orchestrator would re-enter the module
    /// currently executing.
    fn invoke_limar(
        &self,
        ctx: &ModuleContext,
        module: &str,
        method: &str,
        args: &[String],
        jq_transform: Option<&str>,
        pq_transform: Option<&str>,
    ) -> SubcommandResult {
        let output = if module == "command" && method == "run_refs" {
            self.run_refs_inline(ctx, args)
        } else {
            let call_args: Vec<Value> = args.iter().cloned().map(Value::String).collect();
            ctx.call(module, method, &call_args)
        };

        let transformed = output.and_then(|output| match (jq_transform, pq_transform) {
            (Some(jq), _) => query::query_first(jq, &output),
            (None, Some(pq)) => query::query_all(pq, &output),
            (None, None) => Ok(output),
        });

        match transformed {
            Ok(stdout) => SubcommandResult {
                status: 0,
                stdout,
                stderr: String::new(),
            },
            Err(e) => SubcommandResult {
                status: 1,
                stdout: Value::Null,
                stderr: e.to_string(),
            },
        }
    }

    fn run_refs_inline(&self, ctx: &ModuleContext, refs: &[String]) -> Result<Value> {
        let mut entities: Vec<Value> = Vec::new();
        for ref_name in refs {
            match self.run_ref(ctx, ref_name)? {
                Value::Array(items) => entities.extend(items),
                Value::Null => {}
                other => entities.push(other),
            }
        }
        Ok(Value::Array(entities))
    }

    /// Run one command by ref, honouring its cache configuration
    pub fn run_ref(&self, ctx: &ModuleContext, ref_name: &str) -> Result<Value> {
        let item = self.command_items.get(ref_name).ok_or_else(|| {
            LimarError::batch(format!("Unknown command ref '{ref_name}'"))
        })?;
        let (command, cacheable) = {
            let item = item.borrow();
            let command = item.command.clone().ok_or_else(|| {
                LimarError::batch(format!("Item '{ref_name}' carries no command"))
            })?;
            (command, cache_utils::is_enabled(&item))
        };

        let command_type = command.command_type.ok_or_else(|| {
            LimarError::command_run(format!(
                "Attempt to run unimplemented command '{ref_name}'"
            ))
        })?;

        let run = || match command_type {
            CommandType::Query => self.run_query(ctx, ref_name, &command),
            CommandType::Action => self.run_action(ctx, ref_name, &command),
        };

        if !cacheable {
            run()
        } else {
            let invalid_on_run: Vec<String> = command
                .transitive_dependants
                .iter()
                .map(|dependant| self.key_for_ref(dependant))
                .collect::<Result<_>>()?;
            cache_utils::with_caching(ctx, &self.key_for_ref(ref_name)?, run, &invalid_on_run)
        }
    }

    /// The cache key a command's output is stored under
    pub fn key_for_ref(&self, command_ref: &str) -> Result<String> {
        let item = self.command_items.get(command_ref).ok_or_else(|| {
            LimarError::batch(format!("Unknown command ref '{command_ref}'"))
        })?;
        let item = item.borrow();
        let command_type = item
            .command
            .as_ref()
            .and_then(|command| command.command_type)
            .ok_or_else(|| LimarError::batch(format!("Command '{command_ref}' has no type")))?;

        Ok(cache_utils::key(&[&command_type.to_string(), command_ref]))
    }
}
