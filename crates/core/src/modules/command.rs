//! Command module
//!
//! The engine's orchestrator-facing surface: discovers runnable command
//! items from the manifest, resolves the effective subject, schedules the
//! selected commands in a batch, and shapes the resulting entities for
//! display or forwarding.
//!
//! The module exposes a six-stage pipeline (INITIALISE through RENDER);
//! callers may bound the executed range, and the display stages are
//! skipped when the output is being forwarded to another module.

use crate::command::runner::CommandRunner;
use crate::command::transformer;
use crate::command::types::CommandType;
use crate::errors::{LimarError, Result};
use crate::manifest::item::ItemSet;
use crate::modules::manifest::ManifestModule;
use crate::modules::phase::{configure_stage_args, PhaseModule, StageGate};
use crate::orchestrator::{Invocation, Module, ModuleContext};
use crate::phase::PhaseSystem;
use crate::query;
use clap::{Arg, ArgAction, Command};
use serde_json::Value;
use std::any::Any;
use std::rc::Rc;
use tracing::debug;

const INFO_LIFECYCLE_NAME: &str = "command:lifecycle";
const STAGES: [&str; 6] = ["INITIALISE", "GET", "SUBJECT", "RUN", "TABULATE", "RENDER"];

fn info_lifecycle() -> PhaseSystem {
    PhaseSystem::new(INFO_LIFECYCLE_NAME, &STAGES)
}

#[derive(Default)]
pub struct CommandModule {
    system: Option<Rc<PhaseSystem>>,
    runner: Option<CommandRunner>,
}

impl CommandModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn runner(&self) -> Result<&CommandRunner> {
        self.runner
            .as_ref()
            .ok_or_else(|| LimarError::internal("command engine used before start"))
    }

    /// All commands tagged with every element of the given subject
    pub fn commands_with_subject(
        &self,
        ctx: &ModuleContext,
        given_subject: &[String],
    ) -> Result<ItemSet> {
        if given_subject.is_empty() {
            return Ok(self.runner()?.command_items().clone());
        }

        debug!(?given_subject, "getting commands for subject");
        let set_ref = format!("command-run-{:032x}", fastrand::u128(..));
        let expr = given_subject.join(" & ");

        let selected = ctx.with_module::<ManifestModule, _>("manifest", |manifest| {
            manifest.declare_item_set(&set_ref, &expr)
        })?;

        // Keep only runnable commands out of the tag intersection
        let commands = self.runner()?.command_items();
        Ok(selected
            .into_iter()
            .filter(|(ref_name, _)| commands.contains_key(ref_name))
            .collect())
    }

    /// The effective subject for the given command items
    ///
    /// The given subject filtered to subjects the commands declare, or the
    /// commands' primary subject when none is given.
    pub fn effective_subject_for(
        &self,
        command_items: &ItemSet,
        given_subject: &[String],
    ) -> Vec<String> {
        if given_subject.is_empty() {
            let subject = transformer::primary_subject_of(command_items);
            debug!(?subject, "effective subject from primary subject");
            subject
        } else {
            let subject = transformer::subject_of(command_items, given_subject);
            debug!(?subject, "effective subject from given subject");
            subject
        }
    }

    /// Run the given commands and key the resulting entities by subject
    pub fn run_items(
        &self,
        ctx: &ModuleContext,
        command_items: &ItemSet,
        subject: &[String],
        allowed_types: &[CommandType],
    ) -> Result<Value> {
        for (command_ref, item) in command_items {
            let item = item.borrow();
            if !transformer::is_runnable(&item) {
                return Err(LimarError::command_run(format!(
                    "Attempt to run unimplemented command '{command_ref}'"
                )));
            }

            if !allowed_types.is_empty() {
                let command_type = item
                    .command
                    .as_ref()
                    .and_then(|command| command.command_type)
                    .ok_or_else(|| {
                        LimarError::command_run(format!(
                            "Command '{command_ref}' has no type"
                        ))
                    })?;
                if !allowed_types.contains(&command_type) {
                    return Err(LimarError::command_run(format!(
                        "Attempt to run command '{command_ref}' of type '{command_type}' not allowed for this invocation"
                    )));
                }
            }
        }

        let runner = self.runner()?;
        let mut batch = runner.new_batch(subject.to_vec());
        let refs: Vec<String> = command_items.keys().cloned().collect();
        batch.add(&refs)?;
        let entities = batch.process(ctx)?;

        let output: serde_json::Map<String, Value> = entities
            .into_iter()
            .map(|(key, entity)| (key.to_string(), entity))
            .collect();
        Ok(Value::Object(output))
    }

    fn item_set_values(command_items: &ItemSet) -> Value {
        let map: serde_json::Map<String, Value> = command_items
            .iter()
            .map(|(ref_name, item)| (ref_name.clone(), item.borrow().to_value()))
            .collect();
        Value::Object(map)
    }
}

impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn aliases(&self) -> Vec<&'static str> {
        vec!["show", "run"]
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["cache", "phase", "manifest", "command-manifest", "tr"]
    }

    fn configure_args(&mut self, command: Command) -> Command {
        let command = command
            .about("Run the commands matching a subject and show their entities")
            .arg(
                Arg::new("command")
                    .short('c')
                    .long("command")
                    .action(ArgAction::Append)
                    .help(
                        "Run the given command ref instead of the commands matched by the \
                         subject (repeatable)",
                    ),
            )
            .arg(
                Arg::new("subject")
                    .num_args(0..)
                    .help("The subject to show information about"),
            );
        configure_stage_args(command)
    }

    fn configure(&mut self, ctx: &ModuleContext) -> Result<()> {
        let system = ctx.with_module::<PhaseModule, _>("phase", |phase| {
            phase.register_system(info_lifecycle())
        })?;
        self.system = Some(system);
        Ok(())
    }

    fn start(&mut self, ctx: &ModuleContext) -> Result<()> {
        let (subject_items, command_items, digest) =
            ctx.with_module::<ManifestModule, _>("manifest", |manifest| {
                let subjects: ItemSet = manifest
                    .get_item_set(Some("^subject$"))
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|(_, item)| item.borrow().id.is_some())
                    .collect();

                let commands: ItemSet = manifest
                    .get_item_set(Some("^command$"))
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|(_, item)| item.borrow().command.is_some())
                    .collect();

                Ok((subjects, commands, manifest.get_manifest_digest()?.to_string()))
            })?;

        self.runner = Some(CommandRunner::new(
            ctx,
            subject_items,
            command_items,
            &digest,
        )?);
        Ok(())
    }

    fn run(&mut self, ctx: &ModuleContext, invocation: &Invocation) -> Result<Value> {
        let system = self
            .system
            .clone()
            .ok_or_else(|| LimarError::internal("command module not configured"))?;
        let mut gate = StageGate::from_args(system, &invocation.args)?;

        let requested_refs: Vec<String> = invocation
            .args
            .get_many::<String>("command")
            .map(|values| values.cloned().collect())
            .unwrap_or_default();
        let given_subject: Vec<String> = invocation
            .args
            .get_many::<String>("subject")
            .map(|values| values.cloned().collect())
            .unwrap_or_default();

        let mut output = invocation
            .forwarded_data
            .clone()
            .unwrap_or(Value::Null);

        let mut command_items = ItemSet::new();
        if gate.advance_to("GET", true)? {
            command_items = if requested_refs.is_empty() {
                self.commands_with_subject(ctx, &given_subject)?
            } else {
                ctx.with_module::<ManifestModule, _>("manifest", |manifest| {
                    manifest.get_items(&requested_refs)
                })?
            };
            output = Self::item_set_values(&command_items);
        }

        let mut subject = Vec::new();
        let mut allowed_types: Vec<CommandType> = Vec::new();
        if gate.advance_to("SUBJECT", true)? {
            allowed_types = match invocation.invoked_as.as_str() {
                "show" => vec![CommandType::Query],
                "run" => vec![CommandType::Action],
                _ => Vec::new(),
            };
            subject = self.effective_subject_for(&command_items, &given_subject);
            output = Value::Array(subject.iter().cloned().map(Value::String).collect());
        }

        if gate.advance_to("RUN", true)? {
            output = self.run_items(ctx, &command_items, &subject, &allowed_types)?;
        }

        if gate.advance_to("TABULATE", !invocation.output_is_forward)? {
            let entities: Vec<Value> = match &output {
                Value::Object(map) => map.values().cloned().collect(),
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            output = query::tabulate(&entities);
        }

        if gate.advance_to("RENDER", !invocation.output_is_forward)? {
            output = Value::String(query::render_table(&output, true)?);
        }

        Ok(output)
    }

    fn call_service(
        &mut self,
        ctx: &ModuleContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value> {
        match method {
            "run_refs" => {
                let refs: Vec<String> = args
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                let command_items =
                    ctx.with_module::<ManifestModule, _>("manifest", |manifest| {
                        manifest.get_items(&refs)
                    })?;
                let subject = self.effective_subject_for(&command_items, &[]);
                self.run_items(ctx, &command_items, &subject, &[])
            }
            other => Err(LimarError::command_run(format!(
                "Module 'command' has no service method '{other}'"
            ))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
