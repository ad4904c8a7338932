//! Shell module
//!
//! Owns the shell-script sink. Other modules add commands to run in the
//! calling shell (changing directory, exporting variables); the script is
//! written at stop, and only when the run finished without errors.

use crate::errors::{LimarError, Result};
use crate::orchestrator::{Module, ModuleContext, StopOutcome};
use crate::shell_script::ShellScript;
use clap::{Arg, Command};
use serde_json::Value;
use std::any::Any;
use tracing::{debug, warn};

const DEFAULT_SCRIPT_PATH: &str = "/tmp/limar-source";

#[derive(Default)]
pub struct ShellModule {
    script: Option<ShellScript>,
}

impl ShellModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a ready-to-source command for the outer shell
    pub fn add_command(&mut self, command: &str) -> Result<()> {
        let script = self
            .script
            .as_mut()
            .ok_or_else(|| LimarError::internal("shell script used before start"))?;
        debug!(command, "adding shell command to shell script");
        script.add(command);
        Ok(())
    }
}

impl Module for ShellModule {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn configure_root_args(&mut self, command: Command) -> Command {
        command.arg(
            Arg::new("shell-script")
                .long("shell-script")
                .default_value(DEFAULT_SCRIPT_PATH)
                .global(true)
                .help(
                    "Path to a script file that the wrapper shell sources after this \
                     process exits; modules add commands to it to affect the calling shell",
                ),
        )
    }

    fn start(&mut self, ctx: &ModuleContext) -> Result<()> {
        let args = ctx.global_args()?;
        let path = args
            .get_one::<String>("shell-script")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SCRIPT_PATH.to_string());
        self.script = Some(ShellScript::new(path));
        Ok(())
    }

    fn stop(&mut self, _ctx: &ModuleContext, outcome: &StopOutcome) -> Result<()> {
        let script = self
            .script
            .as_ref()
            .ok_or_else(|| LimarError::internal("shell stop before start"))?;

        if outcome.is_clean() {
            debug!("writing added commands to the shell script");
            script.write()
        } else {
            warn!(
                "skipping writing commands to the shell script to avoid causing any more \
                 changes than necessary after the run's error(s)"
            );
            Ok(())
        }
    }

    fn call_service(
        &mut self,
        _ctx: &ModuleContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value> {
        match method {
            "add_command" => {
                let command = args.first().and_then(Value::as_str).ok_or_else(|| {
                    LimarError::config("shell.add_command needs a command string".to_string())
                })?;
                self.add_command(command)?;
                Ok(Value::Null)
            }
            other => Err(LimarError::command_run(format!(
                "Module 'shell' has no service method '{other}'"
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
