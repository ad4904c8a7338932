//! Module orchestrator
//!
//! Registers modules, resolves their dependencies, drives the module
//! lifecycle, and mediates inter-module invocation.
//!
//! The lifecycle phases are: registration, initialisation, environment
//! configuration, argument configuration, configuration, starting, running,
//! and stopping. After registration closes, every phase iterates the
//! modules in dependency (topological) order. A start or run failure halts
//! forward progress; every module that started successfully is stopped, in
//! reverse start order, and the first captured error is returned after the
//! stop sweep.
//!
//! The command line is split into a global section and one or more module
//! invocations separated by `->`; each invocation's return value is
//! forwarded to the next.

use crate::envparse::{Env, EnvParser};
use crate::errors::{LimarError, Result};
use indexmap::IndexMap;
use serde_json::Value;
use std::any::Any;
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// The forwarding operator between module invocations
pub const FORWARD_OPERATOR: &str = "->";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Registration,
    Initialisation,
    EnvironmentConfiguration,
    ArgumentConfiguration,
    Configuration,
    Starting,
    Running,
    Stopping,
}

impl Default for LifecyclePhase {
    fn default() -> Self {
        LifecyclePhase::Registration
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecyclePhase::Registration => "registration",
            LifecyclePhase::Initialisation => "initialisation",
            LifecyclePhase::EnvironmentConfiguration => "environment-configuration",
            LifecyclePhase::ArgumentConfiguration => "argument-configuration",
            LifecyclePhase::Configuration => "configuration",
            LifecyclePhase::Starting => "starting",
            LifecyclePhase::Running => "running",
            LifecyclePhase::Stopping => "stopping",
        };
        write!(f, "{name}")
    }
}

/// One module invocation from the command line
pub struct Invocation {
    /// The name the module was invoked under (an alias or its own name)
    pub invoked_as: String,
    /// The module's own parsed arguments
    pub args: clap::ArgMatches,
    /// Data forwarded from the previous invocation in the chain
    pub forwarded_data: Option<Value>,
    /// Whether this invocation's output feeds another invocation
    pub output_is_forward: bool,
}

/// The error state passed to `stop` hooks
pub struct StopOutcome<'a> {
    pub start_error: Option<&'a LimarError>,
    pub run_error: Option<&'a LimarError>,
}

impl StopOutcome<'_> {
    pub fn is_clean(&self) -> bool {
        self.start_error.is_none() && self.run_error.is_none()
    }
}

/// A lifecycle-driven unit of the application
///
/// Every hook has a default no-op body; a module implements the subset it
/// needs. Construction should be side-effect-light: resource acquisition
/// belongs in `start`, matching teardown in `stop`.
pub trait Module: Any {
    /// The module's kebab-case name, used for invocation, the environment
    /// namespace, and the CLI subcommand
    fn name(&self) -> &'static str;

    /// Alternate invocation names
    fn aliases(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Names of modules this module depends on
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Declare the environment variables this module supports
    fn configure_env(&mut self, _parser: &mut EnvParser) -> Result<()> {
        Ok(())
    }

    /// Contribute options to the root argument parser
    fn configure_root_args(&mut self, command: clap::Command) -> clap::Command {
        command
    }

    /// Configure this module's own subcommand arguments
    fn configure_args(&mut self, command: clap::Command) -> clap::Command {
        command
    }

    /// Configure this module and any modules it depends on
    fn configure(&mut self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// Fully initialise after configuration (acquire resources here)
    fn start(&mut self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// The module's RUN behaviour when invoked from the command line
    fn run(&mut self, _ctx: &ModuleContext, _invocation: &Invocation) -> Result<Value> {
        Err(LimarError::config(format!(
            "Module not callable: '{}'",
            self.name()
        )))
    }

    /// Tear down after running (release resources here)
    fn stop(&mut self, _ctx: &ModuleContext, _outcome: &StopOutcome) -> Result<()> {
        Ok(())
    }

    /// Called whenever another module fetches this one
    fn invoke(&mut self, _phase: LifecyclePhase) {}

    /// Dynamic service dispatch for manifest subcommands and subqueries
    fn call_service(
        &mut self,
        _ctx: &ModuleContext,
        method: &str,
        _args: &[Value],
    ) -> Result<Value> {
        Err(LimarError::command_run(format!(
            "Module '{}' has no service method '{method}'",
            self.name()
        )))
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

type ModuleCell = Rc<RefCell<Box<dyn Module>>>;

/// The facade modules use to reach each other and the shared run state
///
/// Mirrors the orchestrator's invocation surface: fetch a module by name,
/// call a service method on it, or get typed access to it. All access is
/// single-threaded; re-entrant access to a module already on the call stack
/// is an internal error.
#[derive(Default)]
pub struct ModuleContext {
    modules: RefCell<IndexMap<String, ModuleCell>>,
    aliases: RefCell<HashMap<String, String>>,
    phase: Cell<LifecyclePhase>,
    env: RefCell<Env>,
    global_args: RefCell<Option<clap::ArgMatches>>,
}

impl ModuleContext {
    pub fn phase(&self) -> LifecyclePhase {
        self.phase.get()
    }

    /// The parsed environment (valid from the configuration phase on)
    pub fn env(&self) -> Ref<'_, Env> {
        self.env.borrow()
    }

    /// The parsed global arguments (valid from the configuration phase on)
    pub fn global_args(&self) -> Result<clap::ArgMatches> {
        self.global_args
            .borrow()
            .clone()
            .ok_or_else(|| LimarError::internal("global arguments not yet parsed"))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        let canonical = self.canonical_name(name);
        self.modules.borrow().contains_key(&canonical)
    }

    fn canonical_name(&self, name: &str) -> String {
        self.aliases
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Fetch a module by name, calling its `invoke` hook
    pub fn invoke_module(&self, name: &str) -> Result<ModuleCell> {
        let canonical = self.canonical_name(name);
        let cell = self
            .modules
            .borrow()
            .get(&canonical)
            .cloned()
            .ok_or_else(|| {
                LimarError::config(format!("Module not initialised: '{name}'"))
            })?;

        {
            let mut module = cell.try_borrow_mut().map_err(|_| {
                LimarError::internal(format!(
                    "Re-entrant invocation of module '{name}' (already in use on this call stack)"
                ))
            })?;
            module.invoke(self.phase.get());
        }

        Ok(cell)
    }

    /// Call a service method on a module by name
    pub fn call(&self, module: &str, method: &str, args: &[Value]) -> Result<Value> {
        debug!(module, method, "inter-module service call");
        let cell = self.invoke_module(module)?;
        let mut target = cell.try_borrow_mut().map_err(|_| {
            LimarError::internal(format!(
                "Re-entrant invocation of module '{module}' (already in use on this call stack)"
            ))
        })?;
        target.call_service(self, method, args)
    }

    /// Typed access to a module: runs `f` with a mutable reference to it
    pub fn with_module<M, R>(&self, name: &str, f: impl FnOnce(&mut M) -> Result<R>) -> Result<R>
    where
        M: Module,
    {
        let cell = self.invoke_module(name)?;
        let mut module = cell.try_borrow_mut().map_err(|_| {
            LimarError::internal(format!(
                "Re-entrant invocation of module '{name}' (already in use on this call stack)"
            ))
        })?;
        let module = module
            .as_any_mut()
            .downcast_mut::<M>()
            .ok_or_else(|| {
                LimarError::internal(format!("Module '{name}' has an unexpected type"))
            })?;
        f(module)
    }
}

/// Manages the lifecycle of the application's modules
pub struct Orchestrator {
    app_name: String,
    ctx: Rc<ModuleContext>,
    registered: IndexMap<String, Box<dyn Module>>,
    registration_closed: bool,
}

impl Orchestrator {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            ctx: Rc::new(ModuleContext::default()),
            registered: IndexMap::new(),
            registration_closed: false,
        }
    }

    pub fn context(&self) -> Rc<ModuleContext> {
        Rc::clone(&self.ctx)
    }

    /// Register a module; duplicates are skipped, late registration fails
    pub fn register(&mut self, module: Box<dyn Module>) -> Result<()> {
        let name = module.name().to_string();
        if self.registration_closed {
            return Err(LimarError::registration(format!(
                "Attempt to register module '{name}' after module initialisation"
            )));
        }

        if self.registered.contains_key(&name) {
            info!(module = %name, "skipping registering already-registered module");
            return Ok(());
        }

        debug!(module = %name, "registering module");
        self.registered.insert(name, module);
        Ok(())
    }

    /// Drive the full lifecycle for one command-line invocation
    ///
    /// Returns the last module invocation's output on success; on failure
    /// the first captured error, after the stop sweep has run.
    pub fn run(
        &mut self,
        cli_args: &[String],
        cli_env: Option<&HashMap<String, String>>,
    ) -> Result<Option<Value>> {
        // Lifecycle: initialise
        self.ctx.phase.set(LifecyclePhase::Initialisation);
        self.registration_closed = true;

        {
            let mut modules = self.ctx.modules.borrow_mut();
            let mut aliases = self.ctx.aliases.borrow_mut();
            for (name, module) in self.registered.drain(..) {
                for alias in module.aliases() {
                    aliases.insert(alias.to_string(), name.clone());
                }
                modules.insert(name, Rc::new(RefCell::new(module)));
            }
        }

        // Lifecycle: resolve dependencies
        self.sort_modules()?;
        let ordered: Vec<(String, ModuleCell)> = self
            .ctx
            .modules
            .borrow()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.clone()))
            .collect();

        // Lifecycle: configure environment
        self.ctx.phase.set(LifecyclePhase::EnvironmentConfiguration);
        let mut env_parser = EnvParser::new(&self.app_name);
        for (name, cell) in &ordered {
            debug!(module = %name, "configuring environment");
            cell.borrow_mut()
                .configure_env(env_parser.add_scope(name))?;
        }
        *self.ctx.env.borrow_mut() = env_parser.parse(cli_env)?;

        // Lifecycle: configure arguments
        self.ctx.phase.set(LifecyclePhase::ArgumentConfiguration);
        let mut root_command = clap::Command::new(self.app_name.clone())
            .subcommand_required(false)
            .disable_help_subcommand(true);
        for (name, cell) in &ordered {
            debug!(module = %name, "configuring arguments");
            let mut module = cell.borrow_mut();
            root_command = module.configure_root_args(root_command);

            let mut subcommand = clap::Command::new(name.clone());
            for alias in module.aliases() {
                subcommand = subcommand.alias(alias);
            }
            subcommand = module.configure_args(subcommand);
            root_command = root_command.subcommand(subcommand);
        }

        // Split the command line: global opts, then `->`-separated
        // invocations
        let (global_opts, invocation_segments) = split_cli(cli_args);
        let mut global_argv: Vec<String> = vec![self.app_name.clone()];
        global_argv.extend(global_opts.iter().cloned());

        let global_args = root_command
            .clone()
            .try_get_matches_from(&global_argv)
            .map_err(|e| LimarError::config(e.to_string()))?;
        *self.ctx.global_args.borrow_mut() = Some(global_args);

        // Lifecycle: configure
        self.ctx.phase.set(LifecyclePhase::Configuration);
        for (name, cell) in &ordered {
            debug!(module = %name, "configuring module");
            cell.borrow_mut().configure(&self.ctx)?;
        }

        // Lifecycle: start
        self.ctx.phase.set(LifecyclePhase::Starting);
        let mut started: Vec<(String, ModuleCell)> = Vec::new();
        let mut start_error: Option<LimarError> = None;
        for (name, cell) in &ordered {
            debug!(module = %name, "starting module");
            match cell.borrow_mut().start(&self.ctx) {
                Ok(()) => started.push((name.clone(), cell.clone())),
                Err(e) => {
                    error!(
                        module = %name,
                        error = %e,
                        "starting module failed, attempting to stop all successfully started modules"
                    );
                    start_error = Some(e);
                    break;
                }
            }
        }

        // Lifecycle: run each invocation, forwarding data left to right
        let mut run_error: Option<LimarError> = None;
        let mut forwarded: Option<Value> = None;
        if start_error.is_none() {
            self.ctx.phase.set(LifecyclePhase::Running);

            for (index, segment) in invocation_segments.iter().enumerate() {
                match self.run_invocation(
                    &root_command,
                    &global_opts,
                    segment,
                    forwarded.take(),
                    index + 1 < invocation_segments.len(),
                ) {
                    Ok(output) => forwarded = output,
                    Err(e) => {
                        run_error = Some(e);
                        break;
                    }
                }
            }
        }

        // Lifecycle: stop, in reverse start order
        self.ctx.phase.set(LifecyclePhase::Stopping);
        let outcome = StopOutcome {
            start_error: start_error.as_ref(),
            run_error: run_error.as_ref(),
        };
        for (name, cell) in started.iter().rev() {
            debug!(module = %name, "stopping module");
            if let Err(e) = cell.borrow_mut().stop(&self.ctx, &outcome) {
                error!(module = %name, error = %e, "stopping module failed, skipping");
                warn!(
                    "A failed stop may have left state under this module's management unclean"
                );
            }
        }

        match start_error.or(run_error) {
            Some(error) => Err(error),
            None => Ok(forwarded),
        }
    }

    fn run_invocation(
        &self,
        root_command: &clap::Command,
        global_opts: &[String],
        segment: &[String],
        forwarded_data: Option<Value>,
        output_is_forward: bool,
    ) -> Result<Option<Value>> {
        let invoked_as = segment
            .first()
            .ok_or_else(|| LimarError::config("Empty module invocation".to_string()))?
            .clone();

        let mut argv: Vec<String> = vec![self.app_name.clone()];
        argv.extend(global_opts.iter().cloned());
        argv.extend(segment.iter().cloned());

        let matches = root_command
            .clone()
            .try_get_matches_from(&argv)
            .map_err(|e| LimarError::config(e.to_string()))?;
        let (subcommand_name, subcommand_matches) = matches
            .subcommand()
            .ok_or_else(|| {
                LimarError::config(format!("Unknown module invocation: '{invoked_as}'"))
            })?;

        debug!(module = %subcommand_name, invoked_as = %invoked_as, "running module");
        let invocation = Invocation {
            invoked_as,
            args: subcommand_matches.clone(),
            forwarded_data,
            output_is_forward,
        };

        let cell = self.ctx.invoke_module(subcommand_name)?;
        let output = cell
            .try_borrow_mut()
            .map_err(|_| {
                LimarError::internal(format!(
                    "Re-entrant invocation of module '{subcommand_name}'"
                ))
            })?
            .run(&self.ctx, &invocation)?;

        Ok(Some(output))
    }

    /// Topologically sort the initialised modules by their dependencies
    ///
    /// Fails on a cycle, and on a missing dependency with a diagnostic
    /// listing the dependants of the missing module.
    fn sort_modules(&self) -> Result<()> {
        let mut modules = self.ctx.modules.borrow_mut();

        let dependency_graph: IndexMap<String, Vec<String>> = modules
            .iter()
            .map(|(name, cell)| {
                let deps = cell
                    .borrow()
                    .dependencies()
                    .iter()
                    .map(|d| d.to_string())
                    .collect();
                (name.clone(), deps)
            })
            .collect();
        debug!(?dependency_graph, "modules (dependency graph)");

        for dep in dependency_graph.values().flatten() {
            if !dependency_graph.contains_key(dep) {
                let dependants: Vec<&String> = dependency_graph
                    .iter()
                    .filter(|(_, check_deps)| check_deps.contains(dep))
                    .map(|(check_name, _)| check_name)
                    .collect();
                return Err(LimarError::dependency(format!(
                    "Module '{dep}' depended on by modules {dependants:?} is not registered"
                )));
            }
        }

        let sorted = topological_sort(&dependency_graph)?;
        let mut reordered: IndexMap<String, ModuleCell> = IndexMap::new();
        for name in sorted {
            let cell = modules
                .get(&name)
                .cloned()
                .ok_or_else(|| LimarError::internal("sorted module vanished"))?;
            reordered.insert(name, cell);
        }
        *modules = reordered;
        Ok(())
    }
}

/// Split argv into the leading global options and the `->`-separated module
/// invocation segments
fn split_cli(cli_args: &[String]) -> (Vec<String>, Vec<Vec<String>>) {
    let mut global_opts = Vec::new();
    let mut rest = cli_args;
    for (index, arg) in cli_args.iter().enumerate() {
        if !arg.starts_with('-') {
            rest = &cli_args[index..];
            break;
        }
        global_opts.push(arg.clone());
        rest = &cli_args[index + 1..];
    }

    let mut segments: Vec<Vec<String>> = Vec::new();
    if !rest.is_empty() {
        segments.push(Vec::new());
        for arg in rest {
            if arg == FORWARD_OPERATOR {
                segments.push(Vec::new());
            } else {
                segments
                    .last_mut()
                    .expect("segments is never empty here")
                    .push(arg.clone());
            }
        }
    }

    (global_opts, segments)
}

/// Kahn's algorithm over a name -> dependencies map; stable with respect to
/// the input order
pub(crate) fn topological_sort(graph: &IndexMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut in_degree: IndexMap<&String, usize> = graph
        .iter()
        .map(|(name, deps)| {
            let count = deps.iter().filter(|dep| graph.contains_key(*dep)).count();
            (name, count)
        })
        .collect();

    let mut ready: Vec<&String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut sorted: Vec<String> = Vec::with_capacity(graph.len());

    while let Some(name) = ready.first().cloned() {
        ready.remove(0);
        sorted.push(name.clone());

        for (dependant, deps) in graph {
            if deps.contains(name) {
                let degree = in_degree
                    .get_mut(dependant)
                    .expect("all modules have a degree");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dependant);
                }
            }
        }
    }

    if sorted.len() != graph.len() {
        let cyclic: Vec<&String> = graph
            .keys()
            .filter(|name| !sorted.contains(*name))
            .collect();
        return Err(LimarError::dependency(format!(
            "Modules have circular dependencies: {cyclic:?}"
        )));
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records lifecycle calls into a shared log
    struct Probe {
        name: &'static str,
        deps: Vec<&'static str>,
        log: Rc<RefCell<Vec<String>>>,
        fail_on_start: bool,
        fail_on_run: bool,
    }

    impl Probe {
        fn new(name: &'static str, deps: Vec<&'static str>, log: Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                name,
                deps,
                log,
                fail_on_start: false,
                fail_on_run: false,
            }
        }

        fn record(&self, event: &str) {
            self.log.borrow_mut().push(format!("{}:{event}", self.name));
        }
    }

    impl Module for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> Vec<&'static str> {
            self.deps.clone()
        }

        fn configure(&mut self, _ctx: &ModuleContext) -> Result<()> {
            self.record("configure");
            Ok(())
        }

        fn start(&mut self, _ctx: &ModuleContext) -> Result<()> {
            self.record("start");
            if self.fail_on_start {
                return Err(LimarError::internal("start failure"));
            }
            Ok(())
        }

        fn run(&mut self, _ctx: &ModuleContext, invocation: &Invocation) -> Result<Value> {
            self.record("run");
            if self.fail_on_run {
                return Err(LimarError::internal("run failure"));
            }

            // Forward a list of the module names seen so far in the chain
            let mut seen = match &invocation.forwarded_data {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            seen.push(Value::String(self.name.to_string()));
            Ok(Value::Array(seen))
        }

        fn stop(&mut self, _ctx: &ModuleContext, _outcome: &StopOutcome) -> Result<()> {
            self.record("stop");
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_lifecycle_order_follows_dependencies() -> anyhow::Result<()> {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut orchestrator = Orchestrator::new("test-app");
        // Registered out of dependency order on purpose
        orchestrator.register(Box::new(Probe::new(
            "runner",
            vec!["cache"],
            log.clone(),
        )))?;
        orchestrator.register(Box::new(Probe::new("log", vec![], log.clone())))?;
        orchestrator.register(Box::new(Probe::new(
            "cache",
            vec!["log"],
            log.clone(),
        )))?;

        orchestrator.run(&args(&["runner"]), Some(&HashMap::new()))?;

        let log = log.borrow();
        let events: Vec<&str> = log.iter().map(String::as_str).collect();
        assert_eq!(
            events,
            vec![
                "log:configure",
                "cache:configure",
                "runner:configure",
                "log:start",
                "cache:start",
                "runner:start",
                "runner:run",
                "runner:stop",
                "cache:stop",
                "log:stop",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_forwarding_chains_left_to_right() -> anyhow::Result<()> {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut orchestrator = Orchestrator::new("test-app");
        orchestrator.register(Box::new(Probe::new("one", vec![], log.clone())))?;
        orchestrator.register(Box::new(Probe::new("two", vec![], log.clone())))?;
        orchestrator.register(Box::new(Probe::new("three", vec![], log.clone())))?;

        let output = orchestrator.run(
            &args(&["one", "->", "two", "->", "three"]),
            Some(&HashMap::new()),
        )?;

        assert_eq!(
            output,
            Some(serde_json::json!(["one", "two", "three"]))
        );
        Ok(())
    }

    #[test]
    fn test_start_failure_stops_started_modules_only() -> anyhow::Result<()> {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut orchestrator = Orchestrator::new("test-app");
        orchestrator.register(Box::new(Probe::new("first", vec![], log.clone())))?;
        let mut failing = Probe::new("failing", vec!["first"], log.clone());
        failing.fail_on_start = true;
        orchestrator.register(Box::new(failing))?;
        orchestrator.register(Box::new(Probe::new(
            "last",
            vec!["failing"],
            log.clone(),
        )))?;

        let result = orchestrator.run(&args(&["last"]), Some(&HashMap::new()));
        assert!(result.is_err());

        let log = log.borrow();
        let events: Vec<&str> = log.iter().map(String::as_str).collect();
        // No run happened, 'last' never started, only 'first' is stopped
        assert_eq!(
            events,
            vec![
                "first:configure",
                "failing:configure",
                "last:configure",
                "first:start",
                "failing:start",
                "first:stop",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_run_failure_halts_chain_but_stops_everything() -> anyhow::Result<()> {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut orchestrator = Orchestrator::new("test-app");
        let mut failing = Probe::new("bad", vec![], log.clone());
        failing.fail_on_run = true;
        orchestrator.register(Box::new(failing))?;
        orchestrator.register(Box::new(Probe::new("after", vec![], log.clone())))?;

        let result = orchestrator.run(&args(&["bad", "->", "after"]), Some(&HashMap::new()));
        assert!(result.is_err());

        let log = log.borrow();
        assert!(log.contains(&"bad:run".to_string()));
        assert!(!log.contains(&"after:run".to_string()));
        assert!(log.contains(&"after:stop".to_string()));
        assert!(log.contains(&"bad:stop".to_string()));
        Ok(())
    }

    #[test]
    fn test_missing_dependency_names_dependants() -> anyhow::Result<()> {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut orchestrator = Orchestrator::new("test-app");
        orchestrator.register(Box::new(Probe::new(
            "wanting",
            vec!["absent"],
            log.clone(),
        )))?;

        let err = orchestrator
            .run(&args(&["wanting"]), Some(&HashMap::new()))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("absent"), "got: {message}");
        assert!(message.contains("wanting"), "got: {message}");
        Ok(())
    }

    #[test]
    fn test_cyclic_dependencies_fail() -> anyhow::Result<()> {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut orchestrator = Orchestrator::new("test-app");
        orchestrator.register(Box::new(Probe::new("a", vec!["b"], log.clone())))?;
        orchestrator.register(Box::new(Probe::new("b", vec!["a"], log.clone())))?;

        let err = orchestrator
            .run(&args(&["a"]), Some(&HashMap::new()))
            .unwrap_err();
        assert!(err.to_string().contains("circular"));
        Ok(())
    }

    #[test]
    fn test_late_registration_fails() -> anyhow::Result<()> {
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut orchestrator = Orchestrator::new("test-app");
        orchestrator.register(Box::new(Probe::new("early", vec![], log.clone())))?;
        orchestrator.run(&args(&["early"]), Some(&HashMap::new()))?;

        let result = orchestrator.register(Box::new(Probe::new("late", vec![], log)));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_split_cli() {
        let (globals, segments) = split_cli(&args(&[
            "--no-cache",
            "show",
            "project",
            "->",
            "render",
        ]));
        assert_eq!(globals, args(&["--no-cache"]));
        assert_eq!(
            segments,
            vec![args(&["show", "project"]), args(&["render"])]
        );

        let (globals, segments) = split_cli(&args(&["-v"]));
        assert_eq!(globals, args(&["-v"]));
        assert!(segments.is_empty());
    }
}
