//! Phase module
//!
//! A registry of phase systems and phased processes, plus the stage-bound
//! argument surface modules use to let callers select which stages of a
//! multi-stage pipeline actually run.

use crate::errors::{LimarError, Result};
use crate::orchestrator::Module;
use crate::phase::{PhaseSystem, PhasedProcess};
use clap::{Arg, Command};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
pub struct PhaseModule {
    systems: HashMap<String, Rc<PhaseSystem>>,
    processes: HashMap<String, Rc<RefCell<PhasedProcess>>>,
}

impl PhaseModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a phase system; names are unique
    pub fn register_system(&mut self, system: PhaseSystem) -> Result<Rc<PhaseSystem>> {
        let name = system.name().to_string();
        if self.systems.contains_key(&name) {
            return Err(LimarError::phase(format!(
                "Phase system '{name}' already exists; cannot register another with that name"
            )));
        }

        let system = Rc::new(system);
        self.systems.insert(name, Rc::clone(&system));
        Ok(system)
    }

    /// Register a phased process; names are unique
    pub fn register_process(
        &mut self,
        process: PhasedProcess,
    ) -> Result<Rc<RefCell<PhasedProcess>>> {
        let name = process.name().to_string();
        if self.processes.contains_key(&name) {
            return Err(LimarError::phase(format!(
                "Phased process '{name}' already exists; cannot register another with that name"
            )));
        }

        let process = Rc::new(RefCell::new(process));
        self.processes.insert(name, Rc::clone(&process));
        Ok(process)
    }

    pub fn get_system(&self, name: &str) -> Result<Rc<PhaseSystem>> {
        self.systems
            .get(name)
            .cloned()
            .ok_or_else(|| LimarError::phase(format!("Unknown phase system '{name}'")))
    }

    pub fn get_process(&self, name: &str) -> Result<Rc<RefCell<PhasedProcess>>> {
        self.processes
            .get(name)
            .cloned()
            .ok_or_else(|| LimarError::phase(format!("Unknown phased process '{name}'")))
    }
}

impl Module for PhaseModule {
    fn name(&self) -> &'static str {
        "phase"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Add the stage-bound options to a module's argument parser
pub fn configure_stage_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("lower-stage")
                .short('L')
                .long("lower-stage")
                .help(
                    "Run all stages up to the given stage, even if the result is being forwarded",
                ),
        )
        .arg(Arg::new("upper-stage").short('U').long("upper-stage").help(
            "Run no stages after the given stage, even if the result is not being forwarded",
        ))
}

/// Gates the stages of a phased pipeline on the caller's bounds
///
/// A stage runs when its default applies (or the lower bound pulls it in)
/// and the upper bound does not cut it off. Advancing through a stage that
/// runs transitions the underlying process, so out-of-order stage use
/// surfaces as a phase error.
pub struct StageGate {
    process: PhasedProcess,
    lower: Option<String>,
    upper: Option<String>,
}

impl StageGate {
    pub fn new(
        system: Rc<PhaseSystem>,
        lower: Option<String>,
        upper: Option<String>,
    ) -> Result<Self> {
        for bound in [&lower, &upper].into_iter().flatten() {
            if !system.has_phase(bound) {
                return Err(LimarError::phase(format!(
                    "Unknown stage '{bound}' for phase system '{}'",
                    system.name()
                )));
            }
        }

        Ok(Self {
            process: PhasedProcess::new(system),
            lower,
            upper,
        })
    }

    /// From parsed arguments carrying `--lower-stage`/`--upper-stage`
    pub fn from_args(system: Rc<PhaseSystem>, args: &clap::ArgMatches) -> Result<Self> {
        Self::new(
            system,
            args.get_one::<String>("lower-stage").cloned(),
            args.get_one::<String>("upper-stage").cloned(),
        )
    }

    /// Whether the given stage should run; transitions into it when so
    pub fn advance_to(&mut self, stage: &str, default_on: bool) -> Result<bool> {
        let system = self.process.system();

        let within_lower = match &self.lower {
            Some(lower) => system.get_delta(stage, lower)? >= 0,
            None => false,
        };
        let within_upper = match &self.upper {
            Some(upper) => system.get_delta(stage, upper)? >= 0,
            None => true,
        };

        let run = (default_on || within_lower) && within_upper;
        if run {
            self.process.transition_to(stage)?;
        }
        Ok(run)
    }

    pub fn phase(&self) -> &str {
        self.process.phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system() -> Rc<PhaseSystem> {
        Rc::new(PhaseSystem::new(
            "test:stages",
            &["INITIALISE", "GET", "RUN", "RENDER"],
        ))
    }

    #[test]
    fn test_registry_uniqueness() -> anyhow::Result<()> {
        let mut module = PhaseModule::new();
        module.register_system(PhaseSystem::new("sys", &["a", "b"]))?;
        assert!(module
            .register_system(PhaseSystem::new("sys", &["a", "b"]))
            .is_err());

        let sys = module.get_system("sys")?;
        let process =
            PhasedProcess::with_options(Rc::clone(&sys), Some("solo"), None, None, Some(0));
        module.register_process(process)?;
        let process =
            PhasedProcess::with_options(sys, Some("solo"), None, None, Some(0));
        assert!(module.register_process(process).is_err());
        Ok(())
    }

    #[test]
    fn test_gate_defaults() -> anyhow::Result<()> {
        let mut gate = StageGate::new(system(), None, None)?;
        assert!(gate.advance_to("GET", true)?);
        assert!(gate.advance_to("RUN", true)?);
        // Forwarding turns the default off
        assert!(!gate.advance_to("RENDER", false)?);
        assert_eq!(gate.phase(), "RUN");
        Ok(())
    }

    #[test]
    fn test_lower_bound_pulls_stages_in() -> anyhow::Result<()> {
        let mut gate = StageGate::new(system(), Some("RENDER".to_string()), None)?;
        assert!(gate.advance_to("GET", true)?);
        assert!(gate.advance_to("RUN", true)?);
        assert!(gate.advance_to("RENDER", false)?);
        Ok(())
    }

    #[test]
    fn test_upper_bound_cuts_stages_off() -> anyhow::Result<()> {
        let mut gate = StageGate::new(system(), None, Some("GET".to_string()))?;
        assert!(gate.advance_to("GET", true)?);
        assert!(!gate.advance_to("RUN", true)?);
        assert!(!gate.advance_to("RENDER", true)?);
        assert_eq!(gate.phase(), "GET");
        Ok(())
    }

    #[test]
    fn test_unknown_bound_fails() {
        assert!(StageGate::new(system(), Some("NOPE".to_string()), None).is_err());
    }
}
