//! Live phased processes

use super::system::PhaseSystem;
use crate::errors::{LimarError, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const DEFAULT_ID_LENGTH: usize = 8;

/// Tracks the current phase of one process and allows inspection and
/// mutation of that phase according to the rules of its [`PhaseSystem`].
///
/// Process names take a random hex suffix (configurable length, default 8)
/// so that several instances of the same process type can be registered side
/// by side; an id length of 0 pins the name, enforcing a single instance of
/// processes registered under it.
///
/// A subprocess may be registered against a phase; transitions out of that
/// phase are then gated on the subprocess being complete.
pub struct PhasedProcess {
    system: Rc<PhaseSystem>,
    name: String,
    current: String,
    completed: Option<String>,
    subprocesses: HashMap<String, Rc<RefCell<PhasedProcess>>>,
}

impl PhasedProcess {
    pub fn new(system: Rc<PhaseSystem>) -> Self {
        Self::with_options(system, None, None, None, None)
    }

    pub fn with_options(
        system: Rc<PhaseSystem>,
        name: Option<&str>,
        initial_phase: Option<&str>,
        completed_phase: Option<&str>,
        id_length: Option<usize>,
    ) -> Self {
        let base = name.unwrap_or_else(|| system.name()).to_string();
        let id_length = id_length.unwrap_or(DEFAULT_ID_LENGTH);
        let id: String = (0..id_length)
            .map(|_| char::from_digit(fastrand::u32(0..16), 16).unwrap_or('0'))
            .collect();

        let current = initial_phase
            .unwrap_or_else(|| system.initial_phase())
            .to_string();
        let completed = completed_phase
            .map(str::to_string)
            .or_else(|| system.completed_phase().map(str::to_string));

        Self {
            name: format!("{base}({id})"),
            system,
            current,
            completed,
            subprocesses: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system(&self) -> &PhaseSystem {
        &self.system
    }

    pub fn phase(&self) -> &str {
        &self.current
    }

    // Queries
    // --------------------

    pub fn is_before(&self, phase: &str) -> Result<bool> {
        Ok(self.system.get_delta(&self.current, phase)? > 0)
    }

    pub fn is_at_or_before(&self, phase: &str) -> Result<bool> {
        Ok(self.system.get_delta(&self.current, phase)? >= 0)
    }

    pub fn is_at(&self, phase: &str) -> bool {
        self.current == phase
    }

    pub fn is_at_or_after(&self, phase: &str) -> Result<bool> {
        Ok(self.system.get_delta(&self.current, phase)? <= 0)
    }

    pub fn is_after(&self, phase: &str) -> Result<bool> {
        Ok(self.system.get_delta(&self.current, phase)? < 0)
    }

    pub fn is_in_any_of<'a, I: IntoIterator<Item = &'a str>>(&self, phases: I) -> bool {
        phases.into_iter().any(|p| p == self.current)
    }

    /// Whether this process counts as complete
    ///
    /// A process with no completion phase is always complete (it cannot block
    /// anything); otherwise it is complete at its completion phase.
    pub fn is_complete(&self) -> bool {
        match &self.completed {
            None => true,
            Some(completed) => self.current == *completed,
        }
    }

    // Mutators
    // --------------------

    /// Move to the given phase
    ///
    /// Fails if the phase system does not allow the transition, or if an
    /// incomplete subprocess is registered against the current phase.
    pub fn transition_to(&mut self, phase: &str) -> Result<()> {
        if !self.system.can_transition(&self.current, phase) {
            return Err(LimarError::phase(format!(
                "Phased process '{}' cannot transition from '{}' to '{phase}': transition not allowed by phase system '{}'",
                self.name,
                self.current,
                self.system.name()
            )));
        }

        if let Some(subprocess) = self.subprocesses.get(&self.current) {
            let subprocess = subprocess.borrow();
            if !subprocess.is_complete() {
                return Err(LimarError::phase(format!(
                    "Phased process '{}' cannot transition from '{}' to '{phase}': subprocess '{}' not yet complete",
                    self.name,
                    self.current,
                    subprocess.name()
                )));
            }
        }

        self.current = phase.to_string();
        Ok(())
    }

    pub fn transition_to_next(&mut self) -> Result<()> {
        let next = self.system.apply_delta(&self.current, 1)?.to_string();
        self.transition_to(&next)
    }

    pub fn transition_to_complete(&mut self) -> Result<()> {
        let completed = self.completed.clone().ok_or_else(|| {
            LimarError::phase(format!(
                "Phased process '{}' does not have a completion phase to transition to",
                self.name
            ))
        })?;
        self.transition_to(&completed)
    }

    // Subprocesses
    // --------------------

    /// Register a subprocess against a phase; one subprocess per phase
    pub fn start_subprocess(
        &mut self,
        phase: &str,
        process: Rc<RefCell<PhasedProcess>>,
    ) -> Result<()> {
        if let Some(existing) = self.subprocesses.get(phase) {
            return Err(LimarError::phase(format!(
                "Phase '{phase}' already has registered subprocess '{}'; cannot register another",
                existing.borrow().name()
            )));
        }

        self.subprocesses.insert(phase.to_string(), process);
        Ok(())
    }

    /// Remove the subprocess registered against a phase
    ///
    /// Fails when the subprocess is incomplete, unless `force` is given.
    pub fn stop_subprocess(&mut self, phase: &str, force: bool) -> Result<()> {
        let subprocess = self.subprocesses.get(phase).ok_or_else(|| {
            LimarError::phase(format!(
                "Cannot stop subprocess for phase '{phase}': no subprocess was started for it"
            ))
        })?;

        if !force && !subprocess.borrow().is_complete() {
            return Err(LimarError::phase(format!(
                "Cannot stop subprocess '{}' started for phase '{phase}': it is not complete",
                subprocess.borrow().name()
            )));
        }

        self.subprocesses.remove(phase);
        Ok(())
    }

    pub fn subprocess_for(&self, phase: &str) -> Option<Rc<RefCell<PhasedProcess>>> {
        self.subprocesses.get(phase).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system() -> Rc<PhaseSystem> {
        Rc::new(
            PhaseSystem::new("test:proc", &["init", "run", "done"]).with_completed("done"),
        )
    }

    #[test]
    fn test_starts_at_initial_phase() {
        let process = PhasedProcess::new(system());
        assert_eq!(process.phase(), "init");
        assert!(!process.is_complete());
    }

    #[test]
    fn test_linear_walk_to_completion() -> anyhow::Result<()> {
        let mut process = PhasedProcess::new(system());
        process.transition_to_next()?;
        assert_eq!(process.phase(), "run");
        process.transition_to("done")?;
        assert!(process.is_complete());
        Ok(())
    }

    #[test]
    fn test_illegal_transition_fails() {
        let mut process = PhasedProcess::new(system());
        assert!(process.transition_to("done").is_err());
        assert_eq!(process.phase(), "init");
    }

    #[test]
    fn test_comparators() -> anyhow::Result<()> {
        let mut process = PhasedProcess::new(system());
        process.transition_to("run")?;

        assert!(process.is_at("run"));
        assert!(process.is_before("done")?);
        assert!(process.is_after("init")?);
        assert!(process.is_at_or_before("run")?);
        assert!(process.is_at_or_after("run")?);
        assert!(process.is_in_any_of(["init", "run"]));
        assert!(!process.is_in_any_of(["init", "done"]));
        Ok(())
    }

    #[test]
    fn test_incomplete_subprocess_blocks_transition() -> anyhow::Result<()> {
        let mut outer = PhasedProcess::new(system());
        let inner = Rc::new(RefCell::new(PhasedProcess::new(system())));
        outer.start_subprocess("init", Rc::clone(&inner))?;

        assert!(outer.transition_to("run").is_err());

        inner.borrow_mut().transition_to("run")?;
        inner.borrow_mut().transition_to("done")?;
        outer.transition_to("run")?;
        assert_eq!(outer.phase(), "run");
        Ok(())
    }

    #[test]
    fn test_duplicate_subprocess_registration_fails() -> anyhow::Result<()> {
        let mut outer = PhasedProcess::new(system());
        let inner = Rc::new(RefCell::new(PhasedProcess::new(system())));
        outer.start_subprocess("init", Rc::clone(&inner))?;
        assert!(outer.start_subprocess("init", inner).is_err());
        Ok(())
    }

    #[test]
    fn test_stop_subprocess_requires_completion_unless_forced() -> anyhow::Result<()> {
        let mut outer = PhasedProcess::new(system());
        let inner = Rc::new(RefCell::new(PhasedProcess::new(system())));
        outer.start_subprocess("init", inner)?;

        assert!(outer.stop_subprocess("init", false).is_err());
        outer.stop_subprocess("init", true)?;
        assert!(outer.subprocess_for("init").is_none());
        Ok(())
    }

    #[test]
    fn test_names_are_deduplicated() {
        let a = PhasedProcess::new(system());
        let b = PhasedProcess::new(system());
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_zero_id_length_pins_name() {
        let process =
            PhasedProcess::with_options(system(), Some("solo"), None, None, Some(0));
        assert_eq!(process.name(), "solo()");
    }
}
