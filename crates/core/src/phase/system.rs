//! Phase system definitions

use crate::errors::{LimarError, Result};
use std::collections::{BTreeSet, HashMap};

/// The rules of how a defined set of phases relate to one another and the
/// allowed transitions between them.
///
/// A linear system orders its phases as a sequence and allows single forward
/// steps; explicit jumps extend the allowed transitions beyond `+1`, and are
/// the only transitions of a non-linear system.
#[derive(Debug, Clone)]
pub struct PhaseSystem {
    name: String,
    phases: Vec<String>,
    jumps: HashMap<String, BTreeSet<String>>,
    linear: bool,
    initial: String,
    completed: Option<String>,
}

impl PhaseSystem {
    /// Create a linear phase system over the given phases
    ///
    /// The initial phase defaults to the first phase; there is no completion
    /// phase unless one is set with [`PhaseSystem::with_completed`].
    pub fn new(name: impl Into<String>, phases: &[&str]) -> Self {
        assert!(!phases.is_empty(), "a phase system needs at least one phase");
        Self {
            name: name.into(),
            phases: phases.iter().map(|p| p.to_string()).collect(),
            jumps: HashMap::new(),
            linear: true,
            initial: phases[0].to_string(),
            completed: None,
        }
    }

    /// Allow a non-linear jump from one phase to another
    pub fn with_jump(mut self, from: &str, to: &str) -> Self {
        self.jumps
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self
    }

    /// Mark the system non-linear: only explicit jumps are allowed, and
    /// delta-based queries fail
    pub fn non_linear(mut self) -> Self {
        self.linear = false;
        self
    }

    pub fn with_initial(mut self, phase: &str) -> Self {
        self.initial = phase.to_string();
        self
    }

    pub fn with_completed(mut self, phase: &str) -> Self {
        self.completed = Some(phase.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    pub fn is_linear(&self) -> bool {
        self.linear
    }

    pub fn initial_phase(&self) -> &str {
        &self.initial
    }

    pub fn completed_phase(&self) -> Option<&str> {
        self.completed.as_deref()
    }

    pub fn has_phase(&self, phase: &str) -> bool {
        self.phases.iter().any(|p| p == phase)
    }

    fn index_of(&self, phase: &str) -> Result<usize> {
        self.phases
            .iter()
            .position(|p| p == phase)
            .ok_or_else(|| {
                LimarError::phase(format!(
                    "Phase '{phase}' is not a phase of phase system '{}'",
                    self.name
                ))
            })
    }

    /// The signed number of steps needed to get from one phase to another
    ///
    /// Fails if the system is not linear.
    pub fn get_delta(&self, from: &str, to: &str) -> Result<isize> {
        if !self.linear {
            return Err(LimarError::phase(format!(
                "Cannot get delta from phase '{from}' to phase '{to}': phase system '{}' is not linear",
                self.name
            )));
        }

        Ok(self.index_of(to)? as isize - self.index_of(from)? as isize)
    }

    /// The phase reached by making the given signed number of steps
    ///
    /// Fails if the system is not linear or the step lands out of range.
    pub fn apply_delta(&self, from: &str, delta: isize) -> Result<&str> {
        if !self.linear {
            return Err(LimarError::phase(format!(
                "Cannot apply delta ({delta:+}) to phase '{from}': phase system '{}' is not linear",
                self.name
            )));
        }

        let target = self.index_of(from)? as isize + delta;
        usize::try_from(target)
            .ok()
            .and_then(|i| self.phases.get(i))
            .map(String::as_str)
            .ok_or_else(|| {
                LimarError::phase(format!(
                    "Applying delta ({delta:+}) to phase '{from}' leaves phase system '{}'",
                    self.name
                ))
            })
    }

    /// Whether a direct transition between two phases is allowed
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        let linear_step = self.linear
            && matches!(self.get_delta(from, to), Ok(1));
        let jump = self
            .jumps
            .get(from)
            .is_some_and(|targets| targets.contains(to));

        linear_step || jump
    }
}
