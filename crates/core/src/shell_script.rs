//! Shell-script sink
//!
//! Accumulates shell commands to be sourced by a wrapper process after LIMAR
//! exits. Producers are responsible for word splitting and escaping; the sink
//! writes lines verbatim.

use crate::errors::{LimarError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ShellScript {
    script_path: PathBuf,
    commands: Vec<String>,
}

impl ShellScript {
    pub fn new<P: AsRef<Path>>(script_path: P) -> Self {
        Self {
            script_path: script_path.as_ref().to_path_buf(),
            commands: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.script_path
    }

    /// Append a ready-to-source command line
    pub fn add(&mut self, command: impl Into<String>) {
        self.commands.push(command.into());
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Write the accumulated commands, one per line, to the script path
    pub fn write(&self) -> Result<()> {
        let mut body = self.commands.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }

        fs::write(&self.script_path, body).map_err(|e| {
            LimarError::config(format!(
                "Cannot write shell script '{}': {e}",
                self.script_path.display()
            ))
        })?;

        debug!(
            path = %self.script_path.display(),
            commands = self.commands.len(),
            "wrote shell script"
        );
        Ok(())
    }
}
