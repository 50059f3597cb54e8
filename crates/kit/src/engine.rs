//! Virtualization engine subprocess wrapper
//!
//! The engine is an external collaborator driven through a small subprocess
//! contract: `list --name` prints newline-separated instance names,
//! `define <config.json> --name <name>` registers an immutable definition,
//! and `run <name>` boots the instance in the foreground and blocks until
//! it exits. Lifecycle logic only sees the [`Engine`] trait so tests can
//! substitute an in-memory implementation.

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use std::io::Write;
use std::process::Command;
use tracing::debug;

use crate::vm::VmDescriptor;

/// Outcome of defining an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefineOutcome {
    /// The definition was newly registered.
    Created,
    /// Another definition with this name already existed. The
    /// existence-check-then-define sequence is not atomic; losing that race
    /// is benign because both racers define identical state.
    AlreadyExists,
}

/// Exit of a foreground instance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmExit {
    /// Process exit code, if the engine exited rather than being signaled.
    pub code: Option<i32>,
}

/// Operations the lifecycle controller needs from a virtualization engine.
pub trait Engine {
    /// List the names of all defined instances. Failure is fatal to the
    /// caller; lifecycle decisions are never made on a partial listing.
    fn list_instances(&self) -> Result<Vec<String>>;

    /// Register an immutable instance definition under `name`.
    fn define(&self, name: &str, descriptor: &VmDescriptor) -> Result<DefineOutcome>;

    /// Boot `name` in the foreground and block until it exits. Any exit,
    /// clean or not, is reported as a [`VmExit`], never as an error.
    fn run(&self, name: &str) -> Result<VmExit>;
}

/// Engine implementation shelling out to an external binary.
#[derive(Debug)]
pub struct CommandEngine {
    program: String,
}

impl CommandEngine {
    /// Wrap the engine binary at `program` (resolved via PATH).
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }
}

impl Engine for CommandEngine {
    fn list_instances(&self) -> Result<Vec<String>> {
        let output = self
            .command()
            .args(["list", "--name"])
            .output()
            .with_context(|| format!("Failed to run '{} list'", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(eyre!("Failed to list instances: {}", stderr));
        }

        let names = String::from_utf8(output.stdout)?
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();

        Ok(names)
    }

    fn define(&self, name: &str, descriptor: &VmDescriptor) -> Result<DefineOutcome> {
        let mut config = tempfile::Builder::new()
            .prefix("buildvm-define-")
            .suffix(".json")
            .tempfile()?;
        config.write_all(serde_json::to_string_pretty(descriptor)?.as_bytes())?;
        config.flush()?;

        let config_path = config
            .path()
            .to_str()
            .ok_or_else(|| eyre!("Invalid temp config path"))?;
        debug!("Defining instance '{name}' from {config_path}");

        let output = self
            .command()
            .args(["define", config_path, "--name", name])
            .output()
            .with_context(|| format!("Failed to run '{} define'", self.program))?;

        if output.status.success() {
            return Ok(DefineOutcome::Created);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            return Ok(DefineOutcome::AlreadyExists);
        }
        Err(eyre!("Failed to define instance '{}': {}", name, stderr))
    }

    fn run(&self, name: &str) -> Result<VmExit> {
        debug!("Starting instance '{name}' in the foreground");

        // Console and errors pass straight through to the supervisor's log
        let status = self
            .command()
            .args(["run", name])
            .status()
            .with_context(|| format!("Failed to run '{} run {}'", self.program, name))?;

        Ok(VmExit {
            code: status.code(),
        })
    }
}
