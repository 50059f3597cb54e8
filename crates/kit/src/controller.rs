//! VM lifecycle controller
//!
//! Drives the instance through its whole lifecycle:
//!
//! ```text
//! NotDefined --ensure_defined (bootstrap + define)--> Stopped
//!     --run()--> Running --(any exit)--> Stopped
//! ```
//!
//! The controller is single-threaded and blocks for the VM's entire
//! lifetime during `run()`. Recovery is delegated entirely to the external
//! restart loop, which re-enters `ensure_defined()` and re-derives all
//! state from observable facts.

use clap::Parser;
use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::bootstrap;
use crate::config::{self, VmOpts, VmParams};
use crate::engine::{CommandEngine, DefineOutcome, Engine};
use crate::store::StateDir;

/// Lifecycle states of the managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum VmState {
    /// The engine has no definition under the instance name.
    NotDefined,
    /// Defined but not running.
    Stopped,
    /// Running in the foreground under this controller.
    Running,
}

/// Result of `ensure_defined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// The instance already existed; nothing was touched.
    AlreadyDefined,
    /// Bootstrap ran and the instance was created.
    Created,
}

/// Options for the `run` command.
#[derive(Debug, Parser)]
pub struct RunOpts {
    /// Instance options
    #[clap(flatten)]
    pub vm: VmOpts,
}

/// Options for the `ensure` command.
#[derive(Debug, Parser)]
pub struct EnsureOpts {
    /// Instance options
    #[clap(flatten)]
    pub vm: VmOpts,
}

/// Lifecycle controller bound to one engine, store and parameter set.
#[derive(Debug)]
pub struct Controller<'a, E: Engine> {
    engine: &'a E,
    store: &'a StateDir,
    params: VmParams,
}

impl<'a, E: Engine> Controller<'a, E> {
    /// Create a controller for one instance.
    pub fn new(engine: &'a E, store: &'a StateDir, params: VmParams) -> Self {
        Self {
            engine,
            store,
            params,
        }
    }

    /// Make sure the instance exists, bootstrapping credentials if needed.
    ///
    /// The existence check and the define are not atomic. At most one
    /// supervisor per host is assumed; if a concurrent invocation wins the
    /// race anyway, the duplicate define reports "already exists" and is
    /// treated as benign.
    pub fn ensure_defined(&self) -> Result<Ensured> {
        // Listing failure is fatal: never bootstrap on a partial view.
        let instances = self.engine.list_instances()?;

        if instances.iter().any(|n| n == &self.params.name) {
            debug!("Instance '{}' already defined", self.params.name);
            return Ok(Ensured::AlreadyDefined);
        }

        info!("Instance '{}' not defined; bootstrapping", self.params.name);
        bootstrap::run(self.store, &self.params.name, self.params.ssh_port)?;

        let (descriptor, _guest) = config::materialize(&self.params, &self.store.channel_dir())?;
        match self.engine.define(&self.params.name, &descriptor)? {
            DefineOutcome::Created => {
                info!("Instance '{}' created", self.params.name);
            }
            DefineOutcome::AlreadyExists => {
                warn!(
                    "Instance '{}' appeared while bootstrapping; treating as already defined",
                    self.params.name
                );
            }
        }

        Ok(Ensured::Created)
    }

    /// Start the instance in the foreground and block until it exits.
    ///
    /// Shutdown, crash and host sleep all land here; every exit is normal
    /// termination. The external restart loop decides what happens next.
    pub fn run(&self) -> Result<()> {
        info!(
            "Instance '{}' entering {} state",
            self.params.name,
            VmState::Running
        );
        let exit = self.engine.run(&self.params.name)?;
        info!(
            "Instance '{}' exited (code {:?}); {} again, normal termination",
            self.params.name,
            exit.code,
            VmState::Stopped
        );
        Ok(())
    }
}

/// Execute the `run` command: the supervised entrypoint.
pub fn run(opts: RunOpts) -> Result<()> {
    let params = opts.vm.to_params()?;
    let store = StateDir::new(opts.vm.state_dir.clone());
    let engine = CommandEngine::new(opts.vm.engine.clone());

    let controller = Controller::new(&engine, &store, params);
    controller.ensure_defined()?;
    controller.run()
}

/// Execute the `ensure` command.
pub fn ensure(opts: EnsureOpts) -> Result<()> {
    let params = opts.vm.to_params()?;
    let store = StateDir::new(opts.vm.state_dir.clone());
    let engine = CommandEngine::new(opts.vm.engine.clone());

    let controller = Controller::new(&engine, &store, params);
    match controller.ensure_defined()? {
        Ensured::AlreadyDefined => println!("Instance '{}' already defined", opts.vm.name),
        Ensured::Created => println!("Instance '{}' created", opts.vm.name),
    }
    Ok(())
}
