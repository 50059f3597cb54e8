//! Host-side provisioning
//!
//! One-time setup on the host: the dedicated account, the working
//! directory, the supervisor service unit that keeps the controller
//! restarting, and the registration descriptor for the build coordinator.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;
use std::fs;
use tracing::info;

use crate::config::VmOpts;
use crate::principal::{self, PrincipalSpec};
use crate::registration::{self, BuildRegistration};
use crate::store::StateDir;
use crate::units;

/// Options for the `provision` command.
#[derive(Debug, Parser)]
pub struct ProvisionOpts {
    /// Instance options
    #[clap(flatten)]
    pub vm: VmOpts,

    /// Account the supervised controller runs as
    #[clap(long, default_value = "buildvm")]
    pub user: String,

    /// Primary group of the account
    #[clap(long, default_value = "buildvm")]
    pub group: String,

    /// Numeric user id for the account
    #[clap(long, default_value_t = 350)]
    pub uid: u32,

    /// Numeric group id for the account
    #[clap(long, default_value_t = 350)]
    pub gid: u32,

    /// Directory the supervisor unit is written into
    #[clap(long, default_value = "/etc/systemd/system")]
    pub unit_dir: Utf8PathBuf,

    /// Extra KEY=VALUE environment entries for the supervised process
    #[clap(long = "env", value_name = "KEY=VALUE")]
    pub environment: Vec<String>,

    /// Platform identifiers advertised to the build coordinator
    #[clap(long = "system", default_value = "x86_64-linux")]
    pub systems: Vec<String>,
}

impl ProvisionOpts {
    /// Command line the supervisor re-invokes on every restart.
    fn supervised_command(&self) -> Result<Vec<String>> {
        let self_exe = std::env::current_exe().context("Resolving current executable")?;
        let self_exe = self_exe
            .to_str()
            .ok_or_else(|| color_eyre::eyre::eyre!("Executable path is not UTF-8"))?;

        let mut cmd = vec![
            self_exe.to_string(),
            "run".to_string(),
            "--name".to_string(),
            self.vm.name.clone(),
            "--image".to_string(),
            self.vm.image.to_string(),
            "--cpus".to_string(),
            self.vm.cpus.to_string(),
            "--memory".to_string(),
            self.vm.memory.clone(),
            "--ssh-port".to_string(),
            self.vm.ssh_port.to_string(),
            "--state-dir".to_string(),
            self.vm.state_dir.to_string(),
            "--engine".to_string(),
            self.vm.engine.clone(),
        ];
        if self.vm.emulation {
            cmd.push("--emulation".to_string());
        }
        if self.vm.debug {
            cmd.push("--debug".to_string());
        }
        Ok(cmd)
    }
}

/// Execute the provision command.
pub fn run(opts: ProvisionOpts) -> Result<()> {
    let store = StateDir::new(opts.vm.state_dir.clone());
    store.ensure_layout()?;

    principal::ensure_principal(&PrincipalSpec {
        user: opts.user.clone(),
        group: opts.group.clone(),
        uid: opts.uid,
        gid: opts.gid,
        home: opts.vm.state_dir.clone(),
    })?;

    let unit = units::supervisor_unit(
        &opts.vm.name,
        &opts.supervised_command()?,
        store.root(),
        &opts.user,
        &opts.environment,
    )?;
    fs::create_dir_all(&opts.unit_dir)?;
    let unit_path = opts.unit_dir.join(format!("buildvm-{}.service", opts.vm.name));
    fs::write(&unit_path, unit).with_context(|| format!("Writing {unit_path}"))?;
    info!("Wrote supervisor unit to {unit_path}");

    let registration =
        BuildRegistration::for_instance(&opts.vm.name, opts.vm.cpus, opts.systems.clone());
    registration::write(&store, &registration)?;

    println!("Provisioned '{}':", opts.vm.name);
    println!("  Working directory: {}", store.root());
    println!("  Supervisor unit:   {unit_path}");
    println!("  Registration:      {}", store.registration());
    Ok(())
}
