//! Status reporting for the managed instance
//!
//! Reports the facts the restart loop itself decides on: whether the
//! instance is defined, and which credential artifacts are present in the
//! working directory. Supports human-readable and JSON output.

use clap::Parser;
use color_eyre::Result;
use comfy_table::Table;
use serde::Serialize;

use crate::config::VmOpts;
use crate::controller::VmState;
use crate::engine::{CommandEngine, Engine};
use crate::store::StateDir;

/// Options for the `status` command.
#[derive(Debug, Parser)]
pub struct StatusOpts {
    /// Instance options
    #[clap(flatten)]
    pub vm: VmOpts,

    /// Output format (JSON instead of a table)
    #[clap(long)]
    pub json: bool,
}

/// Presence of the host-side credential artifacts.
#[derive(Debug, Serialize)]
struct CredentialStatus {
    host_key: bool,
    user_key: bool,
    known_hosts: bool,
    ssh_config: bool,
    channel_staged: bool,
}

/// Snapshot of the observable instance state.
#[derive(Debug, Serialize)]
struct InstanceStatus {
    name: String,
    state: String,
    credentials: CredentialStatus,
}

fn collect(opts: &StatusOpts) -> Result<InstanceStatus> {
    let store = StateDir::new(opts.vm.state_dir.clone());
    let engine = CommandEngine::new(opts.vm.engine.clone());

    let instances = engine.list_instances()?;
    // A running instance holds its controller's foreground; from the
    // outside "defined" is all this view can assert.
    let state = if instances.iter().any(|n| n == &opts.vm.name) {
        VmState::Stopped
    } else {
        VmState::NotDefined
    };

    Ok(InstanceStatus {
        name: opts.vm.name.clone(),
        state: state.to_string(),
        credentials: CredentialStatus {
            host_key: store.host_key().exists(),
            user_key: store.user_key().exists(),
            known_hosts: store.known_hosts().exists(),
            ssh_config: store.ssh_config().exists(),
            channel_staged: store.channel_dir().exists(),
        },
    })
}

/// Execute the status command.
pub fn run(opts: StatusOpts) -> Result<()> {
    let status = collect(&opts)?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["PROPERTY", "VALUE"]);
    table.add_row(vec!["Name", status.name.as_str()]);
    table.add_row(vec!["State", status.state.as_str()]);
    table.add_row(vec![
        "Host key",
        if status.credentials.host_key { "present" } else { "missing" },
    ]);
    table.add_row(vec![
        "User key",
        if status.credentials.user_key { "present" } else { "missing" },
    ]);
    table.add_row(vec![
        "Trust store",
        if status.credentials.known_hosts { "present" } else { "missing" },
    ]);
    table.add_row(vec![
        "Client config",
        if status.credentials.ssh_config { "present" } else { "missing" },
    ]);
    table.add_row(vec![
        "Channel staging",
        if status.credentials.channel_staged { "present" } else { "absent" },
    ]);
    println!("{table}");

    Ok(())
}
