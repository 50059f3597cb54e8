//! SSH access to the managed instance
//!
//! Connections always go through the emitted client configuration, so the
//! host key is checked strictly against the trust store from the very first
//! contact. There is no fallback path that relaxes checking.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::os::unix::process::CommandExt;
use std::process::Command;
use tracing::debug;

use crate::config::DEFAULT_VM_NAME;
use crate::store::StateDir;

/// Options for the `ssh` command.
#[derive(Debug, Parser)]
pub struct SshOpts {
    /// Instance name / SSH alias to connect to
    #[clap(long, default_value = DEFAULT_VM_NAME)]
    pub name: String,

    /// Working directory holding the emitted client configuration
    #[clap(long, default_value = crate::DEFAULT_STATEDIR)]
    pub state_dir: Utf8PathBuf,

    /// Command to execute on the builder
    pub command: Vec<String>,
}

/// Execute the ssh command.
pub fn run(opts: SshOpts) -> Result<()> {
    let store = StateDir::new(opts.state_dir.clone());
    let config = store.ssh_config();
    if !config.exists() {
        return Err(eyre!(
            "No client configuration at {config}; run 'buildvm ensure' first"
        ));
    }

    let mut cmd = Command::new("ssh");
    cmd.args(["-F", config.as_str()]);
    cmd.arg(&opts.name);

    if opts.command.is_empty() {
        // Interactive session: replace this process for a clean terminal
        debug!("Executing interactive SSH session via exec");
        let error = cmd.exec();
        // exec() only returns on error
        return Err(eyre!("Failed to exec SSH command: {}", error));
    }

    cmd.arg("--");
    cmd.args(&opts.command);
    debug!("Executing SSH command: {:?}", cmd);

    let status = cmd.status().map_err(|e| eyre!("Failed to execute SSH: {e}"))?;
    if !status.success() {
        return Err(eyre!(
            "SSH exited with code: {}",
            status.code().unwrap_or(-1)
        ));
    }
    Ok(())
}
