//! Host principal provisioning
//!
//! The controller and VM run under a dedicated unprivileged account whose
//! home is the working directory. Creation is check-then-create and
//! idempotent; a pre-existing record with a different numeric id aborts and
//! is never auto-reconciled, since silently adopting a foreign id would hand
//! the key material to whoever owns it.

use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use std::process::Command;
use tracing::{debug, info};

/// Desired account records for the controller.
#[derive(Debug, Clone)]
pub struct PrincipalSpec {
    /// Account name.
    pub user: String,
    /// Primary group name.
    pub group: String,
    /// Numeric user id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
    /// Home directory (the working directory).
    pub home: Utf8PathBuf,
}

/// Decision for one directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    /// No record exists; create it.
    Create,
    /// A record exists with the wanted id; leave it alone.
    AlreadyPresent,
}

/// Decide what to do about an existing record, if any.
///
/// The only failure mode is an id mismatch, which is fatal: the existing
/// record is left unmodified and provisioning aborts.
pub fn reconcile(kind: &str, name: &str, existing: Option<u32>, wanted: u32) -> Result<RecordAction> {
    match existing {
        None => Ok(RecordAction::Create),
        Some(id) if id == wanted => Ok(RecordAction::AlreadyPresent),
        Some(id) => Err(eyre!(
            "{kind} '{name}' already exists with id {id}, wanted {wanted}; refusing to modify it"
        )),
    }
}

/// Look up a record id via getent(1). Absent records map to `None`.
fn getent_id(database: &str, name: &str, field: usize) -> Result<Option<u32>> {
    let output = Command::new("getent")
        .args([database, name])
        .output()
        .with_context(|| format!("Failed to run getent {database}"))?;

    // getent exits 2 when the key is not present
    if output.status.code() == Some(2) {
        return Ok(None);
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("getent {database} {name} failed: {}", stderr));
    }

    let line = String::from_utf8(output.stdout)?;
    let id = line
        .trim()
        .split(':')
        .nth(field)
        .ok_or_else(|| eyre!("Malformed getent output for {name}: {line}"))?
        .parse::<u32>()
        .with_context(|| format!("Parsing id from getent output: {line}"))?;
    Ok(Some(id))
}

/// Make sure the group and user records exist with the wanted ids.
pub fn ensure_principal(spec: &PrincipalSpec) -> Result<()> {
    match reconcile("group", &spec.group, getent_id("group", &spec.group, 2)?, spec.gid)? {
        RecordAction::AlreadyPresent => {
            debug!("Group '{}' already present with gid {}", spec.group, spec.gid);
        }
        RecordAction::Create => {
            info!("Creating group '{}' (gid {})", spec.group, spec.gid);
            run_checked(Command::new("groupadd").args([
                "-g",
                &spec.gid.to_string(),
                &spec.group,
            ]))?;
        }
    }

    match reconcile("user", &spec.user, getent_id("passwd", &spec.user, 2)?, spec.uid)? {
        RecordAction::AlreadyPresent => {
            debug!("User '{}' already present with uid {}", spec.user, spec.uid);
        }
        RecordAction::Create => {
            info!("Creating user '{}' (uid {})", spec.user, spec.uid);
            run_checked(Command::new("useradd").args([
                "-r",
                "-u",
                &spec.uid.to_string(),
                "-g",
                &spec.group,
                "-d",
                spec.home.as_str(),
                "-M",
                "-s",
                "/usr/sbin/nologin",
                &spec.user,
            ]))?;
        }
    }

    Ok(())
}

fn run_checked(cmd: &mut Command) -> Result<()> {
    let output = cmd.output().context("Failed to spawn command")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("{:?} failed: {}", cmd.get_program(), stderr));
    }
    Ok(())
}
