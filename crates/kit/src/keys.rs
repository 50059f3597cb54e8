//! Identity keypair generation
//!
//! Both identities are generated together during bootstrap: the host
//! identity the VM proves itself with, and the user identity the client
//! authorizes with. Generation runs only while the VM is absent, so
//! replacing a stale pair from an earlier failed bootstrap is safe.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::eyre, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;
use tracing::debug;

/// Represents an SSH keypair with file paths
#[derive(Debug, Clone)]
pub struct SshKeyPair {
    /// Path to the private key file
    pub private_key_path: Utf8PathBuf,
    /// Path to the public key file (private_key_path + ".pub")
    pub public_key_path: Utf8PathBuf,
}

/// Generate a new ed25519 SSH keypair in the specified directory
///
/// Uses the system's `ssh-keygen` with no passphrase to enable automated
/// use; the private key ends up with 0600 permissions. An existing pair
/// under the same name is replaced.
pub fn generate_ssh_keypair(
    output_dir: &Utf8Path,
    key_name: &str,
    comment: &str,
) -> Result<SshKeyPair> {
    fs::create_dir_all(output_dir)?;

    let private_key_path = output_dir.join(key_name);
    let public_key_path = output_dir.join(format!("{}.pub", key_name));

    // ssh-keygen refuses to overwrite; a leftover pair from a failed
    // bootstrap is replaced wholesale.
    for stale in [&private_key_path, &public_key_path] {
        if stale.exists() {
            debug!("Removing stale key material at {stale}");
            fs::remove_file(stale)?;
        }
    }

    debug!("Generating SSH keypair at {private_key_path}");

    let output = Command::new("ssh-keygen")
        .args([
            "-t",
            "ed25519",
            "-f",
            private_key_path.as_str(),
            "-N",
            "", // No passphrase
            "-C",
            comment,
        ])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("ssh-keygen failed: {}", stderr));
    }

    // Set secure permissions on private key
    let metadata = fs::metadata(&private_key_path)?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(0o600); // Read/write for owner only
    fs::set_permissions(&private_key_path, permissions)?;

    debug!("Generated SSH keypair successfully");

    Ok(SshKeyPair {
        private_key_path,
        public_key_path,
    })
}

/// Read a public key file as a single trimmed line.
pub fn read_public_key(path: &Utf8Path) -> Result<String> {
    let contents = fs::read_to_string(path)?;
    let line = contents.trim();
    if line.is_empty() {
        return Err(eyre!("Public key file {path} is empty"));
    }
    Ok(line.to_string())
}

/// Whether `ssh-keygen` can be spawned at all; used to skip tests on
/// hosts without an OpenSSH client installation.
#[cfg(test)]
pub(crate) fn ssh_keygen_available() -> bool {
    Command::new("ssh-keygen")
        .arg("-?")
        .output()
        .is_ok()
}
