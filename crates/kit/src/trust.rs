//! Trust store and client configuration emission
//!
//! The known-hosts entry for the instance alias is written before the VM is
//! ever defined, so no connection is attempted against an unauthenticated
//! identity. The client stanza pins strict host-key checking against that
//! entry.

use color_eyre::Result;
use std::fs;
use tracing::debug;

use crate::store::StateDir;

/// Remote account the client stanza authenticates as.
pub const SSH_USER: &str = "root";

/// Loopback hostname the forwarded port is reached through.
pub const SSH_HOSTNAME: &str = "127.0.0.1";

/// Format one known-hosts line binding `alias` to the host public key.
///
/// The host-key alias in the client stanza makes the lookup key the alias
/// rather than the loopback address, so several instances can share the
/// loopback hostname on different ports.
pub fn known_hosts_line(alias: &str, host_pubkey: &str) -> String {
    format!("{} {}\n", alias, host_pubkey.trim())
}

/// Record the expected host public key for `alias` in the trust store.
///
/// Any previous entry for the same alias is dropped first; bootstrap only
/// runs while the VM is absent, so an older binding is dead by definition.
pub fn write_trust_entry(store: &StateDir, alias: &str, host_pubkey: &str) -> Result<()> {
    let path = store.known_hosts();

    let mut contents = match fs::read_to_string(&path) {
        Ok(existing) => existing
            .lines()
            .filter(|line| line.split_whitespace().next() != Some(alias))
            .map(|line| format!("{line}\n"))
            .collect::<String>(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    contents.push_str(&known_hosts_line(alias, host_pubkey));

    store.atomic_write(&path, contents)?;
    debug!("Recorded host key for '{alias}' in {path}");
    Ok(())
}

/// Render the client connection stanza for `alias`.
pub fn client_stanza(store: &StateDir, alias: &str, ssh_port: u16) -> String {
    indoc::formatdoc! {"
        Host {alias}
          GlobalKnownHostsFile {known_hosts}
          Hostname {hostname}
          HostKeyAlias {alias}
          Port {ssh_port}
          StrictHostKeyChecking yes
          User {user}
          IdentityFile {identity}
        ",
        known_hosts = store.known_hosts(),
        hostname = SSH_HOSTNAME,
        user = SSH_USER,
        identity = store.user_key(),
    }
}

/// Write the client configuration for `alias` atomically.
pub fn write_client_config(store: &StateDir, alias: &str, ssh_port: u16) -> Result<()> {
    let path = store.ssh_config();
    store.atomic_write(&path, client_stanza(store, alias, ssh_port))?;
    debug!("Wrote client configuration for '{alias}' to {path}");
    Ok(())
}
