//! First-boot trust bootstrap
//!
//! Runs exactly once per VM lifetime, while the instance is still absent:
//! generates both identity keypairs, stages the channel, and records the
//! host identity in the trust store. The trust-store write happens here,
//! before the caller defines the VM, so there is no window in which a
//! connection could be attempted against an unauthenticated identity.

use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::{debug, info};

use crate::channel;
use crate::keys;
use crate::store::StateDir;
use crate::trust;

/// Generate credentials and trust state for `alias`.
///
/// Caller contract: the VM named `alias` is not defined. Key material left
/// behind by an earlier failed bootstrap is regenerated wholesale.
pub fn run(store: &StateDir, alias: &str, ssh_port: u16) -> Result<()> {
    store.ensure_layout()?;

    info!("Generating identity keypairs for '{alias}'");
    let host = keys::generate_ssh_keypair(
        &store.keys_dir(),
        "host_ed25519",
        &format!("host-identity@{alias}"),
    )
    .context("Generating host identity")?;
    let user = keys::generate_ssh_keypair(
        &store.keys_dir(),
        "user_ed25519",
        &format!("user-identity@{alias}"),
    )
    .context("Generating user identity")?;
    debug!("User identity private key stays at {}", user.private_key_path);

    channel::populate(store)?;

    // Trust before first contact: the alias is authenticated from the very
    // first connection attempt.
    let host_pubkey = keys::read_public_key(&host.public_key_path)?;
    trust::write_trust_entry(store, alias, &host_pubkey)?;
    trust::write_client_config(store, alias, ssh_port)?;

    info!("Bootstrap complete for '{alias}'");
    Ok(())
}
