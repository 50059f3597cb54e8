//! Host side of the credential transfer channel
//!
//! The channel is a staging directory shared read-only into the guest for a
//! single bootstrap cycle. It holds exactly two files: the host identity
//! private key and the user identity public key. The guest installer
//! consumes both and tears its mount down; the staging directory itself
//! stays referenced by the immutable VM definition as the mount source.

use camino::Utf8PathBuf;
use color_eyre::{eyre::eyre, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use tracing::debug;

use crate::store::StateDir;

/// Guest-visible tag the channel is mounted by. The descriptor builder and
/// the guest installer both reference this name; nothing depends on the
/// channel's position in the mount list.
pub const CHANNEL_TAG: &str = "credentials";

/// File name of the host identity private key inside the channel.
pub const CHANNEL_HOST_KEY: &str = "host_ed25519";

/// File name of the user identity public key inside the channel.
pub const CHANNEL_USER_PUBKEY: &str = "user_ed25519.pub";

/// Stage the channel contents from freshly generated key material.
///
/// Recreates the staging directory from scratch so a partially populated
/// channel from an earlier failed bootstrap cannot leak through.
pub fn populate(store: &StateDir) -> Result<Utf8PathBuf> {
    let dir = store.channel_dir();

    if dir.exists() {
        debug!("Removing stale channel staging at {dir}");
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;

    let host_key = store.host_key();
    if !host_key.exists() {
        return Err(eyre!("Host identity key missing at {host_key}"));
    }
    let user_pubkey = store.user_pubkey();
    if !user_pubkey.exists() {
        return Err(eyre!("User identity public key missing at {user_pubkey}"));
    }

    let staged_key = dir.join(CHANNEL_HOST_KEY);
    fs::copy(&host_key, &staged_key)?;
    fs::set_permissions(&staged_key, fs::Permissions::from_mode(0o600))?;

    let staged_pubkey = dir.join(CHANNEL_USER_PUBKEY);
    fs::copy(&user_pubkey, &staged_pubkey)?;
    fs::set_permissions(&staged_pubkey, fs::Permissions::from_mode(0o644))?;

    debug!("Staged credential channel at {dir}");
    Ok(dir)
}
