//! Host-side working directory layout
//!
//! All host state lives under one fixed working directory: identity keys, the
//! trust store, the emitted client configuration and the channel staging
//! subdirectory. Lifecycle logic never touches paths directly; it goes
//! through this layout so tests can root everything in a temporary
//! directory.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::{cap_std, cap_std::fs::Dir, dirext::CapStdExtDirExt};
use color_eyre::{eyre::eyre, Result};

/// Subdirectory holding the generated identity keypairs.
const KEYS_SUBDIR: &str = "keys";
/// Subdirectory staged as the guest-visible transfer channel.
const CHANNEL_SUBDIR: &str = "channel";

/// Path-addressed store rooted at the working directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: Utf8PathBuf,
}

impl StateDir {
    /// Create a store rooted at `root`. Nothing is created on disk yet.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The working directory itself.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Private key of the user identity; never leaves the host.
    pub fn user_key(&self) -> Utf8PathBuf {
        self.root.join(KEYS_SUBDIR).join("user_ed25519")
    }

    /// Public half of the user identity.
    pub fn user_pubkey(&self) -> Utf8PathBuf {
        self.root.join(KEYS_SUBDIR).join("user_ed25519.pub")
    }

    /// Staged private key of the host identity, copied into the channel.
    pub fn host_key(&self) -> Utf8PathBuf {
        self.root.join(KEYS_SUBDIR).join("host_ed25519")
    }

    /// Public half of the host identity, recorded in the trust store.
    pub fn host_pubkey(&self) -> Utf8PathBuf {
        self.root.join(KEYS_SUBDIR).join("host_ed25519.pub")
    }

    /// Directory the keypairs are generated into.
    pub fn keys_dir(&self) -> Utf8PathBuf {
        self.root.join(KEYS_SUBDIR)
    }

    /// Global known-hosts file mapping alias to expected host public key.
    pub fn known_hosts(&self) -> Utf8PathBuf {
        self.root.join("known_hosts")
    }

    /// Emitted SSH client configuration stanza.
    pub fn ssh_config(&self) -> Utf8PathBuf {
        self.root.join("ssh_config")
    }

    /// Channel staging subdirectory; the engine exposes this to the guest.
    pub fn channel_dir(&self) -> Utf8PathBuf {
        self.root.join(CHANNEL_SUBDIR)
    }

    /// Emitted build-farm registration descriptor.
    pub fn registration(&self) -> Utf8PathBuf {
        self.root.join("registration.json")
    }

    /// Create the directory skeleton (idempotent).
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.keys_dir())?;
        Ok(())
    }

    /// Write a file under the working directory atomically.
    pub fn atomic_write(&self, path: &Utf8Path, contents: impl AsRef<[u8]>) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| eyre!("No parent directory for {path}"))?;
        let filename = path
            .file_name()
            .ok_or_else(|| eyre!("No file name in {path}"))?;

        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())?;
        dir.atomic_write(filename, contents.as_ref())?;

        Ok(())
    }
}
