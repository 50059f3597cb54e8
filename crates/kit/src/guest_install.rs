//! Guest-side one-shot credential installer
//!
//! Runs inside the guest on first boot, before the SSH daemon is allowed to
//! start. The whole sequence is gated by one precondition: the
//! authorized-keys file does not exist yet. Every step is individually safe
//! to repeat, and the gate artifact is written last, so a partial failure
//! reopens the gate and the next boot retries the same sequence.
//!
//! The sequence is an explicit state machine with one guard/action per
//! transition:
//!
//! ```text
//! ChannelAbsent --mount--> ChannelMounted --install--> KeysInstalled
//!     --cleanup--> ChannelRemoved
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::process::Command;
use tracing::{debug, info};

use crate::channel::{CHANNEL_HOST_KEY, CHANNEL_TAG, CHANNEL_USER_PUBKEY};
use crate::units;

/// Fixed guest mount point of the credential channel.
pub const CHANNEL_MOUNT_POINT: &str = "/run/credential-channel";

/// Host-key path the SSH daemon is configured with.
pub const GUEST_HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_ed25519_key";

/// Authorized-keys path of the remote build account.
pub const GUEST_AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";

/// Options for the guest-side installer.
#[derive(Debug, Parser)]
pub struct GuestInstallOpts {
    /// Channel tag to mount
    #[clap(long, default_value = CHANNEL_TAG)]
    pub tag: String,

    /// Write the guest systemd units to this directory and exit
    #[clap(long)]
    pub emit_units: Option<Utf8PathBuf>,

    /// Include debug conveniences (serial autologin) in the emitted units
    #[clap(long)]
    pub debug: bool,
}

/// Failure of one installer transition; any of these block the SSH daemon.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The mount point could not be created.
    #[error("creating channel mount point: {0}")]
    MountPoint(#[source] std::io::Error),
    /// The channel tag could not be mounted.
    #[error("mounting channel tag '{0}': {1}")]
    Mount(String, String),
    /// The channel mounted but does not hold the expected file.
    #[error("channel is missing {0}")]
    IncompleteChannel(Utf8PathBuf),
    /// The host private key could not be installed.
    #[error("installing host key: {0}")]
    HostKey(#[source] std::io::Error),
    /// The authorized-keys file could not be installed.
    #[error("installing authorized keys: {0}")]
    AuthorizedKeys(#[source] std::io::Error),
    /// The channel could not be unmounted.
    #[error("unmounting channel: {0}")]
    Unmount(String),
    /// The mount point could not be removed after unmounting.
    #[error("removing channel mount point: {0}")]
    RemoveMountPoint(#[source] std::io::Error),
}

/// Installer progress through the channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ChannelState {
    /// No channel is mounted.
    ChannelAbsent,
    /// The channel is mounted read-only at the mount point.
    ChannelMounted,
    /// Both credentials are installed; the gate artifact now exists.
    KeysInstalled,
    /// The channel is unmounted and its mount point removed.
    ChannelRemoved,
}

/// Result of running the installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The gate artifact already existed; nothing was touched.
    AlreadyInstalled,
    /// The full sequence ran to completion.
    Installed,
}

/// Mount operations, separated so the sequence is testable unprivileged.
pub trait ChannelMounter {
    /// Mount `tag` read-only/noexec/nosuid at `target`.
    fn mount(&self, tag: &str, target: &Utf8Path) -> Result<(), InstallError>;
    /// Unmount `target`.
    fn unmount(&self, target: &Utf8Path) -> Result<(), InstallError>;
}

/// Mounter shelling out to mount(8)/umount(8).
#[derive(Debug)]
pub struct SystemMounter;

impl ChannelMounter for SystemMounter {
    fn mount(&self, tag: &str, target: &Utf8Path) -> Result<(), InstallError> {
        let output = Command::new("mount")
            .args(["-t", "virtiofs", "-o", "ro,noexec,nosuid", tag, target.as_str()])
            .output()
            .map_err(|e| InstallError::Mount(tag.to_string(), e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(InstallError::Mount(tag.to_string(), stderr));
        }
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<(), InstallError> {
        let output = Command::new("umount")
            .arg(target.as_str())
            .output()
            .map_err(|e| InstallError::Unmount(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(InstallError::Unmount(stderr));
        }
        Ok(())
    }
}

/// Guest filesystem locations, overridable for tests.
#[derive(Debug, Clone)]
pub struct GuestPaths {
    /// Channel mount point.
    pub channel_mount: Utf8PathBuf,
    /// SSH daemon host-key destination.
    pub host_key: Utf8PathBuf,
    /// Authorized-keys destination (the gate artifact).
    pub authorized_keys: Utf8PathBuf,
}

impl Default for GuestPaths {
    fn default() -> Self {
        Self {
            channel_mount: CHANNEL_MOUNT_POINT.into(),
            host_key: GUEST_HOST_KEY_PATH.into(),
            authorized_keys: GUEST_AUTHORIZED_KEYS.into(),
        }
    }
}

/// One-shot installer driving the channel state machine.
#[derive(Debug)]
pub struct Installer<'a, M: ChannelMounter> {
    tag: String,
    paths: GuestPaths,
    mounter: &'a M,
    state: ChannelState,
}

impl<'a, M: ChannelMounter> Installer<'a, M> {
    /// Create an installer for `tag` over the given paths.
    pub fn new(tag: impl Into<String>, paths: GuestPaths, mounter: &'a M) -> Self {
        Self {
            tag: tag.into(),
            paths,
            mounter,
            state: ChannelState::ChannelAbsent,
        }
    }

    /// Current state, advanced by [`Installer::run`].
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Run the gated sequence to completion or first failure.
    pub fn run(&mut self) -> Result<InstallOutcome, InstallError> {
        // The gate: once the authorized-keys artifact exists the sequence
        // never runs again, even if an earlier run leaked its channel.
        if self.paths.authorized_keys.exists() {
            debug!(
                "{} exists; credentials already installed",
                self.paths.authorized_keys
            );
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        self.mount()?;
        self.install_keys()?;
        self.cleanup()?;
        Ok(InstallOutcome::Installed)
    }

    /// ChannelAbsent -> ChannelMounted: mount the tag and verify contents.
    ///
    /// If the tag cannot be mounted, or the channel does not hold both
    /// credentials, the installer fails closed: nothing has been written.
    fn mount(&mut self) -> Result<(), InstallError> {
        debug_assert_eq!(self.state, ChannelState::ChannelAbsent);

        fs::create_dir_all(&self.paths.channel_mount).map_err(InstallError::MountPoint)?;
        self.mounter.mount(&self.tag, &self.paths.channel_mount)?;

        for name in [CHANNEL_HOST_KEY, CHANNEL_USER_PUBKEY] {
            let staged = self.paths.channel_mount.join(name);
            if !staged.exists() {
                return Err(InstallError::IncompleteChannel(staged));
            }
        }

        self.state = ChannelState::ChannelMounted;
        Ok(())
    }

    /// ChannelMounted -> KeysInstalled: copy both credentials into place.
    ///
    /// An already-installed host key is never overwritten. The gate
    /// artifact is written last so partial failure reopens the gate.
    fn install_keys(&mut self) -> Result<(), InstallError> {
        debug_assert_eq!(self.state, ChannelState::ChannelMounted);

        if self.paths.host_key.exists() {
            debug!("{} already installed; leaving untouched", self.paths.host_key);
        } else {
            let staged = self.paths.channel_mount.join(CHANNEL_HOST_KEY);
            copy_with_mode(&staged, &self.paths.host_key, 0o600)
                .map_err(InstallError::HostKey)?;
            info!("Installed host key at {}", self.paths.host_key);
        }

        let staged = self.paths.channel_mount.join(CHANNEL_USER_PUBKEY);
        if let Some(parent) = self.paths.authorized_keys.parent() {
            fs::create_dir_all(parent).map_err(InstallError::AuthorizedKeys)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(InstallError::AuthorizedKeys)?;
        }
        copy_with_mode(&staged, &self.paths.authorized_keys, 0o644)
            .map_err(InstallError::AuthorizedKeys)?;
        info!("Installed authorized keys at {}", self.paths.authorized_keys);

        self.state = ChannelState::KeysInstalled;
        Ok(())
    }

    /// KeysInstalled -> ChannelRemoved: unmount and delete the mount point.
    ///
    /// A failure here leaves the channel leaked; the gate artifact already
    /// exists, so no later boot will retry. Accepted.
    fn cleanup(&mut self) -> Result<(), InstallError> {
        debug_assert_eq!(self.state, ChannelState::KeysInstalled);

        self.mounter.unmount(&self.paths.channel_mount)?;
        fs::remove_dir(&self.paths.channel_mount).map_err(InstallError::RemoveMountPoint)?;

        self.state = ChannelState::ChannelRemoved;
        Ok(())
    }
}

/// Copy `src` to `dst`, creating `dst` with exactly `mode`.
fn copy_with_mode(src: &Utf8Path, dst: &Utf8Path, mode: u32) -> std::io::Result<()> {
    let data = fs::read(src)?;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(dst)?;
    f.write_all(&data)?;
    // mode() only applies at creation; enforce it on overwrite too
    f.set_permissions(fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Execute the guest-install command.
pub fn run(opts: GuestInstallOpts) -> Result<()> {
    if let Some(ref dir) = opts.emit_units {
        return units::emit_guest_units(dir, opts.debug);
    }

    let mounter = SystemMounter;
    let mut installer = Installer::new(&opts.tag, GuestPaths::default(), &mounter);
    match installer.run() {
        Ok(InstallOutcome::AlreadyInstalled) => {
            info!("Credentials already installed; nothing to do");
            Ok(())
        }
        Ok(InstallOutcome::Installed) => {
            info!("Credential installation complete");
            Ok(())
        }
        // Fail fast: a non-zero exit here keeps the SSH daemon from
        // starting with half-installed credentials.
        Err(e) => Err(eyre!(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Mounter that "mounts" by copying a staging directory into the target.
    struct FakeMounter {
        staging: Option<Utf8PathBuf>,
        fail_unmount: bool,
        mounts: RefCell<u32>,
        unmounts: RefCell<u32>,
    }

    impl FakeMounter {
        fn with_staging(staging: Utf8PathBuf) -> Self {
            Self {
                staging: Some(staging),
                fail_unmount: false,
                mounts: RefCell::new(0),
                unmounts: RefCell::new(0),
            }
        }

        fn unavailable() -> Self {
            Self {
                staging: None,
                fail_unmount: false,
                mounts: RefCell::new(0),
                unmounts: RefCell::new(0),
            }
        }
    }

    impl ChannelMounter for FakeMounter {
        fn mount(&self, tag: &str, target: &Utf8Path) -> Result<(), InstallError> {
            *self.mounts.borrow_mut() += 1;
            let Some(ref staging) = self.staging else {
                return Err(InstallError::Mount(tag.to_string(), "no such tag".into()));
            };
            for entry in fs::read_dir(staging).unwrap() {
                let entry = entry.unwrap();
                fs::copy(entry.path(), target.join(entry.file_name().to_str().unwrap()))
                    .unwrap();
            }
            Ok(())
        }

        fn unmount(&self, target: &Utf8Path) -> Result<(), InstallError> {
            *self.unmounts.borrow_mut() += 1;
            if self.fail_unmount {
                return Err(InstallError::Unmount("busy".into()));
            }
            for entry in fs::read_dir(target).unwrap() {
                fs::remove_file(entry.unwrap().path()).unwrap();
            }
            Ok(())
        }
    }

    struct Fixture {
        _td: TempDir,
        staging: Utf8PathBuf,
        paths: GuestPaths,
    }

    fn fixture() -> Fixture {
        let td = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let staging = root.join("staging");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join(CHANNEL_HOST_KEY), "HOSTPRIVATE\n").unwrap();
        fs::write(staging.join(CHANNEL_USER_PUBKEY), "ssh-ed25519 AAAA user\n").unwrap();

        let paths = GuestPaths {
            channel_mount: root.join("run/credential-channel"),
            host_key: root.join("etc/ssh/ssh_host_ed25519_key"),
            authorized_keys: root.join("root/.ssh/authorized_keys"),
        };
        fs::create_dir_all(paths.host_key.parent().unwrap()).unwrap();
        Fixture {
            _td: td,
            staging,
            paths,
        }
    }

    #[test]
    fn test_full_sequence() {
        let fx = fixture();
        let mounter = FakeMounter::with_staging(fx.staging.clone());
        let mut installer = Installer::new("credentials", fx.paths.clone(), &mounter);

        assert_eq!(installer.run().unwrap(), InstallOutcome::Installed);
        assert_eq!(installer.state(), ChannelState::ChannelRemoved);
        assert_eq!(*mounter.mounts.borrow(), 1);
        assert_eq!(*mounter.unmounts.borrow(), 1);

        assert_eq!(fs::read_to_string(&fx.paths.host_key).unwrap(), "HOSTPRIVATE\n");
        let key_mode = fs::metadata(&fx.paths.host_key).unwrap().permissions().mode();
        assert_eq!(key_mode & 0o777, 0o600);

        let ak_mode = fs::metadata(&fx.paths.authorized_keys)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(ak_mode & 0o777, 0o644);

        // Channel unmounted and mount point removed
        assert!(!fx.paths.channel_mount.exists());
    }

    #[test]
    fn test_gate_short_circuits_without_mutation() {
        let fx = fixture();
        fs::create_dir_all(fx.paths.authorized_keys.parent().unwrap()).unwrap();
        fs::write(&fx.paths.authorized_keys, "existing\n").unwrap();

        let mounter = FakeMounter::with_staging(fx.staging.clone());
        let mut installer = Installer::new("credentials", fx.paths.clone(), &mounter);

        assert_eq!(installer.run().unwrap(), InstallOutcome::AlreadyInstalled);
        assert_eq!(*mounter.mounts.borrow(), 0);
        assert!(!fx.paths.host_key.exists());
        assert!(!fx.paths.channel_mount.exists());
        assert_eq!(
            fs::read_to_string(&fx.paths.authorized_keys).unwrap(),
            "existing\n"
        );
    }

    #[test]
    fn test_fails_closed_when_channel_unavailable() {
        let fx = fixture();
        let mounter = FakeMounter::unavailable();
        let mut installer = Installer::new("credentials", fx.paths.clone(), &mounter);

        assert!(matches!(installer.run(), Err(InstallError::Mount(..))));
        assert!(!fx.paths.host_key.exists());
        assert!(!fx.paths.authorized_keys.exists());
    }

    #[test]
    fn test_fails_closed_on_incomplete_channel() {
        let fx = fixture();
        fs::remove_file(fx.staging.join(CHANNEL_USER_PUBKEY)).unwrap();
        let mounter = FakeMounter::with_staging(fx.staging.clone());
        let mut installer = Installer::new("credentials", fx.paths.clone(), &mounter);

        assert!(matches!(
            installer.run(),
            Err(InstallError::IncompleteChannel(_))
        ));
        // Nothing was written before the verification failed
        assert!(!fx.paths.host_key.exists());
        assert!(!fx.paths.authorized_keys.exists());
    }

    #[test]
    fn test_reinstall_never_overwrites_host_key() {
        let fx = fixture();
        let mounter = FakeMounter::with_staging(fx.staging.clone());

        let mut installer = Installer::new("credentials", fx.paths.clone(), &mounter);
        installer.run().unwrap();

        // Deleting only the gate artifact reopens the sequence; the staged
        // key differs, but the installed host key must survive.
        fs::remove_file(&fx.paths.authorized_keys).unwrap();
        fs::write(fx.staging.join(CHANNEL_HOST_KEY), "DIFFERENT\n").unwrap();

        let mut installer = Installer::new("credentials", fx.paths.clone(), &mounter);
        assert_eq!(installer.run().unwrap(), InstallOutcome::Installed);
        assert_eq!(fs::read_to_string(&fx.paths.host_key).unwrap(), "HOSTPRIVATE\n");
        assert!(fx.paths.authorized_keys.exists());
    }

    #[test]
    fn test_leaked_channel_is_accepted_after_gate_closes() {
        let fx = fixture();
        let mut mounter = FakeMounter::with_staging(fx.staging.clone());
        mounter.fail_unmount = true;

        let mut installer = Installer::new("credentials", fx.paths.clone(), &mounter);
        assert!(matches!(installer.run(), Err(InstallError::Unmount(_))));
        assert_eq!(installer.state(), ChannelState::KeysInstalled);

        // Keys landed, the gate is closed, the channel stays leaked
        assert!(fx.paths.authorized_keys.exists());
        assert!(fx.paths.channel_mount.exists());

        let mut installer = Installer::new("credentials", fx.paths.clone(), &mounter);
        assert_eq!(installer.run().unwrap(), InstallOutcome::AlreadyInstalled);
    }
}
