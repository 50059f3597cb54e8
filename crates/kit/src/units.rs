//! systemd unit text generation
//!
//! Two consumers: the guest image build takes the oneshot installer unit and
//! the sshd drop-in that orders credential installation strictly before the
//! SSH daemon, and host provisioning takes the supervisor service that
//! restarts the controller whenever the VM exits.

use camino::Utf8Path;
use color_eyre::{eyre::eyre, Result};
use const_format::concatcp;
use indoc::formatdoc;
use std::fs;
use tracing::debug;

use crate::channel::CHANNEL_TAG;
use crate::guest_install::GUEST_AUTHORIZED_KEYS;

/// Name of the guest installer unit.
pub const INSTALL_UNIT: &str = "credential-install.service";

/// Guest path of the controller binary inside the image.
const GUEST_BIN: &str = "/usr/bin/buildvm";

/// Installer invocation baked into the oneshot unit.
const INSTALL_EXEC: &str = concatcp!(GUEST_BIN, " guest-install --tag ", CHANNEL_TAG);

/// Render the guest oneshot unit installing credentials from the channel.
///
/// The path condition mirrors the installer's own gate; systemd treats a
/// failed condition as a skip, so dependents still start on later boots.
pub fn installer_unit() -> String {
    formatdoc! {"
        [Unit]
        Description=Install build credentials from the transfer channel
        ConditionPathExists=!{gate}
        Before=sshd.service

        [Service]
        Type=oneshot
        RemainAfterExit=yes
        ExecStart={exec}

        [Install]
        WantedBy=multi-user.target
        ",
        gate = GUEST_AUTHORIZED_KEYS,
        exec = INSTALL_EXEC,
    }
}

/// Render the sshd drop-in making the daemon require the installer.
///
/// A failed installer run keeps sshd from ever reaching ready state with
/// half-installed credentials.
pub fn sshd_dropin() -> String {
    formatdoc! {"
        [Unit]
        Requires={unit}
        After={unit}
        ",
        unit = INSTALL_UNIT,
    }
}

/// Render the serial-console autologin drop-in used in debug mode.
pub fn autologin_dropin() -> String {
    formatdoc! {"
        [Service]
        ExecStart=
        ExecStart=-/sbin/agetty --autologin root --noclear %I $TERM
        "
    }
}

/// Render the host supervisor service for the controller.
pub fn supervisor_unit(
    name: &str,
    exec: &[String],
    working_directory: &Utf8Path,
    user: &str,
    environment: &[String],
) -> Result<String> {
    let exec = shlex::try_join(exec.iter().map(|s| s.as_str()))
        .map_err(|e| eyre!("Failed to quote command line: {e}"))?;

    let env_lines: String = environment
        .iter()
        .map(|kv| format!("Environment={kv}\n"))
        .collect();

    Ok(formatdoc! {"
        [Unit]
        Description=Supervised build VM {name}
        After=network.target

        [Service]
        ExecStart={exec}
        WorkingDirectory={working_directory}
        User={user}
        Restart=always
        {env_lines}
        [Install]
        WantedBy=multi-user.target
        ",
    })
}

/// Write the guest units for the image build to consume.
pub fn emit_guest_units(dir: &Utf8Path, debug_mode: bool) -> Result<()> {
    fs::create_dir_all(dir)?;

    let unit_path = dir.join(INSTALL_UNIT);
    fs::write(&unit_path, installer_unit())?;
    debug!("Wrote {unit_path}");

    let dropin_dir = dir.join("sshd.service.d");
    fs::create_dir_all(&dropin_dir)?;
    let dropin_path = dropin_dir.join("10-credential-install.conf");
    fs::write(&dropin_path, sshd_dropin())?;
    debug!("Wrote {dropin_path}");

    if debug_mode {
        let getty_dir = dir.join("serial-getty@ttyS0.service.d");
        fs::create_dir_all(&getty_dir)?;
        let autologin_path = getty_dir.join("10-autologin.conf");
        fs::write(&autologin_path, autologin_dropin())?;
        debug!("Wrote {autologin_path}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_installer_unit() {
        let expected = indoc::indoc! {"
            [Unit]
            Description=Install build credentials from the transfer channel
            ConditionPathExists=!/root/.ssh/authorized_keys
            Before=sshd.service

            [Service]
            Type=oneshot
            RemainAfterExit=yes
            ExecStart=/usr/bin/buildvm guest-install --tag credentials

            [Install]
            WantedBy=multi-user.target
        "};
        assert_eq!(installer_unit(), expected);
    }

    #[test]
    fn test_sshd_requires_installer() {
        let dropin = sshd_dropin();
        assert!(dropin.contains("Requires=credential-install.service"));
        assert!(dropin.contains("After=credential-install.service"));
    }

    #[test]
    fn test_supervisor_unit() {
        let exec = vec![
            "/usr/local/bin/buildvm".to_string(),
            "run".to_string(),
            "--image".to_string(),
            "/var/lib/buildvm/disk image.raw".to_string(),
        ];
        let unit = supervisor_unit(
            "builder",
            &exec,
            Utf8Path::new("/var/lib/buildvm"),
            "buildvm",
            &["RUST_LOG=info".to_string()],
        )
        .unwrap();

        assert!(unit.contains("Description=Supervised build VM builder"));
        // Embedded space must be quoted, not split
        assert!(unit.contains("ExecStart=/usr/local/bin/buildvm run --image"));
        assert!(unit.contains("disk image.raw"));
        assert!(!unit.contains("ExecStart=/usr/local/bin/buildvm run --image /var/lib/buildvm/disk image.raw"));
        assert!(unit.contains("WorkingDirectory=/var/lib/buildvm"));
        assert!(unit.contains("User=buildvm"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("Environment=RUST_LOG=info"));
    }

    #[test]
    fn test_emit_guest_units() {
        let td = TempDir::new().unwrap();
        let dir = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();

        emit_guest_units(&dir, false).unwrap();
        assert!(dir.join(INSTALL_UNIT).exists());
        assert!(dir.join("sshd.service.d/10-credential-install.conf").exists());
        assert!(!dir.join("serial-getty@ttyS0.service.d").exists());

        emit_guest_units(&dir, true).unwrap();
        assert!(dir
            .join("serial-getty@ttyS0.service.d/10-autologin.conf")
            .exists());
    }
}
