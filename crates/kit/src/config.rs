//! Typed configuration for the managed instance
//!
//! A small named-parameter set maps through one pure function to the VM
//! descriptor and the guest-side configuration. There is no overlay or merge
//! step: what the CLI parsed is what the engine and the guest see.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

use crate::channel;
use crate::vm::{DescriptorBuilder, VmDescriptor};

/// Default instance name and SSH alias.
pub const DEFAULT_VM_NAME: &str = "buildvm";
/// Default memory size for the instance.
pub const DEFAULT_MEMORY_STR: &str = "4G";
/// Default host port forwarded to the guest SSH port.
pub const DEFAULT_SSH_PORT: u16 = 2222;

fn default_vcpus() -> u32 {
    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(2)
}

/// Common options describing the managed instance.
#[derive(Debug, Clone, Args)]
pub struct VmOpts {
    /// Instance name, also used as the SSH alias
    #[clap(long, default_value = DEFAULT_VM_NAME)]
    pub name: String,

    /// Number of vCPUs for the instance
    #[clap(long, default_value_t = default_vcpus())]
    pub cpus: u32,

    /// Memory size for the instance (e.g. 4G, 2048M)
    #[clap(long, default_value = DEFAULT_MEMORY_STR)]
    pub memory: String,

    /// Path to the guest disk image
    #[clap(long)]
    pub image: Utf8PathBuf,

    /// Host port forwarded to the guest SSH port
    #[clap(long, default_value_t = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,

    /// Run the guest under CPU emulation instead of native virtualization
    #[clap(long)]
    pub emulation: bool,

    /// Enable guest debug conveniences (serial console autologin)
    #[clap(long)]
    pub debug: bool,

    /// Working directory holding keys, trust store and channel staging
    #[clap(long, default_value = crate::DEFAULT_STATEDIR)]
    pub state_dir: Utf8PathBuf,

    /// Virtualization engine binary to drive
    #[clap(long, default_value = "vmexec")]
    pub engine: String,
}

impl VmOpts {
    /// Resolve the CLI options into validated parameters.
    pub fn to_params(&self) -> Result<VmParams> {
        Ok(VmParams {
            name: self.name.clone(),
            cpus: self.cpus,
            memory_mib: parse_memory_to_mib(&self.memory)?,
            image: self.image.clone(),
            ssh_port: self.ssh_port,
            emulation: self.emulation,
            debug: self.debug,
        })
    }
}

/// Validated parameters for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmParams {
    /// Instance name and SSH alias.
    pub name: String,
    /// Number of vCPUs.
    pub cpus: u32,
    /// Memory size in MiB.
    pub memory_mib: u64,
    /// Guest disk image.
    pub image: Utf8PathBuf,
    /// Forwarded SSH port.
    pub ssh_port: u16,
    /// CPU emulation flag.
    pub emulation: bool,
    /// Debug mode flag.
    pub debug: bool,
}

/// Guest-side configuration derived from the same parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    /// Enable root autologin on the serial console.
    pub autologin: bool,
}

/// Map the parameter set to the engine descriptor and guest configuration.
///
/// Pure: the only inputs are the parameters and the channel staging path.
pub fn materialize(params: &VmParams, channel_dir: &Utf8Path) -> Result<(VmDescriptor, GuestConfig)> {
    let builder = DescriptorBuilder::new()
        .with_cpus(params.cpus)
        .with_memory_mib(params.memory_mib)
        .with_image(params.image.clone())
        .with_mount(channel_dir, channel::CHANNEL_TAG)
        .with_ssh_port(params.ssh_port)
        .with_emulation(params.emulation)
        .with_debug(params.debug);

    let guest = GuestConfig {
        autologin: builder.debug(),
    };
    let descriptor = builder.build()?;

    Ok((descriptor, guest))
}

/// Parse a memory string (like "2G", "1024M", "512") to MiB
pub fn parse_memory_to_mib(memory_str: &str) -> Result<u64> {
    let memory_str = memory_str.trim();

    let Some(last_char) = memory_str.chars().last() else {
        return Err(eyre!("Memory specification cannot be empty"));
    };

    match last_char.to_ascii_uppercase() {
        'G' => {
            let number_part = &memory_str[..memory_str.len() - 1];
            let gb: f64 = number_part
                .parse()
                .context("Invalid number in memory specification")?;
            Ok((gb * 1024.0) as u64)
        }
        'M' => {
            let number_part = &memory_str[..memory_str.len() - 1];
            let mb: u64 = number_part
                .parse()
                .context("Invalid number in memory specification")?;
            Ok(mb)
        }
        _ => {
            // No suffix, assume MiB
            let mb: u64 = memory_str
                .parse()
                .context("Invalid number in memory specification")?;
            Ok(mb)
        }
    }
}
