//! VM descriptor construction
//!
//! The descriptor is the immutable definition handed to the virtualization
//! engine when the instance is first created. Mounts carry an explicit tag
//! consumed by name on the guest side; there is no positional coupling
//! between mount-list order and guest-visible tags.

use camino::Utf8PathBuf;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

/// A disk image made available to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Host path of the image file.
    pub location: Utf8PathBuf,
}

/// A host directory shared into the guest under an explicit tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRef {
    /// Host path of the shared directory.
    pub location: Utf8PathBuf,
    /// Guest-visible tag the share is mounted by.
    pub tag: String,
}

/// Immutable definition of the build VM, serialized for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDescriptor {
    /// Number of virtual CPUs.
    pub cpus: u32,
    /// Memory size in MiB.
    pub memory: u64,
    /// Disk images, boot disk first.
    pub images: Vec<ImageRef>,
    /// Shared directories.
    pub mounts: Vec<MountRef>,
    /// Host port forwarded to the guest SSH port.
    pub ssh_port: u16,
    /// Run under CPU emulation instead of native virtualization.
    pub emulation_enabled: bool,
}

/// Builder for VM descriptors.
#[derive(Debug, Default)]
pub struct DescriptorBuilder {
    cpus: Option<u32>,
    memory: Option<u64>,
    images: Vec<ImageRef>,
    mounts: Vec<MountRef>,
    ssh_port: Option<u16>,
    emulation: bool,
    debug: bool,
}

impl DescriptorBuilder {
    /// Create a new descriptor builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set number of vCPUs
    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = Some(cpus);
        self
    }

    /// Set memory in MiB
    pub fn with_memory_mib(mut self, memory: u64) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Add a disk image
    pub fn with_image(mut self, location: impl Into<Utf8PathBuf>) -> Self {
        self.images.push(ImageRef {
            location: location.into(),
        });
        self
    }

    /// Share a host directory into the guest under `tag`
    pub fn with_mount(mut self, location: impl Into<Utf8PathBuf>, tag: impl Into<String>) -> Self {
        self.mounts.push(MountRef {
            location: location.into(),
            tag: tag.into(),
        });
        self
    }

    /// Set the forwarded SSH port
    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = Some(port);
        self
    }

    /// Enable CPU emulation
    pub fn with_emulation(mut self, emulation: bool) -> Self {
        self.emulation = emulation;
        self
    }

    /// Thread the explicit debug mode through the definition
    ///
    /// Debug mode never branches ambiently; it is carried here and consumed
    /// by the guest configuration derived from the same parameter set.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Whether debug mode was requested.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Build the descriptor
    pub fn build(self) -> Result<VmDescriptor> {
        if self.images.is_empty() {
            return Err(eyre!("A boot disk image is required"));
        }
        Ok(VmDescriptor {
            cpus: self.cpus.unwrap_or(2),
            memory: self.memory.unwrap_or(2048),
            images: self.images,
            mounts: self.mounts,
            ssh_port: self.ssh_port.unwrap_or(2222),
            emulation_enabled: self.emulation,
        })
    }
}
