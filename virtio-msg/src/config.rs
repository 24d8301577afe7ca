//! Carrier and proxy configuration (spec.md §6 "Configuration").
//!
//! These mirror the QEMU `-device`/`-object` property tables in
//! `examples/original_source/include/hw/virtio/virtio-msg-bus-linux-user.h`
//! and `-ivshmem.h`; grouped into plain structs here since there's no
//! QOM property system to hang them on.

use crate::iommu::IommuStrategy;
use crate::error::Result;

/// `iommu` option (spec.md §6): which translation strategy a bus uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IommuMode {
    None,
    Pagemap,
    XenGfn2Mfn,
}

impl IommuMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IommuMode::None => "none",
            IommuMode::Pagemap => "pagemap",
            IommuMode::XenGfn2Mfn => "xen-gfn2mfn",
        }
    }

    pub fn build(&self) -> Result<IommuStrategy> {
        IommuStrategy::from_config(self.as_str())
    }
}

impl Default for IommuMode {
    fn default() -> Self {
        IommuMode::None
    }
}

/// Shared-memory carrier configuration (spec.md §6; fields named after
/// `VirtIOMSGBusIvshmemConf` in `virtio-msg-bus-ivshmem.h`).
#[derive(Clone, Debug, Default)]
pub struct ShmemConfig {
    /// PCI address of the VFIO device providing the BARs.
    pub dev: Option<String>,
    /// Destination tag written into doorbell notifications.
    pub remote_vmid: u16,
    /// Zero ring memory at startup.
    pub reset_queues: bool,
    /// Backing object exposing guest RAM to the peer.
    pub memdev: Option<String>,
    pub mem_offset: u64,
    pub mem_low_size: u64,
    pub mem_hole: u64,
    pub iommu: IommuMode,
}

/// Host-local carrier configuration (spec.md §6; fields named after
/// `VirtIOMSGBusLinuxUserConf` in `virtio-msg-bus-linux-user.h`).
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// Namespace for the shared ring regions
    /// (`queue-<name>-driver`/`queue-<name>-device`).
    pub name: String,
    /// Notification channel identifier (a chardev id in the original; here
    /// purely informational, the socketpair is constructed directly).
    pub chardev: Option<String>,
    pub reset_queues: bool,
    pub iommu: IommuMode,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            name: "virtio-msg0".to_string(),
            chardev: None,
            reset_queues: false,
            iommu: IommuMode::default(),
        }
    }
}

/// Driver-proxy configuration (spec.md §6 `virtio-id`, §4.7).
#[derive(Clone, Debug)]
pub struct DriverProxyConfig {
    /// Expected virtio device id; a `DEVICE_INFO` mismatch is fatal
    /// (spec.md §9 Open Question (b)).
    pub expected_device_id: u32,
}
