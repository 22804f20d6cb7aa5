//! Long-lived per-processor state handed over by the monitor setup.

use crate::intel::{
    ept::{EptDataHandle, EptEngine},
    guest_view::GuestIdentity,
    vmexit::diagnostics::VmExitHistory,
};

/// Runtime switches of the monitor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmmConfig {
    /// Treat the VMware idle MSR as an implemented MSR.
    pub vmware_compatibility: bool,
    /// Record every VM-exit into the processor's history ring.
    pub record_vm_exits: bool,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            vmware_compatibility: cfg!(feature = "vmware"),
            record_vm_exits: cfg!(feature = "record_vm_exits"),
        }
    }
}

/// Data shared by all processors. Read-only once virtualization has started.
///
/// Its address is what `GetSharedProcessorData` and the termination hypercall
/// hand back to the guest.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedProcessorData {
    pub config: VmmConfig,
}

/// State of one logical processor's virtualization session.
///
/// Owned by the monitor setup; the VM-exit path only borrows it for the
/// duration of one exit. The history ring is the only part it writes.
pub struct ProcessorData<'p> {
    pub shared: &'p SharedProcessorData,
    pub ept: &'p dyn EptEngine,
    pub guest_identity: &'p dyn GuestIdentity,
    pub ept_data: EptDataHandle,
    pub exit_history: VmExitHistory,
}

impl<'p> ProcessorData<'p> {
    pub fn new(
        shared: &'p SharedProcessorData,
        ept: &'p dyn EptEngine,
        guest_identity: &'p dyn GuestIdentity,
        ept_data: EptDataHandle,
    ) -> Self {
        Self { shared, ept, guest_identity, ept_data, exit_history: VmExitHistory::new() }
    }

    pub fn config(&self) -> &VmmConfig {
        &self.shared.config
    }

    /// Address reported to the guest for the shared processor data.
    pub fn shared_data_address(&self) -> u64 {
        self.shared as *const SharedProcessorData as u64
    }

    /// Address reported to the monitor setup when virtualization ends.
    pub fn address(&self) -> u64 {
        self as *const Self as u64
    }
}
