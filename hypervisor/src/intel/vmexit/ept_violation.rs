//! EPT violation and EPT misconfiguration VM-exit handlers.
//!
//! Both are delegated to the EPT engine. A violation is the engine's to
//! resolve; a misconfiguration means the engine built a broken entry, which
//! is fatal.

use {
    crate::{
        error::HypervisorError,
        intel::{
            ept::Entry,
            platform::Platform,
            vmexit::{ExitType, GuestContext},
        },
    },
    log::{error, trace},
    x86::vmx::vmcs::ro,
};

/// Hands an EPT violation to the EPT engine and resumes the guest at the
/// faulting instruction.
pub fn handle_ept_violation<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    trace!(
        "EPT violation at GPA {:#x} RIP {:#x} qualification {:#x}",
        platform.vmread(ro::GUEST_PHYSICAL_ADDR_FULL),
        guest.ip,
        platform.vmread(ro::EXIT_QUALIFICATION)
    );

    let processor_data = &*guest.processor_data;
    processor_data.ept.handle_ept_violation(processor_data.ept_data);

    Ok(ExitType::Continue)
}

/// Reports an EPT misconfiguration with the entry mapping the faulting
/// guest-physical address.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.3.1 EPT Misconfigurations
pub fn handle_ept_misconfiguration<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let guest_physical_address = platform.vmread(ro::GUEST_PHYSICAL_ADDR_FULL);

    let processor_data = &*guest.processor_data;
    let entry = processor_data.ept.get_ept_pt_entry(processor_data.ept_data, guest_physical_address);

    match entry.map(Entry::from) {
        Some(entry) => error!(
            "EPT misconfiguration at GPA {:#x}: {:?} reserved permissions {} reserved memory type {}",
            guest_physical_address,
            entry,
            entry.has_reserved_permissions(),
            entry.has_reserved_memory_type()
        ),
        None => error!("EPT misconfiguration at GPA {:#x}: no entry", guest_physical_address),
    }

    Err(HypervisorError::EptMisconfiguration { guest_physical_address, entry })
}
