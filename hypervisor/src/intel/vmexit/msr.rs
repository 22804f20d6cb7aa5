//! RDMSR and WRMSR VM-exit handlers.
//!
//! MSRs whose guest values live in the VMCS guest-state area are served from
//! there; every other implemented MSR is accessed on the processor. Accesses
//! to MSR numbers outside the architecturally defined ranges raise #GP in the
//! guest instead of faulting in the monitor.

use {
    crate::{
        error::HypervisorError,
        global_const::{INVALID_MSR_ERROR_CODE, VMWARE_IDLE_MSR},
        intel::{
            events::inject_gp,
            platform::Platform,
            vmexit::{ExitType, GuestContext},
        },
    },
    core::ops::RangeInclusive,
    log::{debug, trace},
    x86::{msr, vmx::vmcs::guest},
};

/// Low MSR range.
const MSR_RANGE_LOW: RangeInclusive<u32> = 0x0000_0000..=0x0000_1FFF;

/// High MSR range.
const MSR_RANGE_HIGH: RangeInclusive<u32> = 0xC000_0000..=0xC000_1FFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsrAccessType {
    Read,
    Write,
}

/// Guest-state field holding the guest value of an MSR.
struct VmcsBackedMsr {
    field: u32,
    /// The field is a 32-bit VMCS field.
    is_32bit: bool,
}

fn vmcs_backed_msr(msr: u32) -> Option<VmcsBackedMsr> {
    let (field, is_32bit) = match msr {
        msr::IA32_SYSENTER_CS => (guest::IA32_SYSENTER_CS, true),
        msr::IA32_SYSENTER_ESP => (guest::IA32_SYSENTER_ESP, false),
        msr::IA32_SYSENTER_EIP => (guest::IA32_SYSENTER_EIP, false),
        msr::IA32_DEBUGCTL => (guest::IA32_DEBUGCTL_FULL, false),
        msr::IA32_FS_BASE => (guest::FS_BASE, false),
        msr::IA32_GS_BASE => (guest::GS_BASE, false),
        _ => return None,
    };
    Some(VmcsBackedMsr { field, is_32bit })
}

/// Whether `msr` is in a range the processor can implement.
pub fn is_valid_msr(msr: u32, vmware_compatibility: bool) -> bool {
    MSR_RANGE_LOW.contains(&msr) || MSR_RANGE_HIGH.contains(&msr) || (vmware_compatibility && msr == VMWARE_IDLE_MSR)
}

/// Handles RDMSR and WRMSR VM-exits.
///
/// ECX selects the MSR; the value travels in EDX:EAX.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 2.1 ARCHITECTURAL MSRS
pub fn handle_msr_access<P: Platform>(
    guest: &mut GuestContext,
    platform: &mut P,
    access_type: MsrAccessType,
) -> Result<ExitType, HypervisorError> {
    let msr_id = guest.registers.rcx as u32;

    if !is_valid_msr(msr_id, guest.processor_data.config().vmware_compatibility) {
        debug!("{:?} of unimplemented MSR {:#x} at RIP {:#x}, injecting #GP", access_type, msr_id, guest.ip);
        inject_gp(guest, platform, INVALID_MSR_ERROR_CODE);
        return Ok(ExitType::IncrementRIP);
    }

    let backing = vmcs_backed_msr(msr_id);

    match access_type {
        MsrAccessType::Read => {
            let value = match backing {
                Some(VmcsBackedMsr { field, is_32bit: true }) => platform.vmread(field) & 0xFFFF_FFFF,
                Some(VmcsBackedMsr { field, is_32bit: false }) => platform.vmread(field),
                None => platform.rdmsr(msr_id),
            };
            trace!("RDMSR {:#x} -> {:#x}", msr_id, value);

            guest.registers.rax = value & 0xFFFF_FFFF;
            guest.registers.rdx = value >> 32;
        }
        MsrAccessType::Write => {
            let value = ((guest.registers.rdx & 0xFFFF_FFFF) << 32) | (guest.registers.rax & 0xFFFF_FFFF);
            trace!("WRMSR {:#x} <- {:#x}", msr_id, value);

            match backing {
                Some(VmcsBackedMsr { field, is_32bit: true }) => platform.vmwrite(field, value & 0xFFFF_FFFF),
                Some(VmcsBackedMsr { field, is_32bit: false }) => platform.vmwrite(field, value),
                None => platform.wrmsr(msr_id, value),
            }
        }
    }

    Ok(ExitType::IncrementRIP)
}
