//! CPUID VM-exit handler.
//!
//! The host's CPUID results are passed through with two exceptions that keep
//! the monitor invisible: leaf 0 reports a fixed "GenuineIntel" tuple, and
//! leaf 1 never advertises the hypervisor-present bit.

use {
    crate::{
        error::HypervisorError,
        global_const::{CPUID_MAX_BASIC_LEAF, CPUID_VENDOR_EBX, CPUID_VENDOR_ECX, CPUID_VENDOR_EDX},
        intel::{
            platform::Platform,
            vmexit::{ExitType, GuestContext},
        },
    },
    bit_field::BitField,
    log::trace,
    x86::cpuid::CpuIdResult,
};

/// Leaves the handler treats specially.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CpuidLeaf {
    VendorInfo = 0x0,
    FeatureInformation = 0x1,
}

/// Feature bit in leaf 1 ECX reserved for hypervisors to announce themselves.
const HYPERVISOR_PRESENT_BIT: usize = 31;

/// Handles a CPUID VM-exit.
///
/// Executes CPUID with the guest's EAX/ECX, filters the result, writes it to
/// RAX/RBX/RCX/RDX (zero-extended) and advances RIP.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 3-8. Information Returned by CPUID Instruction
pub fn handle_cpuid<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let leaf = guest.registers.rax as u32;
    let sub_leaf = guest.registers.rcx as u32;

    trace!("CPUID leaf={:#x} sub_leaf={:#x} RIP={:#x}", leaf, sub_leaf, guest.ip);

    let mut result = platform.cpuid(leaf, sub_leaf);

    if leaf == CpuidLeaf::VendorInfo as u32 {
        result = CpuIdResult { eax: CPUID_MAX_BASIC_LEAF, ebx: CPUID_VENDOR_EBX, ecx: CPUID_VENDOR_ECX, edx: CPUID_VENDOR_EDX };
    } else if leaf == CpuidLeaf::FeatureInformation as u32 {
        result.ecx.set_bit(HYPERVISOR_PRESENT_BIT, false);
    }

    guest.registers.rax = result.eax as u64;
    guest.registers.rbx = result.ebx as u64;
    guest.registers.rcx = result.ecx as u64;
    guest.registers.rdx = result.edx as u64;

    Ok(ExitType::IncrementRIP)
}
