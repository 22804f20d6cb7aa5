//! Control register access VM-exit handler.
//!
//! CR0 and CR4 writes are committed to both the guest register and its read
//! shadow after the VMX fixed-bit constraints are applied. CR3 lives in the
//! VMCS; CR8 is kept in the exit context and written back by the trampoline.

use {
    crate::{
        error::HypervisorError,
        intel::{
            platform::Platform,
            vmerror::{ControlRegAccessExitQualification, CrAccessType},
            vmexit::{ExitType, GuestContext},
        },
    },
    bit_field::BitField,
    log::trace,
    x86::{
        msr,
        vmx::vmcs::{control, guest, ro},
    },
    x86_64::registers::control::{Cr0Flags, Cr4Flags},
};

/// CR3 bit 63, the no-flush hint under PCID. MOV to CR3 never changes it.
const CR3_PCID_NO_FLUSH: usize = 63;

/// VM-entry control "IA-32e mode guest".
const IA32E_MODE_GUEST: usize = 9;

/// Applies the IA32_VMX_CRx_FIXED0/FIXED1 constraints to a control register value.
fn apply_fixed_bits<P: Platform>(platform: &mut P, value: u64, fixed0: u32, fixed1: u32) -> u64 {
    let fixed0 = platform.rdmsr(fixed0);
    let fixed1 = platform.rdmsr(fixed1);
    (value & fixed1) | fixed0
}

/// Whether the guest translates through PAE paging outside of IA-32e mode,
/// where the processor caches the four PDPTEs in the VMCS.
fn is_pae_paging<P: Platform>(platform: &P) -> bool {
    let cr0 = Cr0Flags::from_bits_retain(platform.vmread(guest::CR0));
    let cr4 = Cr4Flags::from_bits_retain(platform.vmread(guest::CR4));
    let ia32e = platform.vmread(control::VMENTRY_CONTROLS).get_bit(IA32E_MODE_GUEST);

    cr0.contains(Cr0Flags::PAGING) && cr4.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) && !ia32e
}

/// Reloads the guest PDPTEs from the page-directory-pointer table `cr3` points to.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 4.4.1 PDPTE Registers
fn load_pdptes<P: Platform>(platform: &mut P, cr3: u64) {
    let table = cr3 & !0x1F;
    let mut buffer = [0u8; 32];
    platform.read_physical(table, &mut buffer);

    let fields = [guest::PDPTE0_FULL, guest::PDPTE1_FULL, guest::PDPTE2_FULL, guest::PDPTE3_FULL];
    for (field, entry) in fields.into_iter().zip(buffer.chunks_exact(8)) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(entry);
        platform.vmwrite(field, u64::from_le_bytes(bytes));
    }

    trace!("Reloaded PDPTEs from {:#x}", table);
}

fn write_cr0<P: Platform>(platform: &mut P, value: u64) {
    let cr0 = apply_fixed_bits(platform, value, msr::IA32_VMX_CR0_FIXED0, msr::IA32_VMX_CR0_FIXED1);
    platform.vmwrite(guest::CR0, cr0);
    platform.vmwrite(control::CR0_READ_SHADOW, cr0);
}

fn write_cr4<P: Platform>(platform: &mut P, value: u64) {
    let cr4 = apply_fixed_bits(platform, value, msr::IA32_VMX_CR4_FIXED0, msr::IA32_VMX_CR4_FIXED1);
    platform.vmwrite(guest::CR4, cr4);
    platform.vmwrite(control::CR4_READ_SHADOW, cr4);
}

/// Handles MOV to/from CR, CLTS and LMSW.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
pub fn handle_cr_reg_access<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let qualification = ControlRegAccessExitQualification::from_exit_qualification(platform.vmread(ro::EXIT_QUALIFICATION));
    let register = qualification.gpr_mov_cr;

    trace!("CR access {:?} CR{} R{} RIP {:#x}", qualification.access_type, qualification.control_reg, register, guest.ip);

    let unsupported = || HypervisorError::InvalidControlRegisterAccess {
        access_type: qualification.access_type as u64,
        control_register: qualification.control_reg,
    };

    match qualification.access_type {
        CrAccessType::MovToCr => {
            let value = guest.registers.get(register)?;
            match qualification.control_reg {
                0 => {
                    if is_pae_paging(platform) {
                        let cr3 = platform.vmread(guest::CR3);
                        load_pdptes(platform, cr3);
                    }
                    write_cr0(platform, value);
                }
                3 => {
                    if is_pae_paging(platform) {
                        load_pdptes(platform, value);
                    }

                    // Flushing is permitted on every MOV to CR3, even where it is not required.
                    let vpid = platform.vmread(control::VPID) as u16;
                    platform.invvpid_single_context_retaining_globals(vpid);

                    let mut cr3 = value;
                    cr3.set_bit(CR3_PCID_NO_FLUSH, platform.vmread(guest::CR3).get_bit(CR3_PCID_NO_FLUSH));
                    platform.vmwrite(guest::CR3, cr3);
                }
                4 => {
                    if is_pae_paging(platform) {
                        let cr3 = platform.vmread(guest::CR3);
                        load_pdptes(platform, cr3);
                    }
                    platform.invvpid_all_contexts();
                    write_cr4(platform, value);
                }
                8 => guest.cr8 = value,
                _ => return Err(unsupported()),
            }
        }
        CrAccessType::MovFromCr => {
            let value = match qualification.control_reg {
                3 => platform.vmread(guest::CR3),
                8 => guest.cr8,
                _ => return Err(unsupported()),
            };
            guest.registers.set(register, value)?;
        }
        CrAccessType::Clts => {
            let mut cr0 = Cr0Flags::from_bits_retain(platform.vmread(control::CR0_READ_SHADOW));
            cr0.remove(Cr0Flags::TASK_SWITCHED);
            write_cr0(platform, cr0.bits());
        }
        CrAccessType::Lmsw => {
            // LMSW loads CR0[3:0] but can only set PE, never clear it.
            let mut cr0 = platform.vmread(control::CR0_READ_SHADOW);
            let protected = cr0.get_bit(0);
            cr0.set_bits(0..4, qualification.lmsw_source_data.get_bits(0..4));
            if protected {
                cr0.set_bit(0, true);
            }
            write_cr0(platform, cr0);
        }
    }

    Ok(ExitType::IncrementRIP)
}
