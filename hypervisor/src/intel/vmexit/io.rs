//! IN, OUT, INS and OUTS VM-exit handler.
//!
//! The access is replayed on the processor with the guest's operands. String
//! forms read or write guest memory, so every access runs inside the guest's
//! kernel address space.

use {
    crate::{
        error::HypervisorError,
        intel::{
            guest_view::{GuestAddressSpace, kernel_cr3},
            platform::{IoWidth, Platform},
            vmerror::IoInstQualification,
            vmexit::{ExitType, GuestContext},
        },
    },
    bit_field::BitField,
    log::trace,
    x86::vmx::vmcs::ro,
    x86_64::registers::rflags::RFlags,
};

/// Handles an I/O instruction VM-exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
pub fn handle_io_instruction<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let qualification = IoInstQualification::from(platform.vmread(ro::EXIT_QUALIFICATION));

    let width = qualification
        .access_width()
        .and_then(IoWidth::from_bytes)
        .ok_or(HypervisorError::InvalidIoAccessSize(qualification.size_of_access()))?;

    let port = qualification.port_number();
    let is_in = qualification.direction_in();
    let count = if qualification.rep_prefixed() { guest.registers.rcx } else { 1 };

    trace!(
        "{} port {:#x} width {:?} string {} rep {} RIP {:#x}",
        if is_in { "IN" } else { "OUT" },
        port,
        width,
        qualification.string_instruction(),
        qualification.rep_prefixed(),
        guest.ip
    );

    let cr3 = kernel_cr3(platform, guest.processor_data.guest_identity);
    let mut view = GuestAddressSpace::new(platform, cr3);

    if qualification.string_instruction() {
        let address = if is_in { guest.registers.rdi } else { guest.registers.rsi };

        // The guest's own INS/OUTS would have touched the same memory under the same CR3.
        unsafe {
            if is_in {
                view.io_in_string(port, width, address, count);
            } else {
                view.io_out_string(port, width, address, count);
            }
        }
        drop(view);

        let distance = count.wrapping_mul(width.bytes());
        let index = if is_in { &mut guest.registers.rdi } else { &mut guest.registers.rsi };
        *index = if guest.flags.contains(RFlags::DIRECTION_FLAG) {
            index.wrapping_sub(distance)
        } else {
            index.wrapping_add(distance)
        };

        if qualification.rep_prefixed() {
            guest.registers.rcx = 0;
        }
    } else if is_in {
        let value = view.io_in(port, width) as u64;
        drop(view);

        match width {
            IoWidth::Byte => {
                guest.registers.rax.set_bits(0..8, value);
            }
            IoWidth::Word => {
                guest.registers.rax.set_bits(0..16, value);
            }
            IoWidth::Dword => guest.registers.rax = value,
        }
    } else {
        view.io_out(port, width, (guest.registers.rax & width.mask()) as u32);
    }

    Ok(ExitType::IncrementRIP)
}
