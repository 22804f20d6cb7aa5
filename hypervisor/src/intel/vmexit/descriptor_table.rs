//! Descriptor-table VM-exit handlers: SGDT/SIDT/LGDT/LIDT and SLDT/STR/LLDT/LTR.
//!
//! The memory operand is decoded from the VM-exit instruction information and
//! the exit qualification (the displacement), then accessed through the guest's
//! kernel address space.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 28.2.5 Information for VM Exits Due to Instruction Execution

use {
    crate::{
        error::HypervisorError,
        intel::{
            guest_view::{GuestAddressSpace, kernel_cr3},
            platform::Platform,
            vmerror::{
                ADDRESS_SIZE_32BIT, GdtrOrIdtrInstInformation, GdtrOrIdtrInstruction, LdtrOrTrInstInformation,
                LdtrOrTrInstruction, MemoryOperand,
            },
            vmexit::{ExitType, GuestContext, is_guest_64bit},
        },
    },
    bit_field::BitField,
    log::trace,
    x86::vmx::vmcs::{guest, ro},
};

/// Size of a segment descriptor in the GDT.
const SEGMENT_DESCRIPTOR_SIZE: u64 = 8;

/// Offset of the byte holding the type field within a segment descriptor.
const DESCRIPTOR_TYPE_BYTE: u64 = 5;

/// Type bit that distinguishes a busy TSS from an available one.
const TSS_BUSY: u8 = 0x02;

fn segment_base<P: Platform>(platform: &P, segment_register: u32) -> Result<u64, HypervisorError> {
    let field = match segment_register {
        0 => guest::ES_BASE,
        1 => guest::CS_BASE,
        2 => guest::SS_BASE,
        3 => guest::DS_BASE,
        4 => guest::FS_BASE,
        5 => guest::GS_BASE,
        _ => return Err(HypervisorError::InvalidSegmentRegister(segment_register)),
    };
    Ok(platform.vmread(field))
}

/// Computes the linear address of a memory operand:
/// segment base + base + index * scale + displacement.
pub fn effective_address<P: Platform>(
    guest: &GuestContext,
    platform: &P,
    operand: &MemoryOperand,
    displacement: u64,
) -> Result<u64, HypervisorError> {
    let base = match operand.base_register {
        Some(index) => guest.registers.get(index)?,
        None => 0,
    };

    let index = match operand.index_register {
        Some(index) => guest.registers.get(index)? << operand.scaling,
        None => 0,
    };

    let mut address = segment_base(platform, operand.segment_register)?
        .wrapping_add(base)
        .wrapping_add(index)
        .wrapping_add(displacement);

    if operand.address_size == ADDRESS_SIZE_32BIT {
        address &= 0xFFFF_FFFF;
    }

    Ok(address)
}

/// Handles SGDT, SIDT, LGDT and LIDT.
///
/// Stores write a 10-byte pseudo-descriptor for 64-bit code and a 6-byte one
/// (32-bit base) otherwise. Loads read the same layout back into the guest's
/// GDTR/IDTR fields.
pub fn handle_gdtr_or_idtr_access<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let info = GdtrOrIdtrInstInformation::from(platform.vmread(ro::VMEXIT_INSTRUCTION_INFO) as u32);
    let displacement = platform.vmread(ro::EXIT_QUALIFICATION);
    let instruction = info.instruction();
    let address = effective_address(guest, platform, &info.memory_operand(), displacement)?;
    let long_mode = is_guest_64bit(platform);

    trace!("{:?} [{:#x}] 64-bit={} RIP={:#x}", instruction, address, long_mode, guest.ip);

    let (base_field, limit_field) = match instruction {
        GdtrOrIdtrInstruction::Sgdt | GdtrOrIdtrInstruction::Lgdt => (guest::GDTR_BASE, guest::GDTR_LIMIT),
        GdtrOrIdtrInstruction::Sidt | GdtrOrIdtrInstruction::Lidt => (guest::IDTR_BASE, guest::IDTR_LIMIT),
    };

    let cr3 = kernel_cr3(platform, guest.processor_data.guest_identity);
    let mut view = GuestAddressSpace::new(platform, cr3);

    match instruction {
        GdtrOrIdtrInstruction::Sgdt | GdtrOrIdtrInstruction::Sidt => {
            let base = view.vmread(base_field);
            let limit = view.vmread(limit_field) as u16;

            view.write_u16(address, limit);
            if long_mode {
                view.write_u64(address.wrapping_add(2), base);
            } else {
                view.write_u32(address.wrapping_add(2), base as u32);
            }
        }
        GdtrOrIdtrInstruction::Lgdt | GdtrOrIdtrInstruction::Lidt => {
            let limit = view.read_u16(address);
            let base = if long_mode {
                view.read_u64(address.wrapping_add(2))
            } else {
                view.read_u32(address.wrapping_add(2)) as u64
            };

            view.vmwrite(base_field, base);
            view.vmwrite(limit_field, limit as u64);
        }
    }

    Ok(ExitType::IncrementRIP)
}

/// Handles SLDT, STR, LLDT and LTR.
///
/// LTR also marks the TSS descriptor busy in the guest's GDT, as the processor does.
pub fn handle_ldtr_or_tr_access<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let info = LdtrOrTrInstInformation::from(platform.vmread(ro::VMEXIT_INSTRUCTION_INFO) as u32);
    let instruction = info.instruction();

    let selector_field = match instruction {
        LdtrOrTrInstruction::Sldt | LdtrOrTrInstruction::Lldt => guest::LDTR_SELECTOR,
        LdtrOrTrInstruction::Str | LdtrOrTrInstruction::Ltr => guest::TR_SELECTOR,
    };

    if info.register_access() {
        let register = info.register1() as u64;
        trace!("{:?} register {} RIP={:#x}", instruction, register, guest.ip);

        match instruction {
            LdtrOrTrInstruction::Sldt | LdtrOrTrInstruction::Str => {
                let selector = platform.vmread(selector_field) as u16;
                guest.registers.get_mut(register)?.set_bits(0..16, selector as u64);
            }
            LdtrOrTrInstruction::Lldt | LdtrOrTrInstruction::Ltr => {
                let selector = guest.registers.get(register)? as u16;
                load_selector(guest, platform, instruction, selector_field, selector);
            }
        }

        return Ok(ExitType::IncrementRIP);
    }

    let displacement = platform.vmread(ro::EXIT_QUALIFICATION);
    let address = effective_address(guest, platform, &info.memory_operand(), displacement)?;

    trace!("{:?} [{:#x}] RIP={:#x}", instruction, address, guest.ip);

    match instruction {
        LdtrOrTrInstruction::Sldt | LdtrOrTrInstruction::Str => {
            let selector = platform.vmread(selector_field) as u16;
            let cr3 = kernel_cr3(platform, guest.processor_data.guest_identity);
            GuestAddressSpace::new(platform, cr3).write_u16(address, selector);
        }
        LdtrOrTrInstruction::Lldt | LdtrOrTrInstruction::Ltr => {
            let cr3 = kernel_cr3(platform, guest.processor_data.guest_identity);
            let selector = GuestAddressSpace::new(platform, cr3).read_u16(address);
            load_selector(guest, platform, instruction, selector_field, selector);
        }
    }

    Ok(ExitType::IncrementRIP)
}

fn load_selector<P: Platform>(
    guest: &GuestContext,
    platform: &mut P,
    instruction: LdtrOrTrInstruction,
    selector_field: u32,
    selector: u16,
) {
    platform.vmwrite(selector_field, selector as u64);

    if instruction == LdtrOrTrInstruction::Ltr {
        let descriptor = platform
            .vmread(guest::GDTR_BASE)
            .wrapping_add((selector >> 3) as u64 * SEGMENT_DESCRIPTOR_SIZE)
            .wrapping_add(DESCRIPTOR_TYPE_BYTE);
        let cr3 = kernel_cr3(platform, guest.processor_data.guest_identity);
        let mut view = GuestAddressSpace::new(platform, cr3);
        let type_byte = view.read_u8(descriptor);
        view.write_u8(descriptor, type_byte | TSS_BUSY);
    }
}
