//! MOV DR VM-exit handler.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 18.2 DEBUG REGISTERS

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::{inject_db, inject_gp, inject_ud},
            platform::Platform,
            vmerror::MovDrQualification,
            vmexit::{ExitType, GuestContext, guest_cpl, is_guest_64bit},
        },
    },
    bit_field::BitField,
    log::{debug, trace},
    x86::vmx::vmcs::{guest, ro},
    x86_64::registers::control::Cr4Flags,
};

/// DR6.B0-B3, the breakpoint condition bits.
const DR6_BREAKPOINT_CONDITIONS: core::ops::Range<usize> = 0..4;
/// DR6.BD, set when a #DB is caused by general detect.
const DR6_BD: usize = 13;
/// DR7.GD, general detect enable.
const DR7_GD: usize = 13;

/// Forces the always-1 and always-0 bits of a DR6 value.
///
/// Bits 4-11 and 17-31 read as 1, bit 12 reads as 0. Bit 16 (RTM) is kept.
pub fn fix_dr6(value: u64) -> u64 {
    let mut value = value;
    value.set_bits(4..12, 0xFF);
    value.set_bit(12, false);
    value.set_bits(17..32, 0x7FFF);
    value
}

/// Forces the always-1 and always-0 bits of a DR7 value.
///
/// Bit 10 reads as 1, bits 12, 14 and 15 read as 0. Bit 11 (RTM) is kept.
pub fn fix_dr7(value: u64) -> u64 {
    let mut value = value;
    value.set_bit(10, true);
    value.set_bit(12, false);
    value.set_bits(14..16, 0);
    value
}

/// Handles MOV to and from DR0-DR7.
///
/// DR0-DR3 and DR6 are the processor's registers; DR7 lives in the VMCS.
pub fn handle_dr_access<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    // MOV DR at CPL > 0 exits before the processor checks privilege, so the
    // #GP(0) it would have raised is delivered here.
    if guest_cpl(platform) != 0 {
        debug!("MOV DR at CPL {} RIP {:#x}, injecting #GP(0)", guest_cpl(platform), guest.ip);
        inject_gp(guest, platform, 0);
        return Ok(ExitType::Continue);
    }

    let qualification = MovDrQualification::from(platform.vmread(ro::EXIT_QUALIFICATION));
    let mut debug_register = qualification.debug_register() as u8;

    // DR4 and DR5 alias DR6 and DR7 unless CR4.DE is set.
    if debug_register == 4 || debug_register == 5 {
        let cr4 = Cr4Flags::from_bits_retain(platform.vmread(guest::CR4));
        if cr4.contains(Cr4Flags::DEBUGGING_EXTENSIONS) {
            debug!("MOV DR{} with CR4.DE set, injecting #UD", debug_register);
            inject_ud(guest, platform);
            return Ok(ExitType::Continue);
        }
        debug_register += 2;
    }

    let mut dr7 = platform.vmread(guest::DR7);
    if dr7.get_bit(DR7_GD) {
        debug!("MOV DR{} with DR7.GD set, injecting #DB", debug_register);

        let mut dr6 = platform.read_dr(6);
        dr6.set_bits(DR6_BREAKPOINT_CONDITIONS, 0);
        dr6.set_bit(DR6_BD, true);
        platform.write_dr(6, dr6);

        inject_db(guest, platform);

        // The processor clears GD on delivering the #DB but not in the VMCS copy.
        dr7.set_bit(DR7_GD, false);
        platform.vmwrite(guest::DR7, dr7);
        return Ok(ExitType::Continue);
    }

    let register = qualification.gp_register();

    if qualification.direction_from_dr() {
        let value = match debug_register {
            7 => platform.vmread(guest::DR7),
            _ => platform.read_dr(debug_register),
        };
        trace!("MOV R{}, DR{} = {:#x}", register, debug_register, value);
        guest.registers.set(register, value)?;
    } else {
        let mut value = guest.registers.get(register)?;
        trace!("MOV DR{}, R{} = {:#x}", debug_register, register, value);

        // Outside 64-bit mode the operand is 32 bits wide.
        if !is_guest_64bit(platform) {
            value = value.get_bits(0..32);
        } else if (debug_register == 6 || debug_register == 7) && value.get_bits(32..64) != 0 {
            debug!("MOV DR{} with reserved upper bits {:#x}, injecting #GP(0)", debug_register, value);
            inject_gp(guest, platform, 0);
            return Ok(ExitType::Continue);
        }

        match debug_register {
            6 => platform.write_dr(6, fix_dr6(value)),
            7 => platform.vmwrite(guest::DR7, fix_dr7(value)),
            _ => platform.write_dr(debug_register, value),
        }
    }

    Ok(ExitType::IncrementRIP)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{
            capture::GuestRegisters,
            mock::{Collaborators, MockPlatform},
        },
        x86::vmx::vmcs::control,
    };

    fn mov_dr(debug_register: u64, from_dr: bool, register: u64) -> u64 {
        debug_register | ((from_dr as u64) << 4) | (register << 8)
    }

    #[test]
    fn test_fixed_bits() {
        assert_eq!(fix_dr6(0), 0xFFFE_0FF0);
        assert_eq!(fix_dr6(0x1_1000), 0xFFFF_0FF0);
        assert_eq!(fix_dr7(0), 0x400);
        assert_eq!(fix_dr7(0xF000 | 0x800 | 0x1), 0x2C01);
    }

    #[test]
    fn test_user_mode_access_injects_gp_without_advancing() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters { rax: 0x1234, ..Default::default() };
        let mut platform = MockPlatform::new();
        // DPL 3 stack segment.
        platform.vmcs.insert(guest::SS_ACCESS_RIGHTS, 0xF3);
        platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(0, false, 0));
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_dr_access(&mut guest, &mut platform), Ok(ExitType::Continue));
        assert_eq!(platform.vmcs_value(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0B0D);
        assert_eq!(platform.vmcs_value(control::VMENTRY_EXCEPTION_ERR_CODE), 0);
        assert!(platform.dr_writes.is_empty());
    }

    #[test]
    fn test_dr4_with_debug_extensions_injects_ud() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters::default();
        let mut platform = MockPlatform::new();
        platform.vmcs.insert(guest::CR4, 0x2008);
        platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(4, true, 0));
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_dr_access(&mut guest, &mut platform), Ok(ExitType::Continue));
        assert_eq!(platform.vmcs_value(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0306);
        assert!(platform.dr_reads.is_empty());
    }

    #[test]
    fn test_dr5_aliases_dr7() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters::default();
        let mut platform = MockPlatform::new();
        platform.vmcs.insert(guest::DR7, 0x455);
        platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(5, true, 3));
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_dr_access(&mut guest, &mut platform), Ok(ExitType::IncrementRIP));
        assert_eq!(registers.rbx, 0x455);
    }

    #[test]
    fn test_general_detect() {
        for from_dr in [false, true] {
            let collaborators = Collaborators::new();
            let mut processor_data = collaborators.processor_data();
            let mut registers = GuestRegisters { rcx: 0xdead, ..Default::default() };
            let mut platform = MockPlatform::new();
            platform.vmcs.insert(guest::DR7, 0x2401);
            platform.dr[6] = 0xFFFF_0FF5;
            platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(1, from_dr, 1));
            let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

            assert_eq!(handle_dr_access(&mut guest, &mut platform), Ok(ExitType::Continue));
            assert_eq!(platform.vmcs_value(guest::DR7), 0x401);
            assert_eq!(platform.dr[6], 0xFFFF_2FF0);
            assert_eq!(platform.vmcs_value(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0301);
            assert_eq!(platform.dr[1], 0);
            assert_eq!(platform.dr_writes, [(6, 0xFFFF_2FF0)]);
            assert_eq!(registers.rcx, 0xdead);
        }
    }

    #[test]
    fn test_upper_bits_in_dr7_inject_gp() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters { rdx: 0x1_0000_0400, ..Default::default() };
        let mut platform = MockPlatform::new();
        platform.vmcs.insert(guest::DR7, 0x400);
        platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(7, false, 2));
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_dr_access(&mut guest, &mut platform), Ok(ExitType::Continue));
        assert_eq!(platform.vmcs_value(guest::DR7), 0x400);
        assert_eq!(platform.vmcs_value(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0B0D);
    }

    #[test]
    fn test_upper_bits_in_dr7_are_ignored_outside_64bit_mode() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters { rdx: 0xFFFF_FFFF_0000_0401, ..Default::default() };
        let mut platform = MockPlatform::new();
        platform.vmcs.insert(guest::CS_ACCESS_RIGHTS, 0xC09B);
        platform.vmcs.insert(guest::DR7, 0x400);
        platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(7, false, 2));
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_dr_access(&mut guest, &mut platform), Ok(ExitType::IncrementRIP));
        assert_eq!(platform.vmcs_value(guest::DR7), 0x401);
        assert!(!platform.vmcs.contains_key(&control::VMENTRY_INTERRUPTION_INFO_FIELD));
    }

    #[test]
    fn test_writes_enforce_fixed_bits() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters { rax: 0x1, r8: 0xFFFF_F800_0000_1000, ..Default::default() };
        let mut platform = MockPlatform::new();
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(7, false, 0));
        assert_eq!(handle_dr_access(&mut guest, &mut platform), Ok(ExitType::IncrementRIP));
        assert_eq!(platform.vmcs_value(guest::DR7), 0x401);

        platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(6, false, 0));
        handle_dr_access(&mut guest, &mut platform).unwrap();
        assert_eq!(platform.dr[6], 0xFFFE_0FF1);

        platform.vmcs.insert(ro::EXIT_QUALIFICATION, mov_dr(3, false, 8));
        handle_dr_access(&mut guest, &mut platform).unwrap();
        assert_eq!(platform.dr[3], 0xFFFF_F800_0000_1000);
    }
}
