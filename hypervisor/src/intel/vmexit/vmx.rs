//! VMX instruction VM-exit handler.
//!
//! The guest is never allowed to use VMX itself. Every VMX instruction other
//! than VMCALL fails with VMfailInvalid and has no other effect.

use {
    crate::{
        error::HypervisorError,
        intel::{
            platform::Platform,
            vmexit::{ExitType, GuestContext},
        },
    },
    log::trace,
    x86::vmx::vmcs::guest,
    x86_64::registers::rflags::RFlags,
};

/// Arithmetic flags through which VMX instructions report their outcome.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.2 CONVENTIONS
pub const VMX_STATUS_FLAGS: RFlags = RFlags::CARRY_FLAG
    .union(RFlags::PARITY_FLAG)
    .union(RFlags::AUXILIARY_CARRY_FLAG)
    .union(RFlags::ZERO_FLAG)
    .union(RFlags::SIGN_FLAG)
    .union(RFlags::OVERFLOW_FLAG);

/// Handles VMCLEAR, VMLAUNCH, VMPTRLD, VMPTRST, VMREAD, VMRESUME, VMWRITE,
/// VMXOFF, VMXON, INVEPT and INVVPID by reporting VMfailInvalid.
pub fn handle_vmx_instruction<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    trace!("VMX instruction at RIP {:#x}, reporting VMfailInvalid", guest.ip);

    guest.flags.remove(VMX_STATUS_FLAGS);
    guest.flags.insert(RFlags::CARRY_FLAG);
    platform.vmwrite(guest::RFLAGS, guest.flags.bits());

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
    };

    #[test]
    fn test_reports_fail_invalid() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters::default();
        let mut platform = MockPlatform::new();
        // ZF, SF, PF, IF and the reserved bit.
        platform.vmcs.insert(guest::RFLAGS, 0x2C6);
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_vmx_instruction(&mut guest, &mut platform), Ok(ExitType::IncrementRIP));
        assert_eq!(platform.vmcs_value(guest::RFLAGS), 0x203);
        assert_eq!(platform.vmcs_value(guest::RIP), 0x1000);
    }
}
