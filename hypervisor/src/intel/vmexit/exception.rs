//! Exception or NMI VM-exit handler.
//!
//! Only exceptions selected in the exception bitmap exit here. They are
//! reflected back into the guest unchanged so its own handlers run.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::inject_interruption,
            platform::Platform,
            vmerror::{ExceptionInterrupt, InterruptionType, VmExitInterruptionInformation},
            vmexit::{ExitType, GuestContext, exit_instruction_length},
        },
    },
    log::info,
    x86::vmx::vmcs::{control, ro},
};

/// Re-injects the exception that caused the VM-exit.
///
/// #PF and #GP keep their error codes, and #PF also restores CR2 from the
/// exit qualification. #BP from INT3 is re-raised as a software exception so
/// that the return address pushed for the guest follows the instruction.
pub fn handle_exception<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let information = VmExitInterruptionInformation::from(platform.vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32);
    let vector = information.vector();
    let interruption_type = information.interruption_type();

    let unhandled = HypervisorError::UnhandledException { vector, interruption_type };

    if interruption_type == InterruptionType::HardwareException as u32 {
        let error_code = platform.vmread(ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32;

        if vector == ExceptionInterrupt::PageFault as u32 {
            let fault_address = platform.vmread(ro::EXIT_QUALIFICATION);
            inject_interruption(guest, platform, InterruptionType::HardwareException, vector, Some(error_code));
            info!("GuestIp= {:#x}, #PF Fault= {:#x} Code= {:#x}", guest.ip, fault_address, error_code);
            platform.write_cr2(fault_address);
        } else if vector == ExceptionInterrupt::GeneralProtectionFault as u32 {
            inject_interruption(guest, platform, InterruptionType::HardwareException, vector, Some(error_code));
            info!("GuestIp= {:#x}, #GP Code= {:#x}", guest.ip, error_code);
        } else {
            return Err(unhandled);
        }
    } else if interruption_type == InterruptionType::SoftwareException as u32 && vector == ExceptionInterrupt::Breakpoint as u32 {
        inject_interruption(guest, platform, InterruptionType::SoftwareException, vector, None);
        info!("GuestIp= {:#x}, #BP", guest.ip);
        platform.vmwrite(control::VMENTRY_INSTRUCTION_LEN, exit_instruction_length(platform));
    } else {
        return Err(unhandled);
    }

    Ok(ExitType::Continue)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{
            capture::GuestRegisters,
            mock::{Collaborators, MockPlatform},
        },
        x86::vmx::vmcs::guest,
    };

    #[test]
    fn test_page_fault_is_reinjected_with_cr2() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters::default();
        let mut platform = MockPlatform::new();
        platform.vmcs.insert(ro::VMEXIT_INTERRUPTION_INFO, 0x8000_0B0E);
        platform.vmcs.insert(ro::VMEXIT_INTERRUPTION_ERR_CODE, 0x2);
        platform.vmcs.insert(ro::EXIT_QUALIFICATION, 0x7FF6_1234_5678);
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_exception(&mut guest, &mut platform), Ok(ExitType::Continue));
        assert_eq!(platform.vmcs_value(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0B0E);
        assert_eq!(platform.vmcs_value(control::VMENTRY_EXCEPTION_ERR_CODE), 0x2);
        assert_eq!(platform.cr2, 0x7FF6_1234_5678);
        assert_eq!(platform.vmcs_value(guest::RIP), 0x1000);
    }

    #[test]
    fn test_general_protection_is_reinjected() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters::default();
        let mut platform = MockPlatform::new();
        platform.vmcs.insert(ro::VMEXIT_INTERRUPTION_INFO, 0x8000_0B0D);
        platform.vmcs.insert(ro::VMEXIT_INTERRUPTION_ERR_CODE, 0x10);
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_exception(&mut guest, &mut platform), Ok(ExitType::Continue));
        assert_eq!(platform.vmcs_value(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0B0D);
        assert_eq!(platform.vmcs_value(control::VMENTRY_EXCEPTION_ERR_CODE), 0x10);
        assert_eq!(platform.cr2, 0);
    }

    #[test]
    fn test_breakpoint_is_reinjected_as_software_exception() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters::default();
        let mut platform = MockPlatform::new();
        platform.vmcs.insert(ro::VMEXIT_INTERRUPTION_INFO, 0x8000_0603);
        platform.vmcs.insert(ro::VMEXIT_INSTRUCTION_LEN, 1);
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_exception(&mut guest, &mut platform), Ok(ExitType::Continue));
        assert_eq!(platform.vmcs_value(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0603);
        assert_eq!(platform.vmcs_value(control::VMENTRY_INSTRUCTION_LEN), 1);
        assert_eq!(platform.vmcs.get(&control::VMENTRY_EXCEPTION_ERR_CODE), None);
    }

    #[test]
    fn test_other_exceptions_are_fatal() {
        // #UD as a hardware exception, then an NMI.
        for (information, vector, interruption_type) in [(0x8000_0306u64, 6, 3), (0x8000_0202, 2, 2)] {
            let collaborators = Collaborators::new();
            let mut processor_data = collaborators.processor_data();
            let mut registers = GuestRegisters::default();
            let mut platform = MockPlatform::new();
            platform.vmcs.insert(ro::VMEXIT_INTERRUPTION_INFO, information);
            let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

            assert_eq!(
                handle_exception(&mut guest, &mut platform),
                Err(HypervisorError::UnhandledException { vector, interruption_type })
            );
            assert_eq!(platform.vmcs.get(&control::VMENTRY_INTERRUPTION_INFO_FIELD), None);
        }
    }
}
