//! VM-exit trampoline and dispatcher.
//!
//! The entry stub saves the guest's general-purpose registers and calls into
//! [`handle_vmexit`], which captures the guest context, routes the exit to its
//! handler and applies the handler's [`ExitType`]. Fatal conditions end in a
//! bug check after the guest state and the exit history have been dumped.

use {
    crate::{
        error::HypervisorError,
        global_const::DISPATCH_LEVEL,
        intel::{
            capture::{GuestRegisters, TrapFrame},
            events::advance_guest_rip,
            platform::Platform,
            processor::ProcessorData,
            vmerror::VmxBasicExitReason,
            vmexit::{
                ExitType, GuestContext,
                cpuid::handle_cpuid,
                cr::handle_cr_reg_access,
                descriptor_table::{handle_gdtr_or_idtr_access, handle_ldtr_or_tr_access},
                diagnostics::{VmExitRecord, dump_guest_state},
                dr::handle_dr_access,
                ept_violation::{handle_ept_misconfiguration, handle_ept_violation},
                exception::handle_exception,
                invd::handle_invd,
                invlpg::handle_invlpg,
                io::handle_io_instruction,
                msr::{MsrAccessType, handle_msr_access},
                rdtsc::{handle_rdtsc, handle_rdtscp},
                vmcall::handle_vmcall,
                vmx::handle_vmx_instruction,
                xsetbv::handle_xsetbv,
            },
        },
    },
    log::*,
    x86::vmx::vmcs::{guest, ro},
};

/// Handles one VM-exit.
///
/// Returns `true` when the guest is resumed with VMRESUME and `false` when the
/// monitor has been terminated and the stub must leave VMX operation.
pub fn handle_vmexit<P: Platform>(
    registers: &mut GuestRegisters,
    trap_frame: &mut TrapFrame,
    processor_data: &mut ProcessorData,
    platform: &mut P,
) -> bool {
    // The exit may have interrupted the guest at any IRQL. Handlers must not
    // be preempted, so run at least at DISPATCH_LEVEL.
    let guest_irql = platform.current_irql();
    let guest_cr8 = platform.read_cr8();
    if guest_irql < DISPATCH_LEVEL {
        platform.raise_irql(DISPATCH_LEVEL);
    }

    // RSP is not saved by the processor into the register file.
    registers.rsp = platform.vmread(guest::RSP);

    let mut guest = GuestContext::capture(registers, processor_data, platform, guest_cr8, guest_irql);

    // Makes a debugger or crash dump see the guest's stack and the exiting instruction.
    trap_frame.sp = guest.registers.rsp;
    trap_frame.ip = guest.ip;

    let exit_reason = platform.vmread(ro::EXIT_REASON) as u32;

    if guest.processor_data.config().record_vm_exits {
        let record = VmExitRecord {
            registers: *guest.registers,
            ip: guest.ip,
            exit_reason,
            qualification: platform.vmread(ro::EXIT_QUALIFICATION),
            instruction_info: platform.vmread(ro::VMEXIT_INSTRUCTION_INFO),
        };
        guest.processor_data.exit_history.record(record);
    }

    match dispatch(&mut guest, platform, exit_reason) {
        Ok(ExitType::IncrementRIP) => advance_guest_rip(&mut guest, platform),
        Ok(ExitType::Continue) => {}
        Ok(ExitType::ExitHypervisor) => debug!("Leaving VMX operation at RIP {:#x}", guest.ip),
        Err(error) => {
            error!("Fatal VM-exit {:#x} at RIP {:#x}: {}", exit_reason, guest.ip, error);
            dump_guest_state(platform);
            guest.processor_data.exit_history.dump();

            let context = &*guest.registers as *const GuestRegisters as u64;
            let (code, parameter1, parameter2, parameter3) = error.bug_check_parameters(context);
            platform.bug_check(code, parameter1, parameter2, parameter3);
        }
    }

    // Translations tagged with the guest's EPTP and VPID outlive VMX operation.
    if !guest.vm_continue {
        platform.invept_global();
        platform.invvpid_all_contexts();
    }

    if guest_irql < DISPATCH_LEVEL {
        platform.lower_irql(guest_irql);
    }

    // Handlers may have changed the guest's TPR through MOV to CR8.
    platform.write_cr8(guest.cr8);

    guest.vm_continue
}

/// Routes a VM-exit to its handler.
fn dispatch<P: Platform>(guest: &mut GuestContext, platform: &mut P, exit_reason: u32) -> Result<ExitType, HypervisorError> {
    let Some(basic_exit_reason) = VmxBasicExitReason::from_u32(exit_reason) else {
        return Err(unexpected_vmexit(guest, platform, exit_reason));
    };

    trace!("VM-exit {:?} at RIP {:#x}", basic_exit_reason, guest.ip);

    match basic_exit_reason {
        VmxBasicExitReason::ExceptionOrNmi => handle_exception(guest, platform),
        VmxBasicExitReason::TripleFault => Err(HypervisorError::TripleFault { guest_rip: guest.ip }),
        VmxBasicExitReason::Cpuid => handle_cpuid(guest, platform),
        VmxBasicExitReason::Invd => handle_invd(guest, platform),
        VmxBasicExitReason::Invlpg => handle_invlpg(guest, platform),
        VmxBasicExitReason::Rdtsc => handle_rdtsc(guest, platform),
        VmxBasicExitReason::Rdtscp => handle_rdtscp(guest, platform),
        VmxBasicExitReason::ControlRegisterAccesses => handle_cr_reg_access(guest, platform),
        VmxBasicExitReason::MovDr => handle_dr_access(guest, platform),
        VmxBasicExitReason::IoInstruction => handle_io_instruction(guest, platform),
        VmxBasicExitReason::Rdmsr => handle_msr_access(guest, platform, MsrAccessType::Read),
        VmxBasicExitReason::Wrmsr => handle_msr_access(guest, platform, MsrAccessType::Write),
        VmxBasicExitReason::MonitorTrapFlag => Err(HypervisorError::MonitorTrapFlag { guest_rip: guest.ip }),
        VmxBasicExitReason::AccessToGdtrOrIdtr => handle_gdtr_or_idtr_access(guest, platform),
        VmxBasicExitReason::AccessToLdtrOrTr => handle_ldtr_or_tr_access(guest, platform),
        VmxBasicExitReason::EptViolation => handle_ept_violation(guest, platform),
        VmxBasicExitReason::EptMisconfiguration => handle_ept_misconfiguration(guest, platform),
        VmxBasicExitReason::Vmcall => handle_vmcall(guest, platform),
        VmxBasicExitReason::Vmclear
        | VmxBasicExitReason::Vmlaunch
        | VmxBasicExitReason::Vmptrld
        | VmxBasicExitReason::Vmptrst
        | VmxBasicExitReason::Vmread
        | VmxBasicExitReason::Vmresume
        | VmxBasicExitReason::Vmwrite
        | VmxBasicExitReason::Vmxoff
        | VmxBasicExitReason::Vmxon
        | VmxBasicExitReason::Invept
        | VmxBasicExitReason::Invvpid => handle_vmx_instruction(guest, platform),
        VmxBasicExitReason::Xsetbv => handle_xsetbv(guest, platform),
        _ => Err(unexpected_vmexit(guest, platform, exit_reason)),
    }
}

fn unexpected_vmexit<P: Platform>(guest: &GuestContext, platform: &P, exit_reason: u32) -> HypervisorError {
    HypervisorError::UnexpectedVmExit {
        reason: exit_reason,
        guest_rip: guest.ip,
        qualification: platform.vmread(ro::EXIT_QUALIFICATION),
    }
}
