//! VMCALL VM-exit handler: the guest-to-monitor hypercall interface.
//!
//! ECX carries the hypercall number and RDX a pointer-sized context. A call
//! succeeds with CF and ZF clear; an unsuccessful call raises #UD in the guest,
//! the same as VMCALL outside of VMX non-root operation.

use {
    crate::{
        error::HypervisorError,
        global_const::{HYPERCALL_GET_SHARED_PROCESSOR_DATA, HYPERCALL_PING_VMM, HYPERCALL_TERMINATE_VMM},
        intel::{
            events::inject_ud,
            guest_view::{GuestAddressSpace, kernel_cr3},
            platform::Platform,
            vmexit::{ExitType, GuestContext, exit_instruction_length, guest_cpl, vmx::VMX_STATUS_FLAGS},
        },
    },
    log::{debug, info},
    x86::vmx::vmcs::{control, guest},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Hypercall {
    /// Leave VMX operation on this processor.
    TerminateVmm,
    /// Liveness probe.
    PingVmm,
    /// Store the address of the shared processor data at the context address.
    GetSharedProcessorData,
}

impl Hypercall {
    fn from_u32(number: u32) -> Option<Self> {
        match number {
            HYPERCALL_TERMINATE_VMM => Some(Hypercall::TerminateVmm),
            HYPERCALL_PING_VMM => Some(Hypercall::PingVmm),
            HYPERCALL_GET_SHARED_PROCESSOR_DATA => Some(Hypercall::GetSharedProcessorData),
            _ => None,
        }
    }
}

/// Handles a VMCALL VM-exit.
pub fn handle_vmcall<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let number = guest.registers.rcx as u32;
    let context = guest.registers.rdx;

    let Some(hypercall) = Hypercall::from_u32(number) else {
        debug!("Unsupported hypercall {:#x} at RIP {:#x}", number, guest.ip);
        return Ok(indicate_unsuccessful_vmcall(guest, platform));
    };

    match hypercall {
        Hypercall::TerminateVmm => {
            if guest_cpl(platform) != 0 {
                debug!("Termination requested at CPL {}", guest_cpl(platform));
                return Ok(indicate_unsuccessful_vmcall(guest, platform));
            }
            Ok(terminate(guest, platform, context))
        }
        Hypercall::PingVmm => {
            info!("Pong by VMM! (context = {:#x})", context);
            Ok(indicate_successful_vmcall(guest, platform))
        }
        Hypercall::GetSharedProcessorData => {
            let shared_data = guest.processor_data.shared_data_address();
            let cr3 = kernel_cr3(platform, guest.processor_data.guest_identity);
            GuestAddressSpace::new(platform, cr3).write_u64(context, shared_data);
            Ok(indicate_successful_vmcall(guest, platform))
        }
    }
}

fn indicate_successful_vmcall<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> ExitType {
    guest.flags.remove(VMX_STATUS_FLAGS);
    platform.vmwrite(guest::RFLAGS, guest.flags.bits());
    ExitType::IncrementRIP
}

/// Raises #UD on the VMCALL itself; RIP stays on the instruction.
fn indicate_unsuccessful_vmcall<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> ExitType {
    inject_ud(guest, platform);
    platform.vmwrite(control::VMENTRY_INSTRUCTION_LEN, exit_instruction_length(platform));
    ExitType::Continue
}

/// Prepares the return to the guest without VMX.
///
/// The trampoline skips VMRESUME; after VMXOFF the entry stub restores RFLAGS
/// from RAX, switches to the stack in RDX and jumps to the address in RCX.
fn terminate<P: Platform>(guest: &mut GuestContext, platform: &mut P, context: u64) -> ExitType {
    // VM-exit sets the GDTR and IDTR limits to 0xFFFF. VMRESUME would reload
    // them from the VMCS, but nothing will, so restore them here.
    let (gdt_base, gdt_limit) = (platform.vmread(guest::GDTR_BASE), platform.vmread(guest::GDTR_LIMIT) as u16);
    let (idt_base, idt_limit) = (platform.vmread(guest::IDTR_BASE), platform.vmread(guest::IDTR_LIMIT) as u16);
    platform.lgdt(gdt_base, gdt_limit);
    platform.lidt(idt_base, idt_limit);

    let processor_data = guest.processor_data.address();
    // The caller is the monitor's own kernel-mode unload path; `context` is
    // mapped in the current address space.
    unsafe { platform.write_memory(context, &processor_data.to_le_bytes()) };
    debug!("Context at {:#x} {:#x}", context, processor_data);

    let return_address = guest.ip.wrapping_add(exit_instruction_length(platform));

    // RFLAGS is replaced after VMXOFF, so report success through the saved copy.
    guest.flags.remove(VMX_STATUS_FLAGS);

    guest.registers.rcx = return_address;
    guest.registers.rdx = guest.registers.rsp;
    guest.registers.rax = guest.flags.bits();
    guest.vm_continue = false;

    ExitType::ExitHypervisor
}
