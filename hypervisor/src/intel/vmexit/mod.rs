//! VM-exit handlers, one module per trapped operation class.

use {
    crate::intel::{capture::GuestRegisters, platform::Platform, processor::ProcessorData},
    bit_field::BitField,
    x86::vmx::vmcs::{guest, ro},
    x86_64::registers::rflags::RFlags,
};

pub mod cpuid;
pub mod cr;
pub mod descriptor_table;
pub mod diagnostics;
pub mod dr;
pub mod ept_violation;
pub mod exception;
pub mod invd;
pub mod invlpg;
pub mod io;
pub mod msr;
pub mod rdtsc;
pub mod vmcall;
pub mod vmx;
pub mod xsetbv;

/// What the dispatcher does with the guest after a handler returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitType {
    /// Move RIP past the trapped instruction, honoring single-step.
    IncrementRIP,
    /// Leave RIP alone; the handler injected an event or a collaborator owns the outcome.
    Continue,
    /// Leave VMX operation and return to the guest without virtualization.
    ExitHypervisor,
}

/// State of the guest for the duration of one VM-exit.
pub struct GuestContext<'a, 'p> {
    pub registers: &'a mut GuestRegisters,
    pub processor_data: &'a mut ProcessorData<'p>,
    pub flags: RFlags,
    pub ip: u64,
    /// CR8 of the interrupted guest, written back when the exit completes.
    pub cr8: u64,
    /// IRQL on entry to the trampoline.
    pub irql: u8,
    pub vm_continue: bool,
    /// Set once an event has been queued for VM-entry during this exit.
    pub event_injected: bool,
}

impl<'a, 'p> GuestContext<'a, 'p> {
    pub fn capture<P: Platform>(
        registers: &'a mut GuestRegisters,
        processor_data: &'a mut ProcessorData<'p>,
        platform: &P,
        cr8: u64,
        irql: u8,
    ) -> Self {
        Self {
            registers,
            processor_data,
            flags: RFlags::from_bits_retain(platform.vmread(guest::RFLAGS)),
            ip: platform.vmread(guest::RIP),
            cr8,
            irql,
            vm_continue: true,
            event_injected: false,
        }
    }
}

/// Privilege level of the guest, the DPL of its SS.
pub fn guest_cpl<P: Platform>(platform: &P) -> u8 {
    platform.vmread(guest::SS_ACCESS_RIGHTS).get_bits(5..7) as u8
}

pub fn exit_instruction_length<P: Platform>(platform: &P) -> u64 {
    platform.vmread(ro::VMEXIT_INSTRUCTION_LEN)
}

/// Whether CS is a 64-bit code segment (CS.L).
pub fn is_guest_64bit<P: Platform>(platform: &P) -> bool {
    platform.vmread(guest::CS_ACCESS_RIGHTS).get_bit(13)
}
