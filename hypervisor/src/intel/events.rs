//! Event injection and guest RIP advancement.
//!
//! At most one event can be queued for VM-entry per exit. The first injection
//! wins; later attempts during the same exit are logged and dropped.

use {
    crate::intel::{
        platform::Platform,
        vmerror::{ExceptionInterrupt, InterruptionType},
        vmexit::{GuestContext, exit_instruction_length},
    },
    bitfield::bitfield,
    log::{trace, warn},
    x86::vmx::vmcs::{control, guest},
    x86_64::registers::rflags::RFlags,
};

bitfield! {
    /// Represents the VM-Entry Interruption-Information Field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.8.3 VM-Entry Controls for Event Injection
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct EventInjection(u32);

    impl Debug;

    /// Vector of interrupt or exception
    pub get_vector, set_vector: 7, 0;

    /// Interruption type (see [`InterruptionType`])
    pub get_type, set_type: 10, 8;

    /// Deliver error code (0 = do not deliver; 1 = deliver)
    pub get_deliver_error_code, set_deliver_error_code: 11;

    // Reserved: 30:12

    /// Valid
    pub get_valid, set_valid: 31;
}

impl EventInjection {
    pub fn new(interruption_type: InterruptionType, vector: u32, deliver_error_code: bool) -> Self {
        let mut event = EventInjection(0);

        event.set_vector(vector);
        event.set_type(interruption_type as u32);
        event.set_deliver_error_code(deliver_error_code);
        event.set_valid(true);

        event
    }
}

/// Queues an event for delivery on the next VM-entry.
///
/// Returns `false` without touching the VMCS if an event was already queued
/// during this exit.
pub fn inject_interruption<P: Platform>(
    guest: &mut GuestContext,
    platform: &mut P,
    interruption_type: InterruptionType,
    vector: u32,
    error_code: Option<u32>,
) -> bool {
    let event = EventInjection::new(interruption_type, vector, error_code.is_some());

    if guest.event_injected {
        warn!("Dropping {:?}: an event is already pending for this VM-entry", event);
        return false;
    }

    trace!("Injecting {:?} error_code={:?}", event, error_code);

    if let Some(error_code) = error_code {
        platform.vmwrite(control::VMENTRY_EXCEPTION_ERR_CODE, error_code as u64);
    }
    platform.vmwrite(control::VMENTRY_INTERRUPTION_INFO_FIELD, event.0 as u64);
    guest.event_injected = true;

    true
}

/// Injects #GP with `error_code`.
pub fn inject_gp<P: Platform>(guest: &mut GuestContext, platform: &mut P, error_code: u32) {
    inject_interruption(
        guest,
        platform,
        InterruptionType::HardwareException,
        ExceptionInterrupt::GeneralProtectionFault as u32,
        Some(error_code),
    );
}

/// Injects #UD.
pub fn inject_ud<P: Platform>(guest: &mut GuestContext, platform: &mut P) {
    inject_interruption(guest, platform, InterruptionType::HardwareException, ExceptionInterrupt::InvalidOpcode as u32, None);
}

/// Injects #DB.
pub fn inject_db<P: Platform>(guest: &mut GuestContext, platform: &mut P) {
    inject_interruption(guest, platform, InterruptionType::HardwareException, ExceptionInterrupt::Debug as u32, None);
}

/// Moves the guest RIP past the trapped instruction.
///
/// If the guest is single-stepping (RFLAGS.TF), the #DB it expects after the
/// instruction is injected as well.
pub fn advance_guest_rip<P: Platform>(guest: &mut GuestContext, platform: &mut P) {
    let instruction_length = exit_instruction_length(platform);
    platform.vmwrite(guest::RIP, guest.ip.wrapping_add(instruction_length));

    if guest.flags.contains(RFlags::TRAP_FLAG) {
        let queued = inject_interruption(guest, platform, InterruptionType::HardwareException, ExceptionInterrupt::Debug as u32, None);
        if queued {
            platform.vmwrite(control::VMENTRY_INSTRUCTION_LEN, instruction_length);
        }
    }
}
