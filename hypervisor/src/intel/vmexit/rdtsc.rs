//! RDTSC and RDTSCP VM-exit handlers.

use crate::{
    error::HypervisorError,
    intel::{
        platform::Platform,
        vmexit::{ExitType, GuestContext},
    },
};

fn deliver_tsc(guest: &mut GuestContext, tsc: u64) {
    guest.registers.rdx = tsc >> 32;
    guest.registers.rax = tsc & 0xFFFF_FFFF;
}

/// Handles RDTSC: EDX:EAX = time-stamp counter.
pub fn handle_rdtsc<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let tsc = platform.rdtsc();
    deliver_tsc(guest, tsc);

    Ok(ExitType::IncrementRIP)
}

/// Handles RDTSCP: EDX:EAX = time-stamp counter, ECX = IA32_TSC_AUX.
pub fn handle_rdtscp<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let (tsc, aux) = platform.rdtscp();
    deliver_tsc(guest, tsc);
    guest.registers.rcx = aux as u64;

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
    fn test_rdtsc_splits_counter() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters { rax: u64::MAX, rdx: u64::MAX, rcx: 0x55, ..Default::default() };
        let mut platform = MockPlatform::new();
        platform.tsc = 0x0000_1234_8765_4321;
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_rdtsc(&mut guest, &mut platform), Ok(ExitType::IncrementRIP));
        assert_eq!(registers.rdx, 0x1234);
        assert_eq!(registers.rax, 0x8765_4321);
        assert_eq!(registers.rcx, 0x55);
    }

    #[test]
    fn test_rdtscp_delivers_aux() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters::default();
        let mut platform = MockPlatform::new();
        platform.tsc = 0xAAAA_BBBB_CCCC_DDDD;
        platform.tsc_aux = 3;
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        handle_rdtscp(&mut guest, &mut platform).unwrap();

        assert_eq!((registers.rdx, registers.rax, registers.rcx), (0xAAAA_BBBB, 0xCCCC_DDDD, 3));
    }
}
