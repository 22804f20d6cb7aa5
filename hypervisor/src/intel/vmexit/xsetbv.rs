//! XSETBV VM-exit handler. Guests execute it while resuming from sleep.

use {
    crate::{
        error::HypervisorError,
        intel::{
            platform::Platform,
            vmexit::{ExitType, GuestContext},
        },
    },
    log::trace,
};

/// Handles XSETBV: XCR[ECX] = EDX:EAX.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: XSETBV—Set Extended Control Register
pub fn handle_xsetbv<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let xcr = guest.registers.rcx as u32;
    let value = ((guest.registers.rdx & 0xFFFF_FFFF) << 32) | (guest.registers.rax & 0xFFFF_FFFF);

    trace!("XSETBV XCR{} = {:#x}", xcr, value);
    platform.xsetbv(xcr, value);

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
    fn test_xsetbv_combines_edx_eax() {
        let collaborators = Collaborators::new();
        let mut processor_data = collaborators.processor_data();
        let mut registers = GuestRegisters {
            rcx: 0xFFFF_FFFF_0000_0000,
            rdx: 0xDEAD_0000_0000_0001,
            rax: 0xBEEF_0000_0000_0007,
            ..Default::default()
        };
        let mut platform = MockPlatform::new();
        let mut guest = GuestContext::capture(&mut registers, &mut processor_data, &platform, 0, 2);

        assert_eq!(handle_xsetbv(&mut guest, &mut platform), Ok(ExitType::IncrementRIP));
        assert_eq!(platform.xcr_writes, [(0, 0x1_0000_0007)]);
    }
}
