//! INVLPG VM-exit handler.

use {
    crate::{
        error::HypervisorError,
        intel::{
            platform::Platform,
            vmexit::{ExitType, GuestContext},
        },
    },
    log::trace,
    x86::vmx::vmcs::{control, ro},
};

/// Handles INVLPG by invalidating the linear address for the guest's VPID.
///
/// The exit qualification holds the linear-address operand.
pub fn handle_invlpg<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    let address = platform.vmread(ro::EXIT_QUALIFICATION);
    let vpid = platform.vmread(control::VPID) as u16;

    trace!("INVLPG {:#x} VPID {} RIP {:#x}", address, vpid, guest.ip);
    platform.invvpid_individual_address(vpid, address);

    Ok(ExitType::IncrementRIP)
}
