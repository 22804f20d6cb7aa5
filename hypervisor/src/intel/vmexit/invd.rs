//! INVD VM-exit handler.

use {
    crate::{
        error::HypervisorError,
        intel::{
            platform::Platform,
            vmexit::{ExitType, GuestContext},
        },
    },
    log::debug,
};

/// Handles INVD by executing WBINVD.
///
/// INVD discards modified cache lines, which the monitor's own data may share
/// with the guest. Writing them back first is a superset of what the guest asked for.
pub fn handle_invd<P: Platform>(guest: &mut GuestContext, platform: &mut P) -> Result<ExitType, HypervisorError> {
    debug!("INVD at RIP {:#x}, executing WBINVD", guest.ip);
    platform.invalidate_caches();
    Ok(ExitType::IncrementRIP)
}
