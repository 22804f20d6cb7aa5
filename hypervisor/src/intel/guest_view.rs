//! Scoped access to guest virtual memory.
//!
//! Descriptor-table, task-register and string I/O emulation dereference guest
//! linear addresses. [`GuestAddressSpace`] loads the guest's kernel page tables
//! into CR3 for as long as it lives and restores the host's CR3 when dropped,
//! on every path out of the handler.

use {
    crate::intel::platform::Platform,
    bit_field::BitField,
    core::ops::{Deref, DerefMut},
    log::trace,
    x86::vmx::vmcs::guest,
};

/// Resolves facts about the guest thread that caused the current VM-exit.
pub trait GuestIdentity {
    /// Kernel directory table base of the current guest process.
    fn kernel_directory_table_base(&self) -> u64;
}

/// Returns a CR3 value that maps the guest's kernel address space.
///
/// The guest CR3 is used as is, unless bit 0 is set, in which case it is a user
/// CR3 under kernel page-table isolation and the process's kernel directory
/// table base is used instead.
pub fn kernel_cr3<P: Platform>(platform: &P, identity: &dyn GuestIdentity) -> u64 {
    let guest_cr3 = platform.vmread(guest::CR3);
    if guest_cr3.get_bit(0) { identity.kernel_directory_table_base() } else { guest_cr3 }
}

/// Guard that keeps the guest's address space loaded.
pub struct GuestAddressSpace<'a, P: Platform> {
    platform: &'a mut P,
    host_cr3: u64,
}

impl<'a, P: Platform> GuestAddressSpace<'a, P> {
    pub fn new(platform: &'a mut P, guest_cr3: u64) -> Self {
        let host_cr3 = platform.read_cr3();
        trace!("Switching CR3 {:#x} -> {:#x}", host_cr3, guest_cr3);
        platform.write_cr3(guest_cr3);
        Self { platform, host_cr3 }
    }

    pub fn read_bytes<const N: usize>(&mut self, address: u64) -> [u8; N] {
        let mut buffer = [0u8; N];
        unsafe { self.platform.read_memory(address, &mut buffer) };
        buffer
    }

    pub fn write_bytes(&mut self, address: u64, data: &[u8]) {
        unsafe { self.platform.write_memory(address, data) };
    }

    pub fn read_u8(&mut self, address: u64) -> u8 {
        self.read_bytes::<1>(address)[0]
    }

    pub fn read_u16(&mut self, address: u64) -> u16 {
        u16::from_le_bytes(self.read_bytes(address))
    }

    pub fn read_u32(&mut self, address: u64) -> u32 {
        u32::from_le_bytes(self.read_bytes(address))
    }

    pub fn read_u64(&mut self, address: u64) -> u64 {
        u64::from_le_bytes(self.read_bytes(address))
    }

    pub fn write_u8(&mut self, address: u64, value: u8) {
        self.write_bytes(address, &[value]);
    }

    pub fn write_u16(&mut self, address: u64, value: u16) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write_bytes(address, &value.to_le_bytes());
    }
}

impl<P: Platform> Deref for GuestAddressSpace<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.platform
    }
}

impl<P: Platform> DerefMut for GuestAddressSpace<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.platform
    }
}

impl<P: Platform> Drop for GuestAddressSpace<'_, P> {
    fn drop(&mut self) {
        self.platform.write_cr3(self.host_cr3);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::mock::{MockIdentity, MockPlatform},
    };

    #[test]
    fn test_cr3_is_restored_on_drop() {
        let mut platform = MockPlatform::new();
        platform.cr3 = 0x1000;

        {
            let mut view = GuestAddressSpace::new(&mut platform, 0x7000);
            view.write_u32(0x40, 0xdead_beef);
            assert_eq!(view.read_u32(0x40), 0xdead_beef);
            assert_eq!(view.read_cr3(), 0x7000);
        }

        assert_eq!(platform.cr3, 0x1000);
        assert_eq!(platform.cr3_writes, [0x7000, 0x1000]);
        assert!(platform.memory_access_cr3.iter().all(|&cr3| cr3 == 0x7000));
    }

    #[test]
    fn test_cr3_is_restored_on_early_return() {
        fn store_then_bail(platform: &mut MockPlatform) -> Option<()> {
            let mut view = GuestAddressSpace::new(platform, 0x9000);
            view.write_u8(0x10, 1);
            None::<()>?;
            view.write_u8(0x11, 2);
            Some(())
        }

        let mut platform = MockPlatform::new();
        platform.cr3 = 0x2000;
        assert!(store_then_bail(&mut platform).is_none());
        assert_eq!(platform.cr3, 0x2000);
        assert_eq!(platform.memory.get(&0x11), None);
    }

    #[test]
    fn test_kernel_cr3_for_user_cr3() {
        let mut platform = MockPlatform::new();
        let identity = MockIdentity { kernel_cr3: 0x1ab000 };

        platform.vmcs.insert(guest::CR3, 0x5000);
        assert_eq!(kernel_cr3(&platform, &identity), 0x5000);

        platform.vmcs.insert(guest::CR3, 0x6001);
        assert_eq!(kernel_cr3(&platform, &identity), 0x1ab000);
    }
}
