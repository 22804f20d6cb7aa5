//! Contract with the extended page table (EPT) engine.
//!
//! The EPT hierarchy itself, and the policy for EPT violations, belong to the
//! memory-virtualization component. The VM-exit path only needs two things
//! from it: a way to hand over a violation, and a way to look up the entry that
//! maps a guest-physical address when the hardware reports a misconfiguration.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)

use bitfield::bitfield;

/// Opaque per-processor handle to the EPT engine's data.
#[repr(transparent)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EptDataHandle(pub u64);

pub trait EptEngine {
    /// Handles an EPT violation for the processor owning `ept_data`.
    ///
    /// The engine decides whether the faulting access is retried, emulated or
    /// redirected; the caller resumes the guest unchanged afterwards.
    fn handle_ept_violation(&self, ept_data: EptDataHandle);

    /// Returns the raw EPT entry mapping `guest_physical_address`, if any.
    fn get_ept_pt_entry(&self, ept_data: EptDataHandle, guest_physical_address: u64) -> Option<u64>;
}

bitfield! {
    /// Decoded view of an EPT paging-structure entry, used to describe a
    /// misconfigured entry before halting.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 29-6. Format of an EPT Page-Table Entry that Maps a 4-KByte Page
    #[derive(Clone, Copy)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, _: 0;
    pub writable, _: 1;
    pub executable, _: 2;
    pub memory_type, _: 5, 3;
    pub ignore_pat, _: 6;
    pub large, _: 7;
    pub pfn, _: 51, 12;
}

impl From<u64> for Entry {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Entry {
    /// Write-only and write-execute permissions are reserved combinations.
    pub fn has_reserved_permissions(&self) -> bool {
        self.writable() && !self.readable()
    }

    /// Memory types 2, 3 and 7 are reserved in leaf entries.
    pub fn has_reserved_memory_type(&self) -> bool {
        matches!(self.memory_type(), 2 | 3 | 7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_decoding() {
        // RWX, write-back, 4 KiB page at 0x1234000
        let entry = Entry(0x1234_000 | (6 << 3) | 0b111);
        assert!(entry.readable() && entry.writable() && entry.executable());
        assert_eq!(entry.memory_type(), 6);
        assert_eq!(entry.pfn(), 0x1234);
        assert!(!entry.has_reserved_permissions());
        assert!(!entry.has_reserved_memory_type());
    }

    #[test]
    fn test_reserved_encodings() {
        assert!(Entry(0b010).has_reserved_permissions());
        assert!(Entry(0b001 | (2 << 3)).has_reserved_memory_type());
    }
}
