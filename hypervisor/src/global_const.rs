//! Constants shared by the VM-exit handlers.

/// The priority level at which ordinary interrupts and thread dispatching are blocked.
pub const DISPATCH_LEVEL: u8 = 2;

/// How many VM-exits each processor keeps in its history ring.
pub const VM_EXIT_HISTORY_CAPACITY: usize = 100;

/// Error code of the #GP injected for an access to an unimplemented MSR.
pub const INVALID_MSR_ERROR_CODE: u32 = 0x6A;

/// MSR read by VMware's idle loop (PpmIdleGuestExecute) when running nested.
pub const VMWARE_IDLE_MSR: u32 = 0x4000_00F0;

/// Hypercall numbers, passed in ECX on VMCALL.
pub const HYPERCALL_TERMINATE_VMM: u32 = 0;
pub const HYPERCALL_PING_VMM: u32 = 1;
pub const HYPERCALL_GET_SHARED_PROCESSOR_DATA: u32 = 2;

/// Maximum basic CPUID leaf reported to the guest.
pub const CPUID_MAX_BASIC_LEAF: u32 = 0x10;

/// "GenuineIntel" as returned in EBX, EDX, ECX by CPUID leaf 0.
pub const CPUID_VENDOR_EBX: u32 = u32::from_le_bytes(*b"Genu");
pub const CPUID_VENDOR_EDX: u32 = u32::from_le_bytes(*b"ineI");
pub const CPUID_VENDOR_ECX: u32 = u32::from_le_bytes(*b"ntel");
