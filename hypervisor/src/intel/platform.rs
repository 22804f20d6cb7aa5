//! The privileged operations the VM-exit handlers are built on.
//!
//! Handlers never execute VMX, MSR, port or control-register instructions
//! directly; they go through [`Platform`]. [`crate::intel::support::HardwarePlatform`]
//! is the implementation used in VMX root operation.

use {
    crate::error::{BugCheck, BugCheckCode},
    x86::cpuid::CpuIdResult,
};

/// Operand width of a port I/O access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoWidth {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl IoWidth {
    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            1 => Some(IoWidth::Byte),
            2 => Some(IoWidth::Word),
            4 => Some(IoWidth::Dword),
            _ => None,
        }
    }

    pub fn bytes(self) -> u64 {
        self as u64
    }

    /// Mask selecting the bits of a register the access reads or writes.
    pub fn mask(self) -> u64 {
        match self {
            IoWidth::Byte => 0xFF,
            IoWidth::Word => 0xFFFF,
            IoWidth::Dword => 0xFFFF_FFFF,
        }
    }
}

pub trait Platform {
    fn vmread(&self, field: u32) -> u64;
    fn vmwrite(&mut self, field: u32, value: u64);

    fn rdmsr(&mut self, msr: u32) -> u64;
    fn wrmsr(&mut self, msr: u32, value: u64);

    fn cpuid(&mut self, leaf: u32, sub_leaf: u32) -> CpuIdResult;

    fn rdtsc(&mut self) -> u64;

    /// Returns the time-stamp counter and IA32_TSC_AUX.
    fn rdtscp(&mut self) -> (u64, u32);

    fn xsetbv(&mut self, xcr: u32, value: u64);

    /// Reads DR0-DR3 or DR6.
    fn read_dr(&mut self, index: u8) -> u64;

    /// Writes DR0-DR3 or DR6.
    fn write_dr(&mut self, index: u8, value: u64);

    fn write_cr2(&mut self, value: u64);
    fn read_cr3(&self) -> u64;
    fn write_cr3(&mut self, value: u64);
    fn read_cr8(&self) -> u64;
    fn write_cr8(&mut self, value: u64);

    fn lgdt(&mut self, base: u64, limit: u16);
    fn lidt(&mut self, base: u64, limit: u16);

    fn invept_global(&mut self);
    fn invvpid_all_contexts(&mut self);
    fn invvpid_single_context_retaining_globals(&mut self, vpid: u16);
    fn invvpid_individual_address(&mut self, vpid: u16, address: u64);

    /// Writes back and invalidates the processor's internal caches.
    fn invalidate_caches(&mut self);

    fn io_in(&mut self, port: u16, width: IoWidth) -> u32;
    fn io_out(&mut self, port: u16, width: IoWidth, value: u32);

    /// INS: reads `count` elements from `port` into memory at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be writable for `count` elements in the current address space.
    unsafe fn io_in_string(&mut self, port: u16, width: IoWidth, address: u64, count: u64);

    /// OUTS: writes `count` elements from memory at `address` to `port`.
    ///
    /// # Safety
    ///
    /// `address` must be readable for `count` elements in the current address space.
    unsafe fn io_out_string(&mut self, port: u16, width: IoWidth, address: u64, count: u64);

    /// Copies from virtual `address` in the current address space.
    ///
    /// # Safety
    ///
    /// `address` must be readable for `buffer.len()` bytes in the current address space.
    unsafe fn read_memory(&mut self, address: u64, buffer: &mut [u8]);

    /// Copies to virtual `address` in the current address space.
    ///
    /// # Safety
    ///
    /// `address` must be writable for `data.len()` bytes in the current address space.
    unsafe fn write_memory(&mut self, address: u64, data: &[u8]);

    /// Copies from guest physical memory.
    fn read_physical(&mut self, address: u64, buffer: &mut [u8]);

    fn current_irql(&self) -> u8;
    fn raise_irql(&mut self, irql: u8);
    fn lower_irql(&mut self, irql: u8);

    /// Halts the system. Never returns.
    ///
    /// The default panics, which is what host-side tests observe.
    fn bug_check(&mut self, code: BugCheckCode, parameter1: u64, parameter2: u64, parameter3: u64) -> ! {
        panic!("{}", BugCheck { code, parameters: [parameter1, parameter2, parameter3] })
    }
}
