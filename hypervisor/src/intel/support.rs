//! Real-hardware implementation of [`Platform`] and the instruction wrappers it uses.
//!
//! Everything here executes privileged instructions and is only meaningful in
//! VMX root operation at CPL 0.

use {
    crate::{
        error::{BugCheck, BugCheckCode},
        intel::platform::{IoWidth, Platform},
    },
    core::arch::asm,
    log::error,
    x86::{
        bits64::vmx,
        controlregs,
        cpuid::CpuIdResult,
        dtables::{DescriptorTablePointer, lgdt, lidt},
        io, msr,
    },
};

/// INVEPT / INVVPID descriptor.
#[repr(C, align(16))]
struct InvalidationDescriptor {
    low: u64,
    high: u64,
}

const INVEPT_ALL_CONTEXT: u64 = 2;
const INVVPID_INDIVIDUAL_ADDRESS: u64 = 0;
const INVVPID_ALL_CONTEXT: u64 = 2;
const INVVPID_SINGLE_CONTEXT_RETAINING_GLOBALS: u64 = 3;

/// Reads a VMCS field of the current VMCS.
pub fn vmread(field: u32) -> u64 {
    unsafe { vmx::vmread(field) }.unwrap_or_else(|error| {
        error!("VMREAD {:#x} failed: {:?}", field, error);
        0
    })
}

/// Writes a VMCS field of the current VMCS.
pub fn vmwrite<T: Into<u64>>(field: u32, value: T) {
    let value = value.into();
    if let Err(error) = unsafe { vmx::vmwrite(field, value) } {
        error!("VMWRITE {:#x} = {:#x} failed: {:?}", field, value, error);
    }
}

pub fn rdmsr(msr: u32) -> u64 {
    unsafe { msr::rdmsr(msr) }
}

pub fn wrmsr(msr: u32, value: u64) {
    unsafe { msr::wrmsr(msr, value) };
}

pub fn inb(port: u16) -> u8 {
    unsafe { io::inb(port) }
}

pub fn outb(port: u16, value: u8) {
    unsafe { io::outb(port, value) };
}

fn invvpid(invalidation_type: u64, descriptor: &InvalidationDescriptor) {
    unsafe {
        asm!("invvpid {0}, [{1}]", in(reg) invalidation_type, in(reg) descriptor, options(nostack));
    }
}

fn invept(invalidation_type: u64, descriptor: &InvalidationDescriptor) {
    unsafe {
        asm!("invept {0}, [{1}]", in(reg) invalidation_type, in(reg) descriptor, options(nostack));
    }
}

/// [`Platform`] backed by the processor the code is running on.
///
/// The host is expected to identity-map physical memory, so guest physical
/// addresses handed to [`Platform::read_physical`] are dereferenced as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwarePlatform;

impl Platform for HardwarePlatform {
    fn vmread(&self, field: u32) -> u64 {
        vmread(field)
    }

    fn vmwrite(&mut self, field: u32, value: u64) {
        vmwrite(field, value)
    }

    fn rdmsr(&mut self, msr: u32) -> u64 {
        rdmsr(msr)
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        wrmsr(msr, value)
    }

    fn cpuid(&mut self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        x86::cpuid::cpuid!(leaf, sub_leaf)
    }

    fn rdtsc(&mut self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn rdtscp(&mut self) -> (u64, u32) {
        let mut aux = 0u32;
        let tsc = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
        (tsc, aux)
    }

    fn xsetbv(&mut self, xcr: u32, value: u64) {
        unsafe {
            asm!("xsetbv", in("ecx") xcr, in("eax") value as u32, in("edx") (value >> 32) as u32, options(nostack));
        }
    }

    fn read_dr(&mut self, index: u8) -> u64 {
        let value: u64;
        unsafe {
            match index {
                0 => asm!("mov {}, dr0", out(reg) value, options(nomem, nostack)),
                1 => asm!("mov {}, dr1", out(reg) value, options(nomem, nostack)),
                2 => asm!("mov {}, dr2", out(reg) value, options(nomem, nostack)),
                3 => asm!("mov {}, dr3", out(reg) value, options(nomem, nostack)),
                6 => asm!("mov {}, dr6", out(reg) value, options(nomem, nostack)),
                _ => value = 0,
            }
        }
        value
    }

    fn write_dr(&mut self, index: u8, value: u64) {
        unsafe {
            match index {
                0 => asm!("mov dr0, {}", in(reg) value, options(nomem, nostack)),
                1 => asm!("mov dr1, {}", in(reg) value, options(nomem, nostack)),
                2 => asm!("mov dr2, {}", in(reg) value, options(nomem, nostack)),
                3 => asm!("mov dr3, {}", in(reg) value, options(nomem, nostack)),
                6 => asm!("mov dr6, {}", in(reg) value, options(nomem, nostack)),
                _ => error!("DR{} cannot be written directly", index),
            }
        }
    }

    fn write_cr2(&mut self, value: u64) {
        unsafe { asm!("mov cr2, {}", in(reg) value, options(nomem, nostack)) };
    }

    fn read_cr3(&self) -> u64 {
        unsafe { controlregs::cr3() }
    }

    fn write_cr3(&mut self, value: u64) {
        unsafe { controlregs::cr3_write(value) };
    }

    fn read_cr8(&self) -> u64 {
        let value: u64;
        unsafe { asm!("mov {}, cr8", out(reg) value, options(nomem, nostack)) };
        value
    }

    fn write_cr8(&mut self, value: u64) {
        unsafe { asm!("mov cr8, {}", in(reg) value, options(nomem, nostack)) };
    }

    fn lgdt(&mut self, base: u64, limit: u16) {
        let gdtr = DescriptorTablePointer::<u64> { limit, base: base as *const u64 };
        unsafe { lgdt(&gdtr) };
    }

    fn lidt(&mut self, base: u64, limit: u16) {
        let idtr = DescriptorTablePointer::<u64> { limit, base: base as *const u64 };
        unsafe { lidt(&idtr) };
    }

    fn invept_global(&mut self) {
        invept(INVEPT_ALL_CONTEXT, &InvalidationDescriptor { low: 0, high: 0 });
    }

    fn invvpid_all_contexts(&mut self) {
        invvpid(INVVPID_ALL_CONTEXT, &InvalidationDescriptor { low: 0, high: 0 });
    }

    fn invvpid_single_context_retaining_globals(&mut self, vpid: u16) {
        invvpid(INVVPID_SINGLE_CONTEXT_RETAINING_GLOBALS, &InvalidationDescriptor { low: vpid as u64, high: 0 });
    }

    fn invvpid_individual_address(&mut self, vpid: u16, address: u64) {
        invvpid(INVVPID_INDIVIDUAL_ADDRESS, &InvalidationDescriptor { low: vpid as u64, high: address });
    }

    fn invalidate_caches(&mut self) {
        unsafe { asm!("wbinvd", options(nostack)) };
    }

    fn io_in(&mut self, port: u16, width: IoWidth) -> u32 {
        unsafe {
            match width {
                IoWidth::Byte => io::inb(port) as u32,
                IoWidth::Word => io::inw(port) as u32,
                IoWidth::Dword => io::inl(port),
            }
        }
    }

    fn io_out(&mut self, port: u16, width: IoWidth, value: u32) {
        unsafe {
            match width {
                IoWidth::Byte => io::outb(port, value as u8),
                IoWidth::Word => io::outw(port, value as u16),
                IoWidth::Dword => io::outl(port, value),
            }
        }
    }

    unsafe fn io_in_string(&mut self, port: u16, width: IoWidth, address: u64, count: u64) {
        unsafe {
            match width {
                IoWidth::Byte => asm!("rep insb", in("dx") port, inout("rdi") address => _, inout("rcx") count => _, options(nostack)),
                IoWidth::Word => asm!("rep insw", in("dx") port, inout("rdi") address => _, inout("rcx") count => _, options(nostack)),
                IoWidth::Dword => asm!("rep insd", in("dx") port, inout("rdi") address => _, inout("rcx") count => _, options(nostack)),
            }
        }
    }

    unsafe fn io_out_string(&mut self, port: u16, width: IoWidth, address: u64, count: u64) {
        unsafe {
            match width {
                IoWidth::Byte => asm!("rep outsb", in("dx") port, inout("rsi") address => _, inout("rcx") count => _, options(nostack)),
                IoWidth::Word => asm!("rep outsw", in("dx") port, inout("rsi") address => _, inout("rcx") count => _, options(nostack)),
                IoWidth::Dword => asm!("rep outsd", in("dx") port, inout("rsi") address => _, inout("rcx") count => _, options(nostack)),
            }
        }
    }

    unsafe fn read_memory(&mut self, address: u64, buffer: &mut [u8]) {
        unsafe { core::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), buffer.len()) };
    }

    unsafe fn write_memory(&mut self, address: u64, data: &[u8]) {
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len()) };
    }

    fn read_physical(&mut self, address: u64, buffer: &mut [u8]) {
        unsafe { core::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), buffer.len()) };
    }

    // On x64 the IRQL is the task-priority class held in CR8.
    fn current_irql(&self) -> u8 {
        self.read_cr8() as u8
    }

    fn raise_irql(&mut self, irql: u8) {
        self.write_cr8(irql as u64);
    }

    fn lower_irql(&mut self, irql: u8) {
        self.write_cr8(irql as u64);
    }

    /// Logs the bug check and parks the processor with interrupts disabled.
    ///
    /// Unwinding out of VMX root operation is not possible, so this never
    /// panics.
    fn bug_check(&mut self, code: BugCheckCode, parameter1: u64, parameter2: u64, parameter3: u64) -> ! {
        error!("{}", BugCheck { code, parameters: [parameter1, parameter2, parameter3] });
        loop {
            unsafe { asm!("cli; hlt", options(nomem, nostack)) };
        }
    }
}
