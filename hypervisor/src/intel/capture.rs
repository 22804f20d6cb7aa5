//! Guest register file captured by the VM-exit entry stub.

use {
    crate::{error::HypervisorError, intel::processor::ProcessorData},
    static_assertions::const_assert_eq,
};

/// General-purpose registers of the guest at the time of the VM-exit.
///
/// Fields are laid out in the order the processor numbers them in exit
/// qualifications and instruction information (RAX = 0 ... R15 = 15), which
/// is also the order the entry stub stores them in.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 16 * 8);

impl GuestRegisters {
    /// Reads the register with the given hardware index.
    pub fn get(&self, index: u64) -> Result<u64, HypervisorError> {
        let value = match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => return Err(HypervisorError::InvalidRegisterIndex(index)),
        };
        Ok(value)
    }

    /// Returns a mutable reference to the register with the given hardware index.
    pub fn get_mut(&mut self, index: u64) -> Result<&mut u64, HypervisorError> {
        let register = match index {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            _ => return Err(HypervisorError::InvalidRegisterIndex(index)),
        };
        Ok(register)
    }

    /// Writes the register with the given hardware index.
    pub fn set(&mut self, index: u64, value: u64) -> Result<(), HypervisorError> {
        *self.get_mut(index)? = value;
        Ok(())
    }
}

/// The part of the trap frame a debugger uses to walk the interrupted stack.
///
/// The trampoline points it at the guest's stack and instruction pointer, so a
/// crash dump taken while handling an exit shows the guest's call stack.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TrapFrame {
    pub sp: u64,
    pub ip: u64,
}

/// Layout of the host stack when the entry stub calls into Rust.
///
/// The monitor setup leaves a pointer to the processor's [`ProcessorData`] at
/// the top of the host stack; the stub reserves the trap frame below it and
/// pushes the guest registers below that.
#[repr(C)]
pub struct VmExitStack {
    pub registers: GuestRegisters,
    pub trap_frame: TrapFrame,
    pub processor_data: *mut ProcessorData<'static>,
}

const_assert_eq!(core::mem::size_of::<VmExitStack>(), 16 * 8 + 2 * 8 + 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_order_matches_hardware_encoding() {
        let mut registers = GuestRegisters::default();
        for index in 0..16 {
            registers.set(index, 0x100 + index).unwrap();
        }

        assert_eq!(registers.rax, 0x100);
        assert_eq!(registers.rsp, 0x104);
        assert_eq!(registers.rdi, 0x107);
        assert_eq!(registers.r8, 0x108);
        assert_eq!(registers.r15, 0x10f);
        assert_eq!(registers.get(5).unwrap(), 0x105);
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let mut registers = GuestRegisters::default();
        assert_eq!(registers.get(16), Err(HypervisorError::InvalidRegisterIndex(16)));
        assert!(registers.get_mut(0xff).is_err());
        assert!(registers.set(16, 1).is_err());
        assert_eq!(registers, GuestRegisters::default());
    }
}
