//! Errors that terminate VM-exit handling.
//!
//! Recoverable guest faults never show up here: they are turned into injected
//! exceptions by the handlers. Everything in [`HypervisorError`] ends in a bug
//! check once the trampoline sees it.

use thiserror::Error;

/// Identifies why the monitor halted the system.
///
/// The discriminants are the values reported as the bug check code.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BugCheckCode {
    /// An unspecified bug occurred.
    Unspecified = 0,
    /// An unexpected VM-exit occurred.
    UnexpectedVmExit = 1,
    /// A triple fault VM-exit occurred.
    TripleFaultVmExit = 2,
    /// VMRESUME or VMXOFF has failed.
    CriticalVmxInstructionFailure = 4,
    /// EPT misconfiguration VM-exit occurred.
    EptMisconfigVmExit = 5,
}

impl core::fmt::Display for BugCheckCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let description = match self {
            BugCheckCode::Unspecified => "unspecified",
            BugCheckCode::UnexpectedVmExit => "unexpected VM-exit",
            BugCheckCode::TripleFaultVmExit => "triple fault VM-exit",
            BugCheckCode::CriticalVmxInstructionFailure => "critical VMX instruction failure",
            BugCheckCode::EptMisconfigVmExit => "EPT misconfiguration VM-exit",
        };
        write!(f, "{:#x}: {}", *self as u32, description)
    }
}

/// A bug check code with its three parameters, as written to the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BugCheck {
    pub code: BugCheckCode,
    pub parameters: [u64; 3],
}

impl core::fmt::Display for BugCheck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let [parameter1, parameter2, parameter3] = self.parameters;
        write!(f, "bug check {}: {:#x} {:#x} {:#x}", self.code, parameter1, parameter2, parameter3)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("triple fault in the guest at RIP {guest_rip:#x}")]
    TripleFault { guest_rip: u64 },

    #[error("unexpected VM exit {reason:#x} at RIP {guest_rip:#x} (qualification {qualification:#x})")]
    UnexpectedVmExit { reason: u32, guest_rip: u64, qualification: u64 },

    #[error("monitor trap flag VM exit at RIP {guest_rip:#x}")]
    MonitorTrapFlag { guest_rip: u64 },

    #[error("EPT misconfiguration at guest physical address {guest_physical_address:#x}")]
    EptMisconfiguration { guest_physical_address: u64, entry: Option<u64> },

    #[error("cannot re-inject vector {vector} of interruption type {interruption_type}")]
    UnhandledException { vector: u32, interruption_type: u32 },

    #[error("unsupported access type {access_type} to CR{control_register}")]
    InvalidControlRegisterAccess { access_type: u64, control_register: u64 },

    #[error("general-purpose register index {0} is out of range")]
    InvalidRegisterIndex(u64),

    #[error("segment register index {0} is out of range")]
    InvalidSegmentRegister(u32),

    #[error("I/O access size encoding {0} is invalid")]
    InvalidIoAccessSize(u64),

    #[error("VMX instruction failed with error {vm_instruction_error} at guest RIP {guest_rip:#x}")]
    VmxInstructionFailed { vm_instruction_error: u64, guest_rip: u64 },
}

impl HypervisorError {
    /// Returns the bug check code and its three parameters for this error.
    ///
    /// `context` is the address of the exit's guest context. It is reported
    /// for the exit-reason based fatal conditions so a dump can locate the
    /// register file.
    pub fn bug_check_parameters(&self, context: u64) -> (BugCheckCode, u64, u64, u64) {
        match *self {
            HypervisorError::TripleFault { guest_rip } => (BugCheckCode::TripleFaultVmExit, context, guest_rip, 0),
            HypervisorError::UnexpectedVmExit { guest_rip, qualification, .. } => {
                (BugCheckCode::UnexpectedVmExit, context, guest_rip, qualification)
            }
            HypervisorError::MonitorTrapFlag { guest_rip } => (BugCheckCode::UnexpectedVmExit, context, guest_rip, 0),
            HypervisorError::EptMisconfiguration { guest_physical_address, entry } => {
                (BugCheckCode::EptMisconfigVmExit, guest_physical_address, entry.unwrap_or(0), 0)
            }
            HypervisorError::VmxInstructionFailed { vm_instruction_error, guest_rip } => {
                (BugCheckCode::CriticalVmxInstructionFailure, vm_instruction_error, guest_rip, 0)
            }
            HypervisorError::UnhandledException { .. }
            | HypervisorError::InvalidControlRegisterAccess { .. }
            | HypervisorError::InvalidRegisterIndex(_)
            | HypervisorError::InvalidSegmentRegister(_)
            | HypervisorError::InvalidIoAccessSize(_) => (BugCheckCode::Unspecified, 0, 0, 0),
        }
    }
}
