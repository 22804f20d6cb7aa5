//! Decoding of the hardware-reported VM-exit information.
//!
//! Exit reasons, interruption types and vectors, and the reason-specific
//! exit qualification and VM-exit instruction-information layouts.

use {bit_field::BitField, bitfield::bitfield};

/// Basic exit reasons, the low 16 bits of the VM-exit reason field.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    VmEntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
}

impl VmxBasicExitReason {
    /// Extracts the basic exit reason from the 32-bit VM-exit reason field.
    ///
    /// Returns `None` for reserved or not yet known encodings.
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmxBasicExitReason::*;

        const KNOWN: [VmxBasicExitReason; 62] = [
            ExceptionOrNmi, ExternalInterrupt, TripleFault, InitSignal, StartupIpi, IoSystemManagementInterrupt,
            OtherSmi, InterruptWindow, NmiWindow, TaskSwitch, Cpuid, Getsec, Hlt, Invd, Invlpg, Rdpmc, Rdtsc, Rsm,
            Vmcall, Vmclear, Vmlaunch, Vmptrld, Vmptrst, Vmread, Vmresume, Vmwrite, Vmxoff, Vmxon,
            ControlRegisterAccesses, MovDr, IoInstruction, Rdmsr, Wrmsr, VmEntryFailureInvalidGuestState,
            VmEntryFailureMsrLoading, Mwait, MonitorTrapFlag, Monitor, Pause, VmEntryFailureMachineCheckEvent,
            TprBelowThreshold, ApicAccess, VirtualizedEoi, AccessToGdtrOrIdtr, AccessToLdtrOrTr, EptViolation,
            EptMisconfiguration, Invept, Rdtscp, VmxPreemptionTimerExpired, Invvpid, WbinvdOrWbnoinvd, Xsetbv,
            ApicWrite, Rdrand, Invpcid, Vmfunc, Encls, Rdseed, PageModificationLogFull, Xsaves, Xrstors,
        ];

        let basic_exit_reason = value.get_bits(0..16) as u16;
        KNOWN.iter().copied().find(|reason| *reason as u16 == basic_exit_reason)
    }
}

/// Interruption types of the VM-exit and VM-entry interruption-information fields.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

/// Exception vectors injected or re-injected by the handlers.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionInterrupt {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    InvalidOpcode = 6,
    GeneralProtectionFault = 13,
    PageFault = 14,
}

bitfield! {
    /// VM-Exit Interruption-Information field, valid for exception and NMI exits.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-19. Format of the VM-Exit Interruption-Information Field
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct VmExitInterruptionInformation(u32);
    impl Debug;
    pub vector, _: 7, 0;
    pub interruption_type, _: 10, 8;
    pub error_code_valid, _: 11;
    pub nmi_unblocking, _: 12;
    pub valid, _: 31;
}

/// Access types of a control-register access exit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// Exit qualification for control-register accesses.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControlRegAccessExitQualification {
    pub control_reg: u64,
    pub access_type: CrAccessType,
    pub lmsw_operand_in_memory: bool,
    pub gpr_mov_cr: u64,
    pub lmsw_source_data: u64,
}

impl ControlRegAccessExitQualification {
    pub fn from_exit_qualification(qualification: u64) -> Self {
        let access_type = match qualification.get_bits(4..6) {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        };

        Self {
            control_reg: qualification.get_bits(0..4),
            access_type,
            lmsw_operand_in_memory: qualification.get_bit(6),
            gpr_mov_cr: qualification.get_bits(8..12),
            lmsw_source_data: qualification.get_bits(16..32),
        }
    }
}

bitfield! {
    /// Exit qualification for MOV DR.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-4. Exit Qualification for MOV DR
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct MovDrQualification(u64);
    impl Debug;
    pub debug_register, _: 2, 0;
    /// 0 = MOV to DR, 1 = MOV from DR.
    pub direction_from_dr, _: 4;
    pub gp_register, _: 11, 8;
}

bitfield! {
    /// Exit qualification for I/O instructions.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct IoInstQualification(u64);
    impl Debug;
    /// 0 = 1-byte, 1 = 2-byte, 3 = 4-byte.
    pub size_of_access, _: 2, 0;
    /// 0 = OUT, 1 = IN.
    pub direction_in, _: 3;
    pub string_instruction, _: 4;
    pub rep_prefixed, _: 5;
    pub operand_encoding_immediate, _: 6;
    pub u16, port_number, _: 31, 16;
}

impl IoInstQualification {
    /// Width of the access in bytes, or `None` for a reserved encoding.
    pub fn access_width(&self) -> Option<u32> {
        match self.size_of_access() {
            0 => Some(1),
            1 => Some(2),
            3 => Some(4),
            _ => None,
        }
    }
}

/// Instruction identity of a GDTR/IDTR access exit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GdtrOrIdtrInstruction {
    Sgdt,
    Sidt,
    Lgdt,
    Lidt,
}

/// Instruction identity of an LDTR/TR access exit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LdtrOrTrInstruction {
    Sldt,
    Str,
    Lldt,
    Ltr,
}

bitfield! {
    /// VM-exit instruction information for LIDT, LGDT, SIDT and SGDT.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-10. Format of the VM-Exit Instruction-Information Field as Used for LIDT, LGDT, SIDT, or SGDT
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct GdtrOrIdtrInstInformation(u32);
    impl Debug;
    pub scaling, _: 1, 0;
    /// 0 = 16-bit, 1 = 32-bit, 2 = 64-bit.
    pub address_size, _: 9, 7;
    /// 0 = 16-bit, 1 = 32-bit.
    pub operand_size_32, _: 11;
    pub segment_register, _: 17, 15;
    pub index_register, _: 21, 18;
    pub index_register_invalid, _: 22;
    pub base_register, _: 26, 23;
    pub base_register_invalid, _: 27;
    pub instruction_identity, _: 29, 28;
}

impl GdtrOrIdtrInstInformation {
    pub fn instruction(&self) -> GdtrOrIdtrInstruction {
        match self.instruction_identity() {
            0 => GdtrOrIdtrInstruction::Sgdt,
            1 => GdtrOrIdtrInstruction::Sidt,
            2 => GdtrOrIdtrInstruction::Lgdt,
            _ => GdtrOrIdtrInstruction::Lidt,
        }
    }

    pub fn memory_operand(&self) -> MemoryOperand {
        MemoryOperand {
            scaling: self.scaling(),
            address_size: self.address_size(),
            segment_register: self.segment_register(),
            index_register: (!self.index_register_invalid()).then(|| self.index_register() as u64),
            base_register: (!self.base_register_invalid()).then(|| self.base_register() as u64),
        }
    }
}

bitfield! {
    /// VM-exit instruction information for LLDT, LTR, SLDT and STR.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-11. Format of the VM-Exit Instruction-Information Field as Used for LLDT, LTR, SLDT, and STR
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct LdtrOrTrInstInformation(u32);
    impl Debug;
    pub scaling, _: 1, 0;
    pub register1, _: 6, 3;
    pub address_size, _: 9, 7;
    /// 0 = memory operand, 1 = register operand.
    pub register_access, _: 10;
    pub segment_register, _: 17, 15;
    pub index_register, _: 21, 18;
    pub index_register_invalid, _: 22;
    pub base_register, _: 26, 23;
    pub base_register_invalid, _: 27;
    pub instruction_identity, _: 29, 28;
}

impl LdtrOrTrInstInformation {
    pub fn instruction(&self) -> LdtrOrTrInstruction {
        match self.instruction_identity() {
            0 => LdtrOrTrInstruction::Sldt,
            1 => LdtrOrTrInstruction::Str,
            2 => LdtrOrTrInstruction::Lldt,
            _ => LdtrOrTrInstruction::Ltr,
        }
    }

    pub fn memory_operand(&self) -> MemoryOperand {
        MemoryOperand {
            scaling: self.scaling(),
            address_size: self.address_size(),
            segment_register: self.segment_register(),
            index_register: (!self.index_register_invalid()).then(|| self.index_register() as u64),
            base_register: (!self.base_register_invalid()).then(|| self.base_register() as u64),
        }
    }
}

/// Raw VMCS field values to their decoded views.
macro_rules! impl_from_raw {
    ($($name:ident($raw:ty)),* $(,)?) => {
        $(
            impl From<$raw> for $name {
                fn from(value: $raw) -> Self {
                    Self(value)
                }
            }
        )*
    };
}

impl_from_raw! {
    VmExitInterruptionInformation(u32),
    MovDrQualification(u64),
    IoInstQualification(u64),
    GdtrOrIdtrInstInformation(u32),
    LdtrOrTrInstInformation(u32),
}

/// Addressing-mode fields of a memory operand, common to the descriptor-table
/// instruction-information formats.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryOperand {
    /// 0 = no scaling, 1 = 2, 2 = 4, 3 = 8.
    pub scaling: u32,
    pub address_size: u32,
    pub segment_register: u32,
    pub index_register: Option<u64>,
    pub base_register: Option<u64>,
}

/// Address-size encoding of 32-bit operands.
pub const ADDRESS_SIZE_32BIT: u32 = 1;
