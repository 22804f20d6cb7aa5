//! Postmortem aids: the per-processor VM-exit history and the guest-state dump
//! written before the system is halted.

use {
    crate::{
        global_const::VM_EXIT_HISTORY_CAPACITY,
        intel::{capture::GuestRegisters, platform::Platform},
    },
    log::error,
    x86::vmx::vmcs::{control, guest},
};

/// One VM-exit as seen on entry to the dispatcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct VmExitRecord {
    pub registers: GuestRegisters,
    pub ip: u64,
    pub exit_reason: u32,
    pub qualification: u64,
    pub instruction_info: u64,
}

/// Fixed-capacity ring of the most recent VM-exits of one processor.
///
/// Only the owning processor writes it, so no synchronization is involved.
pub struct VmExitHistory {
    records: [VmExitRecord; VM_EXIT_HISTORY_CAPACITY],
    next: usize,
    total: u64,
}

impl Default for VmExitHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl VmExitHistory {
    pub fn new() -> Self {
        Self { records: [VmExitRecord::default(); VM_EXIT_HISTORY_CAPACITY], next: 0, total: 0 }
    }

    /// Overwrites the oldest slot.
    pub fn record(&mut self, record: VmExitRecord) {
        self.records[self.next] = record;
        self.next = (self.next + 1) % VM_EXIT_HISTORY_CAPACITY;
        self.total += 1;
    }

    /// Number of exits recorded since the processor was virtualized.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Recorded exits, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &VmExitRecord> {
        let filled = (self.total as usize).min(VM_EXIT_HISTORY_CAPACITY);
        let start = (self.next + VM_EXIT_HISTORY_CAPACITY - filled) % VM_EXIT_HISTORY_CAPACITY;
        (0..filled).map(move |i| &self.records[(start + i) % VM_EXIT_HISTORY_CAPACITY])
    }

    pub fn dump(&self) {
        error!("=== LAST {} VM-EXITS (of {}) ===", (self.total as usize).min(VM_EXIT_HISTORY_CAPACITY), self.total);
        for (i, record) in self.iter().enumerate() {
            error!(
                "  [{:3}] reason {:#x} RIP {:#x} qualification {:#x} info {:#x} RAX {:#x} RCX {:#x} RDX {:#x} RSP {:#x}",
                i,
                record.exit_reason,
                record.ip,
                record.qualification,
                record.instruction_info,
                record.registers.rax,
                record.registers.rcx,
                record.registers.rdx,
                record.registers.rsp,
            );
        }
    }
}

const GUEST_STATE_FIELDS: [(&str, u32); 46] = [
    ("ES selector", guest::ES_SELECTOR),
    ("CS selector", guest::CS_SELECTOR),
    ("SS selector", guest::SS_SELECTOR),
    ("DS selector", guest::DS_SELECTOR),
    ("FS selector", guest::FS_SELECTOR),
    ("GS selector", guest::GS_SELECTOR),
    ("LDTR selector", guest::LDTR_SELECTOR),
    ("TR selector", guest::TR_SELECTOR),
    ("VMCS link pointer", guest::LINK_PTR_FULL),
    ("IA32_DEBUGCTL", guest::IA32_DEBUGCTL_FULL),
    ("IA32_PAT", guest::IA32_PAT_FULL),
    ("IA32_EFER", guest::IA32_EFER_FULL),
    ("PDPTE0", guest::PDPTE0_FULL),
    ("PDPTE1", guest::PDPTE1_FULL),
    ("PDPTE2", guest::PDPTE2_FULL),
    ("PDPTE3", guest::PDPTE3_FULL),
    ("ES limit", guest::ES_LIMIT),
    ("CS limit", guest::CS_LIMIT),
    ("SS limit", guest::SS_LIMIT),
    ("DS limit", guest::DS_LIMIT),
    ("FS limit", guest::FS_LIMIT),
    ("GS limit", guest::GS_LIMIT),
    ("LDTR limit", guest::LDTR_LIMIT),
    ("TR limit", guest::TR_LIMIT),
    ("GDTR limit", guest::GDTR_LIMIT),
    ("IDTR limit", guest::IDTR_LIMIT),
    ("CS access rights", guest::CS_ACCESS_RIGHTS),
    ("SS access rights", guest::SS_ACCESS_RIGHTS),
    ("TR access rights", guest::TR_ACCESS_RIGHTS),
    ("Interruptibility state", guest::INTERRUPTIBILITY_STATE),
    ("Activity state", guest::ACTIVITY_STATE),
    ("IA32_SYSENTER_CS", guest::IA32_SYSENTER_CS),
    ("CR0", guest::CR0),
    ("CR3", guest::CR3),
    ("CR4", guest::CR4),
    ("CR0 read shadow", control::CR0_READ_SHADOW),
    ("CR4 read shadow", control::CR4_READ_SHADOW),
    ("FS base", guest::FS_BASE),
    ("GS base", guest::GS_BASE),
    ("TR base", guest::TR_BASE),
    ("GDTR base", guest::GDTR_BASE),
    ("IDTR base", guest::IDTR_BASE),
    ("DR7", guest::DR7),
    ("RSP", guest::RSP),
    ("RIP", guest::RIP),
    ("RFLAGS", guest::RFLAGS),
];

/// Logs the guest-state area of the current VMCS.
pub fn dump_guest_state<P: Platform>(platform: &P) {
    error!("=== GUEST STATE ===");
    for (name, field) in GUEST_STATE_FIELDS {
        error!("  {:<24} {:#018x}", name, platform.vmread(field));
    }
}
