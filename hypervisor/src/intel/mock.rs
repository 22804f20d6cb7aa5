//! In-memory [`Platform`] and collaborators for unit tests.

use {
    crate::intel::{
        ept::{EptDataHandle, EptEngine},
        guest_view::GuestIdentity,
        platform::{IoWidth, Platform},
        processor::{ProcessorData, SharedProcessorData, VmmConfig},
    },
    core::cell::Cell,
    std::{collections::BTreeMap, vec::Vec},
    x86::{
        cpuid::CpuIdResult,
        msr,
        vmx::vmcs::{guest, ro},
    },
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Invalidation {
    EptGlobal,
    VpidAllContexts,
    VpidSingleContextRetainingGlobals(u16),
    VpidIndividualAddress(u16, u64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StringIo {
    pub input: bool,
    pub port: u16,
    pub width: IoWidth,
    pub address: u64,
    pub count: u64,
    pub cr3: u64,
}

pub struct MockPlatform {
    pub vmcs: BTreeMap<u32, u64>,
    pub msrs: BTreeMap<u32, u64>,
    pub msr_reads: Vec<u32>,
    pub msr_writes: Vec<(u32, u64)>,
    pub cpuid_results: BTreeMap<(u32, u32), CpuIdResult>,
    pub tsc: u64,
    pub tsc_aux: u32,
    pub xcr_writes: Vec<(u32, u64)>,
    pub dr: [u64; 8],
    pub dr_reads: Vec<u8>,
    pub dr_writes: Vec<(u8, u64)>,
    pub port_values: BTreeMap<u16, u32>,
    pub port_writes: Vec<(u16, IoWidth, u32)>,
    pub port_access_cr3: Vec<u64>,
    pub string_io: Vec<StringIo>,
    pub cr2: u64,
    pub cr3: u64,
    pub cr3_writes: Vec<u64>,
    pub cr8: u64,
    pub cr8_writes: Vec<u64>,
    pub irql: u8,
    pub irql_changes: Vec<u8>,
    pub memory: BTreeMap<u64, u8>,
    pub memory_access_cr3: Vec<u64>,
    pub physical: BTreeMap<u64, u8>,
    pub gdtr: Option<(u64, u16)>,
    pub idtr: Option<(u64, u16)>,
    pub invalidations: Vec<Invalidation>,
    pub cache_flushes: usize,
}

impl MockPlatform {
    /// Guest at CPL 0 in 64-bit mode, stopped on a 3-byte instruction at 0x1000.
    pub fn new() -> Self {
        let mut platform = Self {
            vmcs: BTreeMap::new(),
            msrs: BTreeMap::new(),
            msr_reads: Vec::new(),
            msr_writes: Vec::new(),
            cpuid_results: BTreeMap::new(),
            tsc: 0,
            tsc_aux: 0,
            xcr_writes: Vec::new(),
            dr: [0; 8],
            dr_reads: Vec::new(),
            dr_writes: Vec::new(),
            port_values: BTreeMap::new(),
            port_writes: Vec::new(),
            port_access_cr3: Vec::new(),
            string_io: Vec::new(),
            cr2: 0,
            cr3: 0x1000,
            cr3_writes: Vec::new(),
            cr8: 0,
            cr8_writes: Vec::new(),
            irql: 0,
            irql_changes: Vec::new(),
            memory: BTreeMap::new(),
            memory_access_cr3: Vec::new(),
            physical: BTreeMap::new(),
            gdtr: None,
            idtr: None,
            invalidations: Vec::new(),
            cache_flushes: 0,
        };

        platform.vmcs.insert(guest::RIP, 0x1000);
        platform.vmcs.insert(guest::RSP, 0x8000);
        platform.vmcs.insert(guest::RFLAGS, 0x2);
        platform.vmcs.insert(ro::VMEXIT_INSTRUCTION_LEN, 3);
        // Present, DPL 0 data segment.
        platform.vmcs.insert(guest::SS_ACCESS_RIGHTS, 0x93);
        // Present, 64-bit code segment.
        platform.vmcs.insert(guest::CS_ACCESS_RIGHTS, 0x209B);
        platform.vmcs.insert(guest::CR3, 0x7000);

        platform.msrs.insert(msr::IA32_VMX_CR0_FIXED0, 0x8000_0021);
        platform.msrs.insert(msr::IA32_VMX_CR0_FIXED1, 0xFFFF_FFFF);
        platform.msrs.insert(msr::IA32_VMX_CR4_FIXED0, 0x2000);
        platform.msrs.insert(msr::IA32_VMX_CR4_FIXED1, 0x3767FF);

        platform
    }

    pub fn vmcs_value(&self, field: u32) -> u64 {
        self.vmcs.get(&field).copied().unwrap_or(0)
    }

    pub fn set_memory(&mut self, address: u64, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address + offset as u64, *byte);
        }
    }

    pub fn memory_bytes<const N: usize>(&self, address: u64) -> [u8; N] {
        let mut buffer = [0u8; N];
        for (offset, byte) in buffer.iter_mut().enumerate() {
            *byte = self.memory.get(&(address + offset as u64)).copied().unwrap_or(0);
        }
        buffer
    }

    pub fn set_physical(&mut self, address: u64, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.physical.insert(address + offset as u64, *byte);
        }
    }
}

impl Platform for MockPlatform {
    fn vmread(&self, field: u32) -> u64 {
        self.vmcs_value(field)
    }

    fn vmwrite(&mut self, field: u32, value: u64) {
        self.vmcs.insert(field, value);
    }

    fn rdmsr(&mut self, msr: u32) -> u64 {
        self.msr_reads.push(msr);
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        self.msr_writes.push((msr, value));
        self.msrs.insert(msr, value);
    }

    fn cpuid(&mut self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        self.cpuid_results.get(&(leaf, sub_leaf)).copied().unwrap_or(CpuIdResult { eax: 0, ebx: 0, ecx: 0, edx: 0 })
    }

    fn rdtsc(&mut self) -> u64 {
        self.tsc
    }

    fn rdtscp(&mut self) -> (u64, u32) {
        (self.tsc, self.tsc_aux)
    }

    fn xsetbv(&mut self, xcr: u32, value: u64) {
        self.xcr_writes.push((xcr, value));
    }

    fn read_dr(&mut self, index: u8) -> u64 {
        self.dr_reads.push(index);
        self.dr[index as usize]
    }

    fn write_dr(&mut self, index: u8, value: u64) {
        self.dr_writes.push((index, value));
        self.dr[index as usize] = value;
    }

    fn write_cr2(&mut self, value: u64) {
        self.cr2 = value;
    }

    fn read_cr3(&self) -> u64 {
        self.cr3
    }

    fn write_cr3(&mut self, value: u64) {
        self.cr3_writes.push(value);
        self.cr3 = value;
    }

    fn read_cr8(&self) -> u64 {
        self.cr8
    }

    fn write_cr8(&mut self, value: u64) {
        self.cr8_writes.push(value);
        self.cr8 = value;
    }

    fn lgdt(&mut self, base: u64, limit: u16) {
        self.gdtr = Some((base, limit));
    }

    fn lidt(&mut self, base: u64, limit: u16) {
        self.idtr = Some((base, limit));
    }

    fn invept_global(&mut self) {
        self.invalidations.push(Invalidation::EptGlobal);
    }

    fn invvpid_all_contexts(&mut self) {
        self.invalidations.push(Invalidation::VpidAllContexts);
    }

    fn invvpid_single_context_retaining_globals(&mut self, vpid: u16) {
        self.invalidations.push(Invalidation::VpidSingleContextRetainingGlobals(vpid));
    }

    fn invvpid_individual_address(&mut self, vpid: u16, address: u64) {
        self.invalidations.push(Invalidation::VpidIndividualAddress(vpid, address));
    }

    fn invalidate_caches(&mut self) {
        self.cache_flushes += 1;
    }

    fn io_in(&mut self, port: u16, width: IoWidth) -> u32 {
        self.port_access_cr3.push(self.cr3);
        (self.port_values.get(&port).copied().unwrap_or(0) as u64 & width.mask()) as u32
    }

    fn io_out(&mut self, port: u16, width: IoWidth, value: u32) {
        self.port_access_cr3.push(self.cr3);
        self.port_writes.push((port, width, value));
    }

    unsafe fn io_in_string(&mut self, port: u16, width: IoWidth, address: u64, count: u64) {
        self.string_io.push(StringIo { input: true, port, width, address, count, cr3: self.cr3 });
    }

    unsafe fn io_out_string(&mut self, port: u16, width: IoWidth, address: u64, count: u64) {
        self.string_io.push(StringIo { input: false, port, width, address, count, cr3: self.cr3 });
    }

    unsafe fn read_memory(&mut self, address: u64, buffer: &mut [u8]) {
        self.memory_access_cr3.push(self.cr3);
        for (offset, byte) in buffer.iter_mut().enumerate() {
            *byte = self.memory.get(&address.wrapping_add(offset as u64)).copied().unwrap_or(0);
        }
    }

    unsafe fn write_memory(&mut self, address: u64, data: &[u8]) {
        self.memory_access_cr3.push(self.cr3);
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(offset as u64), *byte);
        }
    }

    fn read_physical(&mut self, address: u64, buffer: &mut [u8]) {
        for (offset, byte) in buffer.iter_mut().enumerate() {
            *byte = self.physical.get(&(address + offset as u64)).copied().unwrap_or(0);
        }
    }

    fn current_irql(&self) -> u8 {
        self.irql
    }

    fn raise_irql(&mut self, irql: u8) {
        self.irql_changes.push(irql);
        self.irql = irql;
    }

    fn lower_irql(&mut self, irql: u8) {
        self.irql_changes.push(irql);
        self.irql = irql;
    }
}

pub struct MockEpt {
    pub violations: Cell<usize>,
    pub last_handle: Cell<Option<EptDataHandle>>,
    pub lookups: Cell<usize>,
    pub entry: Option<u64>,
}

impl MockEpt {
    pub fn new() -> Self {
        Self { violations: Cell::new(0), last_handle: Cell::new(None), lookups: Cell::new(0), entry: None }
    }
}

impl EptEngine for MockEpt {
    fn handle_ept_violation(&self, ept_data: EptDataHandle) {
        self.violations.set(self.violations.get() + 1);
        self.last_handle.set(Some(ept_data));
    }

    fn get_ept_pt_entry(&self, ept_data: EptDataHandle, _guest_physical_address: u64) -> Option<u64> {
        self.lookups.set(self.lookups.get() + 1);
        self.last_handle.set(Some(ept_data));
        self.entry
    }
}

pub struct MockIdentity {
    pub kernel_cr3: u64,
}

impl GuestIdentity for MockIdentity {
    fn kernel_directory_table_base(&self) -> u64 {
        self.kernel_cr3
    }
}

pub const TEST_EPT_DATA: EptDataHandle = EptDataHandle(0xe000);

/// Owner of the collaborators a [`ProcessorData`] borrows.
pub struct Collaborators {
    pub shared: SharedProcessorData,
    pub ept: MockEpt,
    pub identity: MockIdentity,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::with_config(VmmConfig { vmware_compatibility: false, record_vm_exits: false })
    }

    pub fn with_config(config: VmmConfig) -> Self {
        Self {
            shared: SharedProcessorData { config },
            ept: MockEpt::new(),
            identity: MockIdentity { kernel_cr3: 0x00ab_c000 },
        }
    }

    pub fn processor_data(&self) -> ProcessorData<'_> {
        ProcessorData::new(&self.shared, &self.ept, &self.identity, TEST_EPT_DATA)
    }
}
