//! VM-exit entry stub.
//!
//! `vmm_vmexit_entry` is the host RIP of every VMCS. The monitor setup points
//! the host RSP at a stack whose top slot holds the processor's
//! [`ProcessorData`](crate::intel::processor::ProcessorData) pointer. That
//! host RSP must be 16-byte aligned.
//!
//! On entry the stub reserves a [`TrapFrame`], pushes the guest registers in
//! [`GuestRegisters`](crate::intel::capture::GuestRegisters) order and calls
//! [`vmm_vmexit_handler`] with the resulting [`VmExitStack`]. XMM0-XMM15 are
//! preserved around the call since the guest owns them.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::{TrapFrame, VmExitStack},
            platform::Platform,
            support::HardwarePlatform,
        },
        vmm::handle_vmexit,
    },
    core::{arch::global_asm, mem::size_of},
    log::error,
    x86::vmx::vmcs::{guest, ro},
    x86_64::registers::rflags::RFlags,
};

unsafe extern "sysv64" {
    /// Host RIP for the VMCS.
    pub fn vmm_vmexit_entry();
}

/// Rust side of the entry stub.
///
/// Returns `true` to resume the guest and `false` to leave VMX operation.
#[unsafe(no_mangle)]
extern "sysv64" fn vmm_vmexit_handler(stack: *mut VmExitStack) -> bool {
    // The stub passes its own stack, which stays valid and exclusive for the
    // duration of the call.
    let stack = unsafe { &mut *stack };
    let processor_data = unsafe { &mut *stack.processor_data };

    handle_vmexit(&mut stack.registers, &mut stack.trap_frame, processor_data, &mut HardwarePlatform)
}

/// Called by the stub when VMRESUME or VMXOFF fails. Never returns.
#[unsafe(no_mangle)]
extern "sysv64" fn vmm_vmx_failure_handler(rflags: u64) -> ! {
    let mut platform = HardwarePlatform;
    let error = vmx_instruction_failure(&platform, rflags);
    error!("{}", error);

    let (code, parameter1, parameter2, parameter3) = error.bug_check_parameters(0);
    platform.bug_check(code, parameter1, parameter2, parameter3)
}

/// Decodes a failed VMX instruction from the RFLAGS it left behind.
///
/// VMfailValid (ZF) leaves an error number in the VMCS; VMfailInvalid (CF)
/// means there is no current VMCS to read it from.
fn vmx_instruction_failure<P: Platform>(platform: &P, rflags: u64) -> HypervisorError {
    let vm_instruction_error = if RFlags::from_bits_retain(rflags).contains(RFlags::ZERO_FLAG) {
        platform.vmread(ro::VM_INSTRUCTION_ERROR)
    } else {
        0
    };

    HypervisorError::VmxInstructionFailed { vm_instruction_error, guest_rip: platform.vmread(guest::RIP) }
}

global_asm!(
    r#"
    .globl vmm_vmexit_entry

vmm_vmexit_entry:
    sub     rsp, {trap_frame_size}

    // Stored in GuestRegisters order, RAX at the lowest address. The RSP slot
    // is filled from the VMCS by the handler.
    push    r15
    push    r14
    push    r13
    push    r12
    push    r11
    push    r10
    push    r9
    push    r8
    push    rdi
    push    rsi
    push    rbp
    push    rsp
    push    rbx
    push    rdx
    push    rcx
    push    rax

    mov     rdi, rsp
    sub     rsp, {xmm_area_size}
    movaps  [rsp + 0x00], xmm0
    movaps  [rsp + 0x10], xmm1
    movaps  [rsp + 0x20], xmm2
    movaps  [rsp + 0x30], xmm3
    movaps  [rsp + 0x40], xmm4
    movaps  [rsp + 0x50], xmm5
    movaps  [rsp + 0x60], xmm6
    movaps  [rsp + 0x70], xmm7
    movaps  [rsp + 0x80], xmm8
    movaps  [rsp + 0x90], xmm9
    movaps  [rsp + 0xa0], xmm10
    movaps  [rsp + 0xb0], xmm11
    movaps  [rsp + 0xc0], xmm12
    movaps  [rsp + 0xd0], xmm13
    movaps  [rsp + 0xe0], xmm14
    movaps  [rsp + 0xf0], xmm15

    call    vmm_vmexit_handler

    movaps  xmm0,  [rsp + 0x00]
    movaps  xmm1,  [rsp + 0x10]
    movaps  xmm2,  [rsp + 0x20]
    movaps  xmm3,  [rsp + 0x30]
    movaps  xmm4,  [rsp + 0x40]
    movaps  xmm5,  [rsp + 0x50]
    movaps  xmm6,  [rsp + 0x60]
    movaps  xmm7,  [rsp + 0x70]
    movaps  xmm8,  [rsp + 0x80]
    movaps  xmm9,  [rsp + 0x90]
    movaps  xmm10, [rsp + 0xa0]
    movaps  xmm11, [rsp + 0xb0]
    movaps  xmm12, [rsp + 0xc0]
    movaps  xmm13, [rsp + 0xd0]
    movaps  xmm14, [rsp + 0xe0]
    movaps  xmm15, [rsp + 0xf0]
    add     rsp, {xmm_area_size}

    test    al, al
    jz      .Lexit_vmx

    pop     rax
    pop     rcx
    pop     rdx
    pop     rbx
    add     rsp, 8
    pop     rbp
    pop     rsi
    pop     rdi
    pop     r8
    pop     r9
    pop     r10
    pop     r11
    pop     r12
    pop     r13
    pop     r14
    pop     r15
    add     rsp, {trap_frame_size}

    vmresume
    jmp     .Lvmx_failure

.Lexit_vmx:
    // RAX holds the guest RFLAGS, RCX the return address and RDX the guest
    // RSP, all set up by the termination hypercall.
    pop     rax
    pop     rcx
    pop     rdx
    pop     rbx
    add     rsp, 8
    pop     rbp
    pop     rsi
    pop     rdi
    pop     r8
    pop     r9
    pop     r10
    pop     r11
    pop     r12
    pop     r13
    pop     r14
    pop     r15
    add     rsp, {trap_frame_size}

    vmxoff
    jz      .Lvmx_failure
    jc      .Lvmx_failure

    push    rax
    popfq
    mov     rsp, rdx
    push    rcx
    ret

.Lvmx_failure:
    pushfq
    pop     rdi
    and     rsp, -16
    call    vmm_vmx_failure_handler
    ud2
"#,
    trap_frame_size = const size_of::<TrapFrame>(),
    xmm_area_size = const 16 * 16,
);
