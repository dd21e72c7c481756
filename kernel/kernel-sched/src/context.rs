//! Saved execution state and the low-level switch primitive.
//!
//! The callee-saved integer registers plus stack and instruction pointers
//! are enough to suspend a process at a cooperative yield point; the
//! caller-saved half is dead across the `switch_context` call by the
//! C calling convention. FPU/SSE state is captured separately with
//! `fxsave` into a 512-byte aligned area.

/// Callee-saved register file of a suspended process.
///
/// A process is "suspended at `eip` with stack `esp`"; restoring the four
/// callee-saved registers and jumping there resumes it exactly where
/// [`switch_context`] was entered.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
}

/// 512-byte `fxsave`/`fxrstor` area.
#[repr(C, align(16))]
#[derive(Copy, Clone)]
pub struct FpuState(pub [u8; 512]);

impl Default for FpuState {
    fn default() -> Self {
        Self([0; 512])
    }
}

impl core::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FpuState(..)")
    }
}

/// Save the caller's execution state into `save` and resume `restore`.
///
/// Returns exactly once per suspension: when some later switch restores
/// `save`, execution continues at this call's return. From the caller's
/// point of view every other path is non-returning.
///
/// # Safety
/// `save` and `restore` must point at valid contexts, `restore` must hold
/// a resumable state whose stack is mapped in the active address space,
/// and interrupts must be disabled across the call.
#[cfg(target_arch = "x86")]
#[unsafe(naked)]
pub unsafe extern "cdecl" fn switch_context(save: *mut CpuContext, restore: *const CpuContext) {
    core::arch::naked_asm!(
        // eax = save, edx = restore
        "mov eax, [esp + 4]",
        "mov edx, [esp + 8]",
        // park callee-saved registers
        "mov [eax + 0], ebx",
        "mov [eax + 4], esi",
        "mov [eax + 8], edi",
        "mov [eax + 12], ebp",
        // resume point: our own return address and the stack above it
        "mov ecx, [esp]",
        "mov [eax + 20], ecx",
        "lea ecx, [esp + 4]",
        "mov [eax + 16], ecx",
        // switch to the target stack and continue at its saved eip
        "mov ebx, [edx + 0]",
        "mov esi, [edx + 4]",
        "mov edi, [edx + 8]",
        "mov ebp, [edx + 12]",
        "mov esp, [edx + 16]",
        "jmp dword ptr [edx + 20]",
    )
}

/// Capture the FPU/SSE state.
///
/// # Safety
/// Requires an x86 with FXSR enabled and a 16-byte aligned `state`.
#[cfg(target_arch = "x86")]
pub unsafe fn save_fpu(state: &mut FpuState) {
    unsafe {
        core::arch::asm!("fxsave [{}]", in(reg) state.0.as_mut_ptr(), options(nostack));
    }
}

/// Restore the FPU/SSE state captured by [`save_fpu`].
///
/// # Safety
/// `state` must hold a valid `fxsave` image.
#[cfg(target_arch = "x86")]
pub unsafe fn restore_fpu(state: &FpuState) {
    unsafe {
        core::arch::asm!("fxrstor [{}]", in(reg) state.0.as_ptr(), options(nostack));
    }
}
