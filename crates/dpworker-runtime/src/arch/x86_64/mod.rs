//! x86_64 context switching (System V AMD64)

use std::arch::naked_asm;

/// Callee-saved state of a suspended context
///
/// Layout is fixed; the assembly below addresses fields by offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,    // 0x00
    pub rip: u64,    // 0x08
    pub rbx: u64,    // 0x10
    pub rbp: u64,    // 0x18
    pub r12: u64,    // 0x20
    pub r13: u64,    // 0x28
    pub r14: u64,    // 0x30
    pub r15: u64,    // 0x38
    pub mxcsr: u32,  // 0x40
    pub fpu_cw: u16, // 0x44
    _pad: u16,
}

const _: () = assert!(std::mem::size_of::<SavedRegs>() == 0x48);

/// Power-on defaults for SSE and x87 control words
const DEFAULT_MXCSR: u32 = 0x1F80;
const DEFAULT_FPU_CW: u16 = 0x037F;

impl Default for SavedRegs {
    fn default() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: DEFAULT_MXCSR,
            fpu_cw: DEFAULT_FPU_CW,
            _pad: 0,
        }
    }
}

/// Prepare a fresh context.
///
/// When first switched to, runs `entry(arg)` on the stack ending at
/// `stack_top`. If `entry` returns, control transfers to `link` as if that
/// context had been switched to.
///
/// # Safety
///
/// The stack must stay mapped, and `link` must stay valid, for as long as
/// the context can run.
pub unsafe fn init_context(
    regs: &mut SavedRegs,
    stack_top: *mut u8,
    entry: extern "C" fn(usize),
    arg: usize,
    link: *const SavedRegs,
) {
    // 16-byte aligned at the trampoline, so `call r12` leaves the entry
    // function with the usual rsp % 16 == 8.
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.rsp = sp as u64;
    regs.rip = entry_trampoline as *const () as usize as u64;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
    regs.r14 = link as u64;
}

/// First code a fresh context runs
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry returned: resume the link context
        "mov rdi, r14",
        "call {exit}",
        "ud2",
        exit = sym context_exit,
    );
}

/// Load `to` without saving anything. Never returns.
#[unsafe(naked)]
unsafe extern "C" fn context_exit(_to: *const SavedRegs) {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rax, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov rbp, [rdi + 0x18]",
        "mov r12, [rdi + 0x20]",
        "mov r13, [rdi + 0x28]",
        "mov r14, [rdi + 0x30]",
        "mov r15, [rdi + 0x38]",
        "ldmxcsr dword ptr [rdi + 0x40]",
        "fldcw word ptr [rdi + 0x44]",
        "jmp rax",
    );
}

/// Save the current context into `from` and resume `to`.
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// `to` must hold a context prepared by [`init_context`] or saved by this
/// function, whose stack is still mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut SavedRegs, _to: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to from (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr dword ptr [rdi + 0x40]",
        "fnstcw word ptr [rdi + 0x44]",
        // Load from to (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr dword ptr [rsi + 0x40]",
        "fldcw word ptr [rsi + 0x44]",
        "jmp rax",
        // Resume point for a saved context
        "2:",
        "ret",
    );
}
