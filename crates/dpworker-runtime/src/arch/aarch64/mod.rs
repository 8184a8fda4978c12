//! aarch64 context switching (AAPCS64)

use std::arch::naked_asm;

/// Callee-saved state of a suspended context
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedRegs {
    pub sp: u64,            // 0x00
    pub pc: u64,            // 0x08
    pub x19_x28: [u64; 10], // 0x10
    pub fp: u64,            // 0x60 (x29)
    pub lr: u64,            // 0x68 (x30)
    pub d8_d15: [u64; 8],   // 0x70
    pub fpcr: u64,          // 0xb0
}

const _: () = assert!(std::mem::size_of::<SavedRegs>() == 0xb8);

/// Prepare a fresh context.
///
/// When first switched to, runs `entry(arg)` on the stack ending at
/// `stack_top`. If `entry` returns, control transfers to `link`.
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
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.sp = sp as u64;
    regs.pc = entry_trampoline as *const () as usize as u64;
    regs.x19_x28[0] = entry as usize as u64; // x19
    regs.x19_x28[1] = arg as u64; // x20
    regs.x19_x28[2] = link as u64; // x21
}

/// First code a fresh context runs
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // entry returned: resume the link context
        "mov x0, x21",
        "bl {exit}",
        "brk #0",
        exit = sym context_exit,
    );
}

/// Load `to` without saving anything. Never returns.
#[unsafe(naked)]
unsafe extern "C" fn context_exit(_to: *const SavedRegs) {
    naked_asm!(
        "ldr x9, [x0, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x0, #0x10]",
        "ldp x21, x22, [x0, #0x20]",
        "ldp x23, x24, [x0, #0x30]",
        "ldp x25, x26, [x0, #0x40]",
        "ldp x27, x28, [x0, #0x50]",
        "ldp x29, x30, [x0, #0x60]",
        "ldp d8, d9, [x0, #0x70]",
        "ldp d10, d11, [x0, #0x80]",
        "ldp d12, d13, [x0, #0x90]",
        "ldp d14, d15, [x0, #0xa0]",
        "ldr x9, [x0, #0xb0]",
        "msr fpcr, x9",
        "ldr x10, [x0, #0x08]",
        "br x10",
    );
}

/// Save the current context into `from` and resume `to`.
///
/// # Safety
///
/// `to` must hold a context prepared by [`init_context`] or saved by this
/// function, whose stack is still mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut SavedRegs, _to: *const SavedRegs) {
    naked_asm!(
        // Save to from (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "adr x10, 2f",
        "str x10, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        "mrs x9, fpcr",
        "str x9, [x0, #0xb0]",
        // Load from to (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "ldr x9, [x1, #0xb0]",
        "msr fpcr, x9",
        "ldr x10, [x1, #0x08]",
        "br x10",
        // Resume point for a saved context
        "2:",
        "ret",
    );
}
