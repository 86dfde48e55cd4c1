//! AArch64 context switch.
//!
//! The scheduler's [`ThreadContext`] layout is pinned (`#[repr(C)]`, offsets
//! asserted in the `sched::task` tests) because the assembly below addresses
//! the fields by constant offset:
//!
//! ```text
//!   0  sp          96  x29 (frame pointer)
//!   8  pc         104  x30 (link register)
//!  16  x19..x28   112  initial_x0
//!                 120  initial_x1
//! ```
//!
//! Only the callee-saved state is stored; everything else is dead across a
//! function call by the AAPCS64 ABI, which is exactly what makes a
//! cooperative switch this small.

use crate::sched::task::ThreadContext;

core::arch::global_asm!(
    r#"
    .section .text
    .global context_switch
    .type context_switch, %function
context_switch:
    // x0 = old context (may be null), x1 = new context
    cbz     x0, 1f
    mov     x9, sp
    str     x9, [x0, #0]            // sp
    str     x30, [x0, #8]           // pc: resume at our return address
    stp     x19, x20, [x0, #16]
    stp     x21, x22, [x0, #32]
    stp     x23, x24, [x0, #48]
    stp     x25, x26, [x0, #64]
    stp     x27, x28, [x0, #80]
    stp     x29, x30, [x0, #96]
1:
    ldr     x9, [x1, #0]
    mov     sp, x9
    ldp     x19, x20, [x1, #16]
    ldp     x21, x22, [x1, #32]
    ldp     x23, x24, [x1, #48]
    ldp     x25, x26, [x1, #64]
    ldp     x27, x28, [x1, #80]
    ldp     x29, x30, [x1, #96]
    ldr     x9, [x1, #8]            // target pc
    // Bootstrap argument slots. A fresh thread enters the trampoline with
    // (entry, arg) in x0/x1; for a resumed thread these registers are
    // caller-saved and the clobber is harmless.
    ldp     x0, x1, [x1, #112]
    br      x9
    .size context_switch, . - context_switch
"#
);

extern "C" {
    /// Save the callee-saved state into `old` (if non-null) and resume
    /// `new`, switching stacks in the process.
    ///
    /// # Safety
    ///
    /// `new` must point at a context whose `sp` is a valid, 16-byte-aligned
    /// stack top and whose `pc` is a valid resume address. `old`, when
    /// non-null, must point at writable [`ThreadContext`] storage that
    /// outlives the suspended thread.
    pub fn context_switch(old: *mut ThreadContext, new: *const ThreadContext);
}
