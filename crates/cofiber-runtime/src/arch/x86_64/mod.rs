//! x86_64 context switching implementation
//!
//! Only callee-saved registers are exchanged: the switch is an ordinary
//! `extern "C"` call from the compiler's point of view, so everything
//! caller-saved is already spilled by the time we get here.

use super::{EntryFn, ExecutionContext};
use std::arch::naked_asm;

/// Callee-saved register set of a suspended fiber
///
/// Field offsets are hard-coded in [`swap_registers`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl ExecutionContext for Registers {
    unsafe fn create_with_stack(stack_top: *mut u8, entry: EntryFn, arg: usize) -> Self {
        // The trampoline is entered by `jmp`, not `call`, so rsp must be
        // 16-byte aligned here for its own `call` to leave the entry
        // function with the ABI-mandated rsp % 16 == 8.
        let sp = (stack_top as usize) & !0xF;
        Registers {
            rsp: sp as u64,
            rip: fiber_entry_trampoline as usize as u64,
            rbx: 0,
            rbp: 0,
            r12: entry as usize as u64,
            r13: arg as u64,
            r14: 0,
            r15: 0,
        }
    }

    #[inline]
    unsafe fn swap(suspend: *mut Self, resume: *const Self) {
        swap_registers(suspend, resume);
    }
}

/// Calls `r12(r13)`. The entry function never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save callee-saved registers into `old` and load them from `new`.
#[unsafe(naked)]
unsafe extern "C" fn swap_registers(_old: *mut Registers, _new: *const Registers) {
    naked_asm!(
        // Save into old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // A saved context resumes here and returns to swap_registers' caller
        "1:",
        "ret",
    );
}
