//! Architecture-specific primitives
//!
//! The contract the core consumes: per-thread and per-process arch state,
//! kernel-thread stack preparation, the context switch (optionally
//! installing a new translation map atomically with the stack switch),
//! entering user mode, and switching onto a different kernel stack for the
//! exit continuation.
//!
//! Test builds replace the register-level pieces with bookkeeping so the
//! state machines can be driven on a hosted target.

#[cfg(test)]
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::kern::cpu;
use crate::types::{Addr, ThreadId};

/// Saved callee-saved register context (System V x86_64).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: 0x202, // IF set
        }
    }
}

/// Per-thread architecture state.
#[derive(Debug, Clone, Default)]
pub struct ArchThread {
    pub context: Context,
}

impl ArchThread {
    pub fn new() -> Self {
        Self {
            context: Context::new(),
        }
    }
}

/// Per-process architecture state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchProc;

impl ArchProc {
    pub fn new(_kernel: bool) -> Self {
        ArchProc
    }
}

/// Trampoline installed at the top of a fresh kernel stack.
pub type KthreadEntry = fn() -> i32;

/// Prepare an initial kernel stack so that the first dispatch of this
/// thread re-enables interrupts and runs `entry`.
pub fn initialize_kthread_stack(arch: &mut ArchThread, kstack_top: Addr, entry: KthreadEntry) {
    arch.context = Context::new();
    arch.context.rsp = kstack_top as u64;
    arch.context.rip = entry as usize as u64;
}

/// Publish the thread now executing on this CPU.
pub fn set_current_thread(id: Option<ThreadId>) {
    cpu::current_cpu().set_current_thread(id);
}

/// The thread executing on this CPU, if threading is up.
pub fn current_thread_id() -> Option<ThreadId> {
    cpu::try_current_cpu().and_then(|cpu| cpu.current_thread())
}

// ============================================================================
// Context switch
// ============================================================================

/// Swap register state from one thread to another, installing `new_tmap`
/// as the page-table root when the target runs in a different address
/// space.
///
/// # Safety
/// Both pointers must reference live `Context` records owned by threads
/// quiesced under the thread lock.
#[cfg(all(not(test), target_arch = "x86_64"))]
pub unsafe fn context_switch(from: *mut Context, to: *const Context, new_tmap: Option<u64>) {
    if let Some(root) = new_tmap {
        core::arch::asm!("mov cr3, {0}", in(reg) root, options(nostack));
    }
    core::arch::asm!(
        "
        mov [rdi + 0], rbx
        mov [rdi + 8], rbp
        mov [rdi + 16], r12
        mov [rdi + 24], r13
        mov [rdi + 32], r14
        mov [rdi + 40], r15
        mov [rdi + 48], rsp
        lea rax, [rip + 2f]
        mov [rdi + 56], rax
        pushfq
        pop rax
        mov [rdi + 64], rax

        mov rbx, [rsi + 0]
        mov rbp, [rsi + 8]
        mov r12, [rsi + 16]
        mov r13, [rsi + 24]
        mov r14, [rsi + 32]
        mov r15, [rsi + 40]
        mov rsp, [rsi + 48]
        mov rax, [rsi + 64]
        push rax
        popfq
        mov rax, [rsi + 56]
        jmp rax

        2:
        ",
        in("rdi") from,
        in("rsi") to,
        out("rax") _,
        clobber_abi("C"),
    );
}

#[cfg(any(test, not(target_arch = "x86_64")))]
pub unsafe fn context_switch(_from: *mut Context, _to: *const Context, _new_tmap: Option<u64>) {
    // Hosted builds track the switch through the CPU records only.
}

// ============================================================================
// Stack switch for the exit continuation
// ============================================================================

/// Continuation invoked on the new stack.
pub type StackCall = fn(arg: usize);

/// Move the stack pointer to `stack_top` and call `func(arg)`. The caller's
/// frame is dead after this; in a freestanding build control never returns.
#[cfg(all(not(test), target_arch = "x86_64"))]
pub unsafe fn switch_kstack_and_call(stack_top: Addr, func: StackCall, arg: usize) {
    core::arch::asm!(
        "mov rsp, {stack}",
        "call {func}",
        "ud2",
        stack = in(reg) stack_top,
        func = in(reg) func,
        in("rdi") arg,
        options(noreturn),
    );
}

#[cfg(any(test, not(target_arch = "x86_64")))]
pub unsafe fn switch_kstack_and_call(_stack_top: Addr, func: StackCall, arg: usize) {
    func(arg);
}

// ============================================================================
// Entering user mode
// ============================================================================

#[cfg(test)]
static LAST_USPACE_ENTRY: AtomicUsize = AtomicUsize::new(0);
#[cfg(test)]
static LAST_USPACE_ARGS: AtomicUsize = AtomicUsize::new(0);
#[cfg(test)]
static LAST_USPACE_SP: AtomicUsize = AtomicUsize::new(0);

/// Drop to user mode at `entry` with `args` in the first argument register
/// and the stack at `ustack_top`.
#[cfg(all(not(test), target_arch = "x86_64"))]
pub unsafe fn enter_uspace(entry: Addr, args: Addr, ustack_top: Addr) {
    // iretq frame: SS, RSP, RFLAGS, CS, RIP (user selectors 0x23 / 0x1b).
    core::arch::asm!(
        "push 0x23",
        "push {stack}",
        "push 0x202",
        "push 0x1b",
        "push {entry}",
        "iretq",
        stack = in(reg) ustack_top,
        entry = in(reg) entry,
        in("rdi") args,
        options(noreturn),
    );
}

#[cfg(all(not(test), not(target_arch = "x86_64")))]
pub unsafe fn enter_uspace(_entry: Addr, _args: Addr, _ustack_top: Addr) {
    unimplemented!("enter_uspace: unsupported architecture");
}

#[cfg(test)]
pub unsafe fn enter_uspace(entry: Addr, args: Addr, ustack_top: Addr) {
    LAST_USPACE_ENTRY.store(entry, Ordering::Release);
    LAST_USPACE_ARGS.store(args, Ordering::Release);
    LAST_USPACE_SP.store(ustack_top, Ordering::Release);
}

/// The last recorded user-mode entry (test builds).
#[cfg(test)]
pub fn last_uspace_entry() -> (Addr, Addr, Addr) {
    (
        LAST_USPACE_ENTRY.load(Ordering::Acquire),
        LAST_USPACE_ARGS.load(Ordering::Acquire),
        LAST_USPACE_SP.load(Ordering::Acquire),
    )
}
