//! The dispatcher
//!
//! Selects the next runnable thread from the shared run queues, arms the
//! quantum timer, and performs the context switch with its time accounting.
//! Entered only with the thread lock held and local interrupts disabled;
//! that is what keeps one dispatcher instance per CPU.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::arch;
use crate::interrupt::{InterruptStatus, INT_RESCHEDULE};
use crate::kern::cpu::{self, CpuEnt};
use crate::kern::thread::{Thread, ThreadState, ThreadTable};
use crate::kern::timer;
use crate::types::ThreadId;
use crate::vm;

/// Fixed scheduling quantum.
pub const QUANTUM_US: u64 = 10_000;

/// Priority levels, highest wins. The real-time band sits above the
/// regular band; level 0 is reserved for the idle threads.
pub const THREAD_NUM_PRIORITY_LEVELS: usize = 64;
pub const THREAD_IDLE_PRIORITY: i32 = 0;
pub const THREAD_LOWEST_PRIORITY: i32 = 1;
pub const THREAD_LOW_PRIORITY: i32 = 12;
pub const THREAD_MEDIUM_PRIORITY: i32 = 24;
pub const THREAD_HIGH_PRIORITY: i32 = 36;
pub const THREAD_MAX_PRIORITY: i32 = 47;
pub const THREAD_MIN_RT_PRIORITY: i32 = 48;
pub const THREAD_MAX_RT_PRIORITY: i32 = 63;

// Randomized skip for coarse mixing between near-equal regular
// priorities. Same generator as the original: a sample at or below
// 0x3000 skips the level once.
static RAND_STATE: AtomicI32 = AtomicI32::new(0);

fn rand16() -> i32 {
    let mut next = RAND_STATE.load(Ordering::Relaxed);
    if next == 0 {
        next = timer::system_time() as i32 | 1;
    }
    next = next.wrapping_mul(1103515245).wrapping_add(12345);
    RAND_STATE.store(next, Ordering::Relaxed);
    (next >> 16) & 0x7fff
}

/// Seed the skip generator, mainly so dispatch tests are deterministic.
pub fn seed_rand(seed: i32) {
    RAND_STATE.store(seed, Ordering::Relaxed);
}

/// Quantum expiry: mark the CPU preempted so the interrupt tail calls the
/// dispatcher.
fn reschedule_event(data: u64) -> InterruptStatus {
    cpu::cpu_ent(data as usize).set_preempted(true);
    INT_RESCHEDULE
}

/// Pick the next thread to run. Thread lock held.
///
/// 1. Scan the real-time band high to low and take the first head.
/// 2. Scan the regular band high to low; each non-empty level is taken
///    immediately with probability ~5/8, otherwise remembered once as the
///    fallback.
/// 3. If every regular level was skipped, take the highest remembered one.
/// 4. Otherwise run this CPU's idle thread.
pub(crate) fn select_next(tt: &mut ThreadTable, cpu: &CpuEnt) -> Arc<Thread> {
    for pri in (THREAD_MIN_RT_PRIORITY..=THREAD_MAX_RT_PRIORITY).rev() {
        if let Some(tid) = tt.run_q[pri as usize].dequeue() {
            return tt.get(tid).expect("run queue holds unknown thread");
        }
    }

    let mut fallback: Option<usize> = None;
    for pri in ((THREAD_IDLE_PRIORITY + 1)..=THREAD_MAX_PRIORITY).rev() {
        if !tt.run_q[pri as usize].is_empty() {
            if rand16() > 0x3000 {
                let tid = tt.run_q[pri as usize].dequeue().unwrap();
                return tt.get(tid).expect("run queue holds unknown thread");
            }
            if fallback.is_none() {
                fallback = Some(pri as usize);
            }
        }
    }

    if let Some(pri) = fallback {
        let tid = tt.run_q[pri].dequeue().expect("fallback level emptied");
        return tt.get(tid).expect("run queue holds unknown thread");
    }

    let idle = cpu.idle_thread().expect("cpu has no idle thread");
    tt.get(idle).expect("idle thread not in thread table")
}

/// The dispatcher. Thread lock held, interrupts disabled.
pub(crate) fn resched(tt: &mut ThreadTable) {
    let cpu = cpu::current_cpu();

    let old = tt.current_on(cpu.cpu_num);

    if let Some(ref old) = old {
        match old.next_state() {
            ThreadState::Running | ThreadState::Ready => {
                // The idle thread never leaves its CPU's idle slot.
                if cpu.idle_thread() != Some(ThreadId(old.id())) {
                    tt.enqueue_run_q(old);
                }
            }
            ThreadState::FreeOnResched => {
                tt.dead_q.push_back(old.clone());
            }
            ThreadState::Suspended | ThreadState::Waiting | ThreadState::Birth => {}
        }
        old.set_state(old.next_state());
    }

    let next = select_next(tt, cpu);
    next.set_state(ThreadState::Running);
    next.set_next_state(ThreadState::Ready);
    tt.set_current_on(cpu.cpu_num, next.clone());

    // Re-arm the quantum timer. If the quantum already expired the old
    // event has fired and there is nothing to cancel.
    if !cpu.preempted() {
        if let Some(old_event) = cpu.quantum_timer.lock().take() {
            timer::timer_cancel_event(cpu.cpu_num, old_event);
        }
    }
    cpu.set_preempted(false);
    *cpu.quantum_timer.lock() = Some(timer::timer_set_event(
        cpu.cpu_num,
        QUANTUM_US,
        reschedule_event,
        cpu.cpu_num as u64,
    ));

    match old {
        Some(ref old) if old.id() == next.id() => {}
        Some(ref old) => context_switch(cpu, old, &next),
        None => {
            // Boot path: nothing to switch away from.
            next.set_cpu(Some(cpu.cpu_num));
            arch::set_current_thread(Some(ThreadId(next.id())));
            cpu.set_active_aspace(next.aspace());
        }
    }
}

/// Hand the CPU from one thread to another.
fn context_switch(cpu: &CpuEnt, from: &Arc<Thread>, to: &Arc<Thread>) {
    let now = timer::system_time();
    from.credit_time(now);
    to.stamp_time(now);

    // Either the FPU state is saved in the record, or some CPU still owns
    // it; when no other CPU does, it must be this one.
    if !from.fpu_state_saved() && from.fpu_cpu().is_none() {
        assert_eq!(
            cpu.fpu_thread(),
            Some(ThreadId(from.id())),
            "fpu state neither saved nor owned"
        );
    }

    to.set_cpu(Some(cpu.cpu_num));
    arch::set_current_thread(Some(ThreadId(to.id())));
    from.set_cpu(None);

    // Install the target's translation map only when the address space
    // actually changes.
    let new_tmap = if from.aspace() == to.aspace() {
        None
    } else {
        vm::translation_map_root(to.aspace())
    };
    cpu.set_active_aspace(to.aspace());

    let from_ctx = {
        let mut guard = from.arch.lock();
        &mut guard.context as *mut arch::Context
    };
    let to_ctx = {
        let guard = to.arch.lock();
        &guard.context as *const arch::Context
    };
    unsafe { arch::context_switch(from_ctx, to_ctx, new_tmap) };
}

/// Timer-interrupt tail for the scheduler: run the dispatcher when the
/// quantum timer asked for it.
pub fn reschedule_if_preempted() {
    let cpu = cpu::current_cpu();
    if cpu.preempted() {
        let mut tt = crate::kern::thread::thread_table().lock_irq();
        resched(&mut tt);
    }
}

// One-shot hook run by blocking paths after the dispatcher parks the
// caller, standing in for "the other threads run now" on a hosted target.
#[cfg(test)]
mod test_hook {
    use crate::kern::lock::SpinLock;

    type Hook = alloc::boxed::Box<dyn FnMut() + Send>;
    pub(super) static RESCHED_HOOK: SpinLock<Option<Hook>> = SpinLock::new(None);
}

#[cfg(test)]
pub fn set_resched_hook(hook: alloc::boxed::Box<dyn FnMut() + Send>) {
    *test_hook::RESCHED_HOOK.lock() = Some(hook);
}

#[cfg(test)]
pub(crate) fn run_resched_hook() {
    let hook = test_hook::RESCHED_HOOK.lock().take();
    if let Some(mut hook) = hook {
        hook();
    }
}
