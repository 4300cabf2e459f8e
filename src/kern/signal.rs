//! Signals
//!
//! The stop/continue/kill machinery the thread and process lifecycles are
//! built on: suspend and resume are signal sends, a dying main thread kills
//! its siblings with `SIGKILLTHR`, and job control delivers `SIGHUP`/
//! `SIGCONT` to orphaned process groups. Senders that fan out pass
//! `SIG_FLAG_NO_RESCHED` and reschedule once at the end.

use crate::errors::KernError;
use crate::kern::sched;
use crate::kern::sem;
use crate::kern::thread::{self, Thread, ThreadState};
use crate::types::{ProcId, ThreadId};

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGKILL: u32 = 9;
pub const SIGSEGV: u32 = 11;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGSTOP: u32 = 17;
pub const SIGTSTP: u32 = 18;
pub const SIGCONT: u32 = 19;
pub const SIGCHLD: u32 = 20;
/// Kills a single thread rather than the whole process.
pub const SIGKILLTHR: u32 = 21;
pub const SIGURG: u32 = 22;
pub const SIGWINCH: u32 = 28;

pub const SIG_COUNT: usize = 32;

/// Sender hint: more sends follow, defer the reschedule to the outermost
/// caller.
pub const SIG_FLAG_NO_RESCHED: u32 = 0x1;

/// Default disposition marker.
pub const SIG_DFL: usize = 0;
/// Ignore marker.
pub const SIG_IGN: usize = 1;

const STOP_SIGS: u32 = sig_mask(SIGSTOP) | sig_mask(SIGTSTP);

/// Bit for a signal number in a pending/blocked mask.
pub const fn sig_mask(sig: u32) -> u32 {
    1 << (sig - 1)
}

/// Per-signal action installed by sigaction.
#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: usize,
    pub mask: u32,
    pub flags: u32,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SIG_DFL,
            mask: 0,
            flags: 0,
        }
    }
}

/// Per-thread signal state, embedded in the thread record.
#[derive(Debug)]
pub struct SigState {
    pub pending: u32,
    pub block_mask: u32,
    pub actions: [SigAction; SIG_COUNT],
    /// Handler-bound signals consumed by the arch layer on the way back to
    /// user space.
    pub user_delivered: u32,
}

impl Default for SigState {
    fn default() -> Self {
        Self {
            pending: 0,
            block_mask: 0,
            actions: [SigAction::default(); SIG_COUNT],
            user_delivered: 0,
        }
    }
}

/// What the caller of `handle_signals` must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigOutcome {
    None,
    Reschedule,
    /// The thread must exit with this code.
    Exit(i32),
}

/// Deliver a signal to a thread.
pub fn send_signal_etc(tid: ThreadId, sig: u32, flags: u32) -> Result<(), KernError> {
    if sig == 0 || sig as usize > SIG_COUNT {
        return Err(KernError::InvalidArgs);
    }
    let thread = thread::get_thread(tid).ok_or(KernError::InvalidHandle)?;

    {
        let mut state = thread.sig.lock();
        state.pending |= sig_mask(sig);
        if sig == SIGCONT {
            state.pending &= !STOP_SIGS;
        }
    }

    match sig {
        SIGCONT => {
            // A continue makes a stopped thread runnable right here; the
            // signal subsystem is the single point that flips stopped
            // state.
            let mut tt = thread::thread_table().lock_irq();
            if thread.state() == ThreadState::Suspended {
                tt.make_ready(&thread);
            }
        }
        SIGKILL | SIGKILLTHR => {
            // A kill must reach a stopped thread too, or it could never
            // run to its own teardown.
            if thread.state() == ThreadState::Suspended {
                let mut tt = thread::thread_table().lock_irq();
                if thread.state() == ThreadState::Suspended {
                    tt.make_ready(&thread);
                }
            } else if thread.state() == ThreadState::Waiting {
                sem::sem_interrupt_thread(&thread);
            }
        }
        _ if thread.state() == ThreadState::Waiting => {
            // A signal aimed at an interruptable sleeper cuts the wait
            // short.
            sem::sem_interrupt_thread(&thread);
        }
        _ => {}
    }

    if flags & SIG_FLAG_NO_RESCHED == 0 && crate::arch::current_thread_id().is_some() {
        let mut tt = thread::thread_table().lock_irq();
        sched::resched(&mut tt);
    }
    Ok(())
}

pub fn send_signal(tid: ThreadId, sig: u32) -> Result<(), KernError> {
    send_signal_etc(tid, sig, 0)
}

/// Deliver a signal to a process (its main thread).
pub fn send_proc_signal_etc(pid: ProcId, sig: u32, flags: u32) -> Result<(), KernError> {
    let main = crate::kern::proc::proc_get_main_thread(pid)?;
    send_signal_etc(main, sig, flags)
}

/// Install a signal action for the current thread.
pub fn sigaction(sig: u32, action: SigAction) -> Result<(), KernError> {
    if sig == 0 || sig as usize > SIG_COUNT || sig == SIGKILL || sig == SIGKILLTHR || sig == SIGSTOP
    {
        return Err(KernError::InvalidArgs);
    }
    let thread = thread::thread_get_current_thread().ok_or(KernError::InvalidHandle)?;
    thread.sig.lock().actions[(sig - 1) as usize] = action;
    Ok(())
}

/// Adjust the current thread's blocked-signal mask. The unblockable
/// signals stay unblockable.
pub fn set_sig_block_mask(mask: u32) -> Result<u32, KernError> {
    let thread = thread::thread_get_current_thread().ok_or(KernError::InvalidHandle)?;
    let mut state = thread.sig.lock();
    let old = state.block_mask;
    state.block_mask = mask & !(sig_mask(SIGKILL) | sig_mask(SIGKILLTHR) | sig_mask(SIGSTOP));
    Ok(old)
}

/// Process the pending, unblocked signals of a thread. Called with the
/// thread lock held; the thread-lock-free consequences (the exit itself)
/// are the caller's job.
pub fn handle_signals(t: &Thread) -> SigOutcome {
    let mut outcome = SigOutcome::None;

    let mut state = t.sig.lock();
    let ready = state.pending & !state.block_mask;
    if ready == 0 {
        return SigOutcome::None;
    }

    for sig in 1..=SIG_COUNT as u32 {
        let bit = sig_mask(sig);
        if ready & bit == 0 {
            continue;
        }
        state.pending &= !bit;

        let action = state.actions[(sig - 1) as usize];
        if action.handler == SIG_IGN {
            continue;
        }
        if action.handler != SIG_DFL && sig != SIGKILL && sig != SIGKILLTHR && sig != SIGSTOP {
            state.user_delivered |= bit;
            continue;
        }

        match sig {
            SIGCHLD | SIGCONT | SIGURG | SIGWINCH => {}
            SIGSTOP | SIGTSTP => {
                t.set_next_state(ThreadState::Suspended);
                if outcome == SigOutcome::None {
                    outcome = SigOutcome::Reschedule;
                }
            }
            _ => {
                // Default disposition is to die; remaining bits keep
                // pending but the exit path makes them moot.
                return SigOutcome::Exit(sig as i32);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_mask_values() {
        assert_eq!(sig_mask(SIGHUP), 0x1);
        assert_eq!(sig_mask(SIGKILL), 0x100);
    }

    #[test]
    fn test_default_state_has_nothing_pending() {
        let state = SigState::default();
        assert_eq!(state.pending, 0);
        assert_eq!(state.block_mask, 0);
        assert_eq!(state.actions[0].handler, SIG_DFL);
    }
}
