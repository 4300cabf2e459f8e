//! Counting semaphores
//!
//! The blocking primitive the thread core consumes: acquire with timeout
//! and interruptable flags, release with a no-reschedule hint for fan-out
//! paths, and delete-with-retcode, which is how an exiting thread publishes
//! its exit code to waiters.
//!
//! Lock order: the semaphore table lock may be held over the thread lock;
//! it never touches the process lock.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use spin::Once;

use crate::errors::KernError;
use crate::interrupt::{InterruptStatus, INT_RESCHEDULE};
use crate::kern::lock::SpinLock;
use crate::kern::sched;
use crate::kern::thread::{self, Thread};
use crate::kern::timer;
use crate::smp;
use crate::types::{make_name, Name, ProcId, SemId, ThreadId, TimerId};

pub const SEM_FLAG_NO_RESCHED: u32 = 0x1;
pub const SEM_FLAG_TIMEOUT: u32 = 0x2;
pub const SEM_FLAG_INTERRUPTABLE: u32 = 0x4;

/// Sentinel stored in a waiter's errcode slot until the wakeup path fills
/// in the real outcome.
pub(crate) const SEM_ERRCODE_PENDING: i32 = i32::MIN;

/// Per-thread semaphore wait state, embedded in the thread record.
#[derive(Debug)]
pub struct SemWait {
    pub blocking: Option<SemId>,
    pub count: u32,
    pub flags: u32,
    pub errcode: i32,
    pub deleted_retcode: i32,
    pub timer: Option<TimerId>,
}

impl Default for SemWait {
    fn default() -> Self {
        Self {
            blocking: None,
            count: 0,
            flags: 0,
            errcode: SEM_ERRCODE_PENDING,
            deleted_retcode: 0,
            timer: None,
        }
    }
}

struct Waiter {
    tid: ThreadId,
    count: u32,
}

struct Sem {
    #[allow(dead_code)]
    name: Name,
    owner: ProcId,
    count: i32,
    waiters: VecDeque<Waiter>,
}

struct SemTable {
    sems: BTreeMap<SemId, Sem>,
    next_id: i32,
}

static SEMS: Once<SpinLock<SemTable>> = Once::new();

fn sem_table() -> &'static SpinLock<SemTable> {
    SEMS.call_once(|| {
        SpinLock::new(SemTable {
            sems: BTreeMap::new(),
            next_id: 1,
        })
    })
}

/// Create a semaphore owned by `owner` with an initial count.
pub fn sem_create_etc(count: i32, name: &str, owner: ProcId) -> Result<SemId, KernError> {
    if count < 0 {
        return Err(KernError::InvalidArgs);
    }
    let mut table = sem_table().lock_irq();
    let id = SemId(table.next_id);
    table.next_id += 1;
    table.sems.insert(
        id,
        Sem {
            name: make_name(name),
            owner,
            count,
            waiters: VecDeque::new(),
        },
    );
    Ok(id)
}

/// Create a semaphore owned by the current process (the kernel process if
/// threading is not up yet).
pub fn sem_create(count: i32, name: &str) -> Result<SemId, KernError> {
    sem_create_etc(count, name, thread::current_proc_id_or_kernel())
}

pub fn sem_acquire(id: SemId, count: u32) -> Result<(), KernError> {
    sem_acquire_etc(id, count, 0, 0, None)
}

/// Acquire `count` units, optionally bounded by a timeout and optionally
/// interruptable by signals. When the semaphore is deleted underneath the
/// waiter, the deleter's retcode is stored through `deleted_retcode` and
/// `SemDeleted` is returned.
pub fn sem_acquire_etc(
    id: SemId,
    count: u32,
    flags: u32,
    timeout_us: u64,
    deleted_retcode: Option<&mut i32>,
) -> Result<(), KernError> {
    if count == 0 {
        return Err(KernError::InvalidArgs);
    }

    let thread = {
        let mut table = sem_table().lock_irq();
        let sem = table.sems.get_mut(&id).ok_or(KernError::InvalidHandle)?;

        if sem.count >= count as i32 {
            sem.count -= count as i32;
            return Ok(());
        }

        if flags & SEM_FLAG_TIMEOUT != 0 && timeout_us == 0 {
            return Err(KernError::SemTimedOut);
        }

        let tid = crate::arch::current_thread_id()
            .expect("sem_acquire: would block with no current thread");
        let thread = thread::get_thread(tid).expect("sem_acquire: current thread not in table");

        {
            let mut wait = thread.sem_wait.lock();
            wait.blocking = Some(id);
            wait.count = count;
            wait.flags = flags;
            wait.errcode = SEM_ERRCODE_PENDING;
            wait.deleted_retcode = 0;
            wait.timer = if flags & SEM_FLAG_TIMEOUT != 0 {
                Some(timer::timer_set_event(
                    smp::current_cpu_id(),
                    timeout_us,
                    sem_timeout_hook,
                    tid.0 as u64,
                ))
            } else {
                None
            };
        }
        sem.waiters.push_back(Waiter { tid, count });
        thread.set_next_state(thread::ThreadState::Waiting);
        thread
    };

    {
        let mut tt = thread::thread_table().lock_irq();
        sched::resched(&mut tt);
    }

    // On a hosted target "the other threads run now" is a registered
    // hook; see sched::run_resched_hook.
    #[cfg(test)]
    sched::run_resched_hook();

    // Woken: read the outcome the waker left for us.
    let (errcode, retcode, timer_id) = {
        let mut wait = thread.sem_wait.lock();
        let out = (wait.errcode, wait.deleted_retcode, wait.timer.take());
        wait.blocking = None;
        wait.errcode = SEM_ERRCODE_PENDING;
        out
    };
    if let Some(tid) = timer_id {
        timer::timer_cancel_event(smp::current_cpu_id(), tid);
    }

    match KernError::from_status(errcode) {
        None if errcode == SEM_ERRCODE_PENDING => {
            panic!("sem_acquire: woke without an outcome")
        }
        None => Ok(()),
        Some(KernError::SemDeleted) => {
            if let Some(out) = deleted_retcode {
                *out = retcode;
            }
            Err(KernError::SemDeleted)
        }
        Some(err) => Err(err),
    }
}

pub fn sem_release(id: SemId, count: u32) -> Result<(), KernError> {
    sem_release_etc(id, count, 0)
}

/// Release `count` units. `SEM_FLAG_NO_RESCHED` defers the reschedule to
/// the outermost caller so a fan-out performs at most one.
pub fn sem_release_etc(id: SemId, count: u32, flags: u32) -> Result<(), KernError> {
    {
        let mut table = sem_table().lock_irq();
        let sem = table.sems.get_mut(&id).ok_or(KernError::InvalidHandle)?;
        sem.count += count as i32;

        loop {
            let satisfiable = sem
                .waiters
                .front()
                .is_some_and(|w| sem.count >= w.count as i32);
            if !satisfiable {
                break;
            }
            let waiter = sem.waiters.pop_front().unwrap();
            sem.count -= waiter.count as i32;
            wake_waiter(waiter.tid, crate::errors::NO_ERROR, 0);
        }
    }

    if flags & SEM_FLAG_NO_RESCHED == 0 && crate::arch::current_thread_id().is_some() {
        let mut tt = thread::thread_table().lock_irq();
        sched::resched(&mut tt);
    }
    Ok(())
}

pub fn sem_delete(id: SemId) -> Result<(), KernError> {
    sem_delete_etc(id, -1)
}

/// Delete a semaphore, waking every waiter with `SemDeleted` and the given
/// retcode.
pub fn sem_delete_etc(id: SemId, retcode: i32) -> Result<(), KernError> {
    let mut table = sem_table().lock_irq();
    let sem = table.sems.remove(&id).ok_or(KernError::InvalidHandle)?;
    for waiter in sem.waiters {
        wake_waiter(waiter.tid, KernError::SemDeleted.as_status(), retcode);
    }
    Ok(())
}

/// Delete every semaphore owned by a process. Used by the exit path.
pub fn sem_delete_owned_sems(owner: ProcId) -> usize {
    let ids: Vec<SemId> = {
        let table = sem_table().lock_irq();
        table
            .sems
            .iter()
            .filter(|(_, s)| s.owner == owner)
            .map(|(&id, _)| id)
            .collect()
    };
    let count = ids.len();
    for id in ids {
        let _ = sem_delete_etc(id, -1);
    }
    count
}

/// Interrupt a thread blocked on an interruptable semaphore wait. Called
/// by the signal code with no locks held. Returns whether the thread was
/// taken off a wait queue.
pub fn sem_interrupt_thread(thread: &Thread) -> bool {
    let mut table = sem_table().lock_irq();
    let (blocking, flags, tid) = {
        let wait = thread.sem_wait.lock();
        (wait.blocking, wait.flags, ThreadId(thread.id()))
    };
    let Some(sem_id) = blocking else {
        return false;
    };
    if flags & SEM_FLAG_INTERRUPTABLE == 0 {
        return false;
    }
    if let Some(sem) = table.sems.get_mut(&sem_id) {
        if let Some(pos) = sem.waiters.iter().position(|w| w.tid == tid) {
            sem.waiters.remove(pos);
        }
    }
    wake_waiter(tid, KernError::SemInterrupted.as_status(), 0);
    true
}

/// Current count, mainly for assertions and the debugger.
pub fn sem_count(id: SemId) -> Option<i32> {
    sem_table().lock().sems.get(&id).map(|s| s.count)
}

/// Deposit an outcome and make the waiter runnable. Caller holds the
/// semaphore table lock (or has already detached the waiter).
fn wake_waiter(tid: ThreadId, errcode: i32, retcode: i32) {
    let Some(thread) = thread::get_thread(tid) else {
        return;
    };
    {
        let mut wait = thread.sem_wait.lock();
        wait.errcode = errcode;
        wait.deleted_retcode = retcode;
        wait.blocking = None;
    }
    let mut tt = thread::thread_table().lock_irq();
    if thread.state() == thread::ThreadState::Waiting {
        tt.make_ready(&thread);
    } else {
        // Not switched out yet: cancel the pending wait.
        thread.set_next_state(thread::ThreadState::Ready);
    }
}

fn sem_timeout_hook(data: u64) -> InterruptStatus {
    let tid = ThreadId(data as i32);
    if let Some(thread) = thread::get_thread(tid) {
        let timed_out = {
            let mut table = sem_table().lock_irq();
            let mut wait = thread.sem_wait.lock();
            if let Some(sem_id) = wait.blocking {
                if let Some(sem) = table.sems.get_mut(&sem_id) {
                    if let Some(pos) = sem.waiters.iter().position(|w| w.tid == tid) {
                        sem.waiters.remove(pos);
                    }
                }
                wait.blocking = None;
                wait.errcode = KernError::SemTimedOut.as_status();
                true
            } else {
                false
            }
        };
        if timed_out {
            let mut tt = thread::thread_table().lock_irq();
            if thread.state() == thread::ThreadState::Waiting {
                tt.make_ready(&thread);
            } else {
                thread.set_next_state(thread::ThreadState::Ready);
            }
        }
    }
    INT_RESCHEDULE
}
