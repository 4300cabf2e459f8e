//! Thread management
//!
//! Threads are the schedulable entity. A thread belongs to exactly one
//! process at a time; the first thread inserted into a process is its main
//! thread and its exit tears the process down. Records are pooled: a dead
//! thread parks on the dead queue and is reused by the next creation.
//!
//! The global thread lock guards the thread index, the run queues, the
//! dead queue, the death-stack bitmap, and per-thread scheduling state.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::arch::{self, ArchThread};
use crate::errors::KernError;
use crate::interrupt::{
    int_disable_interrupts, int_restore_interrupts, InterruptStatus, INT_NO_RESCHEDULE,
    INT_RESCHEDULE,
};
use crate::kern::copyio::{self, is_kernel_address};
use crate::kern::cpu;
use crate::kern::lock::SpinLock;
use crate::kern::pgroup;
use crate::kern::proc::{self, ProcState};
use crate::kern::queue::ThreadQueue;
use crate::kern::sched::{
    self, THREAD_HIGH_PRIORITY, THREAD_LOWEST_PRIORITY, THREAD_MAX_PRIORITY,
    THREAD_MAX_RT_PRIORITY, THREAD_MEDIUM_PRIORITY, THREAD_NUM_PRIORITY_LEVELS,
};
use crate::kern::sem::{
    self, SemWait, SEM_FLAG_INTERRUPTABLE, SEM_FLAG_NO_RESCHED, SEM_FLAG_TIMEOUT,
};
use crate::kern::signal::{self, SigOutcome, SigState, SIGCHLD, SIGCONT, SIGKILLTHR, SIGSTOP};
use crate::kern::timer;
use crate::println;
use crate::smp;
use crate::types::{
    make_name, Addr, AspaceId, Name, ProcId, RegionId, SemId, ThreadId, TimerId,
};
use crate::vm::{
    self, RegionAddr, RegionWiring, KSTACK_SIZE, LOCK_KERNEL, LOCK_RW, STACK_SIZE,
    USER_STACK_REGION, USER_STACK_REGION_SIZE,
};

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    Birth = 0,
    Ready = 1,
    Running = 2,
    Waiting = 3,
    Suspended = 4,
    /// Dead; the dispatcher moves the record to the dead queue at the next
    /// reschedule.
    FreeOnResched = 5,
}

impl ThreadState {
    fn from_u32(v: u32) -> ThreadState {
        match v {
            0 => ThreadState::Birth,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Waiting,
            4 => ThreadState::Suspended,
            _ => ThreadState::FreeOnResched,
        }
    }
}

/// Which time bucket is accruing.
pub const KERNEL_TIME: u32 = 0;
pub const USER_TIME: u32 = 1;

/// Kernel-thread entry function.
pub type KernelEntry = fn(usize) -> i32;

/// The thread record.
pub struct Thread {
    id: AtomicI32,
    name: SpinLock<Name>,
    state: AtomicU32,
    next_state: AtomicU32,
    priority: AtomicI32,

    cpu: AtomicI32,
    fpu_cpu: AtomicI32,
    fpu_state_saved: AtomicBool,

    proc: AtomicI32,
    /// Address space whose translation map must be active while this
    /// thread runs. Cached on attach so the dispatcher never takes the
    /// process lock.
    aspace: AtomicI32,

    entry: AtomicUsize,
    args: AtomicUsize,

    kernel_stack_region: AtomicI32,
    kernel_stack_base: AtomicUsize,
    user_stack_region: AtomicI32,
    user_stack_base: AtomicUsize,

    return_code_sem: AtomicI32,

    in_kernel: AtomicBool,
    int_disable_level: AtomicU32,

    user_time: AtomicU64,
    kernel_time: AtomicU64,
    last_time: AtomicU64,
    last_time_type: AtomicU32,

    pub(crate) sem_wait: SpinLock<SemWait>,
    pub(crate) sig: SpinLock<SigState>,
    pub(crate) alarm: SpinLock<Option<TimerId>>,
    pub(crate) arch: SpinLock<ArchThread>,
}

static NEXT_THREAD_ID: AtomicI32 = AtomicI32::new(1);

impl Thread {
    fn new_raw(name: &str) -> Arc<Thread> {
        let t = Arc::new(Thread {
            id: AtomicI32::new(NEXT_THREAD_ID.fetch_add(1, Ordering::AcqRel)),
            name: SpinLock::new(make_name(name)),
            state: AtomicU32::new(ThreadState::Birth as u32),
            next_state: AtomicU32::new(ThreadState::Birth as u32),
            priority: AtomicI32::new(-1),
            cpu: AtomicI32::new(-1),
            fpu_cpu: AtomicI32::new(-1),
            fpu_state_saved: AtomicBool::new(true),
            proc: AtomicI32::new(-1),
            aspace: AtomicI32::new(-1),
            entry: AtomicUsize::new(0),
            args: AtomicUsize::new(0),
            kernel_stack_region: AtomicI32::new(-1),
            kernel_stack_base: AtomicUsize::new(0),
            user_stack_region: AtomicI32::new(-1),
            user_stack_base: AtomicUsize::new(0),
            return_code_sem: AtomicI32::new(-1),
            in_kernel: AtomicBool::new(true),
            int_disable_level: AtomicU32::new(0),
            user_time: AtomicU64::new(0),
            kernel_time: AtomicU64::new(0),
            last_time: AtomicU64::new(0),
            last_time_type: AtomicU32::new(KERNEL_TIME),
            sem_wait: SpinLock::new(SemWait::default()),
            sig: SpinLock::new(SigState::default()),
            alarm: SpinLock::new(None),
            arch: SpinLock::new(ArchThread::new()),
        });
        t
    }

    /// Reset a pooled record for reuse. Only called on records quiesced on
    /// the dead queue under the thread lock.
    fn reinit(&self, name: &str) {
        *self.name.lock() = make_name(name);
        self.id
            .store(NEXT_THREAD_ID.fetch_add(1, Ordering::AcqRel), Ordering::Release);
        self.state.store(ThreadState::Birth as u32, Ordering::Release);
        self.next_state
            .store(ThreadState::Birth as u32, Ordering::Release);
        self.priority.store(-1, Ordering::Release);
        self.cpu.store(-1, Ordering::Release);
        self.fpu_cpu.store(-1, Ordering::Release);
        self.fpu_state_saved.store(true, Ordering::Release);
        self.proc.store(-1, Ordering::Release);
        self.aspace.store(-1, Ordering::Release);
        self.entry.store(0, Ordering::Release);
        self.args.store(0, Ordering::Release);
        self.kernel_stack_region.store(-1, Ordering::Release);
        self.kernel_stack_base.store(0, Ordering::Release);
        self.user_stack_region.store(-1, Ordering::Release);
        self.user_stack_base.store(0, Ordering::Release);
        self.return_code_sem.store(-1, Ordering::Release);
        self.in_kernel.store(true, Ordering::Release);
        self.int_disable_level.store(0, Ordering::Release);
        self.user_time.store(0, Ordering::Release);
        self.kernel_time.store(0, Ordering::Release);
        self.last_time.store(0, Ordering::Release);
        self.last_time_type.store(KERNEL_TIME, Ordering::Release);
        *self.sem_wait.lock() = SemWait::default();
        *self.sig.lock() = SigState::default();
        *self.alarm.lock() = None;
        *self.arch.lock() = ArchThread::new();
    }

    pub fn id(&self) -> i32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn name(&self) -> Name {
        self.name.lock().clone()
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn next_state(&self) -> ThreadState {
        ThreadState::from_u32(self.next_state.load(Ordering::Acquire))
    }

    pub fn set_next_state(&self, state: ThreadState) {
        self.next_state.store(state as u32, Ordering::Release);
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority_raw(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub fn cpu(&self) -> Option<usize> {
        match self.cpu.load(Ordering::Acquire) {
            -1 => None,
            n => Some(n as usize),
        }
    }

    pub(crate) fn set_cpu(&self, cpu: Option<usize>) {
        self.cpu.store(cpu.map_or(-1, |n| n as i32), Ordering::Release);
    }

    pub fn fpu_cpu(&self) -> Option<usize> {
        match self.fpu_cpu.load(Ordering::Acquire) {
            -1 => None,
            n => Some(n as usize),
        }
    }

    pub(crate) fn set_fpu_cpu(&self, cpu: Option<usize>) {
        self.fpu_cpu
            .store(cpu.map_or(-1, |n| n as i32), Ordering::Release);
    }

    pub fn fpu_state_saved(&self) -> bool {
        self.fpu_state_saved.load(Ordering::Acquire)
    }

    pub(crate) fn set_fpu_state_saved(&self, saved: bool) {
        self.fpu_state_saved.store(saved, Ordering::Release);
    }

    pub fn proc_id(&self) -> i32 {
        self.proc.load(Ordering::Acquire)
    }

    pub(crate) fn set_proc(&self, pid: ProcId) {
        self.proc.store(pid.0, Ordering::Release);
    }

    pub(crate) fn aspace(&self) -> AspaceId {
        AspaceId(self.aspace.load(Ordering::Acquire))
    }

    pub(crate) fn set_aspace(&self, aspace: AspaceId) {
        self.aspace.store(aspace.0, Ordering::Release);
    }

    pub fn entry(&self) -> usize {
        self.entry.load(Ordering::Acquire)
    }

    pub fn args(&self) -> usize {
        self.args.load(Ordering::Acquire)
    }

    pub fn kernel_stack_base(&self) -> Addr {
        self.kernel_stack_base.load(Ordering::Acquire)
    }

    pub fn user_stack_base(&self) -> Addr {
        self.user_stack_base.load(Ordering::Acquire)
    }

    pub(crate) fn set_kernel_stack(&self, region: RegionId, base: Addr) {
        self.kernel_stack_region.store(region.0, Ordering::Release);
        self.kernel_stack_base.store(base, Ordering::Release);
    }

    fn kernel_stack_region(&self) -> RegionId {
        RegionId(self.kernel_stack_region.load(Ordering::Acquire))
    }

    pub(crate) fn set_user_stack(&self, region: RegionId, base: Addr) {
        self.user_stack_region.store(region.0, Ordering::Release);
        self.user_stack_base.store(base, Ordering::Release);
    }

    fn take_user_stack_region(&self) -> Option<RegionId> {
        match self.user_stack_region.swap(-1, Ordering::AcqRel) {
            -1 => None,
            id => Some(RegionId(id)),
        }
    }

    fn return_code_sem(&self) -> Option<SemId> {
        match self.return_code_sem.load(Ordering::Acquire) {
            -1 => None,
            id => Some(SemId(id)),
        }
    }

    fn take_return_code_sem(&self) -> Option<SemId> {
        match self.return_code_sem.swap(-1, Ordering::AcqRel) {
            -1 => None,
            id => Some(SemId(id)),
        }
    }

    pub fn in_kernel(&self) -> bool {
        self.in_kernel.load(Ordering::Acquire)
    }

    fn set_in_kernel(&self, value: bool) {
        self.in_kernel.store(value, Ordering::Release);
    }

    pub fn user_time(&self) -> u64 {
        self.user_time.load(Ordering::Acquire)
    }

    pub fn kernel_time(&self) -> u64 {
        self.kernel_time.load(Ordering::Acquire)
    }

    /// Credit the accruing bucket with the time since the last stamp.
    pub(crate) fn credit_time(&self, now: u64) {
        let last = self.last_time.swap(now, Ordering::AcqRel);
        let delta = now.saturating_sub(last);
        if self.last_time_type.load(Ordering::Acquire) == USER_TIME {
            self.user_time.fetch_add(delta, Ordering::AcqRel);
        } else {
            self.kernel_time.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Start a fresh accounting interval.
    pub(crate) fn stamp_time(&self, now: u64) {
        self.last_time.store(now, Ordering::Release);
    }

    fn set_last_time_type(&self, bucket: u32) {
        self.last_time_type.store(bucket, Ordering::Release);
    }
}

/// One pre-created wired stack in the death-stack pool.
pub(crate) struct DeathStack {
    pub region: RegionId,
    pub address: Addr,
}

/// Everything the thread lock protects.
pub(crate) struct ThreadTable {
    threads: BTreeMap<i32, Arc<Thread>>,
    pub run_q: [ThreadQueue; THREAD_NUM_PRIORITY_LEVELS],
    pub dead_q: VecDeque<Arc<Thread>>,
    current: [Option<Arc<Thread>>; smp::MAX_CPUS],
    pub death_stacks: Vec<DeathStack>,
    pub death_stack_bitmap: u32,
}

impl ThreadTable {
    fn new() -> Self {
        const EMPTY_Q: ThreadQueue = ThreadQueue::new();
        const NO_THREAD: Option<Arc<Thread>> = None;
        Self {
            threads: BTreeMap::new(),
            run_q: [EMPTY_Q; THREAD_NUM_PRIORITY_LEVELS],
            dead_q: VecDeque::new(),
            current: [NO_THREAD; smp::MAX_CPUS],
            death_stacks: Vec::new(),
            death_stack_bitmap: 0,
        }
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.get(&id.0).cloned()
    }

    fn insert(&mut self, thread: Arc<Thread>) {
        self.threads.insert(thread.id(), thread);
    }

    fn remove(&mut self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.remove(&id.0)
    }

    pub(crate) fn current_on(&self, cpu: usize) -> Option<Arc<Thread>> {
        self.current[cpu].clone()
    }

    pub(crate) fn set_current_on(&mut self, cpu: usize, thread: Arc<Thread>) {
        self.current[cpu] = Some(thread);
    }

    /// Tail-insert a thread into the run queue for its priority, clamped
    /// into range.
    pub(crate) fn enqueue_run_q(&mut self, thread: &Arc<Thread>) {
        let mut pri = thread.priority();
        if pri > THREAD_MAX_RT_PRIORITY {
            pri = THREAD_MAX_RT_PRIORITY;
            thread.set_priority_raw(pri);
        }
        if pri < 0 {
            pri = 0;
            thread.set_priority_raw(pri);
        }
        self.run_q[pri as usize].enqueue(ThreadId(thread.id()));
    }

    /// Make a thread runnable: ready state plus a run-queue slot.
    pub(crate) fn make_ready(&mut self, thread: &Arc<Thread>) {
        thread.set_state(ThreadState::Ready);
        thread.set_next_state(ThreadState::Ready);
        self.enqueue_run_q(thread);
    }

    fn remove_from_queues(&mut self, id: ThreadId) {
        for q in self.run_q.iter_mut() {
            if q.remove(id) {
                return;
            }
        }
    }

    fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

static THREAD_TABLE: spin::Once<SpinLock<ThreadTable>> = spin::Once::new();

pub(crate) fn thread_table() -> &'static SpinLock<ThreadTable> {
    THREAD_TABLE.call_once(|| SpinLock::new(ThreadTable::new()))
}

/// Look up a live thread by id.
pub(crate) fn get_thread(id: ThreadId) -> Option<Arc<Thread>> {
    thread_table().lock().get(id)
}

static SNOOZE_SEM: AtomicI32 = AtomicI32::new(-1);
static DEATH_STACK_SEM: AtomicI32 = AtomicI32::new(-1);

fn snooze_sem() -> SemId {
    SemId(SNOOZE_SEM.load(Ordering::Acquire))
}

fn death_stack_sem() -> SemId {
    SemId(DEATH_STACK_SEM.load(Ordering::Acquire))
}

// ============================================================================
// Current thread
// ============================================================================

/// The thread executing on this CPU, if threading is up.
pub fn thread_get_current_thread() -> Option<Arc<Thread>> {
    arch::current_thread_id().and_then(get_thread)
}

pub fn thread_get_current_thread_id() -> ThreadId {
    arch::current_thread_id().unwrap_or(ThreadId(0))
}

/// The current thread's process, or the kernel process before threading
/// is up.
pub(crate) fn current_proc_id_or_kernel() -> ProcId {
    thread_get_current_thread()
        .map(|t| ProcId(t.proc_id()))
        .unwrap_or_else(proc::proc_get_kernel_proc_id)
}

// ============================================================================
// Record creation and the pool
// ============================================================================

fn create_thread_struct(name: &str) -> Result<Arc<Thread>, KernError> {
    let recycled = {
        let mut tt = thread_table().lock_irq();
        tt.dead_q.pop_front()
    };

    let t = match recycled {
        Some(t) => {
            t.reinit(name);
            t
        }
        None => Thread::new_raw(name),
    };

    let sem_name = format!("thread_{:#x}_retcode_sem", t.id());
    let sem = sem::sem_create(0, &sem_name)?;
    t.return_code_sem.store(sem.0, Ordering::Release);
    Ok(t)
}

fn delete_thread_struct(t: &Arc<Thread>) {
    if let Some(sem) = t.take_return_code_sem() {
        let _ = sem::sem_delete_etc(sem, -1);
    }
}

// ============================================================================
// Trampolines
//
// A freshly created thread's kernel stack is arranged so that its first
// dispatch lands here, still holding the thread lock with interrupts off,
// exactly as if it had been rescheduled from.
// ============================================================================

fn first_dispatch_prologue() -> Arc<Thread> {
    #[cfg(not(test))]
    unsafe {
        thread_table().force_unlock();
    }
    #[cfg(not(test))]
    int_restore_interrupts();

    let t = thread_get_current_thread().expect("trampoline with no current thread");
    t.stamp_time(timer::system_time());
    t.set_last_time_type(KERNEL_TIME);
    t
}

fn kernel_thread_kentry() -> i32 {
    let t = first_dispatch_prologue();

    let entry: KernelEntry = unsafe { core::mem::transmute(t.entry()) };
    let retcode = entry(t.args());

    thread_exit(retcode);
    0
}

fn user_thread_kentry() -> i32 {
    let t = first_dispatch_prologue();

    // A signal may have been delivered while we were in birth.
    thread_atkernel_exit();

    unsafe { arch::enter_uspace(t.entry(), t.args(), t.user_stack_base() + STACK_SIZE) };

    // The thread exits through the exit syscall; only hosted builds come
    // back from enter_uspace.
    0
}

// ============================================================================
// Creation
// ============================================================================

fn _create_thread(
    name: &str,
    pid: ProcId,
    entry: usize,
    args: usize,
    kernel: bool,
) -> Result<ThreadId, KernError> {
    let t = create_thread_struct(name)?;
    t.set_priority_raw(THREAD_MEDIUM_PRIORITY);
    t.set_state(ThreadState::Birth);
    t.set_next_state(ThreadState::Suspended);

    {
        let mut tt = thread_table().lock_irq();
        tt.insert(t.clone());
    }

    // Attach to the target process, unless it is already dying.
    let target_proc = {
        let pt = proc::proc_table().lock_irq();
        match pt.get_proc(pid) {
            Some(p) if p.state() != ProcState::Death => {
                proc::insert_thread_into_proc(&p, &t);
                Some(p)
            }
            _ => None,
        }
    };
    let Some(p) = target_proc else {
        let mut tt = thread_table().lock_irq();
        tt.remove(ThreadId(t.id()));
        drop(tt);
        delete_thread_struct(&t);
        return Err(KernError::TaskProcDeleted);
    };

    let stack_name = format!("{}_kstack", name);
    let (kstack_region, kstack_base) = vm::vm_create_anonymous_region(
        vm::vm_get_kernel_aspace_id(),
        &stack_name,
        RegionAddr::AnyAddress,
        KSTACK_SIZE,
        RegionWiring::Wired,
        LOCK_RW | LOCK_KERNEL,
    )
    .unwrap_or_else(|_| panic!("_create_thread: error creating kernel stack"));
    t.set_kernel_stack(kstack_region, kstack_base);

    t.args.store(args, Ordering::Release);
    t.entry.store(entry, Ordering::Release);

    if kernel {
        arch::initialize_kthread_stack(
            &mut t.arch.lock(),
            kstack_base + KSTACK_SIZE,
            kernel_thread_kentry,
        );
    } else {
        // Probe downward through the user stack window until a slot is
        // free.
        let aspace = AspaceId(p.aspace());
        assert!(aspace.0 >= 0, "_create_thread: user thread in a process with no address space");
        let mut base = (USER_STACK_REGION - STACK_SIZE) + USER_STACK_REGION_SIZE;
        let mut created = None;
        while base > USER_STACK_REGION {
            let stack_name = format!("{}_stack{}", p.name().as_str(), t.id());
            match vm::vm_create_anonymous_region(
                aspace,
                &stack_name,
                RegionAddr::ExactAddress(base),
                STACK_SIZE,
                RegionWiring::Lazy,
                LOCK_RW,
            ) {
                Ok(region) => {
                    created = Some(region);
                    break;
                }
                Err(_) => base -= STACK_SIZE,
            }
        }
        let (ustack_region, ustack_base) =
            created.unwrap_or_else(|| panic!("_create_thread: unable to create user stack"));
        t.set_user_stack(ustack_region, ustack_base);

        arch::initialize_kthread_stack(
            &mut t.arch.lock(),
            kstack_base + KSTACK_SIZE,
            user_thread_kentry,
        );
    }

    // The new thread starts as if it had called int_disable_interrupts.
    t.int_disable_level.store(1, Ordering::Release);
    t.set_state(ThreadState::Suspended);

    Ok(ThreadId(t.id()))
}

pub fn thread_create_user_thread(
    name: &str,
    pid: ProcId,
    entry: Addr,
    args: Addr,
) -> Result<ThreadId, KernError> {
    _create_thread(name, pid, entry, args, false)
}

pub fn thread_create_kernel_thread(
    name: &str,
    func: KernelEntry,
    args: usize,
) -> Result<ThreadId, KernError> {
    _create_thread(name, proc::proc_get_kernel_proc_id(), func as usize, args, true)
}

pub(crate) fn thread_create_kernel_thread_etc(
    name: &str,
    func: KernelEntry,
    args: usize,
    pid: ProcId,
) -> Result<ThreadId, KernError> {
    _create_thread(name, pid, func as usize, args, true)
}

pub fn user_thread_create_user_thread(
    uname: Addr,
    entry: Addr,
    args: Addr,
) -> Result<ThreadId, KernError> {
    if is_kernel_address(uname) || is_kernel_address(entry) {
        return Err(KernError::VmBadUserMemory);
    }
    let name = copyio::user_strlcpy_from(uname, crate::types::MAX_NAME_LEN)?;
    let pid = current_proc_id_or_kernel();
    thread_create_user_thread(&name, pid, entry, args)
}

// ============================================================================
// Suspend, resume, priority
// ============================================================================

/// Stopped-vs-runnable state is only ever flipped by the signal code.
pub fn thread_suspend_thread(id: ThreadId) -> Result<(), KernError> {
    signal::send_signal_etc(id, SIGSTOP, signal::SIG_FLAG_NO_RESCHED)
}

pub fn thread_resume_thread(id: ThreadId) -> Result<(), KernError> {
    signal::send_signal_etc(id, SIGCONT, signal::SIG_FLAG_NO_RESCHED)
}

pub fn thread_set_priority(id: ThreadId, priority: i32) -> Result<(), KernError> {
    let priority = priority.clamp(THREAD_LOWEST_PRIORITY, THREAD_MAX_RT_PRIORITY);

    if let Some(current) = thread_get_current_thread() {
        if current.id() == id.0 {
            // Our own record: we are running, so we are in no run queue.
            current.set_priority_raw(priority);
            return Ok(());
        }
    }

    let mut tt = thread_table().lock_irq();
    let t = tt.get(id).ok_or(KernError::InvalidHandle)?;
    if t.state() == ThreadState::Ready && t.priority() != priority {
        // Sitting in a ready queue: it has to move levels.
        tt.remove_from_queues(id);
        t.set_priority_raw(priority);
        tt.enqueue_run_q(&t);
    } else {
        t.set_priority_raw(priority);
    }
    Ok(())
}

/// User-settable priorities have a lower ceiling than kernel ones.
pub fn user_thread_set_priority(id: ThreadId, priority: i32) -> Result<(), KernError> {
    thread_set_priority(id, priority.min(THREAD_MAX_PRIORITY))
}

// ============================================================================
// Info & iteration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub owner_proc_id: ProcId,
    pub name: Name,
    pub state: ThreadState,
    pub priority: i32,
    pub user_stack_base: Addr,
    pub user_time: u64,
    pub kernel_time: u64,
}

impl ThreadInfo {
    fn from_thread(t: &Thread) -> Self {
        Self {
            id: ThreadId(t.id()),
            owner_proc_id: ProcId(t.proc_id()),
            name: t.name(),
            state: t.state(),
            priority: t.priority(),
            user_stack_base: t.user_stack_base(),
            user_time: t.user_time(),
            kernel_time: t.kernel_time(),
        }
    }

    fn write_to_user(&self, dest: Addr) -> Result<(), KernError> {
        copyio::user_write_u32(dest, self.id.0 as u32)?;
        copyio::user_write_u32(dest + 4, self.owner_proc_id.0 as u32)?;
        copyio::user_write_u32(dest + 8, self.state as u32)?;
        copyio::user_write_u32(dest + 12, self.priority as u32)?;
        copyio::user_write_u64(dest + 16, self.user_stack_base as u64)?;
        copyio::user_write_u64(dest + 24, self.user_time)?;
        copyio::user_write_u64(dest + 32, self.kernel_time)?;
        let mut name_buf = [0u8; crate::types::MAX_NAME_LEN];
        let bytes = self.name.as_bytes();
        name_buf[..bytes.len()].copy_from_slice(bytes);
        copyio::user_memcpy_to(dest + 40, &name_buf)
    }
}

pub fn thread_get_thread_info(id: ThreadId) -> Result<ThreadInfo, KernError> {
    let tt = thread_table().lock_irq();
    let t = tt.get(id).ok_or(KernError::InvalidHandle)?;
    Ok(ThreadInfo::from_thread(&t))
}

pub fn user_thread_get_thread_info(id: ThreadId, uinfo: Addr) -> Result<(), KernError> {
    if is_kernel_address(uinfo) {
        return Err(KernError::VmBadUserMemory);
    }
    let info = thread_get_thread_info(id)?;
    info.write_to_user(uinfo)
}

/// Walk a process's thread list. `cookie` 0 starts the walk; the returned
/// cookie continues it.
pub fn thread_get_next_thread_info(
    cookie: u32,
    pid: ProcId,
) -> Result<(ThreadInfo, u32), KernError> {
    let pt = proc::proc_table().lock_irq();
    let p = pt.get_proc(pid).ok_or(KernError::InvalidHandle)?;

    let thread_ids = p.thread_ids();
    let next = if cookie == 0 {
        thread_ids.first().copied()
    } else {
        thread_ids
            .iter()
            .position(|t| t.0 as u32 == cookie)
            .and_then(|pos| thread_ids.get(pos + 1))
            .copied()
    };

    let tid = next.ok_or(KernError::NotFound)?;
    let t = get_thread(tid).ok_or(KernError::NotFound)?;
    Ok((ThreadInfo::from_thread(&t), t.id() as u32))
}

pub fn user_thread_get_next_thread_info(
    ucookie: Addr,
    pid: ProcId,
    uinfo: Addr,
) -> Result<(), KernError> {
    if is_kernel_address(ucookie) || is_kernel_address(uinfo) {
        return Err(KernError::VmBadUserMemory);
    }
    let cookie = copyio::user_read_u32(ucookie)?;
    let (info, next_cookie) = thread_get_next_thread_info(cookie, pid)?;
    info.write_to_user(uinfo)?;
    copyio::user_write_u32(ucookie, next_cookie)
}

// ============================================================================
// Waiting and killing
// ============================================================================

/// Wait for a thread to exit; returns its exit code. The continue signal
/// lets a stopped thread proceed to its death if a kill is in flight.
pub fn thread_wait_on_thread(id: ThreadId) -> Result<i32, KernError> {
    signal::send_signal_etc(id, SIGCONT, 0)?;

    let sem = {
        let tt = thread_table().lock_irq();
        let t = tt.get(id).ok_or(KernError::InvalidHandle)?;
        t.return_code_sem().ok_or(KernError::InvalidHandle)?
    };

    let mut retcode = 0;
    match sem::sem_acquire_etc(sem, 1, SEM_FLAG_INTERRUPTABLE, 0, Some(&mut retcode)) {
        // The thread died the way it should; don't ripple a non-error up.
        Err(KernError::SemDeleted) => Ok(retcode),
        Ok(()) => Ok(0),
        Err(err) => Err(err),
    }
}

pub fn user_thread_wait_on_thread(id: ThreadId, uretcode: Addr) -> Result<(), KernError> {
    if is_kernel_address(uretcode) {
        return Err(KernError::VmBadUserMemory);
    }
    let retcode = thread_wait_on_thread(id)?;
    copyio::user_write_u32(uretcode, retcode as u32)
}

pub fn thread_kill_thread(id: ThreadId) -> Result<(), KernError> {
    signal::send_signal_etc(id, SIGKILLTHR, signal::SIG_FLAG_NO_RESCHED)?;
    if Some(id) != arch::current_thread_id() {
        thread_wait_on_thread(id).map(|_| ())
    } else {
        Ok(())
    }
}

pub fn thread_kill_thread_nowait(id: ThreadId) -> Result<(), KernError> {
    signal::send_signal_etc(id, SIGKILLTHR, signal::SIG_FLAG_NO_RESCHED)
}

// ============================================================================
// Snooze, yield, alarms
// ============================================================================

pub fn thread_snooze(time_us: u64) -> Result<(), KernError> {
    match sem::sem_acquire_etc(
        snooze_sem(),
        1,
        SEM_FLAG_TIMEOUT | SEM_FLAG_INTERRUPTABLE,
        time_us,
        None,
    ) {
        // Nobody ever releases the snooze sem; timing out is the normal
        // way back.
        Err(KernError::SemTimedOut) => Ok(()),
        other => other,
    }
}

pub fn user_thread_snooze(time_us: u64) -> Result<(), KernError> {
    thread_snooze(time_us)
}

pub fn thread_yield() {
    let mut tt = thread_table().lock_irq();
    sched::resched(&mut tt);
}

pub fn user_thread_yield() {
    thread_yield();
}

fn alarm_hook(data: u64) -> InterruptStatus {
    let tid = ThreadId(data as i32);
    let _ = signal::send_signal_etc(tid, signal::SIGALRM, signal::SIG_FLAG_NO_RESCHED);
    INT_RESCHEDULE
}

/// Arm (or re-arm) the current thread's alarm.
pub fn thread_set_alarm(delay_us: u64) -> Result<(), KernError> {
    let t = thread_get_current_thread().ok_or(KernError::InvalidHandle)?;
    let cpu_num = smp::current_cpu_id();
    let mut alarm = t.alarm.lock();
    if let Some(old) = alarm.take() {
        timer::timer_cancel_event(cpu_num, old);
    }
    *alarm = Some(timer::timer_set_event(cpu_num, delay_us, alarm_hook, t.id() as u64));
    Ok(())
}

// ============================================================================
// Death stacks
// ============================================================================

/// Claim a death stack. Gated by a counting semaphore sized to the pool;
/// returns with local interrupts disabled.
fn get_death_stack() -> usize {
    sem::sem_acquire(death_stack_sem(), 1).expect("death stack gate gone");

    int_disable_interrupts();
    let bit = {
        let mut tt = thread_table().lock();
        let free = !tt.death_stack_bitmap;
        let bit = free & free.wrapping_neg();
        tt.death_stack_bitmap |= bit;
        bit
    };

    if bit == 0 {
        panic!("get_death_stack: couldn't find free stack!");
    }
    if bit & (bit - 1) != 0 {
        panic!("get_death_stack: impossible bitmap result!");
    }

    bit.trailing_zeros() as usize
}

/// Return a death stack to the pool and reschedule for the last time.
fn put_death_stack_and_reschedule(index: usize) {
    {
        let tt = thread_table().lock();
        if index >= tt.death_stacks.len() || tt.death_stack_bitmap & (1 << index) == 0 {
            panic!("put_death_stack: passed invalid stack index {}", index);
        }
    }

    int_disable_interrupts();
    {
        let mut tt = thread_table().lock();
        tt.death_stack_bitmap &= !(1 << index);
    }
    // The gate release must happen outside the thread lock; NO_RESCHED
    // keeps it from running the dispatcher early.
    let _ = sem::sem_release_etc(death_stack_sem(), 1, SEM_FLAG_NO_RESCHED);
    {
        let mut tt = thread_table().lock();
        sched::resched(&mut tt);
    }
    int_restore_interrupts();
}

// ============================================================================
// Exit
// ============================================================================

struct ThreadExitArgs {
    t: Arc<Thread>,
    old_kernel_stack: RegionId,
    death_stack: usize,
}

/// The continuation, running on the death stack: free the old kernel
/// stack, unhook the record everywhere, and reschedule away forever.
fn thread_exit2(raw_args: usize) {
    let args = unsafe { Box::from_raw(raw_args as *mut ThreadExitArgs) };

    // get_death_stack left interrupts disabled.
    int_restore_interrupts();

    let _ = vm::vm_delete_region(vm::vm_get_kernel_aspace_id(), args.old_kernel_stack);

    {
        let pt = proc::proc_table().lock_irq();
        if let Some(kernel) = pt.get_proc(proc::proc_get_kernel_proc_id()) {
            proc::remove_thread_from_proc(&kernel, &args.t);
        }
    }
    {
        let mut tt = thread_table().lock_irq();
        tt.remove(ThreadId(args.t.id()));
    }

    args.t.set_next_state(ThreadState::FreeOnResched);

    if let Some(fpu_cpu) = args.t.fpu_cpu() {
        cpu::cpu_ent(fpu_cpu).set_fpu_thread(None);
        args.t.set_fpu_cpu(None);
        args.t.set_fpu_state_saved(true);
    }

    let death_stack = args.death_stack;
    drop(args);
    put_death_stack_and_reschedule(death_stack);

    #[cfg(not(test))]
    panic!("thread_exit2: made it where it shouldn't have!");
}

/// Self-exit. Tears down the process too when this is its main thread.
/// Does not return on a freestanding build.
pub fn thread_exit(retcode: i32) {
    let t = thread_get_current_thread().expect("thread_exit: no current thread");
    let pid = ProcId(t.proc_id());
    let p = proc::get_proc(pid).expect("thread_exit: current process missing");
    let mut parent_pid: Option<ProcId> = None;
    let mut delete_proc = false;

    println!("thread {:#x} exiting w/return code {:#x}", t.id(), retcode);

    // Boost our priority to get this over with.
    let _ = thread_set_priority(ThreadId(t.id()), THREAD_HIGH_PRIORITY);

    // Cancel any pending alarm.
    if let Some(alarm) = t.alarm.lock().take() {
        timer::timer_cancel_event(smp::current_cpu_id(), alarm);
    }

    // The user stack goes first.
    if p.aspace() >= 0 {
        if let Some(region) = t.take_user_stack_region() {
            let _ = vm::vm_delete_region(AspaceId(p.aspace()), region);
        }
    }

    let kernel_pid = proc::proc_get_kernel_proc_id();
    if pid != kernel_pid {
        // Move into the kernel process until we die, and make sure we run
        // on the kernel's translation map.
        let kernel_proc = proc::get_proc(kernel_pid).expect("kernel process missing");
        {
            let _pt = proc::proc_table().lock_irq();
            proc::remove_thread_from_proc(&p, &t);
            proc::insert_thread_into_proc(&kernel_proc, &t);
            if p.main_thread() == Some(ThreadId(t.id())) {
                delete_proc = true;
                p.set_state(ProcState::Death);
            }
        }
        vm::vm_aspace_swap(vm::vm_get_kernel_aspace_id());
    }

    if delete_proc {
        if p.num_threads() > 0 {
            // Kill every remaining sibling. The death state keeps new
            // threads from being inserted while we do it.
            {
                let _pt = proc::proc_table().lock_irq();
                for tid in p.thread_ids() {
                    let _ = thread_kill_thread_nowait(tid);
                }
            }
            while p.num_threads() > 0 {
                let _ = thread_snooze(10_000); // 10 ms
            }
        }

        {
            let mut pt = proc::proc_table().lock_irq();

            // Our departure may orphan our process group: nobody left in
            // the group with a parent in our parent's group, inside the
            // same session.
            if let Some(parent) = pt.get_proc(ProcId(p.parent_id())) {
                if p.sid() == parent.sid() && p.pgid() != parent.pgid() {
                    let connected = pgroup::check_for_pgrp_connection(
                        &pt,
                        crate::types::PgrpId(p.pgid()),
                        crate::types::PgrpId(parent.pgid()),
                        Some(pid),
                    );
                    if !connected {
                        println!(
                            "thread_exit: killing process {} orphans process group {}",
                            pid.0,
                            p.pgid()
                        );
                        let _ = pgroup::send_pgrp_signal_etc_locked(
                            &mut pt,
                            crate::types::PgrpId(p.pgid()),
                            signal::SIGHUP,
                            signal::SIG_FLAG_NO_RESCHED,
                        );
                        let _ = pgroup::send_pgrp_signal_etc_locked(
                            &mut pt,
                            crate::types::PgrpId(p.pgid()),
                            SIGCONT,
                            signal::SIG_FLAG_NO_RESCHED,
                        );
                    }
                }
            }

            pt.remove_proc(pid);
            proc::proc_reparent_children_locked(&mut pt, &p);
            let _ = pgroup::remove_proc_from_pgroup(&mut pt, &p, crate::types::PgrpId(p.pgid()));
            let _ = pgroup::remove_proc_from_session(&mut pt, &p, crate::types::SessId(p.sid()));

            parent_pid = Some(ProcId(p.parent_id()));
            if let Some(parent) = pt.get_proc(ProcId(p.parent_id())) {
                proc::remove_proc_from_parent(&parent, &p);
            }
        }

        // Resources owned by the process.
        if p.aspace() >= 0 {
            let aspace = AspaceId(p.aspace());
            vm::vm_put_aspace(aspace);
            let _ = vm::vm_delete_aspace(aspace);
        }
        crate::port::port_delete_owned_ports(pid);
        sem::sem_delete_owned_sems(pid);
        crate::vfs::vfs_free_ioctx(crate::types::IoCtxId(p.ioctx()));
    }

    if let Some(ppid) = parent_pid {
        let _ = signal::send_proc_signal_etc(ppid, SIGCHLD, signal::SIG_FLAG_NO_RESCHED);
    }

    // Publish the retcode to anyone waiting on us.
    if let Some(sem) = t.take_return_code_sem() {
        let _ = sem::sem_delete_etc(sem, retcode);
    }

    // From here on we need a borrowed stack: ours is about to go away.
    let death_stack = get_death_stack();
    {
        let (ds_region, ds_address) = {
            let tt = thread_table().lock();
            let ds = &tt.death_stacks[death_stack];
            (ds.region, ds.address)
        };

        let args = Box::new(ThreadExitArgs {
            t: t.clone(),
            old_kernel_stack: t.kernel_stack_region(),
            death_stack,
        });

        // The bookkeeping must change before the switch, or an interrupt
        // would land on the stack we are deleting.
        t.set_kernel_stack(ds_region, ds_address);

        unsafe {
            arch::switch_kstack_and_call(
                ds_address + KSTACK_SIZE,
                thread_exit2,
                Box::into_raw(args) as usize,
            )
        };
    }

    #[cfg(not(test))]
    panic!("thread_exit: never can get here");
}

// ============================================================================
// Kernel entry/exit bracketing
// ============================================================================

/// Trap-handler hook: a thread crossed from user into kernel space.
pub fn thread_atkernel_entry() {
    let Some(t) = thread_get_current_thread() else {
        return;
    };

    int_disable_interrupts();

    let now = timer::system_time();
    t.credit_time(now);
    t.set_last_time_type(KERNEL_TIME);

    {
        let _tt = thread_table().lock();
        t.set_in_kernel(true);
    }

    int_restore_interrupts();
}

/// Trap-handler hook: a thread is about to return to user space. Pending
/// signals are handled here and may suspend, reschedule, or end us.
pub fn thread_atkernel_exit() {
    let Some(t) = thread_get_current_thread() else {
        return;
    };

    let outcome = {
        let mut tt = thread_table().lock_irq();
        let outcome = signal::handle_signals(&t);
        if outcome == SigOutcome::Reschedule {
            sched::resched(&mut tt);
        }
        outcome
    };

    if let SigOutcome::Exit(code) = outcome {
        thread_exit(code);
        return;
    }

    {
        let _tt = thread_table().lock_irq();
        t.set_in_kernel(false);
    }

    let now = timer::system_time();
    t.credit_time(now);
    t.set_last_time_type(USER_TIME);
}

/// Interrupt-tail hook; the returned sentinel tells the frame whether to
/// call the dispatcher.
pub fn thread_atinterrupt_exit() -> InterruptStatus {
    let Some(t) = thread_get_current_thread() else {
        return INT_NO_RESCHEDULE;
    };

    let _tt = thread_table().lock();
    match signal::handle_signals(&t) {
        SigOutcome::None => INT_NO_RESCHEDULE,
        SigOutcome::Reschedule => INT_RESCHEDULE,
        SigOutcome::Exit(code) => {
            // A thread cannot tear itself down inside an interrupt frame;
            // leave the kill pending for the kernel-exit path.
            t.sig.lock().pending |= signal::sig_mask(code as u32);
            INT_RESCHEDULE
        }
    }
}

// ============================================================================
// Init
// ============================================================================

static THREADING_UP: AtomicBool = AtomicBool::new(false);

/// Bring up the threading system: kernel process, idle threads, death
/// stacks. Idempotent.
pub fn thread_init(num_cpus: usize) {
    if THREADING_UP.swap(true, Ordering::AcqRel) {
        return;
    }

    println!("initializing threading system...");

    proc::proc_init();

    let snooze = sem::sem_create(0, "snooze sem").expect("error creating snooze sem");
    SNOOZE_SEM.store(snooze.0, Ordering::Release);

    let kernel_pid = proc::proc_get_kernel_proc_id();
    let kernel_proc = proc::get_proc(kernel_pid).expect("kernel proc missing");
    let kernel_aspace = vm::vm_get_kernel_aspace_id();

    // One idle thread per CPU, pinned to its idle slot.
    for i in 0..num_cpus {
        let name = format!("idle_thread{}", i);
        let t = create_thread_struct(&name).expect("error creating idle thread struct");
        t.set_priority_raw(sched::THREAD_IDLE_PRIORITY);
        t.set_state(ThreadState::Running);
        t.set_next_state(ThreadState::Ready);
        t.int_disable_level.store(1, Ordering::Release);
        t.stamp_time(timer::system_time());

        let stack_name = format!("idle_thread{}_kstack", i);
        let (region, base) = vm::vm_create_anonymous_region(
            kernel_aspace,
            &stack_name,
            RegionAddr::AnyAddress,
            KSTACK_SIZE,
            RegionWiring::Wired,
            LOCK_RW | LOCK_KERNEL,
        )
        .expect("error creating idle kstack region");
        t.set_kernel_stack(region, base);

        {
            let mut tt = thread_table().lock_irq();
            tt.insert(t.clone());
        }
        {
            let _pt = proc::proc_table().lock_irq();
            proc::insert_thread_into_proc(&kernel_proc, &t);
        }

        t.set_cpu(Some(i));
        cpu::cpu_ent(i).set_idle_thread(ThreadId(t.id()));
        {
            let mut tt = thread_table().lock_irq();
            tt.set_current_on(i, t.clone());
        }
        if i == 0 {
            arch::set_current_thread(Some(ThreadId(t.id())));
            cpu::cpu_ent(0).set_active_aspace(t.aspace());
        }
    }

    // The death-stack pool, sized to the CPU count and clamped to the
    // bitmap width.
    let num_death_stacks = num_cpus.min(32);
    for i in 0..num_death_stacks {
        let name = format!("death_stack{}", i);
        let (region, address) = vm::vm_create_anonymous_region(
            kernel_aspace,
            &name,
            RegionAddr::AnyAddress,
            KSTACK_SIZE,
            RegionWiring::Wired,
            LOCK_RW | LOCK_KERNEL,
        )
        .expect("error creating death stacks");
        let mut tt = thread_table().lock_irq();
        tt.death_stacks.push(DeathStack { region, address });
    }
    let gate = sem::sem_create(num_death_stacks as i32, "death_stack_noavail_sem")
        .expect("error creating death stack sem");
    DEATH_STACK_SEM.store(gate.0, Ordering::Release);
}

/// Per-CPU part of bring-up: install the CPU's idle thread as current.
pub fn thread_init_percpu(cpu_num: usize) {
    if let Some(idle) = cpu::cpu_ent(cpu_num).idle_thread() {
        if cpu_num == smp::current_cpu_id() {
            arch::set_current_thread(Some(idle));
        }
    }
}

/// Start the scheduler. Runs under the context of the initial idle
/// thread.
pub fn thread_start_threading() {
    // Invalidate every other CPU's TLB before letting them loose.
    int_disable_interrupts();
    smp::smp_send_broadcast_ici(smp::IciMessage::GlobalInvalidatePage, smp::IciFlags::Sync);
    int_restore_interrupts();

    smp::smp_send_broadcast_ici(smp::IciMessage::Reschedule, smp::IciFlags::Async);

    let mut tt = thread_table().lock_irq();
    sched::resched(&mut tt);
}

/// Count of live thread records, for the debugger.
pub fn thread_count() -> usize {
    thread_table().lock().thread_count()
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a bare runnable record and put it on a run queue.
    pub fn make_ready_thread(tt: &mut ThreadTable, name: &str, priority: i32) -> ThreadId {
        let t = Thread::new_raw(name);
        t.set_priority_raw(priority);
        t.set_proc(proc::proc_get_kernel_proc_id());
        t.set_aspace(vm::vm_get_kernel_aspace_id());
        let id = ThreadId(t.id());
        tt.insert(t.clone());
        tt.make_ready(&t);
        id
    }

    /// Remove a test thread from the queues and the table.
    pub fn retire_thread(tt: &mut ThreadTable, id: ThreadId) {
        tt.remove_from_queues(id);
        tt.remove(id);
    }

    /// Create a full thread record attached to a process, without using
    /// the pool.
    pub fn make_attached_thread(name: &str, pid: ProcId, priority: i32) -> ThreadId {
        let id = _create_thread(name, pid, 0, 0, true).expect("create failed");
        let _ = thread_set_priority(id, priority);
        id
    }

    /// Install a thread as the current one on CPU 0, in the running
    /// state.
    pub fn set_current(id: ThreadId) {
        let t = get_thread(id).expect("set_current: unknown thread");
        let mut tt = thread_table().lock_irq();
        tt.remove_from_queues(id);
        t.set_state(ThreadState::Running);
        t.set_next_state(ThreadState::Ready);
        t.set_cpu(Some(0));
        tt.set_current_on(0, t.clone());
        drop(tt);
        arch::set_current_thread(Some(id));
    }

    static FIXTURE_THREAD: AtomicI32 = AtomicI32::new(-1);

    /// The serialized tests share one high-RT "test main" thread so stray
    /// reschedules always come back to it.
    pub fn reset_fixture() {
        let existing = FIXTURE_THREAD.load(Ordering::Acquire);
        let id = if existing > 0 && get_thread(ThreadId(existing)).is_some() {
            ThreadId(existing)
        } else {
            let id = {
                let mut tt = thread_table().lock_irq();
                let t = Thread::new_raw("test_main");
                t.set_priority_raw(60);
                t.set_proc(proc::proc_get_kernel_proc_id());
                t.set_aspace(vm::vm_get_kernel_aspace_id());
                let id = ThreadId(t.id());
                tt.insert(t);
                id
            };
            FIXTURE_THREAD.store(id.0, Ordering::Release);
            id
        };
        let t = get_thread(id).unwrap();
        t.set_priority_raw(60);
        *t.sig.lock() = SigState::default();
        *t.sem_wait.lock() = SemWait::default();
        set_current(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_create_thread_starts_suspended() {
        let _fixture = testing::lock_kernel();
        fn entry(_args: usize) -> i32 {
            0
        }
        let tid = thread_create_kernel_thread("suspended_kthread", entry, 0).unwrap();
        let t = get_thread(tid).unwrap();
        assert_eq!(t.state(), ThreadState::Suspended);
        assert_eq!(t.priority(), THREAD_MEDIUM_PRIORITY);
        assert_eq!(ProcId(t.proc_id()), proc::proc_get_kernel_proc_id());

        let info = thread_get_thread_info(tid).unwrap();
        assert_eq!(info.name.as_str(), "suspended_kthread");

        // clean up: run its exit from its own context
        test_support::set_current(tid);
        thread_exit(0);
    }

    #[test]
    fn test_resume_makes_ready_and_dispatchable() {
        let _fixture = testing::lock_kernel();
        fn entry(_args: usize) -> i32 {
            0
        }
        let tid = thread_create_kernel_thread("resumed_kthread", entry, 0).unwrap();
        thread_resume_thread(tid).unwrap();
        let t = get_thread(tid).unwrap();
        assert_eq!(t.state(), ThreadState::Ready);
        {
            let tt = thread_table().lock_irq();
            assert!(tt.run_q[t.priority() as usize].contains(tid));
        }

        test_support::set_current(tid);
        thread_exit(0);
    }

    #[test]
    fn test_priority_clamping_and_requeue() {
        let _fixture = testing::lock_kernel();
        let mut tt = thread_table().lock_irq();
        let tid = test_support::make_ready_thread(&mut tt, "repri", 10);
        drop(tt);

        // kernel interface clamps to the RT ceiling
        thread_set_priority(tid, 1000).unwrap();
        let t = get_thread(tid).unwrap();
        assert_eq!(t.priority(), THREAD_MAX_RT_PRIORITY);
        {
            let tt = thread_table().lock_irq();
            assert!(tt.run_q[THREAD_MAX_RT_PRIORITY as usize].contains(tid));
            assert!(!tt.run_q[10].contains(tid));
        }

        // user interface has the lower ceiling
        user_thread_set_priority(tid, 1000).unwrap();
        assert_eq!(t.priority(), THREAD_MAX_PRIORITY);

        let mut tt = thread_table().lock_irq();
        test_support::retire_thread(&mut tt, tid);
    }

    #[test]
    fn test_set_priority_unknown_thread() {
        let _fixture = testing::lock_kernel();
        assert_eq!(
            thread_set_priority(ThreadId(999_999), 10).unwrap_err(),
            KernError::InvalidHandle
        );
    }

    #[test]
    fn test_create_into_dying_proc_fails_clean() {
        let _fixture = testing::lock_kernel();
        let pid = proc::test_support::make_bare_proc("dying_proc");
        let p = proc::get_proc(pid).unwrap();
        p.set_state(ProcState::Death);

        let before = thread_count();
        fn entry(_args: usize) -> i32 {
            0
        }
        let err = thread_create_kernel_thread_etc("too_late", entry, 0, pid).unwrap_err();
        assert_eq!(err, KernError::TaskProcDeleted);
        // no leaked record in the index
        assert_eq!(thread_count(), before);

        proc::test_support::retire_proc(pid);
    }

    #[test]
    fn test_exit_publishes_retcode_to_waiter() {
        let _fixture = testing::lock_kernel();
        fn entry(_args: usize) -> i32 {
            0
        }
        let tid = thread_create_kernel_thread("exiting_kthread", entry, 0).unwrap();
        let waiter = thread_get_current_thread_id();

        sched::set_resched_hook(Box::new(move || {
            // The waiter is parked; run the target's exit.
            test_support::set_current(tid);
            thread_exit(99);
            test_support::set_current(waiter);
        }));

        let code = thread_wait_on_thread(tid).unwrap();
        assert_eq!(code, 99);
        // the record is gone from the index
        assert!(get_thread(tid).is_none());
    }

    #[test]
    fn test_exit_pools_record_on_dead_queue() {
        let _fixture = testing::lock_kernel();
        fn entry(_args: usize) -> i32 {
            0
        }
        let tid = thread_create_kernel_thread("pooled_kthread", entry, 0).unwrap();
        let fixture_tid = thread_get_current_thread_id();

        let dead_before = thread_table().lock().dead_q.len();
        test_support::set_current(tid);
        thread_exit(0);
        test_support::set_current(fixture_tid);

        let dead_after = thread_table().lock().dead_q.len();
        assert_eq!(dead_after, dead_before + 1);

        // the next creation drains the pool
        let tid2 = thread_create_kernel_thread("recycled_kthread", entry, 0).unwrap();
        assert_eq!(thread_table().lock().dead_q.len(), dead_before);
        assert_ne!(tid2, tid);

        test_support::set_current(tid2);
        thread_exit(0);
        test_support::set_current(fixture_tid);
    }

    #[test]
    fn test_main_thread_exit_kills_siblings() {
        let _fixture = testing::lock_kernel();
        let pid = proc::test_support::make_bare_proc("multi_thread_proc");
        let main = proc::test_support::give_main_thread(pid);
        let sibling = test_support::make_attached_thread("sibling", pid, 24);
        let p = proc::get_proc(pid).unwrap();
        assert_eq!(p.main_thread(), Some(main));
        assert_eq!(p.num_threads(), 2);

        // The main thread's exit signal-kills the sibling, then polls in
        // 10 ms snoozes until the thread count drains. The hook plays the
        // sibling's part while the exiter sleeps.
        sched::set_resched_hook(Box::new(move || {
            let s = get_thread(sibling).unwrap();
            assert_ne!(
                s.sig.lock().pending & signal::sig_mask(SIGKILLTHR),
                0
            );
            test_support::set_current(sibling);
            thread_atkernel_exit(); // surfaces the kill, runs the exit
            test_support::set_current(main);
            timer::timer_advance_clock(20_000);
            timer::timer_interrupt(0);
        }));

        test_support::set_current(main);
        thread_exit(0);

        assert!(proc::get_proc(pid).is_none());
        assert!(get_thread(sibling).is_none());
        assert!(get_thread(main).is_none());
    }

    #[test]
    fn test_death_stack_gating() {
        let _fixture = testing::lock_kernel();
        let gate = death_stack_sem();
        let total = thread_table().lock().death_stacks.len() as i32;
        assert!(total >= 1);
        assert_eq!(sem::sem_count(gate), Some(total));

        let index = get_death_stack();
        int_restore_interrupts(); // get_death_stack leaves them disabled
        {
            let tt = thread_table().lock();
            assert_eq!(tt.death_stack_bitmap & (1 << index), 1 << index);
            assert!(tt.death_stack_bitmap.count_ones() <= tt.death_stacks.len() as u32);
        }
        // gate value equals pool size minus popcount
        assert_eq!(sem::sem_count(gate), Some(total - 1));

        if total == 1 {
            // a second exiter blocks on the gate
            let err =
                sem::sem_acquire_etc(gate, 1, SEM_FLAG_TIMEOUT, 0, None).unwrap_err();
            assert_eq!(err, KernError::SemTimedOut);
        }

        put_death_stack_and_reschedule(index);
        {
            let tt = thread_table().lock();
            assert_eq!(tt.death_stack_bitmap & (1 << index), 0);
        }
        assert_eq!(sem::sem_count(gate), Some(total));
    }

    #[test]
    fn test_atkernel_entry_exit_time_buckets() {
        let _fixture = testing::lock_kernel();
        let t = thread_get_current_thread().unwrap();
        t.set_last_time_type(USER_TIME);
        let now = timer::system_time();
        t.stamp_time(now);

        timer::timer_advance_clock(500);
        thread_atkernel_entry();
        assert!(t.user_time() >= 500);
        assert!(t.in_kernel());

        timer::timer_advance_clock(300);
        let kernel_before = t.kernel_time();
        thread_atkernel_exit();
        assert!(t.kernel_time() >= kernel_before + 300);
        assert!(!t.in_kernel());
    }

    #[test]
    fn test_stop_signal_suspends_at_kernel_exit() {
        let _fixture = testing::lock_kernel();
        let t = thread_get_current_thread().unwrap();
        let tid = ThreadId(t.id());

        signal::send_signal_etc(tid, SIGSTOP, signal::SIG_FLAG_NO_RESCHED).unwrap();
        thread_atkernel_exit();
        assert_eq!(t.state(), ThreadState::Suspended);

        // CONT brings it back to the run queue
        thread_resume_thread(tid).unwrap();
        assert_eq!(t.state(), ThreadState::Ready);
    }

    #[test]
    fn test_snooze_wakes_by_timeout() {
        let _fixture = testing::lock_kernel();
        sched::set_resched_hook(Box::new(|| {
            timer::timer_advance_clock(20_000);
            timer::timer_interrupt(0);
        }));
        thread_snooze(10_000).unwrap();
    }

    #[test]
    fn test_wait_on_unknown_thread() {
        let _fixture = testing::lock_kernel();
        assert_eq!(
            thread_wait_on_thread(ThreadId(987_654)).unwrap_err(),
            KernError::InvalidHandle
        );
    }

    #[test]
    fn test_thread_iteration_over_proc() {
        let _fixture = testing::lock_kernel();
        let kernel = proc::proc_get_kernel_proc_id();

        let mut seen = alloc::vec::Vec::new();
        let mut cookie = 0;
        loop {
            match thread_get_next_thread_info(cookie, kernel) {
                Ok((info, next)) => {
                    seen.push(info.id);
                    cookie = next;
                }
                Err(KernError::NotFound) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        // at least the idle thread lives there
        assert!(!seen.is_empty());
    }
}
