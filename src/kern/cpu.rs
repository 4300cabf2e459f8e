//! Per-CPU state
//!
//! One record per CPU: the thread currently executing there, the thread
//! whose FPU state the CPU holds, the preemption flag set by the quantum
//! timer, the CPU's quantum timer event, its idle thread slot, and the
//! address space whose translation map is installed.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use spin::Once;

use crate::kern::lock::SpinLock;
use crate::smp;
use crate::types::{AspaceId, ThreadId, TimerId};

/// Per-CPU record.
pub struct CpuEnt {
    pub cpu_num: usize,
    current_thread: AtomicI32,
    fpu_thread: AtomicI32,
    preempted: AtomicBool,
    pub quantum_timer: SpinLock<Option<TimerId>>,
    idle_thread: AtomicI32,
    active_aspace: AtomicI32,
}

impl CpuEnt {
    fn new(cpu_num: usize) -> Self {
        Self {
            cpu_num,
            current_thread: AtomicI32::new(-1),
            fpu_thread: AtomicI32::new(-1),
            preempted: AtomicBool::new(false),
            quantum_timer: SpinLock::new(None),
            idle_thread: AtomicI32::new(-1),
            active_aspace: AtomicI32::new(-1),
        }
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        match self.current_thread.load(Ordering::Acquire) {
            -1 => None,
            id => Some(ThreadId(id)),
        }
    }

    pub fn set_current_thread(&self, id: Option<ThreadId>) {
        self.current_thread
            .store(id.map_or(-1, |t| t.0), Ordering::Release);
    }

    pub fn fpu_thread(&self) -> Option<ThreadId> {
        match self.fpu_thread.load(Ordering::Acquire) {
            -1 => None,
            id => Some(ThreadId(id)),
        }
    }

    pub fn set_fpu_thread(&self, id: Option<ThreadId>) {
        self.fpu_thread
            .store(id.map_or(-1, |t| t.0), Ordering::Release);
    }

    pub fn preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }

    pub fn set_preempted(&self, value: bool) {
        self.preempted.store(value, Ordering::Release);
    }

    pub fn idle_thread(&self) -> Option<ThreadId> {
        match self.idle_thread.load(Ordering::Acquire) {
            -1 => None,
            id => Some(ThreadId(id)),
        }
    }

    pub fn set_idle_thread(&self, id: ThreadId) {
        self.idle_thread.store(id.0, Ordering::Release);
    }

    pub fn active_aspace(&self) -> Option<AspaceId> {
        match self.active_aspace.load(Ordering::Acquire) {
            -1 => None,
            id => Some(AspaceId(id)),
        }
    }

    pub fn set_active_aspace(&self, id: AspaceId) {
        self.active_aspace.store(id.0, Ordering::Release);
    }
}

static CPUS: Once<Vec<CpuEnt>> = Once::new();

/// Initialize the per-CPU records. Idempotent.
pub fn init(num_cpus: usize) {
    CPUS.call_once(|| (0..num_cpus.clamp(1, smp::MAX_CPUS)).map(CpuEnt::new).collect());
}

/// The record for a specific CPU.
pub fn cpu_ent(cpu_num: usize) -> &'static CpuEnt {
    &CPUS.get().expect("cpu table not initialized")[cpu_num]
}

/// The record for the CPU executing the caller.
pub fn current_cpu() -> &'static CpuEnt {
    cpu_ent(smp::current_cpu_id())
}

/// Like `current_cpu`, but usable before the CPU table exists.
pub fn try_current_cpu() -> Option<&'static CpuEnt> {
    CPUS.get().map(|cpus| &cpus[smp::current_cpu_id()])
}

/// Number of CPU records.
pub fn num_cpus() -> usize {
    CPUS.get().map_or(0, |cpus| cpus.len())
}
