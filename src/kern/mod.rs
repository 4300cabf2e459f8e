//! Kern subsystem - the process and thread core
//!
//! Run queues and the dispatcher, thread and process lifecycles, process
//! groups and sessions, and the lock discipline tying them together.

pub mod copyio;
pub mod cpu;
pub mod lock;
pub mod pgroup;
pub mod proc;
pub mod queue;
pub mod sched;
pub mod sem;
pub mod signal;
pub mod thread;
pub mod timer;

pub use copyio::is_kernel_address;
pub use pgroup::{getpgid, send_pgrp_signal_etc, send_session_signal_etc, setpgid, setsid};
pub use proc::{
    proc_create_proc, proc_get_main_thread, proc_get_next_proc_info, proc_get_proc_info,
    proc_kill_proc, proc_wait_on_proc, Proc, ProcInfo, ProcState,
};
pub use sched::{seed_rand, QUANTUM_US};
pub use sem::{sem_acquire, sem_acquire_etc, sem_create, sem_delete, sem_delete_etc, sem_release,
    sem_release_etc};
pub use signal::{send_proc_signal_etc, send_signal, send_signal_etc};
pub use thread::{
    thread_atinterrupt_exit, thread_atkernel_entry, thread_atkernel_exit, thread_count,
    thread_create_kernel_thread, thread_create_user_thread, thread_exit, thread_get_current_thread,
    thread_get_current_thread_id, thread_get_thread_info, thread_init, thread_init_percpu,
    thread_kill_thread, thread_kill_thread_nowait, thread_resume_thread, thread_set_priority,
    thread_snooze, thread_start_threading, thread_suspend_thread, thread_wait_on_thread,
    thread_yield, Thread, ThreadInfo, ThreadState,
};

/// Initialize the kern subsystem for `num_cpus` CPUs.
pub fn init(num_cpus: usize) {
    cpu::init(num_cpus);
    timer::init(num_cpus);
    thread::thread_init(num_cpus);
}
