//! Kestrel - a monolithic kernel process and thread subsystem
//!
//! The core that turns a set of CPUs into a multi-programmed system: a
//! shared run queue with preemption and priority classes, thread and
//! process lifecycles (including the death-stack self-teardown), process
//! groups and sessions with orphan detection, and the two-spinlock lock
//! discipline governing all of it.

#![cfg_attr(not(test), no_std)]
// Kernel types often have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod errors;
pub mod types;

pub mod arch;
pub mod console;
pub mod elf;
pub mod interrupt;
pub mod kern;
pub mod port;
pub mod smp;
pub mod vfs;
pub mod vm;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Kestrel";

/// Bring the subsystem up on `num_cpus` CPUs. Idempotent.
pub fn init(num_cpus: usize) {
    smp::smp_set_num_cpus(num_cpus);
    vm::init();
    kern::init(num_cpus);
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for tests that touch the global kernel tables.
    //!
    //! The tables, the system clock, and the per-CPU current-thread slots
    //! are process-wide, so such tests serialize on one lock and run with
    //! a high-RT "test main" thread installed as current - stray
    //! reschedules always come back to it.

    use spin::{Mutex, MutexGuard};

    static KERNEL_LOCK: Mutex<()> = Mutex::new(());

    pub fn lock_kernel() -> MutexGuard<'static, ()> {
        let guard = KERNEL_LOCK.lock();
        crate::init(1);
        crate::kern::thread::test_support::reset_fixture();
        guard
    }

    /// Tests that only drive the clock share the same serialization.
    pub fn lock_clock() -> MutexGuard<'static, ()> {
        lock_kernel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Kestrel");
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_is_idempotent() {
        let _fixture = testing::lock_kernel();
        init(1);
        init(1);
        assert!(kern::thread::thread_count() > 0);
    }
}
