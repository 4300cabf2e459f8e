//! Local interrupt control
//!
//! Tracks a per-CPU disable depth so nested critical sections compose. The
//! interrupt tail of the trap code consumes the reschedule sentinels returned
//! by timer hooks and by `thread_atinterrupt_exit`.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::smp;

/// Decision returned up through an interrupt frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InterruptStatus {
    NoReschedule = 0,
    Reschedule = 1,
}

pub use self::InterruptStatus::NoReschedule as INT_NO_RESCHEDULE;
pub use self::InterruptStatus::Reschedule as INT_RESCHEDULE;

const DEPTH_INIT: AtomicU32 = AtomicU32::new(0);
static DISABLE_DEPTH: [AtomicU32; smp::MAX_CPUS] = [DEPTH_INIT; smp::MAX_CPUS];

/// Disable local interrupts, incrementing the nesting depth.
pub fn int_disable_interrupts() {
    let cpu = smp::current_cpu_id();
    if DISABLE_DEPTH[cpu].fetch_add(1, Ordering::AcqRel) == 0 {
        arch_disable();
    }
}

/// Restore local interrupts, re-enabling when the depth returns to zero.
pub fn int_restore_interrupts() {
    let cpu = smp::current_cpu_id();
    let prev = DISABLE_DEPTH[cpu].fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "int_restore_interrupts: unbalanced restore");
    if prev == 1 {
        arch_enable();
    }
}

/// Whether local interrupts are currently enabled on this CPU.
pub fn int_are_interrupts_enabled() -> bool {
    DISABLE_DEPTH[smp::current_cpu_id()].load(Ordering::Acquire) == 0
}

#[cfg(all(not(test), target_arch = "x86_64"))]
fn arch_disable() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
}

#[cfg(all(not(test), target_arch = "x86_64"))]
fn arch_enable() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
}

#[cfg(any(test, not(target_arch = "x86_64")))]
fn arch_disable() {}

#[cfg(any(test, not(target_arch = "x86_64")))]
fn arch_enable() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_restore_nesting() {
        int_disable_interrupts();
        assert!(!int_are_interrupts_enabled());
        int_disable_interrupts();
        int_restore_interrupts();
        // our own outer disable still holds
        assert!(!int_are_interrupts_enabled());
        int_restore_interrupts();
    }

    #[test]
    fn test_sentinel_values() {
        assert_eq!(INT_NO_RESCHEDULE as i32, 0);
        assert_eq!(INT_RESCHEDULE as i32, 1);
    }
}
