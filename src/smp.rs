//! SMP support
//!
//! CPU discovery plus the inter-processor interrupt (ICI) broadcast used
//! for cross-CPU TLB invalidation and reschedule requests. On a single
//! bring-up CPU the broadcasts reduce to flag updates that the other CPUs
//! observe when they come online.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Hard upper bound on supported CPUs.
pub const MAX_CPUS: usize = 32;

/// ICI message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IciMessage {
    /// Invalidate the whole TLB on every CPU.
    GlobalInvalidatePage,
    /// Ask every CPU to run its dispatcher at the next opportunity.
    Reschedule,
}

/// Delivery flags for [`smp_send_broadcast_ici`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IciFlags {
    Async,
    Sync,
}

static NUM_CPUS: AtomicUsize = AtomicUsize::new(1);
static TLB_INVALIDATE_GEN: AtomicU32 = AtomicU32::new(0);

const FLAG_INIT: AtomicBool = AtomicBool::new(false);
static RESCHED_REQUESTED: [AtomicBool; MAX_CPUS] = [FLAG_INIT; MAX_CPUS];

/// Record the number of CPUs in the system. Called once at boot.
pub fn smp_set_num_cpus(num: usize) {
    NUM_CPUS.store(num.clamp(1, MAX_CPUS), Ordering::Release);
}

pub fn smp_get_num_cpus() -> usize {
    NUM_CPUS.load(Ordering::Acquire)
}

/// The CPU executing the caller. Secondary CPUs are identified by the
/// per-CPU data the arch layer installs at bring-up; until then everything
/// runs on the bootstrap processor.
pub fn current_cpu_id() -> usize {
    0
}

/// Broadcast an ICI to every other CPU.
pub fn smp_send_broadcast_ici(msg: IciMessage, _flags: IciFlags) {
    match msg {
        IciMessage::GlobalInvalidatePage => {
            TLB_INVALIDATE_GEN.fetch_add(1, Ordering::AcqRel);
        }
        IciMessage::Reschedule => {
            let me = current_cpu_id();
            for (cpu, flag) in RESCHED_REQUESTED
                .iter()
                .enumerate()
                .take(smp_get_num_cpus())
            {
                if cpu != me {
                    flag.store(true, Ordering::Release);
                }
            }
        }
    }
}

/// Consume a pending reschedule request for a CPU.
pub fn take_reschedule_request(cpu: usize) -> bool {
    RESCHED_REQUESTED[cpu].swap(false, Ordering::AcqRel)
}

/// Generation counter bumped by every global TLB invalidate broadcast.
pub fn tlb_invalidate_generation() -> u32 {
    TLB_INVALIDATE_GEN.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_cpus_clamped() {
        let _fixture = crate::testing::lock_kernel();
        smp_set_num_cpus(0);
        assert_eq!(smp_get_num_cpus(), 1);
        smp_set_num_cpus(MAX_CPUS + 5);
        assert_eq!(smp_get_num_cpus(), MAX_CPUS);
        smp_set_num_cpus(1);
    }

    #[test]
    fn test_tlb_broadcast_bumps_generation() {
        let before = tlb_invalidate_generation();
        smp_send_broadcast_ici(IciMessage::GlobalInvalidatePage, IciFlags::Sync);
        assert!(tlb_invalidate_generation() > before);
    }
}
