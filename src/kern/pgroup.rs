//! Process groups and sessions
//!
//! Job-control groupings: every process is in exactly one process group
//! and one session, and a session wholly contains any group it references.
//! A group whose members have no parent outside the group but inside the
//! same session is orphaned; orphaning delivers hangup-then-continue.
//!
//! Membership lives under the process lock. Group and session nodes are
//! allocated outside the lock (allocation may block), re-checked, and
//! either published or discarded.

use alloc::vec::Vec;

use crate::errors::KernError;
use crate::kern::proc::{self, Proc, ProcTable};
use crate::kern::sched;
use crate::kern::signal::{self, SIG_FLAG_NO_RESCHED};
use crate::kern::thread;
use crate::types::{PgrpId, ProcId, SessId};

use alloc::sync::Arc;

/// A process group or session: the founder's id plus the member list.
pub(crate) struct GroupNode {
    pub id: i32,
    pub members: Vec<ProcId>,
}

impl GroupNode {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            members: Vec::new(),
        }
    }
}

// ============================================================================
// Membership (callers hold the process lock)
// ============================================================================

pub(crate) fn add_proc_to_pgroup(
    pt: &mut ProcTable,
    p: &Arc<Proc>,
    pgid: PgrpId,
) -> Result<(), KernError> {
    let node = pt.pgroups.get_mut(&pgid.0).ok_or(KernError::NotFound)?;
    p.set_pgid(pgid.0);
    debug_assert!(!node.members.contains(&p.id()));
    node.members.insert(0, p.id());
    Ok(())
}

pub(crate) fn remove_proc_from_pgroup(
    pt: &mut ProcTable,
    p: &Arc<Proc>,
    pgid: PgrpId,
) -> Result<(), KernError> {
    let node = pt.pgroups.get_mut(&pgid.0).ok_or(KernError::NotFound)?;
    debug_assert_eq!(p.pgid(), pgid.0);
    let pid = p.id();
    node.members.retain(|&id| id != pid);
    Ok(())
}

pub(crate) fn add_proc_to_session(
    pt: &mut ProcTable,
    p: &Arc<Proc>,
    sid: SessId,
) -> Result<(), KernError> {
    let node = pt.sessions.get_mut(&sid.0).ok_or(KernError::NotFound)?;
    p.set_sid(sid.0);
    debug_assert!(!node.members.contains(&p.id()));
    node.members.insert(0, p.id());
    Ok(())
}

pub(crate) fn remove_proc_from_session(
    pt: &mut ProcTable,
    p: &Arc<Proc>,
    sid: SessId,
) -> Result<(), KernError> {
    let node = pt.sessions.get_mut(&sid.0).ok_or(KernError::NotFound)?;
    debug_assert_eq!(p.sid(), sid.0);
    let pid = p.id();
    node.members.retain(|&id| id != pid);
    Ok(())
}

// ============================================================================
// Orphan detection
// ============================================================================

/// A group is still connected when any member other than `ignore` has a
/// parent in `check_for`. Holds the process lock.
pub(crate) fn check_for_pgrp_connection(
    pt: &ProcTable,
    pgid: PgrpId,
    check_for: PgrpId,
    ignore: Option<ProcId>,
) -> bool {
    let Some(node) = pt.pgroups.get(&pgid.0) else {
        return false;
    };
    for &member in &node.members {
        if Some(member) == ignore {
            continue;
        }
        let Some(p) = pt.get_proc(member) else {
            continue;
        };
        debug_assert_eq!(p.pgid(), pgid.0);
        if let Some(parent) = pt.get_proc(ProcId(p.parent_id())) {
            if parent.pgid() == check_for.0 {
                return true;
            }
        }
    }
    false
}

// ============================================================================
// Group-directed signals
// ============================================================================

/// Deliver a signal to every member of a process group. Holds the process
/// lock; each send defers its reschedule so the fan-out performs at most
/// one.
pub(crate) fn send_pgrp_signal_etc_locked(
    pt: &mut ProcTable,
    pgid: PgrpId,
    sig: u32,
    flags: u32,
) -> Result<(), KernError> {
    let members = match pt.pgroups.get(&pgid.0) {
        Some(node) => node.members.clone(),
        None => return Err(KernError::NotFound),
    };
    for member in members {
        if let Some(p) = pt.get_proc(member) {
            if let Some(main) = p.main_thread() {
                let _ = signal::send_signal_etc(main, sig, flags | SIG_FLAG_NO_RESCHED);
            }
        }
    }
    Ok(())
}

pub fn send_pgrp_signal_etc(pgid: PgrpId, sig: u32, flags: u32) -> Result<(), KernError> {
    let result = {
        let mut pt = proc::proc_table().lock_irq();
        send_pgrp_signal_etc_locked(&mut pt, pgid, sig, flags)
    };
    if flags & SIG_FLAG_NO_RESCHED == 0 && crate::arch::current_thread_id().is_some() {
        let mut tt = thread::thread_table().lock_irq();
        sched::resched(&mut tt);
    }
    result
}

/// Deliver a signal to every member of a session.
pub fn send_session_signal_etc(sid: SessId, sig: u32, flags: u32) -> Result<(), KernError> {
    let result = {
        let pt = proc::proc_table().lock_irq();
        let members = match pt.sessions.get(&sid.0) {
            Some(node) => node.members.clone(),
            None => return Err(KernError::NotFound),
        };
        for member in members {
            if let Some(p) = pt.get_proc(member) {
                if let Some(main) = p.main_thread() {
                    let _ = signal::send_signal_etc(main, sig, flags | SIG_FLAG_NO_RESCHED);
                }
            }
        }
        Ok(())
    };
    if flags & SIG_FLAG_NO_RESCHED == 0 && crate::arch::current_thread_id().is_some() {
        let mut tt = thread::thread_table().lock_irq();
        sched::resched(&mut tt);
    }
    result
}

// ============================================================================
// setpgid / getpgid / setsid
// ============================================================================

/// Move a process to a process group, creating the group if needed.
/// `pid` 0 means the caller, `pgid` 0 means a group named after `pid`.
pub fn setpgid(pid: ProcId, pgid: PgrpId) -> Result<(), KernError> {
    if pid.0 < 0 || pgid.0 < 0 {
        return Err(KernError::InvalidArgs);
    }
    let pid = if pid.0 == 0 {
        proc::proc_get_current_proc_id()
    } else {
        pid
    };
    let pgid = if pgid.0 == 0 { PgrpId(pid.0) } else { pgid };

    let mut preallocated: Option<GroupNode> = None;
    loop {
        let mut pt = proc::proc_table().lock_irq();

        let p = pt.get_proc(pid).ok_or(KernError::NotFound)?;
        if p.pgid() == pgid.0 {
            // already a member; a preallocated node is simply discarded
            return Ok(());
        }

        if !pt.pgroups.contains_key(&pgid.0) {
            match preallocated.take() {
                Some(node) => {
                    pt.pgroups.insert(pgid.0, node);
                }
                None => {
                    // The node allocation may block: drop the lock, build
                    // it, and re-check on the way back in.
                    drop(pt);
                    preallocated = Some(GroupNode::new(pgid.0));
                    continue;
                }
            }
        }

        remove_proc_from_pgroup(&mut pt, &p, PgrpId(p.pgid()))?;
        add_proc_to_pgroup(&mut pt, &p, pgid)?;
        return Ok(());
    }
}

pub fn getpgid(pid: ProcId) -> Result<PgrpId, KernError> {
    if pid.0 < 0 {
        return Err(KernError::InvalidArgs);
    }
    let pid = if pid.0 == 0 {
        proc::proc_get_current_proc_id()
    } else {
        pid
    };
    let pt = proc::proc_table().lock_irq();
    let p = pt.get_proc(pid).ok_or(KernError::NotFound)?;
    Ok(PgrpId(p.pgid()))
}

/// Put the calling process in a session of its own. Calling it again in
/// the same process is a no-op returning the same session id.
pub fn setsid() -> Result<SessId, KernError> {
    let pid = proc::proc_get_current_proc_id();
    let sid = SessId(pid.0);

    let mut preallocated: Option<GroupNode> = None;
    loop {
        let mut pt = proc::proc_table().lock_irq();

        let p = pt.get_proc(pid).ok_or(KernError::NotFound)?;
        if p.sid() == sid.0 {
            return Ok(sid);
        }

        if !pt.sessions.contains_key(&sid.0) {
            match preallocated.take() {
                Some(node) => {
                    pt.sessions.insert(sid.0, node);
                }
                None => {
                    drop(pt);
                    preallocated = Some(GroupNode::new(sid.0));
                    continue;
                }
            }
        }

        remove_proc_from_session(&mut pt, &p, SessId(p.sid()))?;
        add_proc_to_session(&mut pt, &p, sid)?;
        return Ok(sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::proc::test_support;
    use crate::kern::signal::{sig_mask, SIGHUP};
    use crate::testing;

    #[test]
    fn test_setpgid_getpgid_round_trip() {
        let _fixture = testing::lock_kernel();
        let pid = test_support::make_bare_proc("pgid_proc");

        setpgid(pid, PgrpId(pid.0)).unwrap();
        assert_eq!(getpgid(pid).unwrap(), PgrpId(pid.0));

        // moving again to the same group is a no-op
        setpgid(pid, PgrpId(pid.0)).unwrap();
        assert_eq!(getpgid(pid).unwrap(), PgrpId(pid.0));

        {
            let pt = proc::proc_table().lock_irq();
            let node = pt.pgroups.get(&pid.0).unwrap();
            assert_eq!(node.members, alloc::vec![pid]);
        }

        test_support::retire_proc(pid);
    }

    #[test]
    fn test_setpgid_rejects_bad_args() {
        let _fixture = testing::lock_kernel();
        assert_eq!(
            setpgid(ProcId(-2), PgrpId(0)).unwrap_err(),
            KernError::InvalidArgs
        );
        assert_eq!(
            setpgid(ProcId(999_999), PgrpId(999_999)).unwrap_err(),
            KernError::NotFound
        );
    }

    #[test]
    fn test_move_between_groups_is_single_membership() {
        let _fixture = testing::lock_kernel();
        let a = test_support::make_bare_proc("grp_a");
        let b = test_support::make_bare_proc("grp_b");

        setpgid(a, PgrpId(a.0)).unwrap();
        setpgid(b, PgrpId(a.0)).unwrap();
        {
            let pt = proc::proc_table().lock_irq();
            assert_eq!(pt.pgroups.get(&a.0).unwrap().members.len(), 2);
        }

        // b founds its own group; it must leave a's
        setpgid(b, PgrpId(b.0)).unwrap();
        {
            let pt = proc::proc_table().lock_irq();
            assert_eq!(pt.pgroups.get(&a.0).unwrap().members, alloc::vec![a]);
            assert_eq!(pt.pgroups.get(&b.0).unwrap().members, alloc::vec![b]);
        }

        test_support::retire_proc(b);
        test_support::retire_proc(a);
    }

    #[test]
    fn test_setsid_twice_is_idempotent() {
        let _fixture = testing::lock_kernel();
        let pid = test_support::make_bare_proc("session_proc");
        let main = test_support::give_main_thread(pid);
        crate::kern::thread::test_support::set_current(main);

        let sid = setsid().unwrap();
        assert_eq!(sid, SessId(pid.0));
        let again = setsid().unwrap();
        assert_eq!(again, sid);

        // restore the fixture as current before cleanup
        crate::kern::thread::test_support::set_current(main);
        crate::kern::thread::thread_exit(0);
    }

    #[test]
    fn test_pgrp_connection_detection() {
        let _fixture = testing::lock_kernel();
        let kernel_pgid = {
            let pt = proc::proc_table().lock_irq();
            let kernel = pt.get_proc(proc::proc_get_kernel_proc_id()).unwrap();
            PgrpId(kernel.pgid())
        };

        // one process alone in its own group, parented by the kernel proc
        let lone = test_support::make_bare_proc("lone_member");
        setpgid(lone, PgrpId(lone.0)).unwrap();

        let pt = proc::proc_table().lock_irq();
        // connected to the kernel group through its parent
        assert!(check_for_pgrp_connection(
            &pt,
            PgrpId(lone.0),
            kernel_pgid,
            None
        ));
        // but not once the process is ignored
        assert!(!check_for_pgrp_connection(
            &pt,
            PgrpId(lone.0),
            kernel_pgid,
            Some(lone)
        ));
        // and not against an unrelated group id
        assert!(!check_for_pgrp_connection(
            &pt,
            PgrpId(lone.0),
            PgrpId(lone.0),
            None
        ));
        drop(pt);

        test_support::retire_proc(lone);
    }

    #[test]
    fn test_group_signal_fans_out_to_main_threads() {
        let _fixture = testing::lock_kernel();
        let a = test_support::make_bare_proc("fan_a");
        let b = test_support::make_bare_proc("fan_b");
        let a_main = test_support::give_main_thread(a);
        let b_main = test_support::give_main_thread(b);

        setpgid(a, PgrpId(a.0)).unwrap();
        setpgid(b, PgrpId(a.0)).unwrap();

        send_pgrp_signal_etc(PgrpId(a.0), SIGHUP, SIG_FLAG_NO_RESCHED).unwrap();

        for main in [a_main, b_main] {
            let t = crate::kern::thread::get_thread(main).unwrap();
            assert_ne!(t.sig.lock().pending & sig_mask(SIGHUP), 0);
        }

        assert_eq!(
            send_pgrp_signal_etc(PgrpId(987_654), SIGHUP, SIG_FLAG_NO_RESCHED).unwrap_err(),
            KernError::NotFound
        );

        for main in [a_main, b_main] {
            crate::kern::thread::test_support::set_current(main);
            crate::kern::thread::thread_exit(0);
        }
    }

    #[test]
    fn test_session_signal_fans_out() {
        let _fixture = testing::lock_kernel();
        let leader = test_support::make_bare_proc("sess_leader");
        let leader_main = test_support::give_main_thread(leader);
        crate::kern::thread::test_support::set_current(leader_main);
        let sid = setsid().unwrap();

        send_session_signal_etc(sid, SIGHUP, SIG_FLAG_NO_RESCHED).unwrap();

        let t = crate::kern::thread::get_thread(leader_main).unwrap();
        assert_ne!(t.sig.lock().pending & sig_mask(SIGHUP), 0);

        crate::kern::thread::test_support::set_current(leader_main);
        crate::kern::thread::thread_exit(0);
    }
}
