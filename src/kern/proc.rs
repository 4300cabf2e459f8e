//! Process management
//!
//! A process is an address-space-and-resource container for threads. Every
//! process has a parent (the kernel process is its own), belongs to exactly
//! one process group and one session, and dies when its main thread exits.
//!
//! The global process lock guards the process index, the pgroup and
//! session tables, parent/child links, and per-process state. It may be
//! held over an acquisition of the thread lock, never the reverse.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::arch::ArchProc;
use crate::errors::KernError;
use crate::kern::copyio::{self, is_kernel_address};
use crate::kern::lock::SpinLock;
use crate::kern::pgroup::{self, GroupNode};
use crate::kern::signal;
use crate::kern::thread::{self, Thread};
use crate::println;
use crate::types::{
    make_name, Addr, AspaceId, IoCtxId, Name, PgrpId, ProcId, SessId, ThreadId,
};
use crate::vfs;
use crate::vm::{
    self, RegionAddr, RegionWiring, LOCK_RW, PAGE_SIZE, STACK_SIZE, USER_BASE, USER_SIZE,
    USER_STACK_REGION, USER_STACK_REGION_SIZE,
};

/// Create the new process suspended; the caller resumes it.
pub const PROC_FLAG_SUSPENDED: u32 = 0x1;
/// Found a new session (implies a new process group).
pub const PROC_FLAG_NEW_SESSION: u32 = 0x2;
/// Found a new process group.
pub const PROC_FLAG_NEW_PGROUP: u32 = 0x4;

/// Longest path accepted from user space.
pub const SYS_MAX_PATH_LEN: usize = 256;
/// Bound on a single user-supplied argument string.
pub const SYS_THREAD_ARG_LENGTH_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcState {
    Birth = 0,
    Normal = 1,
    Death = 2,
}

impl ProcState {
    fn from_u32(v: u32) -> ProcState {
        match v {
            0 => ProcState::Birth,
            1 => ProcState::Normal,
            _ => ProcState::Death,
        }
    }
}

/// The process record.
pub struct Proc {
    id: ProcId,
    name: SpinLock<Name>,
    state: AtomicU32,
    parent: AtomicI32,
    children: SpinLock<Vec<ProcId>>,
    threads: SpinLock<Vec<ThreadId>>,
    main_thread: AtomicI32,
    num_threads: AtomicU32,
    pgid: AtomicI32,
    sid: AtomicI32,
    aspace: AtomicI32,
    ioctx: AtomicI32,
    #[allow(dead_code)]
    pub(crate) arch: SpinLock<ArchProc>,
}

static NEXT_PROC_ID: AtomicI32 = AtomicI32::new(1);

impl Proc {
    fn new(name: &str, kernel: bool) -> Arc<Proc> {
        Arc::new(Proc {
            id: ProcId(NEXT_PROC_ID.fetch_add(1, Ordering::AcqRel)),
            name: SpinLock::new(make_name(name)),
            state: AtomicU32::new(ProcState::Birth as u32),
            parent: AtomicI32::new(-1),
            children: SpinLock::new(Vec::new()),
            threads: SpinLock::new(Vec::new()),
            main_thread: AtomicI32::new(-1),
            num_threads: AtomicU32::new(0),
            pgid: AtomicI32::new(-1),
            sid: AtomicI32::new(-1),
            aspace: AtomicI32::new(-1),
            ioctx: AtomicI32::new(-1),
            arch: SpinLock::new(ArchProc::new(kernel)),
        })
    }

    pub fn id(&self) -> ProcId {
        self.id
    }

    pub fn name(&self) -> Name {
        self.name.lock().clone()
    }

    pub fn state(&self) -> ProcState {
        ProcState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ProcState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn parent_id(&self) -> i32 {
        self.parent.load(Ordering::Acquire)
    }

    fn set_parent(&self, parent: i32) {
        self.parent.store(parent, Ordering::Release);
    }

    pub fn pgid(&self) -> i32 {
        self.pgid.load(Ordering::Acquire)
    }

    pub(crate) fn set_pgid(&self, pgid: i32) {
        self.pgid.store(pgid, Ordering::Release);
    }

    pub fn sid(&self) -> i32 {
        self.sid.load(Ordering::Acquire)
    }

    pub(crate) fn set_sid(&self, sid: i32) {
        self.sid.store(sid, Ordering::Release);
    }

    pub fn aspace(&self) -> i32 {
        self.aspace.load(Ordering::Acquire)
    }

    fn set_aspace(&self, aspace: AspaceId) {
        self.aspace.store(aspace.0, Ordering::Release);
    }

    pub fn ioctx(&self) -> i32 {
        self.ioctx.load(Ordering::Acquire)
    }

    fn set_ioctx(&self, ioctx: IoCtxId) {
        self.ioctx.store(ioctx.0, Ordering::Release);
    }

    pub fn main_thread(&self) -> Option<ThreadId> {
        match self.main_thread.load(Ordering::Acquire) {
            -1 => None,
            id => Some(ThreadId(id)),
        }
    }

    pub fn num_threads(&self) -> u32 {
        self.num_threads.load(Ordering::Acquire)
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    pub fn children_ids(&self) -> Vec<ProcId> {
        self.children.lock().clone()
    }
}

/// Everything the process lock protects.
pub(crate) struct ProcTable {
    procs: BTreeMap<i32, Arc<Proc>>,
    pub(crate) pgroups: BTreeMap<i32, GroupNode>,
    pub(crate) sessions: BTreeMap<i32, GroupNode>,
}

impl ProcTable {
    fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            pgroups: BTreeMap::new(),
            sessions: BTreeMap::new(),
        }
    }

    pub(crate) fn get_proc(&self, id: ProcId) -> Option<Arc<Proc>> {
        self.procs.get(&id.0).cloned()
    }

    fn insert_proc(&mut self, p: Arc<Proc>) {
        self.procs.insert(p.id().0, p);
    }

    pub(crate) fn remove_proc(&mut self, id: ProcId) -> Option<Arc<Proc>> {
        self.procs.remove(&id.0)
    }

    fn iter_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.procs.keys().copied()
    }
}

static PROC_TABLE: spin::Once<SpinLock<ProcTable>> = spin::Once::new();
static KERNEL_PROC_ID: AtomicI32 = AtomicI32::new(-1);
static PROC_INIT_DONE: AtomicBool = AtomicBool::new(false);

pub(crate) fn proc_table() -> &'static SpinLock<ProcTable> {
    PROC_TABLE.call_once(|| SpinLock::new(ProcTable::new()))
}

pub fn proc_get_kernel_proc_id() -> ProcId {
    ProcId(KERNEL_PROC_ID.load(Ordering::Acquire))
}

pub fn proc_get_current_proc_id() -> ProcId {
    thread::current_proc_id_or_kernel()
}

/// Look up a live process by id.
pub fn get_proc(id: ProcId) -> Option<Arc<Proc>> {
    proc_table().lock().get_proc(id)
}

/// Create the kernel process and its group and session. Idempotent; runs
/// once during thread_init.
pub(crate) fn proc_init() {
    if PROC_INIT_DONE.swap(true, Ordering::AcqRel) {
        return;
    }

    let kernel = Proc::new("kernel", true);
    kernel.set_state(ProcState::Normal);
    // The kernel process is its own parent.
    kernel.set_parent(kernel.id().0);
    KERNEL_PROC_ID.store(kernel.id().0, Ordering::Release);

    let ioctx = vfs::vfs_new_ioctx(None).expect("could not create ioctx for kernel proc");
    kernel.set_ioctx(ioctx);

    let kid = kernel.id();
    let mut pt = proc_table().lock_irq();
    pt.insert_proc(kernel.clone());
    pt.pgroups.insert(kid.0, GroupNode::new(kid.0));
    pgroup::add_proc_to_pgroup(&mut pt, &kernel, PgrpId(kid.0)).expect("kernel pgroup");
    pt.sessions.insert(kid.0, GroupNode::new(kid.0));
    pgroup::add_proc_to_session(&mut pt, &kernel, SessId(kid.0)).expect("kernel session");
}

// ============================================================================
// Family and thread-list links (callers hold the process lock)
// ============================================================================

pub(crate) fn insert_thread_into_proc(p: &Arc<Proc>, t: &Arc<Thread>) {
    p.threads.lock().insert(0, ThreadId(t.id()));
    let count = p.num_threads.fetch_add(1, Ordering::AcqRel) + 1;
    if count == 1 {
        // This was the first thread.
        p.main_thread.store(t.id(), Ordering::Release);
    }
    t.set_proc(p.id());
    t.set_aspace(if p.aspace() >= 0 {
        AspaceId(p.aspace())
    } else {
        vm::vm_get_kernel_aspace_id()
    });
}

pub(crate) fn remove_thread_from_proc(p: &Arc<Proc>, t: &Arc<Thread>) {
    let tid = ThreadId(t.id());
    p.threads.lock().retain(|&id| id != tid);
    p.num_threads.fetch_sub(1, Ordering::AcqRel);
}

pub(crate) fn insert_proc_into_parent(parent: &Arc<Proc>, p: &Arc<Proc>) {
    parent.children.lock().insert(0, p.id());
    p.set_parent(parent.id().0);
}

pub(crate) fn remove_proc_from_parent(parent: &Arc<Proc>, p: &Arc<Proc>) {
    let pid = p.id();
    parent.children.lock().retain(|&id| id != pid);
    p.set_parent(-1);
}

/// Move every child to this process's parent. Holds the process lock.
/// A move can orphan the child's process group; such a group gets the
/// hangup-then-continue pair.
pub(crate) fn proc_reparent_children_locked(pt: &mut ProcTable, p: &Arc<Proc>) {
    let Some(grandparent) = pt.get_proc(ProcId(p.parent_id())) else {
        return;
    };

    for child_id in p.children_ids() {
        let Some(child) = pt.get_proc(child_id) else {
            continue;
        };
        remove_proc_from_parent(p, &child);
        insert_proc_into_parent(&grandparent, &child);

        if p.sid() == child.sid() && p.pgid() != child.pgid() {
            let connected = pgroup::check_for_pgrp_connection(
                pt,
                PgrpId(child.pgid()),
                PgrpId(p.pgid()),
                None,
            );
            if !connected {
                println!(
                    "proc_reparent_children: process {} orphans process group {}",
                    p.id().0,
                    child.pgid()
                );
                let _ = pgroup::send_pgrp_signal_etc_locked(
                    pt,
                    PgrpId(child.pgid()),
                    signal::SIGHUP,
                    signal::SIG_FLAG_NO_RESCHED,
                );
                let _ = pgroup::send_pgrp_signal_etc_locked(
                    pt,
                    PgrpId(child.pgid()),
                    signal::SIGCONT,
                    signal::SIG_FLAG_NO_RESCHED,
                );
            }
        }
    }
}

// ============================================================================
// Process creation
// ============================================================================

struct ProcArgs {
    path: String,
    args: Vec<String>,
}

const USPACE_PROG_ARGS_SIZE: usize = 128;
const PROG_NAME_OFFSET: usize = 0;
const PROG_PATH_OFFSET: usize = 32;
const ARGC_OFFSET: usize = 96;
const ARGV_OFFSET: usize = 104;
const ENVC_OFFSET: usize = 112;
const ENVP_OFFSET: usize = 120;

fn page_align(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn arguments_data_size(args: &[String]) -> usize {
    let strings: usize = args.iter().map(|a| a.len() + 1).sum();
    strings + (args.len() + 1) * 8 + USPACE_PROG_ARGS_SIZE
}

/// Launch function, running as the new process's first (kernel) thread:
/// build the primary user stack with the argument block, load the binary,
/// and drop into user space.
fn proc_create_proc2(raw_args: usize) -> i32 {
    let pargs = unsafe { Box::from_raw(raw_args as *mut ProcArgs) };

    let t = thread::thread_get_current_thread().expect("launch without current thread");
    let p = get_proc(ProcId(t.proc_id())).expect("launch without process");
    let aspace = AspaceId(p.aspace());

    println!("proc_create_proc2: entry thread {}", t.id());

    // Run on the new process's map while populating it.
    vm::vm_aspace_swap(aspace);

    // Primary stack, with the argument block sitting above the stack top.
    let tot_top_size = STACK_SIZE + page_align(arguments_data_size(&pargs.args));
    let wanted_base = (USER_STACK_REGION - tot_top_size) + USER_STACK_REGION_SIZE;
    let stack_name = format!("{}_primary_stack", p.name().as_str());
    let (region, base) = vm::vm_create_anonymous_region(
        aspace,
        &stack_name,
        RegionAddr::ExactAddress(wanted_base),
        tot_top_size,
        RegionWiring::Lazy,
        LOCK_RW,
    )
    .unwrap_or_else(|_| panic!("proc_create_proc2: could not create default user stack region"));
    t.set_user_stack(region, base);

    let uspa: Addr = base + STACK_SIZE;
    let uargs: Addr = uspa + USPACE_PROG_ARGS_SIZE;
    let mut udest: Addr = uargs + (pargs.args.len() + 1) * 8;

    // argv pointers, then the strings they point at
    for (i, arg) in pargs.args.iter().enumerate() {
        if copyio::user_write_u64(uargs + i * 8, udest as u64).is_err()
            || copyio::user_strcpy_to(udest, arg).is_err()
        {
            return KernError::VmBadUserMemory.as_status();
        }
        udest += arg.len() + 1;
    }
    if copyio::user_write_u64(uargs + pargs.args.len() * 8, 0).is_err() {
        return KernError::VmBadUserMemory.as_status();
    }

    // the program-args record itself
    let mut name_buf = [0u8; 32];
    let name = p.name();
    name_buf[..name.len()].copy_from_slice(name.as_bytes());
    let mut path_buf = [0u8; 64];
    let path_len = pargs.path.len().min(63);
    path_buf[..path_len].copy_from_slice(&pargs.path.as_bytes()[..path_len]);

    let ok = copyio::user_memcpy_to(uspa + PROG_NAME_OFFSET, &name_buf).is_ok()
        && copyio::user_memcpy_to(uspa + PROG_PATH_OFFSET, &path_buf).is_ok()
        && copyio::user_write_u32(uspa + ARGC_OFFSET, pargs.args.len() as u32).is_ok()
        && copyio::user_write_u64(uspa + ARGV_OFFSET, uargs as u64).is_ok()
        && copyio::user_write_u32(uspa + ENVC_OFFSET, 0).is_ok()
        && copyio::user_write_u64(uspa + ENVP_OFFSET, 0).is_ok();
    if !ok {
        return KernError::VmBadUserMemory.as_status();
    }

    println!("proc_create_proc2: loading binary '{}'", pargs.path);
    let entry = match crate::elf::elf_load_uspace(&pargs.path, aspace) {
        Ok(entry) => entry,
        Err(err) => return err.as_status(),
    };
    drop(pargs);

    println!("proc_create_proc2: loaded binary. entry = {:#x}", entry);

    p.set_state(ProcState::Normal);

    unsafe { crate::arch::enter_uspace(entry, uspa, base + STACK_SIZE) };

    // only hosted builds come back from enter_uspace
    0
}

/// Create a process running `path`. The heavy lifting happens on the new
/// process's own launch thread.
pub fn proc_create_proc(
    path: &str,
    name: &str,
    args: Vec<String>,
    mut flags: u32,
) -> Result<ProcId, KernError> {
    let p = Proc::new(name, false);
    let pid = p.id();
    let curr_pid = proc_get_current_proc_id();

    println!(
        "proc_create_proc: entry '{}', name '{}' argc = {} flags = {:#x}",
        path,
        name,
        args.len(),
        flags
    );

    // Pre-allocate group nodes: allocation cannot happen under the
    // process lock.
    let mut snode = None;
    if flags & PROC_FLAG_NEW_SESSION != 0 {
        // your own session implies your own pgroup
        flags |= PROC_FLAG_NEW_PGROUP;
        snode = Some(GroupNode::new(pid.0));
    }
    let pgnode = if flags & PROC_FLAG_NEW_PGROUP != 0 {
        Some(GroupNode::new(pid.0))
    } else {
        None
    };

    {
        let mut pt = proc_table().lock_irq();
        pt.insert_proc(p.clone());

        let curr = pt
            .get_proc(curr_pid)
            .expect("proc_create_proc: creator vanished");
        insert_proc_into_parent(&curr, &p);

        match snode {
            Some(node) => {
                pt.sessions.insert(pid.0, node);
                pgroup::add_proc_to_session(&mut pt, &p, SessId(pid.0))
                    .expect("fresh session node");
            }
            None => {
                // inherit the creator's session
                pgroup::add_proc_to_session(&mut pt, &p, SessId(curr.sid()))
                    .expect("creator session exists");
            }
        }
        match pgnode {
            Some(node) => {
                pt.pgroups.insert(pid.0, node);
                pgroup::add_proc_to_pgroup(&mut pt, &p, PgrpId(pid.0))
                    .expect("fresh pgroup node");
            }
            None => {
                // inherit the creator's process group
                pgroup::add_proc_to_pgroup(&mut pt, &p, PgrpId(curr.pgid()))
                    .expect("creator pgroup exists");
            }
        }
    }

    // Everything past this point can fail and must unwind in reverse.
    let result = (|| -> Result<ThreadId, KernError> {
        let parent_ioctx = get_proc(curr_pid)
            .map(|curr| IoCtxId(curr.ioctx()))
            .filter(|id| id.0 >= 0);
        let ioctx = vfs::vfs_new_ioctx(parent_ioctx)?;
        p.set_ioctx(ioctx);

        let aspace = vm::vm_create_aspace(name, USER_BASE, USER_SIZE).inspect_err(|_| {
            vfs::vfs_free_ioctx(ioctx);
        })?;
        p.set_aspace(aspace);

        let pargs = Box::new(ProcArgs {
            path: path.to_string(),
            args,
        });
        let raw = Box::into_raw(pargs) as usize;
        let tid = thread::thread_create_kernel_thread_etc(name, proc_create_proc2, raw, pid)
            .inspect_err(|_| {
                drop(unsafe { Box::from_raw(raw as *mut ProcArgs) });
                vm::vm_put_aspace(aspace);
                let _ = vm::vm_delete_aspace(aspace);
                vfs::vfs_free_ioctx(ioctx);
            })?;
        Ok(tid)
    })();

    let tid = match result {
        Ok(tid) => tid,
        Err(err) => {
            // Take the record back out of every index.
            let mut pt = proc_table().lock_irq();
            let _ = pgroup::remove_proc_from_pgroup(&mut pt, &p, PgrpId(p.pgid()));
            let _ = pgroup::remove_proc_from_session(&mut pt, &p, SessId(p.sid()));
            if let Some(parent) = pt.get_proc(ProcId(p.parent_id())) {
                remove_proc_from_parent(&parent, &p);
            }
            pt.remove_proc(pid);
            return Err(err);
        }
    };

    if flags & PROC_FLAG_SUSPENDED == 0 {
        let _ = thread::thread_resume_thread(tid);
    }

    Ok(pid)
}

fn user_copy_arg_list(uargs: Addr, argc: usize) -> Result<Vec<String>, KernError> {
    if argc == 0 {
        return Ok(Vec::new());
    }
    if is_kernel_address(uargs) {
        return Err(KernError::VmBadUserMemory);
    }
    let mut out = Vec::with_capacity(argc);
    for i in 0..argc {
        let mut ptr_buf = [0u8; 8];
        copyio::user_memcpy_from(&mut ptr_buf, uargs + i * 8)?;
        let arg_ptr = u64::from_le_bytes(ptr_buf) as Addr;
        if is_kernel_address(arg_ptr) {
            return Err(KernError::VmBadUserMemory);
        }
        out.push(copyio::user_strlcpy_from(
            arg_ptr,
            SYS_THREAD_ARG_LENGTH_MAX - 1,
        )?);
    }
    Ok(out)
}

pub fn user_proc_create_proc(
    upath: Addr,
    uname: Addr,
    uargs: Addr,
    argc: usize,
    flags: u32,
) -> Result<ProcId, KernError> {
    if is_kernel_address(upath) || is_kernel_address(uname) {
        return Err(KernError::VmBadUserMemory);
    }
    let args = user_copy_arg_list(uargs, argc)?;
    let path = copyio::user_strlcpy_from(upath, SYS_MAX_PATH_LEN - 1)?;
    let name = copyio::user_strlcpy_from(uname, crate::types::MAX_NAME_LEN)?;
    proc_create_proc(&path, &name, args, flags)
}

// ============================================================================
// Kill, wait, main thread
// ============================================================================

pub fn proc_get_main_thread(id: ProcId) -> Result<ThreadId, KernError> {
    let pt = proc_table().lock_irq();
    let p = pt.get_proc(id).ok_or(KernError::InvalidHandle)?;
    p.main_thread().ok_or(KernError::InvalidHandle)
}

/// Kill a process: kill its main thread, whose exit path takes care of
/// everything else.
pub fn proc_kill_proc(id: ProcId) -> Result<(), KernError> {
    let main = proc_get_main_thread(id)?;
    thread::thread_kill_thread(main)
}

pub fn proc_wait_on_proc(id: ProcId) -> Result<i32, KernError> {
    let main = proc_get_main_thread(id)?;
    thread::thread_wait_on_thread(main)
}

pub fn user_proc_wait_on_proc(id: ProcId, uretcode: Addr) -> Result<(), KernError> {
    if is_kernel_address(uretcode) {
        return Err(KernError::VmBadUserMemory);
    }
    let retcode = proc_wait_on_proc(id)?;
    copyio::user_write_u32(uretcode, retcode as u32)
}

// ============================================================================
// Info & iteration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub pid: ProcId,
    pub ppid: ProcId,
    pub pgid: PgrpId,
    pub sid: SessId,
    pub name: Name,
    pub state: ProcState,
    pub num_threads: u32,
}

impl ProcInfo {
    fn from_proc(p: &Proc) -> Self {
        Self {
            pid: p.id(),
            ppid: ProcId(p.parent_id()),
            pgid: PgrpId(p.pgid()),
            sid: SessId(p.sid()),
            name: p.name(),
            state: p.state(),
            num_threads: p.num_threads(),
        }
    }

    fn write_to_user(&self, dest: Addr) -> Result<(), KernError> {
        copyio::user_write_u32(dest, self.pid.0 as u32)?;
        copyio::user_write_u32(dest + 4, self.ppid.0 as u32)?;
        copyio::user_write_u32(dest + 8, self.pgid.0 as u32)?;
        copyio::user_write_u32(dest + 12, self.sid.0 as u32)?;
        copyio::user_write_u32(dest + 16, self.state as u32)?;
        copyio::user_write_u32(dest + 20, self.num_threads)?;
        let mut name_buf = [0u8; crate::types::MAX_NAME_LEN];
        let bytes = self.name.as_bytes();
        name_buf[..bytes.len()].copy_from_slice(bytes);
        copyio::user_memcpy_to(dest + 24, &name_buf)
    }
}

pub fn proc_get_proc_info(id: ProcId) -> Result<ProcInfo, KernError> {
    let pt = proc_table().lock_irq();
    let p = pt.get_proc(id).ok_or(KernError::InvalidHandle)?;
    Ok(ProcInfo::from_proc(&p))
}

pub fn user_proc_get_proc_info(id: ProcId, uinfo: Addr) -> Result<(), KernError> {
    if is_kernel_address(uinfo) {
        return Err(KernError::VmBadUserMemory);
    }
    let info = proc_get_proc_info(id)?;
    info.write_to_user(uinfo)
}

/// Walk the process index. `cookie` 0 starts; iteration ends with
/// `NoMoreHandles`.
pub fn proc_get_next_proc_info(cookie: u32) -> Result<(ProcInfo, u32), KernError> {
    let pt = proc_table().lock_irq();

    let next = if cookie == 0 {
        pt.iter_ids().next()
    } else {
        pt.iter_ids().skip_while(|&id| id as u32 != cookie).nth(1)
    };

    let id = next.ok_or(KernError::NoMoreHandles)?;
    let p = pt.get_proc(ProcId(id)).ok_or(KernError::NoMoreHandles)?;
    Ok((ProcInfo::from_proc(&p), id as u32))
}

pub fn user_proc_get_next_proc_info(ucookie: Addr, uinfo: Addr) -> Result<(), KernError> {
    if is_kernel_address(ucookie) || is_kernel_address(uinfo) {
        return Err(KernError::VmBadUserMemory);
    }
    let cookie = copyio::user_read_u32(ucookie)?;
    let (info, next_cookie) = proc_get_next_proc_info(cookie)?;
    info.write_to_user(uinfo)?;
    copyio::user_write_u32(ucookie, next_cookie)
}

// ============================================================================
// Resource limits
// ============================================================================

pub const RLIMIT_NOFILE: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RLimit {
    pub cur: u64,
    pub max: u64,
}

pub fn getrlimit(resource: i32) -> Result<RLimit, KernError> {
    match resource {
        RLIMIT_NOFILE => {
            let p = get_proc(proc_get_current_proc_id()).ok_or(KernError::InvalidHandle)?;
            vfs::vfs_getrlimit(IoCtxId(p.ioctx()))
        }
        _ => Err(KernError::InvalidArgs),
    }
}

pub fn setrlimit(resource: i32, limit: RLimit) -> Result<(), KernError> {
    match resource {
        RLIMIT_NOFILE => {
            let p = get_proc(proc_get_current_proc_id()).ok_or(KernError::InvalidHandle)?;
            vfs::vfs_setrlimit(IoCtxId(p.ioctx()), limit)
        }
        _ => Err(KernError::InvalidArgs),
    }
}

pub fn user_getrlimit(resource: i32, urlp: Addr) -> Result<(), KernError> {
    if urlp == 0 {
        return Err(KernError::InvalidArgs);
    }
    if is_kernel_address(urlp) {
        return Err(KernError::VmBadUserMemory);
    }
    let limit = getrlimit(resource)?;
    copyio::user_write_u64(urlp, limit.cur)?;
    copyio::user_write_u64(urlp + 8, limit.max)
}

pub fn user_setrlimit(resource: i32, urlp: Addr) -> Result<(), KernError> {
    if urlp == 0 {
        return Err(KernError::InvalidArgs);
    }
    if is_kernel_address(urlp) {
        return Err(KernError::VmBadUserMemory);
    }
    let mut buf = [0u8; 8];
    copyio::user_memcpy_from(&mut buf, urlp)?;
    let cur = u64::from_le_bytes(buf);
    copyio::user_memcpy_from(&mut buf, urlp + 8)?;
    let max = u64::from_le_bytes(buf);
    setrlimit(resource, RLimit { cur, max })
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A minimal live process in the kernel session/pgroup, with no
    /// threads.
    pub fn make_bare_proc(name: &str) -> ProcId {
        let p = Proc::new(name, false);
        p.set_state(ProcState::Normal);
        let pid = p.id();
        let kernel_pid = proc_get_kernel_proc_id();
        let mut pt = proc_table().lock_irq();
        pt.insert_proc(p.clone());
        let kernel = pt.get_proc(kernel_pid).unwrap();
        insert_proc_into_parent(&kernel, &p);
        pgroup::add_proc_to_pgroup(&mut pt, &p, PgrpId(kernel.pgid())).unwrap();
        pgroup::add_proc_to_session(&mut pt, &p, SessId(kernel.sid())).unwrap();
        pid
    }

    /// Remove a test process from every index.
    pub fn retire_proc(pid: ProcId) {
        let mut pt = proc_table().lock_irq();
        let Some(p) = pt.get_proc(pid) else {
            return;
        };
        let _ = pgroup::remove_proc_from_pgroup(&mut pt, &p, PgrpId(p.pgid()));
        let _ = pgroup::remove_proc_from_session(&mut pt, &p, SessId(p.sid()));
        if let Some(parent) = pt.get_proc(ProcId(p.parent_id())) {
            remove_proc_from_parent(&parent, &p);
        }
        pt.remove_proc(pid);
    }

    /// Attach a fresh main thread to a bare process.
    pub fn give_main_thread(pid: ProcId) -> ThreadId {
        thread::test_support::make_attached_thread("proc_main", pid, 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::sched;
    use crate::kern::signal::{sig_mask, SIGCONT, SIGHUP};
    use crate::testing;

    #[test]
    fn test_kernel_proc_is_own_parent() {
        let _fixture = testing::lock_kernel();
        let kernel = get_proc(proc_get_kernel_proc_id()).unwrap();
        assert_eq!(kernel.parent_id(), kernel.id().0);
        assert_eq!(kernel.state(), ProcState::Normal);
        // and nobody else is
        for (info, _) in iterate_all() {
            if info.pid != kernel.id() {
                assert_ne!(info.pid, info.ppid);
            }
        }
    }

    fn iterate_all() -> Vec<(ProcInfo, u32)> {
        let mut out = Vec::new();
        let mut cookie = 0;
        loop {
            match proc_get_next_proc_info(cookie) {
                Ok((info, next)) => {
                    cookie = next;
                    out.push((info, next));
                }
                Err(KernError::NoMoreHandles) => break,
                Err(e) => panic!("unexpected: {:?}", e),
            }
        }
        out
    }

    #[test]
    fn test_proc_iteration_sees_new_proc() {
        let _fixture = testing::lock_kernel();
        let pid = test_support::make_bare_proc("iterated");
        let all = iterate_all();
        assert!(all.iter().any(|(info, _)| info.pid == pid));
        test_support::retire_proc(pid);
    }

    #[test]
    fn test_proc_create_inherits_group_and_session() {
        let _fixture = testing::lock_kernel();
        let kernel = get_proc(proc_get_kernel_proc_id()).unwrap();
        let pid = proc_create_proc(
            "/boot/bin/true",
            "inherit_test",
            Vec::new(),
            PROC_FLAG_SUSPENDED,
        )
        .unwrap();
        let p = get_proc(pid).unwrap();
        assert_eq!(p.pgid(), kernel.pgid());
        assert_eq!(p.sid(), kernel.sid());
        assert_eq!(p.parent_id(), kernel.id().0);
        assert_eq!(p.state(), ProcState::Birth);
        assert_eq!(p.num_threads(), 1);

        // tear down via the main thread's own exit
        let main = p.main_thread().unwrap();
        thread::test_support::set_current(main);
        thread::thread_exit(0);
        assert!(get_proc(pid).is_none());
    }

    #[test]
    fn test_new_session_implies_new_pgroup() {
        let _fixture = testing::lock_kernel();
        let pid = proc_create_proc(
            "/boot/bin/daemon",
            "session_leader",
            Vec::new(),
            PROC_FLAG_SUSPENDED | PROC_FLAG_NEW_SESSION,
        )
        .unwrap();
        let p = get_proc(pid).unwrap();
        assert_eq!(p.sid(), pid.0);
        assert_eq!(p.pgid(), pid.0);

        let main = p.main_thread().unwrap();
        thread::test_support::set_current(main);
        thread::thread_exit(0);
    }

    #[test]
    fn test_launch_builds_stack_args_and_enters_uspace() {
        let _fixture = testing::lock_kernel();
        let pid = proc_create_proc(
            "/boot/bin/shell",
            "launch_test",
            alloc::vec!["shell".to_string(), "-l".to_string()],
            PROC_FLAG_SUSPENDED,
        )
        .unwrap();
        let p = get_proc(pid).unwrap();
        let main = p.main_thread().unwrap();
        let t = thread::get_thread(main).unwrap();

        // run the launch function in the new thread's context
        thread::test_support::set_current(main);
        let rc = proc_create_proc2(t.args());
        assert_eq!(rc, 0);
        assert_eq!(p.state(), ProcState::Normal);

        let (entry, uspa, _sp) = crate::arch::last_uspace_entry();
        assert_ne!(entry, 0);
        // argc was written into the program-args record
        let argc = copyio::user_read_u32(uspa + ARGC_OFFSET).unwrap();
        assert_eq!(argc, 2);

        thread::thread_exit(0);
    }

    #[test]
    fn test_exit_reparents_children_to_grandparent() {
        let _fixture = testing::lock_kernel();
        let kernel_pid = proc_get_kernel_proc_id();

        let parent_pid = test_support::make_bare_proc("reparent_parent");
        let _parent_main = test_support::give_main_thread(parent_pid);
        let parent = get_proc(parent_pid).unwrap();

        // child of parent
        let child_pid = {
            let p = Proc::new("reparent_child", false);
            p.set_state(ProcState::Normal);
            let pid = p.id();
            let mut pt = proc_table().lock_irq();
            pt.insert_proc(p.clone());
            insert_proc_into_parent(&parent, &p);
            let kernel = pt.get_proc(kernel_pid).unwrap();
            pgroup::add_proc_to_pgroup(&mut pt, &p, PgrpId(kernel.pgid())).unwrap();
            pgroup::add_proc_to_session(&mut pt, &p, SessId(kernel.sid())).unwrap();
            pid
        };

        // parent's main thread exits; child must move to the kernel proc
        let main = parent.main_thread().unwrap();
        thread::test_support::set_current(main);
        thread::thread_exit(7);

        let child = get_proc(child_pid).unwrap();
        assert_eq!(child.parent_id(), kernel_pid.0);
        assert!(get_proc(parent_pid).is_none());

        test_support::retire_proc(child_pid);
    }

    #[test]
    fn test_orphaned_pgroup_gets_sighup_then_sigcont() {
        let _fixture = testing::lock_kernel();

        // session S: parent P in group g1, child C in group g2
        let p_pid = test_support::make_bare_proc("orphan_parent");
        let _p_main = test_support::give_main_thread(p_pid);
        let p = get_proc(p_pid).unwrap();
        pgroup::setpgid(p_pid, PgrpId(p_pid.0)).unwrap();

        let c_pid = test_support::make_bare_proc("orphan_child");
        let c_main = test_support::give_main_thread(c_pid);
        let c = get_proc(c_pid).unwrap();
        {
            // make C a child of P, in its own group g2, same session
            let mut pt = proc_table().lock_irq();
            let kernel = pt.get_proc(proc_get_kernel_proc_id()).unwrap();
            remove_proc_from_parent(&kernel, &c);
            insert_proc_into_parent(&p, &c);
        }
        pgroup::setpgid(c_pid, PgrpId(c_pid.0)).unwrap();
        assert_eq!(c.sid(), p.sid());
        assert_ne!(c.pgid(), p.pgid());

        // P exits: C's group has no remaining connection and is orphaned
        let main = p.main_thread().unwrap();
        thread::test_support::set_current(main);
        thread::thread_exit(0);

        let ct = thread::get_thread(c_main).unwrap();
        let pending = ct.sig.lock().pending;
        assert_ne!(pending & sig_mask(SIGHUP), 0);
        assert_ne!(pending & sig_mask(SIGCONT), 0);

        // cleanup: run C's exit too
        thread::test_support::set_current(c_main);
        thread::thread_exit(0);
    }

    #[test]
    fn test_kill_proc_targets_main_thread() {
        let _fixture = testing::lock_kernel();
        let pid = test_support::make_bare_proc("killed_proc");
        let main = test_support::give_main_thread(pid);
        let waiter = thread::thread_get_current_thread_id();

        sched::set_resched_hook(Box::new(move || {
            // The kill's wait parked us; run the victim's exit. Its
            // pending SIGKILLTHR surfaces at kernel exit.
            thread::test_support::set_current(main);
            thread::thread_atkernel_exit();
            thread::test_support::set_current(waiter);
        }));

        proc_kill_proc(pid).unwrap();
        assert!(get_proc(pid).is_none());
    }

    #[test]
    fn test_rlimit_nofile_round_trip() {
        let _fixture = testing::lock_kernel();
        let before = getrlimit(RLIMIT_NOFILE).unwrap();
        let wanted = RLimit {
            cur: before.cur / 2,
            max: before.max,
        };
        setrlimit(RLIMIT_NOFILE, wanted).unwrap();
        assert_eq!(getrlimit(RLIMIT_NOFILE).unwrap(), wanted);
        setrlimit(RLIMIT_NOFILE, before).unwrap();

        assert_eq!(getrlimit(999).unwrap_err(), KernError::InvalidArgs);
    }
}
