//! I/O context collaborator
//!
//! The slice of the filesystem layer the process core consumes: an I/O
//! context per process, created empty or cloned from the parent's, plus
//! the open-file limit backing `RLIMIT_NOFILE`.

use alloc::collections::BTreeMap;
use spin::Once;

use crate::errors::KernError;
use crate::kern::lock::SpinLock;
use crate::kern::proc::RLimit;
use crate::types::{make_name, IoCtxId, Name};

const DEFAULT_MAX_FDS: u64 = 256;
const FD_HARD_LIMIT: u64 = 4096;

struct IoContext {
    cwd: Name,
    max_fds: u64,
}

struct IoCtxTable {
    contexts: BTreeMap<IoCtxId, IoContext>,
    next_id: i32,
}

static IOCTXS: Once<SpinLock<IoCtxTable>> = Once::new();

fn table() -> &'static SpinLock<IoCtxTable> {
    IOCTXS.call_once(|| {
        SpinLock::new(IoCtxTable {
            contexts: BTreeMap::new(),
            next_id: 1,
        })
    })
}

/// Create an I/O context, cloning the working directory and limits from
/// `parent` when given.
pub fn vfs_new_ioctx(parent: Option<IoCtxId>) -> Result<IoCtxId, KernError> {
    let mut t = table().lock();
    let (cwd, max_fds) = match parent {
        Some(parent) => {
            let p = t.contexts.get(&parent).ok_or(KernError::InvalidHandle)?;
            (p.cwd.clone(), p.max_fds)
        }
        None => (make_name("/"), DEFAULT_MAX_FDS),
    };
    let id = IoCtxId(t.next_id);
    t.next_id += 1;
    t.contexts.insert(id, IoContext { cwd, max_fds });
    Ok(id)
}

pub fn vfs_free_ioctx(id: IoCtxId) {
    table().lock().contexts.remove(&id);
}

pub fn vfs_getrlimit(id: IoCtxId) -> Result<RLimit, KernError> {
    let t = table().lock();
    let ctx = t.contexts.get(&id).ok_or(KernError::InvalidHandle)?;
    Ok(RLimit {
        cur: ctx.max_fds,
        max: FD_HARD_LIMIT,
    })
}

pub fn vfs_setrlimit(id: IoCtxId, limit: RLimit) -> Result<(), KernError> {
    if limit.cur > limit.max || limit.max > FD_HARD_LIMIT {
        return Err(KernError::InvalidArgs);
    }
    let mut t = table().lock();
    let ctx = t.contexts.get_mut(&id).ok_or(KernError::InvalidHandle)?;
    ctx.max_fds = limit.cur;
    Ok(())
}
