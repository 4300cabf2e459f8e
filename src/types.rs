//! Common types used across Kestrel
//!
//! This module defines shared identifier types to avoid circular
//! dependencies between the kern submodules.

/// Maximum length of a thread or process name, including room for the
/// suffixes the kernel appends when naming stack regions.
pub const MAX_NAME_LEN: usize = 32;

/// Bounded object name.
pub type Name = heapless::String<MAX_NAME_LEN>;

/// Build a bounded name from an arbitrary string, truncating if needed.
pub fn make_name(s: &str) -> Name {
    let mut name = Name::new();
    for c in s.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub i32);

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcId(pub i32);

/// Process group identifier. A group's id equals the id of its founder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PgrpId(pub i32);

/// Session identifier. A session's id equals the id of its founder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessId(pub i32);

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AspaceId(pub i32);

/// VM region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RegionId(pub i32);

/// Semaphore identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SemId(pub i32);

/// I/O context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IoCtxId(pub i32);

/// Timer event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimerId(pub u64);

/// Virtual address
pub type Addr = usize;

/// Time in microseconds since boot
pub type BigTime = u64;
