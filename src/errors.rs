//! Kernel error codes
//!
//! A flat set of negative sentinels. User-facing operations return these
//! as negative integers; in-kernel code carries them through `Result`.

/// Raw status value. Zero or positive values are success, negative values
/// are one of the [`KernError`] sentinels.
pub type Status = i32;

/// Success status.
pub const NO_ERROR: Status = 0;

/// Error sentinels produced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernError {
    /// Allocator failure
    NoMemory = -1,
    /// Caller-visible argument violation
    InvalidArgs = -2,
    /// Unknown thread or process id
    InvalidHandle = -3,
    /// Group or session id unknown
    NotFound = -4,
    /// Iteration exhausted
    NoMoreHandles = -5,
    /// Raced with a process entering the death state
    TaskProcDeleted = -6,
    /// Pointer from user space points into the kernel or faults
    VmBadUserMemory = -7,
    /// Address not covered by any region
    VmBadAddress = -8,
    /// No room left to place a region
    NoMoreRegions = -9,
    /// Semaphore deleted while waiting
    SemDeleted = -10,
    /// Semaphore wait timed out
    SemTimedOut = -11,
    /// Semaphore wait interrupted by a signal
    SemInterrupted = -12,
}

impl KernError {
    /// The raw negative sentinel for this error.
    pub fn as_status(self) -> Status {
        self as Status
    }

    /// Map a raw negative status back to an error, if it is one.
    pub fn from_status(status: Status) -> Option<KernError> {
        match status {
            -1 => Some(KernError::NoMemory),
            -2 => Some(KernError::InvalidArgs),
            -3 => Some(KernError::InvalidHandle),
            -4 => Some(KernError::NotFound),
            -5 => Some(KernError::NoMoreHandles),
            -6 => Some(KernError::TaskProcDeleted),
            -7 => Some(KernError::VmBadUserMemory),
            -8 => Some(KernError::VmBadAddress),
            -9 => Some(KernError::NoMoreRegions),
            -10 => Some(KernError::SemDeleted),
            -11 => Some(KernError::SemTimedOut),
            -12 => Some(KernError::SemInterrupted),
            _ => None,
        }
    }
}

/// Collapse a `Result` carrying a positive payload into a raw status.
pub fn status_of(result: Result<Status, KernError>) -> Status {
    match result {
        Ok(v) => v,
        Err(e) => e.as_status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_negative() {
        assert!(KernError::NoMemory.as_status() < 0);
        assert!(KernError::SemInterrupted.as_status() < 0);
    }

    #[test]
    fn test_status_round_trip() {
        for err in [
            KernError::NoMemory,
            KernError::InvalidArgs,
            KernError::InvalidHandle,
            KernError::NotFound,
            KernError::NoMoreHandles,
            KernError::TaskProcDeleted,
            KernError::VmBadUserMemory,
            KernError::VmBadAddress,
            KernError::NoMoreRegions,
            KernError::SemDeleted,
            KernError::SemTimedOut,
            KernError::SemInterrupted,
        ] {
            assert_eq!(KernError::from_status(err.as_status()), Some(err));
        }
        assert_eq!(KernError::from_status(0), None);
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(Ok(7)), 7);
        assert_eq!(
            status_of(Err(KernError::InvalidHandle)),
            KernError::InvalidHandle.as_status()
        );
    }
}
