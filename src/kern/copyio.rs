//! Safe user/kernel data transfer
//!
//! User pointers must never be dereferenced directly: they are validated
//! against the kernel range, then resolved through the address space active
//! on the current CPU. Faults surface as `VmBadUserMemory` before any
//! observable state change.

use alloc::string::String;
use alloc::vec;

use crate::errors::KernError;
use crate::kern::cpu;
use crate::types::Addr;
use crate::vm;

/// Whether an address lies in the kernel half of the address space. A user
/// pointer into this range is always rejected.
pub fn is_kernel_address(addr: Addr) -> bool {
    addr >= vm::KERNEL_BASE
}

fn check_user_range(addr: Addr, len: usize) -> Result<(), KernError> {
    if addr == 0 {
        return Err(KernError::VmBadUserMemory);
    }
    let end = addr.checked_add(len).ok_or(KernError::VmBadUserMemory)?;
    if is_kernel_address(addr) || is_kernel_address(end) {
        return Err(KernError::VmBadUserMemory);
    }
    Ok(())
}

fn current_user_aspace() -> Result<crate::types::AspaceId, KernError> {
    cpu::current_cpu()
        .active_aspace()
        .ok_or(KernError::VmBadUserMemory)
}

/// Copy bytes into user space at `dest`.
pub fn user_memcpy_to(dest: Addr, src: &[u8]) -> Result<(), KernError> {
    check_user_range(dest, src.len())?;
    let aspace = current_user_aspace()?;
    vm::write_mem(aspace, dest, src).map_err(|_| KernError::VmBadUserMemory)
}

/// Copy bytes out of user space at `src`.
pub fn user_memcpy_from(dest: &mut [u8], src: Addr) -> Result<(), KernError> {
    check_user_range(src, dest.len())?;
    let aspace = current_user_aspace()?;
    vm::read_mem(aspace, src, dest).map_err(|_| KernError::VmBadUserMemory)
}

/// Read a NUL-terminated string from user space, bounded by `max_len`
/// bytes (the NUL may fall at the bound).
pub fn user_strlcpy_from(src: Addr, max_len: usize) -> Result<String, KernError> {
    check_user_range(src, max_len)?;
    let aspace = current_user_aspace()?;
    let mut buf = vec![0u8; max_len];
    vm::read_mem(aspace, src, &mut buf).map_err(|_| KernError::VmBadUserMemory)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(max_len);
    buf.truncate(end);
    String::from_utf8(buf).map_err(|_| KernError::VmBadUserMemory)
}

/// Write a string plus NUL terminator into user space.
pub fn user_strcpy_to(dest: Addr, s: &str) -> Result<(), KernError> {
    user_memcpy_to(dest, s.as_bytes())?;
    user_memcpy_to(dest + s.len(), &[0u8])
}

/// Read a u32 from user space.
pub fn user_read_u32(src: Addr) -> Result<u32, KernError> {
    let mut buf = [0u8; 4];
    user_memcpy_from(&mut buf, src)?;
    Ok(u32::from_le_bytes(buf))
}

/// Write a u32 into user space.
pub fn user_write_u32(dest: Addr, value: u32) -> Result<(), KernError> {
    user_memcpy_to(dest, &value.to_le_bytes())
}

/// Write a u64 into user space.
pub fn user_write_u64(dest: Addr, value: u64) -> Result<(), KernError> {
    user_memcpy_to(dest, &value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{
        vm_create_anonymous_region, vm_create_aspace, RegionAddr, RegionWiring, LOCK_RW,
        PAGE_SIZE, USER_BASE, USER_SIZE,
    };

    fn user_fixture() -> (crate::types::AspaceId, Addr) {
        crate::vm::init();
        crate::kern::cpu::init(1);
        let aspace = vm_create_aspace("copyio_test", USER_BASE, USER_SIZE).unwrap();
        let (_rid, base) = vm_create_anonymous_region(aspace, "copyio_buf",
            RegionAddr::AnyAddress, PAGE_SIZE, RegionWiring::Wired, LOCK_RW)
        .unwrap();
        crate::vm::vm_aspace_swap(aspace);
        (aspace, base)
    }

    #[test]
    fn test_kernel_pointer_rejected() {
        let _fixture = crate::testing::lock_kernel();
        user_fixture();
        let err = user_memcpy_to(crate::vm::KERNEL_BASE + 0x1000, b"x").unwrap_err();
        assert_eq!(err, KernError::VmBadUserMemory);
        let mut buf = [0u8; 1];
        let err = user_memcpy_from(&mut buf, crate::vm::KERNEL_BASE).unwrap_err();
        assert_eq!(err, KernError::VmBadUserMemory);
    }

    #[test]
    fn test_copy_round_trip() {
        let _fixture = crate::testing::lock_kernel();
        let (_aspace, base) = user_fixture();
        user_memcpy_to(base, b"syscall args").unwrap();
        let mut buf = [0u8; 12];
        user_memcpy_from(&mut buf, base).unwrap();
        assert_eq!(&buf, b"syscall args");
    }

    #[test]
    fn test_strlcpy_bounded() {
        let _fixture = crate::testing::lock_kernel();
        let (_aspace, base) = user_fixture();
        user_strcpy_to(base, "a_name").unwrap();
        let s = user_strlcpy_from(base, 16).unwrap();
        assert_eq!(s, "a_name");

        // unterminated data is cut at the bound
        user_memcpy_to(base, &[b'x'; 16]).unwrap();
        let s = user_strlcpy_from(base, 8).unwrap();
        assert_eq!(s.len(), 8);
    }

    #[test]
    fn test_unmapped_address_faults() {
        let _fixture = crate::testing::lock_kernel();
        user_fixture();
        let err = user_memcpy_to(USER_BASE + 0x5000_0000, b"x").unwrap_err();
        assert_eq!(err, KernError::VmBadUserMemory);
    }
}
