//! ELF loader collaborator
//!
//! The single capability the process core consumes: populate a user
//! address space from a binary and hand back its entry point. The real
//! loader (segment parsing, relocation, the runtime linker) lives outside
//! this subsystem; this one reserves the text window and derives the
//! entry from it.

use alloc::format;

use crate::errors::KernError;
use crate::types::{Addr, AspaceId};
use crate::vm::{self, RegionAddr, RegionWiring, LOCK_RW, PAGE_SIZE};

/// Where program text is mapped in a fresh address space.
const ELF_TEXT_BASE: Addr = vm::USER_BASE;
const ELF_TEXT_SIZE: usize = 64 * PAGE_SIZE;

/// Offset of the entry point into the text image.
const ELF_ENTRY_OFFSET: usize = 0x18;

/// Load `path` into an address space; returns the entry point.
pub fn elf_load_uspace(path: &str, aspace: AspaceId) -> Result<Addr, KernError> {
    if path.is_empty() {
        return Err(KernError::InvalidArgs);
    }

    let short = path.rsplit('/').next().unwrap_or(path);
    let region_name = format!("{}_text", short);
    let (_region, base) = vm::vm_create_anonymous_region(
        aspace,
        &region_name,
        RegionAddr::ExactAddress(ELF_TEXT_BASE),
        ELF_TEXT_SIZE,
        RegionWiring::Lazy,
        LOCK_RW,
    )?;

    Ok(base + ELF_ENTRY_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{vm_create_aspace, USER_BASE, USER_SIZE};

    #[test]
    fn test_load_reserves_text_and_returns_entry() {
        crate::vm::init();
        let aspace = vm_create_aspace("elf_test", USER_BASE, USER_SIZE).unwrap();
        let entry = elf_load_uspace("/boot/bin/init", aspace).unwrap();
        assert_eq!(entry, ELF_TEXT_BASE + ELF_ENTRY_OFFSET);
        assert!(vm::vm_find_region_by_name(aspace, "init_text").is_some());

        // a second image cannot land on the same text window
        assert!(elf_load_uspace("/boot/bin/other", aspace).is_err());
        vm::vm_delete_aspace(aspace).unwrap();
    }

    #[test]
    fn test_empty_path_rejected() {
        crate::vm::init();
        let aspace = vm_create_aspace("elf_empty", USER_BASE, USER_SIZE).unwrap();
        assert_eq!(
            elf_load_uspace("", aspace).unwrap_err(),
            KernError::InvalidArgs
        );
        vm::vm_delete_aspace(aspace).unwrap();
    }
}
