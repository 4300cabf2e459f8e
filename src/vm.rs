//! Virtual memory collaborator
//!
//! The narrow slice of the VM subsystem the process/thread core consumes:
//! address spaces with a translation-map root, anonymous regions (wired or
//! lazy) with placement hints, name lookup, and the per-CPU active-aspace
//! swap. Regions carry a backing store so the safe user-copy primitives
//! operate on real memory.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use spin::Once;

use crate::errors::KernError;
use crate::kern::cpu;
use crate::kern::lock::SpinLock;
use crate::types::{make_name, Addr, AspaceId, Name, RegionId};

pub const PAGE_SIZE: usize = 4096;

/// Kernel half of the canonical 64-bit address space.
pub const KERNEL_BASE: Addr = 0xffff_8000_0000_0000;
pub const KERNEL_SIZE: usize = 0x0000_0001_0000_0000;

/// User address window.
pub const USER_BASE: Addr = 0x0000_0000_0010_0000;
pub const USER_SIZE: usize = 0x0000_6100_0000_0000 - USER_BASE;

/// Kernel stack size (wired).
pub const KSTACK_SIZE: usize = 4 * PAGE_SIZE;

/// User stack size (lazy).
pub const STACK_SIZE: usize = 16 * PAGE_SIZE;

/// Window inside the user address space where thread stacks are placed,
/// probed at descending addresses.
pub const USER_STACK_REGION: Addr = 0x0000_6000_0000_0000;
pub const USER_STACK_REGION_SIZE: usize = 64 * STACK_SIZE;

/// Whether a region's pages are committed up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionWiring {
    Wired,
    Lazy,
}

/// Placement hint for region creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionAddr {
    AnyAddress,
    ExactAddress(Addr),
}

pub const LOCK_RO: u32 = 0x1;
pub const LOCK_RW: u32 = 0x2;
pub const LOCK_KERNEL: u32 = 0x4;

struct VmRegion {
    id: RegionId,
    name: Name,
    base: Addr,
    size: usize,
    #[allow(dead_code)]
    wiring: RegionWiring,
    #[allow(dead_code)]
    lock: u32,
    backing: Vec<u8>,
}

struct VmAspace {
    #[allow(dead_code)]
    id: AspaceId,
    name: Name,
    base: Addr,
    size: usize,
    translation_map_root: u64,
    ref_count: u32,
    regions: BTreeMap<RegionId, VmRegion>,
}

impl VmAspace {
    fn find_gap(&self, size: usize) -> Option<Addr> {
        let mut candidate = self.base;
        let mut bases: Vec<(Addr, usize)> =
            self.regions.values().map(|r| (r.base, r.size)).collect();
        bases.sort_unstable();
        for (base, rsize) in bases {
            if candidate + size <= base {
                return Some(candidate);
            }
            candidate = candidate.max(base + rsize);
        }
        if candidate + size <= self.base + self.size {
            Some(candidate)
        } else {
            None
        }
    }

    fn overlaps(&self, base: Addr, size: usize) -> bool {
        self.regions
            .values()
            .any(|r| base < r.base + r.size && r.base < base + size)
    }
}

struct VmState {
    aspaces: BTreeMap<AspaceId, VmAspace>,
    kernel_aspace: AspaceId,
    next_aspace_id: i32,
    next_region_id: i32,
    next_tmap_root: u64,
}

static VM: Once<SpinLock<VmState>> = Once::new();

fn vm_state() -> &'static SpinLock<VmState> {
    VM.get().expect("vm not initialized")
}

/// Create the kernel address space. Idempotent.
pub fn init() {
    VM.call_once(|| {
        let mut state = VmState {
            aspaces: BTreeMap::new(),
            kernel_aspace: AspaceId(1),
            next_aspace_id: 2,
            next_region_id: 1,
            next_tmap_root: 0x1000,
        };
        state.aspaces.insert(
            AspaceId(1),
            VmAspace {
                id: AspaceId(1),
                name: make_name("kernel_land"),
                base: KERNEL_BASE,
                size: KERNEL_SIZE,
                translation_map_root: 0x1000,
                ref_count: 1,
                regions: BTreeMap::new(),
            },
        );
        SpinLock::new(state)
    });
}

pub fn vm_get_kernel_aspace_id() -> AspaceId {
    vm_state().lock().kernel_aspace
}

/// Create an address space covering `[base, base + size)`.
pub fn vm_create_aspace(name: &str, base: Addr, size: usize) -> Result<AspaceId, KernError> {
    if size == 0 {
        return Err(KernError::InvalidArgs);
    }
    let mut vm = vm_state().lock();
    let id = AspaceId(vm.next_aspace_id);
    vm.next_aspace_id += 1;
    vm.next_tmap_root += 0x1000;
    let root = vm.next_tmap_root;
    vm.aspaces.insert(
        id,
        VmAspace {
            id,
            name: make_name(name),
            base,
            size,
            translation_map_root: root,
            ref_count: 1,
            regions: BTreeMap::new(),
        },
    );
    Ok(id)
}

/// Drop a reference to an address space.
pub fn vm_put_aspace(id: AspaceId) {
    let mut vm = vm_state().lock();
    if let Some(aspace) = vm.aspaces.get_mut(&id) {
        aspace.ref_count = aspace.ref_count.saturating_sub(1);
    }
}

/// Take a reference to an address space.
pub fn vm_get_aspace_by_id(id: AspaceId) -> Result<AspaceId, KernError> {
    let mut vm = vm_state().lock();
    let aspace = vm.aspaces.get_mut(&id).ok_or(KernError::InvalidHandle)?;
    aspace.ref_count += 1;
    Ok(id)
}

/// Delete an address space and all of its regions.
pub fn vm_delete_aspace(id: AspaceId) -> Result<(), KernError> {
    let mut vm = vm_state().lock();
    if id == vm.kernel_aspace {
        return Err(KernError::InvalidArgs);
    }
    vm.aspaces.remove(&id).ok_or(KernError::InvalidHandle)?;
    Ok(())
}

/// Create an anonymous region. Returns the region id and its base address.
pub fn vm_create_anonymous_region(
    aspace_id: AspaceId,
    name: &str,
    addr: RegionAddr,
    size: usize,
    wiring: RegionWiring,
    lock: u32,
) -> Result<(RegionId, Addr), KernError> {
    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(KernError::InvalidArgs);
    }
    let mut vm = vm_state().lock();
    let id = RegionId(vm.next_region_id);
    let aspace = vm
        .aspaces
        .get_mut(&aspace_id)
        .ok_or(KernError::InvalidHandle)?;

    let base = match addr {
        RegionAddr::AnyAddress => aspace.find_gap(size).ok_or(KernError::NoMoreRegions)?,
        RegionAddr::ExactAddress(base) => {
            if base < aspace.base || base + size > aspace.base + aspace.size {
                return Err(KernError::VmBadAddress);
            }
            if aspace.overlaps(base, size) {
                return Err(KernError::NoMoreRegions);
            }
            base
        }
    };

    aspace.regions.insert(
        id,
        VmRegion {
            id,
            name: make_name(name),
            base,
            size,
            wiring,
            lock,
            backing: vec![0; size],
        },
    );
    vm.next_region_id += 1;
    Ok((id, base))
}

pub fn vm_delete_region(aspace_id: AspaceId, region: RegionId) -> Result<(), KernError> {
    let mut vm = vm_state().lock();
    let aspace = vm
        .aspaces
        .get_mut(&aspace_id)
        .ok_or(KernError::InvalidHandle)?;
    aspace
        .regions
        .remove(&region)
        .map(|_| ())
        .ok_or(KernError::InvalidHandle)
}

pub fn vm_find_region_by_name(aspace_id: AspaceId, name: &str) -> Option<(RegionId, Addr)> {
    let vm = vm_state().lock();
    let aspace = vm.aspaces.get(&aspace_id)?;
    aspace
        .regions
        .values()
        .find(|r| r.name.as_str() == name)
        .map(|r| (r.id, r.base))
}

/// The page-table root installed with this address space.
pub fn translation_map_root(aspace_id: AspaceId) -> Option<u64> {
    let vm = vm_state().lock();
    vm.aspaces.get(&aspace_id).map(|a| a.translation_map_root)
}

/// Install an address space on the current CPU.
pub fn vm_aspace_swap(aspace_id: AspaceId) {
    cpu::current_cpu().set_active_aspace(aspace_id);
}

pub fn aspace_name(aspace_id: AspaceId) -> Option<Name> {
    let vm = vm_state().lock();
    vm.aspaces.get(&aspace_id).map(|a| a.name.clone())
}

/// Copy bytes into an address space at `addr`. The range must lie inside a
/// single region.
pub fn write_mem(aspace_id: AspaceId, addr: Addr, bytes: &[u8]) -> Result<(), KernError> {
    let mut vm = vm_state().lock();
    let aspace = vm
        .aspaces
        .get_mut(&aspace_id)
        .ok_or(KernError::InvalidHandle)?;
    let region = aspace
        .regions
        .values_mut()
        .find(|r| addr >= r.base && addr + bytes.len() <= r.base + r.size)
        .ok_or(KernError::VmBadAddress)?;
    let offset = addr - region.base;
    region.backing[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Copy bytes out of an address space at `addr`.
pub fn read_mem(aspace_id: AspaceId, addr: Addr, out: &mut [u8]) -> Result<(), KernError> {
    let vm = vm_state().lock();
    let aspace = vm.aspaces.get(&aspace_id).ok_or(KernError::InvalidHandle)?;
    let region = aspace
        .regions
        .values()
        .find(|r| addr >= r.base && addr + out.len() <= r.base + r.size)
        .ok_or(KernError::VmBadAddress)?;
    let offset = addr - region.base;
    out.copy_from_slice(&region.backing[offset..offset + out.len()]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> AspaceId {
        init();
        vm_create_aspace("test_aspace", USER_BASE, USER_SIZE).unwrap()
    }

    #[test]
    fn test_region_any_placement_does_not_overlap() {
        let aspace = setup();
        let (r1, b1) =
            vm_create_anonymous_region(aspace, "one", RegionAddr::AnyAddress, PAGE_SIZE,
                RegionWiring::Wired, LOCK_RW)
            .unwrap();
        let (r2, b2) =
            vm_create_anonymous_region(aspace, "two", RegionAddr::AnyAddress, PAGE_SIZE,
                RegionWiring::Wired, LOCK_RW)
            .unwrap();
        assert_ne!(r1, r2);
        assert!(b2 >= b1 + PAGE_SIZE || b1 >= b2 + PAGE_SIZE);
        vm_delete_aspace(aspace).unwrap();
    }

    #[test]
    fn test_exact_placement_rejects_overlap() {
        let aspace = setup();
        let base = USER_STACK_REGION;
        vm_create_anonymous_region(aspace, "stack", RegionAddr::ExactAddress(base),
            STACK_SIZE, RegionWiring::Lazy, LOCK_RW)
        .unwrap();
        let err = vm_create_anonymous_region(aspace, "stack2", RegionAddr::ExactAddress(base),
            STACK_SIZE, RegionWiring::Lazy, LOCK_RW)
        .unwrap_err();
        assert_eq!(err, KernError::NoMoreRegions);
        vm_delete_aspace(aspace).unwrap();
    }

    #[test]
    fn test_find_region_by_name() {
        let aspace = setup();
        let (rid, base) = vm_create_anonymous_region(aspace, "named", RegionAddr::AnyAddress,
            PAGE_SIZE, RegionWiring::Wired, LOCK_RW)
        .unwrap();
        assert_eq!(vm_find_region_by_name(aspace, "named"), Some((rid, base)));
        assert_eq!(vm_find_region_by_name(aspace, "missing"), None);
        vm_delete_aspace(aspace).unwrap();
    }

    #[test]
    fn test_backing_round_trip() {
        let aspace = setup();
        let (_rid, base) = vm_create_anonymous_region(aspace, "buf", RegionAddr::AnyAddress,
            PAGE_SIZE, RegionWiring::Wired, LOCK_RW)
        .unwrap();
        write_mem(aspace, base + 16, b"payload").unwrap();
        let mut out = [0u8; 7];
        read_mem(aspace, base + 16, &mut out).unwrap();
        assert_eq!(&out, b"payload");

        let err = write_mem(aspace, base + PAGE_SIZE, b"x").unwrap_err();
        assert_eq!(err, KernError::VmBadAddress);
        vm_delete_aspace(aspace).unwrap();
    }

    #[test]
    fn test_delete_region() {
        let aspace = setup();
        let (rid, _) = vm_create_anonymous_region(aspace, "gone", RegionAddr::AnyAddress,
            PAGE_SIZE, RegionWiring::Wired, LOCK_RW)
        .unwrap();
        vm_delete_region(aspace, rid).unwrap();
        assert_eq!(vm_find_region_by_name(aspace, "gone"), None);
        assert_eq!(vm_delete_region(aspace, rid), Err(KernError::InvalidHandle));
        vm_delete_aspace(aspace).unwrap();
    }

    #[test]
    fn test_kernel_aspace_undeletable() {
        init();
        let kid = vm_get_kernel_aspace_id();
        assert_eq!(vm_delete_aspace(kid), Err(KernError::InvalidArgs));
    }
}
