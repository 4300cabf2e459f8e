//! Ports collaborator
//!
//! Only the capability the exit path consumes: ports carry an owning
//! process, and a dying process's ports are released in bulk.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Once;

use crate::errors::KernError;
use crate::kern::lock::SpinLock;
use crate::types::{make_name, Name, ProcId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortId(pub i32);

struct Port {
    #[allow(dead_code)]
    name: Name,
    owner: ProcId,
}

struct PortTable {
    ports: BTreeMap<PortId, Port>,
    next_id: i32,
}

static PORTS: Once<SpinLock<PortTable>> = Once::new();

fn table() -> &'static SpinLock<PortTable> {
    PORTS.call_once(|| {
        SpinLock::new(PortTable {
            ports: BTreeMap::new(),
            next_id: 1,
        })
    })
}

pub fn port_create(owner: ProcId, name: &str) -> Result<PortId, KernError> {
    let mut t = table().lock();
    let id = PortId(t.next_id);
    t.next_id += 1;
    t.ports.insert(
        id,
        Port {
            name: make_name(name),
            owner,
        },
    );
    Ok(id)
}

pub fn port_delete(id: PortId) -> Result<(), KernError> {
    table()
        .lock()
        .ports
        .remove(&id)
        .map(|_| ())
        .ok_or(KernError::InvalidHandle)
}

/// Release every port owned by a process. Used by the exit path.
pub fn port_delete_owned_ports(owner: ProcId) -> usize {
    let mut t = table().lock();
    let doomed: Vec<PortId> = t
        .ports
        .iter()
        .filter(|(_, port)| port.owner == owner)
        .map(|(&id, _)| id)
        .collect();
    for id in &doomed {
        t.ports.remove(id);
    }
    doomed.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_release_by_owner() {
        let owner = ProcId(31337);
        let a = port_create(owner, "a").unwrap();
        let _b = port_create(owner, "b").unwrap();
        let keep = port_create(ProcId(1), "keep").unwrap();

        assert_eq!(port_delete_owned_ports(owner), 2);
        assert_eq!(port_delete(a).unwrap_err(), KernError::InvalidHandle);
        port_delete(keep).unwrap();
    }
}
