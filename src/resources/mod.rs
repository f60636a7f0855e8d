//! Exclusive resource locking (C5). The coordinator never blocks: callers
//! poll `try_acquire` and back off themselves (the scheduler's dispatch
//! loop, see `tasks::scheduler`).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::profiles::model::{PowerSupplyProfile, SerialPortProfile, SocatProfile};
use crate::profiles::modbus_tcp_configuration;
use crate::tasks::execution::TaskId;

/// Structural identity of a physical or network resource a task must hold
/// exclusively for its duration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    SerialDevice(String),
    TcpPort(u16),
    PlcHost(String, u16),
    PowerCoil(String, u16, u16),
}

/// The exclusive-resource set a task's resolved profiles require, in the
/// order the orchestrator acquires them: serial, then bridge port, then
/// PLC host/coil.
pub fn required_keys(
    serial: &SerialPortProfile,
    socat: &SocatProfile,
    power: &PowerSupplyProfile,
) -> Vec<ResourceKey> {
    let modbus = modbus_tcp_configuration(power);
    vec![
        ResourceKey::SerialDevice(serial.device_path.clone()),
        ResourceKey::TcpPort(socat.listen_port),
        ResourceKey::PlcHost(modbus.host.clone(), modbus.port),
        ResourceKey::PowerCoil(modbus.host.clone(), modbus.port, modbus.wire_coil_address()),
    ]
}

/// Maps each held `ResourceKey` to the task that owns it. The only shared
/// mutable state here is the lock table itself; the mutex is held only
/// for the O(n) membership check and insert/remove, never across I/O.
#[derive(Default)]
pub struct ResourceCoordinator {
    locks: Mutex<HashMap<ResourceKey, TaskId>>,
}

impl ResourceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// All-or-nothing: either every key in `keys` becomes owned by
    /// `task_id`, or none do.
    pub fn try_acquire(&self, task_id: TaskId, keys: &[ResourceKey]) -> bool {
        let mut locks = self.locks.lock().expect("resource lock table poisoned");
        if keys.iter().any(|k| locks.contains_key(k)) {
            return false;
        }
        for key in keys {
            locks.insert(key.clone(), task_id);
        }
        true
    }

    pub fn release(&self, keys: &[ResourceKey]) {
        let mut locks = self.locks.lock().expect("resource lock table poisoned");
        for key in keys {
            locks.remove(key);
        }
    }

    /// True when `task_id` currently owns every key in `keys` and no
    /// others extraneous key — used by the property test that a task
    /// observed Running holds exactly its resolved resource set.
    #[cfg(test)]
    pub fn holds_exactly(&self, task_id: TaskId, keys: &[ResourceKey]) -> bool {
        let locks = self.locks.lock().expect("resource lock table poisoned");
        let owned: std::collections::HashSet<&ResourceKey> = locks
            .iter()
            .filter(|(_, owner)| **owner == task_id)
            .map(|(k, _)| k)
            .collect();
        let expected: std::collections::HashSet<&ResourceKey> = keys.iter().collect();
        owned == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn task_id() -> TaskId {
        TaskId(Uuid::new_v4())
    }

    #[test]
    fn acquire_is_all_or_nothing() {
        let coordinator = ResourceCoordinator::new();
        let t1 = task_id();
        let t2 = task_id();
        let keys = vec![
            ResourceKey::SerialDevice("/dev/ttyUSB0".into()),
            ResourceKey::TcpPort(8000),
        ];
        assert!(coordinator.try_acquire(t1, &keys));
        assert!(!coordinator.try_acquire(t2, &keys));
        coordinator.release(&keys);
        assert!(coordinator.try_acquire(t2, &keys));
    }

    #[test]
    fn partial_conflict_grants_nothing() {
        let coordinator = ResourceCoordinator::new();
        let t1 = task_id();
        let t2 = task_id();
        assert!(coordinator.try_acquire(t1, &[ResourceKey::TcpPort(8000)]));
        let keys = vec![
            ResourceKey::SerialDevice("/dev/ttyUSB1".into()),
            ResourceKey::TcpPort(8000),
        ];
        assert!(!coordinator.try_acquire(t2, &keys));
        assert!(coordinator.holds_exactly(t1, &[ResourceKey::TcpPort(8000)]));
    }
}
