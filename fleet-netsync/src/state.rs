//! Link-layer state machine.
//!
//! Applies link-layer transactions all-or-nothing: operations run against a
//! staged copy of the state, which replaces the live state only when every
//! operation succeeded and the machine-level invariants still hold.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use crate::command::{
    AddressData, DeviceData, Life, MachineData, Op, ProviderIdKind, Transaction,
};
use crate::store::{Event, StoreError};

type Result<T> = std::result::Result<T, StoreError>;

const APPLIED_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

/// Persisted link-layer state of every machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkLayerState {
    #[serde(default)]
    pub machines: HashMap<String, MachineData>,
    #[serde(default)]
    pub devices: HashMap<String, DeviceData>,
    #[serde(default)]
    pub addresses: HashMap<String, AddressData>,
    /// Provider ID registry: `ProviderIdKind::key` -> owning record ID.
    #[serde(default)]
    pub provider_ids: HashMap<String, String>,
    /// Idempotency cache of applied transaction IDs
    #[serde(skip)]
    applied_transactions: Option<LruCache<String, ()>>,
}

impl Default for LinkLayerState {
    fn default() -> Self {
        Self {
            machines: HashMap::new(),
            devices: HashMap::new(),
            addresses: HashMap::new(),
            provider_ids: HashMap::new(),
            applied_transactions: Some(LruCache::new(APPLIED_CACHE_SIZE)),
        }
    }
}

impl LinkLayerState {
    // =========================================================================
    // Machine queries
    // =========================================================================

    /// Get a machine by ID
    pub fn get_machine(&self, id: &str) -> Option<&MachineData> {
        self.machines.get(id)
    }

    /// Add an alive machine, returning false if it already exists
    pub fn add_machine(&mut self, id: &str) -> bool {
        if self.machines.contains_key(id) {
            return false;
        }
        self.machines.insert(
            id.to_string(),
            MachineData {
                id: id.to_string(),
                life: Life::Alive,
            },
        );
        true
    }

    /// Change a machine's life
    pub fn set_machine_life(&mut self, id: &str, life: Life) -> Result<()> {
        match self.machines.get_mut(id) {
            Some(machine) => {
                machine.life = life;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("machine '{}'", id))),
        }
    }

    /// Remove a machine together with all of its link-layer records
    pub fn remove_machine(&mut self, id: &str) -> Option<MachineData> {
        let machine = self.machines.remove(id)?;
        let device_ids: HashSet<String> = self
            .devices
            .values()
            .filter(|d| d.machine_id == id)
            .map(|d| d.id.clone())
            .collect();
        let address_ids: HashSet<String> = self
            .addresses
            .values()
            .filter(|a| a.machine_id == id)
            .map(|a| a.id.clone())
            .collect();
        self.devices.retain(|_, d| d.machine_id != id);
        self.addresses.retain(|_, a| a.machine_id != id);
        self.provider_ids
            .retain(|_, owner| !device_ids.contains(owner) && !address_ids.contains(owner));
        Some(machine)
    }

    // =========================================================================
    // Link-layer queries
    // =========================================================================

    /// Get a device by ID
    pub fn get_device(&self, id: &str) -> Option<&DeviceData> {
        self.devices.get(id)
    }

    /// Get a device by machine and name
    pub fn get_device_by_name(&self, machine_id: &str, name: &str) -> Option<&DeviceData> {
        self.devices
            .values()
            .find(|d| d.machine_id == machine_id && d.name == name)
    }

    /// List a machine's devices, ordered by name
    pub fn devices_for_machine(&self, machine_id: &str) -> Vec<&DeviceData> {
        let mut devices: Vec<_> = self
            .devices
            .values()
            .filter(|d| d.machine_id == machine_id)
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Get an address by ID
    pub fn get_address(&self, id: &str) -> Option<&AddressData> {
        self.addresses.get(id)
    }

    /// List a machine's addresses, ordered by device name and value
    pub fn addresses_for_machine(&self, machine_id: &str) -> Vec<&AddressData> {
        let mut addresses: Vec<_> = self
            .addresses
            .values()
            .filter(|a| a.machine_id == machine_id)
            .collect();
        addresses.sort_by(|a, b| {
            a.device_name
                .cmp(&b.device_name)
                .then_with(|| a.value.cmp(&b.value))
        });
        addresses
    }

    /// ID of the record holding a provider ID
    pub fn provider_id_owner(&self, kind: ProviderIdKind, provider_id: &str) -> Option<&str> {
        self.provider_ids
            .get(&kind.key(provider_id))
            .map(String::as_str)
    }

    /// Ensure the idempotency cache is initialized (after deserialization)
    fn ensure_cache(&mut self) {
        if self.applied_transactions.is_none() {
            self.applied_transactions = Some(LruCache::new(APPLIED_CACHE_SIZE));
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Apply a transaction all-or-nothing.
    ///
    /// A transaction whose ID was already applied is acknowledged without
    /// being applied again.
    pub fn apply(&mut self, txn: &Transaction) -> Result<Vec<Event>> {
        self.ensure_cache();

        if let Some(cache) = &self.applied_transactions
            && cache.contains(&txn.id)
        {
            return Ok(vec![]);
        }

        let mut cache = self.applied_transactions.take();
        let mut staged = self.clone();
        let result = staged
            .apply_ops(self, &txn.ops)
            .and_then(|events| staged.validate().map(|_| events));

        match result {
            Ok(events) => {
                if let Some(cache) = &mut cache {
                    cache.put(txn.id.clone(), ());
                }
                staged.applied_transactions = cache;
                *self = staged;
                Ok(events)
            }
            Err(e) => {
                self.applied_transactions = cache;
                Err(e)
            }
        }
    }

    /// Check the invariants every committed state satisfies.
    ///
    /// - device names are unique per machine
    /// - parents and address owners name existing devices of the same machine
    /// - an address value appears once per device
    /// - the provider ID registry and the records agree
    pub fn validate(&self) -> Result<()> {
        let mut names: HashSet<(&str, &str)> = HashSet::new();
        for device in self.devices.values() {
            if !self.machines.contains_key(&device.machine_id) {
                return Err(StoreError::Aborted(format!(
                    "device '{}' belongs to missing machine '{}'",
                    device.id, device.machine_id
                )));
            }
            if !names.insert((device.machine_id.as_str(), device.name.as_str())) {
                return Err(StoreError::Aborted(format!(
                    "duplicate device name '{}' on machine '{}'",
                    device.name, device.machine_id
                )));
            }
        }

        for device in self.devices.values() {
            if let Some(parent) = &device.parent_name
                && !names.contains(&(device.machine_id.as_str(), parent.as_str()))
            {
                return Err(StoreError::Aborted(format!(
                    "device '{}' on machine '{}' names missing parent '{}'",
                    device.name, device.machine_id, parent
                )));
            }
            if let Some(pid) = &device.provider_id
                && self.provider_id_owner(ProviderIdKind::Device, pid) != Some(device.id.as_str())
            {
                return Err(StoreError::Aborted(format!(
                    "provider ID '{}' of device '{}' is not registered to it",
                    pid, device.id
                )));
            }
        }

        let mut values: HashSet<(&str, &str, &str)> = HashSet::new();
        for addr in self.addresses.values() {
            if !names.contains(&(addr.machine_id.as_str(), addr.device_name.as_str())) {
                return Err(StoreError::Aborted(format!(
                    "address '{}' names missing device '{}' on machine '{}'",
                    addr.value, addr.device_name, addr.machine_id
                )));
            }
            if !values.insert((
                addr.machine_id.as_str(),
                addr.device_name.as_str(),
                addr.value.as_str(),
            )) {
                return Err(StoreError::Aborted(format!(
                    "duplicate address '{}' on device '{}'",
                    addr.value, addr.device_name
                )));
            }
            if let Some(pid) = &addr.provider_id
                && self.provider_id_owner(ProviderIdKind::Address, pid) != Some(addr.id.as_str())
            {
                return Err(StoreError::Aborted(format!(
                    "provider ID '{}' of address '{}' is not registered to it",
                    pid, addr.id
                )));
            }
        }

        for (key, owner) in &self.provider_ids {
            if !self.devices.contains_key(owner) && !self.addresses.contains_key(owner) {
                return Err(StoreError::Aborted(format!(
                    "provider ID '{}' is held by missing record '{}'",
                    key, owner
                )));
            }
        }

        Ok(())
    }

    fn apply_ops(&mut self, baseline: &LinkLayerState, ops: &[Op]) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for op in ops {
            self.apply_op(baseline, op, &mut events)?;
        }
        Ok(events)
    }

    fn apply_op(&mut self, baseline: &LinkLayerState, op: &Op, events: &mut Vec<Event>) -> Result<()> {
        match op {
            // =================================================================
            // Machine Assertions
            // =================================================================
            Op::AssertMachineAlive { machine_id } => match baseline.machines.get(machine_id) {
                None => Err(StoreError::NotFound(format!("machine '{}'", machine_id))),
                Some(machine) if machine.life != Life::Alive => Err(StoreError::Aborted(
                    format!("machine '{}' is not alive", machine_id),
                )),
                Some(_) => Ok(()),
            },

            // =================================================================
            // Device Operations
            // =================================================================
            Op::AddDevice { device } => {
                if self.devices.contains_key(&device.id) {
                    return Err(StoreError::Aborted(format!(
                        "device '{}' already exists",
                        device.id
                    )));
                }
                if !self.machines.contains_key(&device.machine_id) {
                    return Err(StoreError::NotFound(format!(
                        "machine '{}'",
                        device.machine_id
                    )));
                }
                self.devices.insert(device.id.clone(), device.clone());
                events.push(Event::DeviceAdded(device.clone()));
                Ok(())
            }

            Op::UpdateDevice {
                id,
                revision,
                timestamp,
                changes,
            } => {
                self.expect_device_revision(baseline, id, *revision)?;
                if changes.is_empty() {
                    return Ok(());
                }

                let Some(device) = self.devices.get_mut(id) else {
                    return Err(device_gone(id));
                };
                let old = device.clone();
                if let Some(name) = &changes.name {
                    device.name = name.clone();
                }
                if let Some(parent) = &changes.parent_name {
                    device.parent_name = Some(parent.clone());
                } else if changes.clear_parent {
                    device.parent_name = None;
                }
                device.revision += 1;
                device.updated_at = timestamp.clone();
                let new = device.clone();

                if old.name != new.name {
                    self.rename_device_addresses(baseline, &new, timestamp, events);
                }
                events.push(Event::DeviceUpdated {
                    id: id.clone(),
                    old,
                    new,
                });
                Ok(())
            }

            Op::SetDeviceProviderId {
                id,
                revision,
                timestamp,
                provider_id,
            } => {
                self.expect_device_revision(baseline, id, *revision)?;
                let Some(device) = self.devices.get_mut(id) else {
                    return Err(device_gone(id));
                };
                let old = device.clone();
                device.provider_id = Some(provider_id.clone());
                device.revision += 1;
                device.updated_at = timestamp.clone();
                events.push(Event::DeviceUpdated {
                    id: id.clone(),
                    old,
                    new: device.clone(),
                });
                Ok(())
            }

            Op::RemoveDevice { id, revision } => {
                self.expect_device_revision(baseline, id, *revision)?;
                match self.devices.remove(id) {
                    Some(device) => {
                        events.push(Event::DeviceRemoved {
                            id: id.clone(),
                            machine_id: device.machine_id,
                        });
                        Ok(())
                    }
                    None => Err(device_gone(id)),
                }
            }

            // =================================================================
            // Address Operations
            // =================================================================
            Op::AddAddress { address } => {
                if self.addresses.contains_key(&address.id) {
                    return Err(StoreError::Aborted(format!(
                        "address '{}' already exists",
                        address.id
                    )));
                }
                if !self.machines.contains_key(&address.machine_id) {
                    return Err(StoreError::NotFound(format!(
                        "machine '{}'",
                        address.machine_id
                    )));
                }
                self.addresses.insert(address.id.clone(), address.clone());
                events.push(Event::AddressAdded(address.clone()));
                Ok(())
            }

            Op::SetAddressOrigin {
                id,
                revision,
                timestamp,
                origin,
            } => self.update_address(baseline, id, *revision, timestamp, events, |addr| {
                addr.origin = *origin;
            }),

            Op::SetAddressProviderId {
                id,
                revision,
                timestamp,
                provider_id,
            } => self.update_address(baseline, id, *revision, timestamp, events, |addr| {
                addr.provider_id = Some(provider_id.clone());
            }),

            Op::SetAddressProviderNetIds {
                id,
                revision,
                timestamp,
                network_id,
                subnet_id,
            } => self.update_address(baseline, id, *revision, timestamp, events, |addr| {
                addr.provider_network_id = network_id.clone();
                addr.provider_subnet_id = subnet_id.clone();
            }),

            Op::RemoveAddress { id, revision } => {
                self.expect_address_revision(baseline, id, *revision)?;
                match self.addresses.remove(id) {
                    Some(addr) => {
                        events.push(Event::AddressRemoved {
                            id: id.clone(),
                            machine_id: addr.machine_id,
                        });
                        Ok(())
                    }
                    None => Err(address_gone(id)),
                }
            }

            // =================================================================
            // Provider ID Registry
            // =================================================================
            Op::InsertProviderId {
                kind,
                provider_id,
                owner_id,
            } => {
                let key = kind.key(provider_id);
                match self.provider_ids.get(&key) {
                    Some(owner) if owner == owner_id => Ok(()),
                    Some(owner) => Err(StoreError::Aborted(format!(
                        "provider ID '{}' already in use by '{}'",
                        provider_id, owner
                    ))),
                    None => {
                        self.provider_ids.insert(key, owner_id.clone());
                        Ok(())
                    }
                }
            }

            Op::RemoveProviderId {
                kind,
                provider_id,
                owner_id,
            } => {
                let key = kind.key(provider_id);
                if self.provider_ids.get(&key) == Some(owner_id) {
                    self.provider_ids.remove(&key);
                }
                Ok(())
            }
        }
    }

    /// Follow a device rename on the addresses that named the device before
    /// this transaction.
    fn rename_device_addresses(
        &mut self,
        baseline: &LinkLayerState,
        device: &DeviceData,
        timestamp: &str,
        events: &mut Vec<Event>,
    ) {
        let Some(before) = baseline.devices.get(&device.id) else {
            return;
        };
        for (id, addr) in self.addresses.iter_mut() {
            let Some(base) = baseline.addresses.get(id) else {
                continue;
            };
            if base.machine_id != device.machine_id || base.device_name != before.name {
                continue;
            }
            let old = addr.clone();
            addr.device_name = device.name.clone();
            addr.revision += 1;
            addr.updated_at = timestamp.to_string();
            events.push(Event::AddressUpdated {
                id: id.clone(),
                old,
                new: addr.clone(),
            });
        }
    }

    fn update_address<F>(
        &mut self,
        baseline: &LinkLayerState,
        id: &str,
        revision: u64,
        timestamp: &str,
        events: &mut Vec<Event>,
        change: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut AddressData),
    {
        self.expect_address_revision(baseline, id, revision)?;
        let Some(addr) = self.addresses.get_mut(id) else {
            return Err(address_gone(id));
        };
        let old = addr.clone();
        change(addr);
        addr.revision += 1;
        addr.updated_at = timestamp.to_string();
        events.push(Event::AddressUpdated {
            id: id.to_string(),
            old,
            new: addr.clone(),
        });
        Ok(())
    }

    /// Revisions are checked against the state before the transaction, so
    /// several operations on one record can share the snapshot revision.
    fn expect_device_revision(&self, baseline: &LinkLayerState, id: &str, revision: u64) -> Result<()> {
        let Some(current) = baseline.devices.get(id) else {
            return Err(device_gone(id));
        };
        if current.revision != revision {
            return Err(StoreError::VersionMismatch {
                id: id.to_string(),
                expected: revision,
                actual: current.revision,
            });
        }
        if !self.devices.contains_key(id) {
            return Err(device_gone(id));
        }
        Ok(())
    }

    fn expect_address_revision(
        &self,
        baseline: &LinkLayerState,
        id: &str,
        revision: u64,
    ) -> Result<()> {
        let Some(current) = baseline.addresses.get(id) else {
            return Err(address_gone(id));
        };
        if current.revision != revision {
            return Err(StoreError::VersionMismatch {
                id: id.to_string(),
                expected: revision,
                actual: current.revision,
            });
        }
        if !self.addresses.contains_key(id) {
            return Err(address_gone(id));
        }
        Ok(())
    }
}

fn device_gone(id: &str) -> StoreError {
    StoreError::Aborted(format!("device '{}' no longer exists", id))
}

fn address_gone(id: &str) -> StoreError {
    StoreError::Aborted(format!("address '{}' no longer exists", id))
}
