//! MemoryStore - in-process link-layer store backed by `LinkLayerState`.
//!
//! Implements the link-layer capability traits and `TransactionRunner` on top
//! of the state machine. Transactions are applied under a single write lock,
//! so readers never observe a half-applied batch.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use crate::command::{
    AddressData, DeviceChanges, DeviceData, Life, Op, ProviderIdKind, Transaction,
};
use crate::network::{LinkLayerDeviceAddress, LinkLayerDeviceArgs, Origin, ip_key, mac_key};
use crate::state::LinkLayerState;

use super::error::{Result, StoreError};
use super::event::Event;
use super::traits::{
    LinkLayerAccessor, LinkLayerAddress, LinkLayerDevice, LinkLayerMachine, TransactionRunner,
};

/// MemoryStore wraps a `LinkLayerState` and implements the store traits.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<LinkLayerState>>,
    events: broadcast::Sender<Event>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::from_state(LinkLayerState::default())
    }

    /// Create a store serving the given state.
    pub fn from_state(state: LinkLayerState) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(state)),
            events,
        }
    }

    /// Load a store from a JSON state file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let state: LinkLayerState = serde_json::from_slice(&raw)?;
        state.validate()?;
        debug!(
            path = %path.display(),
            machines = state.machines.len(),
            devices = state.devices.len(),
            addresses = state.addresses.len(),
            "loaded link-layer state"
        );
        Ok(Self::from_state(state))
    }

    /// Write the current state to a JSON file.
    ///
    /// The file is replaced atomically via a temporary sibling.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let raw = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&*state)?
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Subscribe to state change events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> LinkLayerState {
        self.state.read().await.clone()
    }

    /// Add an alive machine. Returns false if it already existed.
    pub async fn add_machine(&self, id: &str) -> bool {
        self.state.write().await.add_machine(id)
    }

    /// Change a machine's life.
    pub async fn set_machine_life(&self, id: &str, life: Life) -> Result<()> {
        self.state.write().await.set_machine_life(id, life)
    }

    /// Remove a machine and its link-layer records.
    pub async fn remove_machine(&self, id: &str) -> Result<()> {
        match self.state.write().await.remove_machine(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("machine '{}'", id))),
        }
    }

    /// Get a handle for reconciling one machine's link-layer data.
    pub async fn machine(&self, id: &str) -> Result<MachineHandle> {
        let state = self.state.read().await;
        if state.get_machine(id).is_none() {
            return Err(StoreError::NotFound(format!("machine '{}'", id)));
        }
        Ok(MachineHandle {
            id: id.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionRunner for MemoryStore {
    async fn run_transaction(&self, txn: Transaction) -> Result<()> {
        let events = {
            let mut state = self.state.write().await;
            state.apply(&txn)?
        };

        info!(
            txn = %txn.id,
            ops = txn.ops.len(),
            changes = events.len(),
            "applied link-layer transaction"
        );

        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

// =============================================================================
// Machine Handle
// =============================================================================

/// Link-layer view of one machine in a `MemoryStore`.
#[derive(Clone)]
pub struct MachineHandle {
    id: String,
    state: Arc<RwLock<LinkLayerState>>,
}

#[async_trait]
impl LinkLayerAccessor for MachineHandle {
    type Device = DeviceRecord;
    type Address = AddressRecord;

    async fn all_link_layer_devices(&self) -> Result<Vec<DeviceRecord>> {
        let state = self.state.read().await;
        if state.get_machine(&self.id).is_none() {
            return Err(StoreError::NotFound(format!("machine '{}'", self.id)));
        }
        Ok(state
            .devices_for_machine(&self.id)
            .into_iter()
            .map(|data| DeviceRecord {
                data: data.clone(),
                state: Arc::clone(&self.state),
            })
            .collect())
    }

    async fn all_addresses(&self) -> Result<Vec<AddressRecord>> {
        let state = self.state.read().await;
        if state.get_machine(&self.id).is_none() {
            return Err(StoreError::NotFound(format!("machine '{}'", self.id)));
        }
        Ok(state
            .addresses_for_machine(&self.id)
            .into_iter()
            .map(|data| AddressRecord {
                data: data.clone(),
                state: Arc::clone(&self.state),
            })
            .collect())
    }
}

#[async_trait]
impl LinkLayerMachine for MachineHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn assert_alive_op(&self) -> Op {
        Op::AssertMachineAlive {
            machine_id: self.id.clone(),
        }
    }

    async fn refresh(&self) -> Result<Life> {
        let state = self.state.read().await;
        state
            .get_machine(&self.id)
            .map(|m| m.life)
            .ok_or_else(|| StoreError::NotFound(format!("machine '{}'", self.id)))
    }

    async fn add_device_ops(
        &self,
        args: &LinkLayerDeviceArgs,
        addrs: &[LinkLayerDeviceAddress],
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>> {
        let timestamp = Utc::now().to_rfc3339();
        let device = DeviceData {
            id: uuid::Uuid::new_v4().to_string(),
            machine_id: self.id.clone(),
            name: args.name.clone(),
            mac_address: mac_key(&args.mac_address),
            parent_name: args.parent_name.clone(),
            provider_id: args.provider_id.clone(),
            revision: 0,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        };

        let mut ops = Vec::with_capacity(1 + addrs.len());
        if let Some(pid) = &device.provider_id {
            let state = self.state.read().await;
            ops.extend(claim_provider_id(
                &state,
                ProviderIdKind::Device,
                pid,
                &device.id,
                removed,
            )?);
        }
        ops.push(Op::AddDevice { device });

        for addr in addrs {
            ops.extend(self.add_address_ops(addr, removed).await?);
        }
        Ok(ops)
    }
}

impl MachineHandle {
    async fn add_address_ops(
        &self,
        addr: &LinkLayerDeviceAddress,
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>> {
        let timestamp = Utc::now().to_rfc3339();
        let address = AddressData {
            id: uuid::Uuid::new_v4().to_string(),
            machine_id: self.id.clone(),
            device_name: addr.device_name.clone(),
            value: ip_key(&addr.value),
            origin: addr.origin,
            provider_id: addr.provider_id.clone(),
            provider_network_id: addr.provider_network_id.clone(),
            provider_subnet_id: addr.provider_subnet_id.clone(),
            revision: 0,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        };

        let mut ops = Vec::with_capacity(3);
        if let Some(pid) = &address.provider_id {
            let state = self.state.read().await;
            ops.extend(claim_provider_id(
                &state,
                ProviderIdKind::Address,
                pid,
                &address.id,
                removed,
            )?);
        }
        ops.push(Op::AddAddress { address });
        Ok(ops)
    }
}

/// Registry operations giving `provider_id` to `owner_id`.
///
/// An ID held by a record in `removed` is released before it is inserted
/// again, so the insert never sees the old owner.
fn claim_provider_id(
    state: &LinkLayerState,
    kind: ProviderIdKind,
    provider_id: &str,
    owner_id: &str,
    removed: &HashSet<String>,
) -> Result<Vec<Op>> {
    let insert = Op::InsertProviderId {
        kind,
        provider_id: provider_id.to_string(),
        owner_id: owner_id.to_string(),
    };
    match state.provider_id_owner(kind, provider_id) {
        None => Ok(vec![insert]),
        Some(owner) if owner == owner_id => Ok(vec![insert]),
        Some(owner) if removed.contains(owner) => Ok(vec![
            Op::RemoveProviderId {
                kind,
                provider_id: provider_id.to_string(),
                owner_id: owner.to_string(),
            },
            insert,
        ]),
        Some(owner) => Err(StoreError::Conflict(format!(
            "provider ID '{}' already in use by '{}'",
            provider_id, owner
        ))),
    }
}

// =============================================================================
// Records
// =============================================================================

/// Snapshot of a persisted device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    data: DeviceData,
    state: Arc<RwLock<LinkLayerState>>,
}

impl DeviceRecord {
    pub fn data(&self) -> &DeviceData {
        &self.data
    }
}

#[async_trait]
impl LinkLayerDevice for DeviceRecord {
    fn id(&self) -> &str {
        &self.data.id
    }

    fn mac_address(&self) -> &str {
        &self.data.mac_address
    }

    fn name(&self) -> &str {
        &self.data.name
    }

    fn provider_id(&self) -> Option<&str> {
        self.data.provider_id.as_deref()
    }

    fn parent_name(&self) -> Option<&str> {
        self.data.parent_name.as_deref()
    }

    async fn set_provider_id_ops(
        &self,
        provider_id: &str,
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>> {
        if self.data.provider_id.as_deref() == Some(provider_id) {
            return Ok(vec![]);
        }

        let mut ops = Vec::with_capacity(4);
        if let Some(old) = &self.data.provider_id {
            ops.push(Op::RemoveProviderId {
                kind: ProviderIdKind::Device,
                provider_id: old.clone(),
                owner_id: self.data.id.clone(),
            });
        }
        {
            let state = self.state.read().await;
            ops.extend(claim_provider_id(
                &state,
                ProviderIdKind::Device,
                provider_id,
                &self.data.id,
                removed,
            )?);
        }
        ops.push(Op::SetDeviceProviderId {
            id: self.data.id.clone(),
            revision: self.data.revision,
            timestamp: Utc::now().to_rfc3339(),
            provider_id: provider_id.to_string(),
        });
        Ok(ops)
    }

    fn remove_ops(&self) -> Vec<Op> {
        let mut ops = vec![Op::RemoveDevice {
            id: self.data.id.clone(),
            revision: self.data.revision,
        }];
        if let Some(pid) = &self.data.provider_id {
            ops.push(Op::RemoveProviderId {
                kind: ProviderIdKind::Device,
                provider_id: pid.clone(),
                owner_id: self.data.id.clone(),
            });
        }
        ops
    }

    fn update_ops(&self, args: &LinkLayerDeviceArgs) -> Vec<Op> {
        let mut changes = DeviceChanges::default();
        if args.name != self.data.name {
            changes.name = Some(args.name.clone());
        }
        match (&args.parent_name, &self.data.parent_name) {
            (Some(new), Some(old)) if new == old => {}
            (Some(new), _) => changes.parent_name = Some(new.clone()),
            (None, Some(_)) => changes.clear_parent = true,
            (None, None) => {}
        }
        vec![Op::UpdateDevice {
            id: self.data.id.clone(),
            revision: self.data.revision,
            timestamp: Utc::now().to_rfc3339(),
            changes,
        }]
    }

    async fn add_address_ops(
        &self,
        addr: &LinkLayerDeviceAddress,
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>> {
        let machine = MachineHandle {
            id: self.data.machine_id.clone(),
            state: Arc::clone(&self.state),
        };
        machine.add_address_ops(addr, removed).await
    }
}

/// Snapshot of a persisted address.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    data: AddressData,
    state: Arc<RwLock<LinkLayerState>>,
}

impl AddressRecord {
    pub fn data(&self) -> &AddressData {
        &self.data
    }
}

#[async_trait]
impl LinkLayerAddress for AddressRecord {
    fn id(&self) -> &str {
        &self.data.id
    }

    fn device_name(&self) -> &str {
        &self.data.device_name
    }

    fn value(&self) -> &str {
        &self.data.value
    }

    fn origin(&self) -> Origin {
        self.data.origin
    }

    fn provider_id(&self) -> Option<&str> {
        self.data.provider_id.as_deref()
    }

    fn provider_network_id(&self) -> Option<&str> {
        self.data.provider_network_id.as_deref()
    }

    fn provider_subnet_id(&self) -> Option<&str> {
        self.data.provider_subnet_id.as_deref()
    }

    async fn set_provider_id_ops(
        &self,
        provider_id: &str,
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>> {
        if self.data.provider_id.as_deref() == Some(provider_id) {
            return Ok(vec![]);
        }

        let mut ops = Vec::with_capacity(4);
        if let Some(old) = &self.data.provider_id {
            ops.push(Op::RemoveProviderId {
                kind: ProviderIdKind::Address,
                provider_id: old.clone(),
                owner_id: self.data.id.clone(),
            });
        }
        {
            let state = self.state.read().await;
            ops.extend(claim_provider_id(
                &state,
                ProviderIdKind::Address,
                provider_id,
                &self.data.id,
                removed,
            )?);
        }
        ops.push(Op::SetAddressProviderId {
            id: self.data.id.clone(),
            revision: self.data.revision,
            timestamp: Utc::now().to_rfc3339(),
            provider_id: provider_id.to_string(),
        });
        Ok(ops)
    }

    fn set_origin_ops(&self, origin: Origin) -> Vec<Op> {
        if origin == self.data.origin {
            return vec![];
        }
        vec![Op::SetAddressOrigin {
            id: self.data.id.clone(),
            revision: self.data.revision,
            timestamp: Utc::now().to_rfc3339(),
            origin,
        }]
    }

    fn set_provider_net_ids_ops(
        &self,
        network_id: Option<&str>,
        subnet_id: Option<&str>,
    ) -> Vec<Op> {
        if self.data.provider_network_id.as_deref() == network_id
            && self.data.provider_subnet_id.as_deref() == subnet_id
        {
            return vec![];
        }
        vec![Op::SetAddressProviderNetIds {
            id: self.data.id.clone(),
            revision: self.data.revision,
            timestamp: Utc::now().to_rfc3339(),
            network_id: network_id.map(str::to_string),
            subnet_id: subnet_id.map(str::to_string),
        }]
    }

    fn remove_ops(&self) -> Vec<Op> {
        let mut ops = vec![Op::RemoveAddress {
            id: self.data.id.clone(),
            revision: self.data.revision,
        }];
        if let Some(pid) = &self.data.provider_id {
            ops.push(Op::RemoveProviderId {
                kind: ProviderIdKind::Address,
                provider_id: pid.clone(),
                owner_id: self.data.id.clone(),
            });
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(name: &str, mac: &str) -> LinkLayerDeviceArgs {
        LinkLayerDeviceArgs {
            name: name.to_string(),
            mac_address: mac.to_string(),
            parent_name: None,
            provider_id: None,
        }
    }

    fn make_addr(device: &str, value: &str) -> LinkLayerDeviceAddress {
        LinkLayerDeviceAddress {
            device_name: device.to_string(),
            value: value.to_string(),
            origin: Origin::Machine,
            provider_id: None,
            provider_network_id: None,
            provider_subnet_id: None,
        }
    }

    async fn store_with_eth0() -> (MemoryStore, MachineHandle) {
        let store = MemoryStore::new();
        store.add_machine("0").await;
        let machine = store.machine("0").await.unwrap();

        let mut args = make_args("eth0", "AA:BB:CC:DD:EE:FF");
        args.provider_id = Some("nic-1".to_string());
        let ops = machine
            .add_device_ops(&args, &[make_addr("eth0", "10.0.0.5")], &HashSet::new())
            .await
            .unwrap();
        store.run_transaction(Transaction::new(ops)).await.unwrap();
        (store, machine)
    }

    #[tokio::test]
    async fn test_machine_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.machine("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_device_ops_normalize_and_register() {
        let (store, machine) = store_with_eth0().await;

        let devices = machine.all_link_layer_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mac_address(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(devices[0].provider_id(), Some("nic-1"));

        let state = store.snapshot().await;
        assert_eq!(
            state.provider_id_owner(ProviderIdKind::Device, "nic-1"),
            Some(devices[0].id())
        );
        assert_eq!(machine.all_addresses().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_id_in_use_is_a_conflict() {
        let (_store, machine) = store_with_eth0().await;

        let mut args = make_args("eth1", "11:22:33:44:55:66");
        args.provider_id = Some("nic-1".to_string());
        let result = machine.add_device_ops(&args, &[], &HashSet::new()).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_provider_id_of_removed_device_is_taken_over() {
        let (store, machine) = store_with_eth0().await;
        let old = machine.all_link_layer_devices().await.unwrap().remove(0);

        let mut args = make_args("eth0", "11:22:33:44:55:66");
        args.provider_id = Some("nic-1".to_string());
        let removed = HashSet::from([old.id().to_string()]);
        let mut ops = machine.add_device_ops(&args, &[], &removed).await.unwrap();

        match &ops[0] {
            Op::RemoveProviderId {
                provider_id,
                owner_id,
                ..
            } => {
                assert_eq!(provider_id, "nic-1");
                assert_eq!(owner_id, old.id());
            }
            other => panic!("Unexpected op: {:?}", other),
        }
        assert!(matches!(ops[1], Op::InsertProviderId { .. }));

        for addr in machine.all_addresses().await.unwrap() {
            ops.extend(addr.remove_ops());
        }
        ops.extend(old.remove_ops());
        store.run_transaction(Transaction::new(ops)).await.unwrap();

        let state = store.snapshot().await;
        let device = state.get_device_by_name("0", "eth0").unwrap();
        assert_eq!(device.mac_address, "11:22:33:44:55:66");
        assert_eq!(
            state.provider_id_owner(ProviderIdKind::Device, "nic-1"),
            Some(device.id.as_str())
        );
    }

    #[tokio::test]
    async fn test_remove_ops_release_provider_id() {
        let (store, machine) = store_with_eth0().await;

        let devices = machine.all_link_layer_devices().await.unwrap();
        let addrs = machine.all_addresses().await.unwrap();
        let mut ops = addrs[0].remove_ops();
        ops.extend(devices[0].remove_ops());
        store.run_transaction(Transaction::new(ops)).await.unwrap();

        let state = store.snapshot().await;
        assert!(state.devices.is_empty());
        assert!(state.provider_ids.is_empty());
    }

    #[tokio::test]
    async fn test_update_ops_compute_changes() {
        let (_store, machine) = store_with_eth0().await;
        let devices = machine.all_link_layer_devices().await.unwrap();

        let same = devices[0].update_ops(&make_args("eth0", "aa:bb:cc:dd:ee:ff"));
        assert_eq!(same.len(), 1);
        assert!(same[0].is_noop());

        let mut renamed = make_args("ens3", "aa:bb:cc:dd:ee:ff");
        renamed.parent_name = Some("bond0".to_string());
        match &devices[0].update_ops(&renamed)[0] {
            Op::UpdateDevice { changes, .. } => {
                assert_eq!(changes.name.as_deref(), Some("ens3"));
                assert_eq!(changes.parent_name.as_deref(), Some("bond0"));
            }
            other => panic!("Unexpected op: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_address_ops_skip_unchanged_values() {
        let (_store, machine) = store_with_eth0().await;
        let addrs = machine.all_addresses().await.unwrap();

        assert!(addrs[0].set_origin_ops(Origin::Machine).is_empty());
        assert_eq!(addrs[0].set_origin_ops(Origin::Provider).len(), 1);
        assert!(addrs[0].set_provider_net_ids_ops(None, None).is_empty());
        assert_eq!(
            addrs[0]
                .set_provider_net_ids_ops(Some("net-1"), Some("subnet-1"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_events_are_broadcast_after_commit() {
        let store = MemoryStore::new();
        store.add_machine("0").await;
        let machine = store.machine("0").await.unwrap();
        let mut rx = store.subscribe();

        let ops = machine
            .add_device_ops(&make_args("eth0", "aa:bb:cc:dd:ee:ff"), &[], &HashSet::new())
            .await
            .unwrap();
        store.run_transaction(Transaction::new(ops)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.resource_type(), "device");
        assert_eq!(event.machine_id(), "0");
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let (store, _machine) = store_with_eth0().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        store.save(&path).await.unwrap();
        let loaded = MemoryStore::load(&path).await.unwrap();

        let before = store.snapshot().await;
        let after = loaded.snapshot().await;
        assert_eq!(before.devices, after.devices);
        assert_eq!(before.addresses, after.addresses);
        assert_eq!(before.provider_ids, after.provider_ids);
    }

    #[tokio::test]
    async fn test_records_read_after_machine_removal_fail() {
        let (store, machine) = store_with_eth0().await;
        store.remove_machine("0").await.unwrap();

        assert!(matches!(
            machine.all_link_layer_devices().await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(machine.refresh().await, Err(StoreError::NotFound(_))));
    }
}
