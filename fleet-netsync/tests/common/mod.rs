//! Shared helpers for reconciliation integration tests.

#![allow(dead_code)]

use fleet_netsync::command::Op;
use fleet_netsync::error::ReconcileError;
use fleet_netsync::network::{InterfaceAddress, InterfaceInfo, InterfaceInfos, Origin};
use fleet_netsync::{
    ApplyOutcome, MemoryStore, ModelOperation, ReconcileConfig, UpdateMachineLinkLayerOp,
    apply_operation,
};

pub const MACHINE: &str = "0";
pub const MAC_A: &str = "aa:bb:cc:dd:ee:ff";
pub const MAC_B: &str = "11:22:33:44:55:66";

pub fn make_info(mac: &str, name: &str, addrs: &[&str]) -> InterfaceInfo {
    InterfaceInfo {
        mac_address: mac.to_string(),
        name: name.to_string(),
        parent_name: None,
        provider_id: None,
        addresses: addrs.iter().map(|a| InterfaceAddress::machine(a)).collect(),
    }
}

pub fn make_provider_address(value: &str, network_id: &str, subnet_id: &str) -> InterfaceAddress {
    InterfaceAddress {
        value: value.to_string(),
        origin: Origin::Provider,
        provider_id: None,
        provider_network_id: Some(network_id.to_string()),
        provider_subnet_id: Some(subnet_id.to_string()),
    }
}

/// A store holding one alive machine with no link-layer records.
pub async fn make_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.add_machine(MACHINE).await;
    store
}

/// Reconcile the test machine against `infos` with the default settings.
pub async fn reconcile(
    store: &MemoryStore,
    infos: Vec<InterfaceInfo>,
) -> Result<ApplyOutcome, ReconcileError> {
    let machine = store.machine(MACHINE).await?;
    let mut op = UpdateMachineLinkLayerOp::new(machine, InterfaceInfos::new(infos));
    apply_operation(store, &mut op, &ReconcileConfig::default()).await
}

/// The operations one pass would submit, without applying them.
pub async fn build_ops(store: &MemoryStore, infos: Vec<InterfaceInfo>) -> Vec<Op> {
    let machine = store.machine(MACHINE).await.unwrap();
    let mut op = UpdateMachineLinkLayerOp::new(machine, InterfaceInfos::new(infos));
    op.build(0).await.unwrap()
}

pub fn op_names(ops: &[Op]) -> Vec<&'static str> {
    ops.iter().map(Op::name).collect()
}
