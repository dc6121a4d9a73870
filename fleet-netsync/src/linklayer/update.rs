//! Builder for the link-layer update of one machine.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::audit::ReconcileAuditLogger;
use crate::command::{Life, Op};
use crate::error::{ReconcileError, Result};
use crate::network::{
    InterfaceInfos, LinkLayerDeviceAddress, LinkLayerDeviceArgs, Origin, ip_key,
};
use crate::store::{LinkLayerAddress, LinkLayerDevice, LinkLayerMachine, StoreError};

use super::apply::{ApplyOutcome, ModelOperation};
use super::matcher::{matching_incoming, matching_incoming_addresses, normalize_incoming};
use super::processed::ProcessedSet;
use super::snapshot::Snapshot;

/// Callback invoked once with the final outcome of the update.
pub type DoneCallback = Box<dyn FnOnce(&Result<ApplyOutcome>) + Send + Sync>;

/// Reconciles a machine's persisted link-layer devices and addresses with
/// the interfaces an agent observed.
///
/// Each call to `build` reads a fresh snapshot and produces one complete
/// batch:
///
/// 1. the machine alive assertion
/// 2. for each matched device: its update, provider ID, address updates and
///    address creations
/// 3. creations of devices that are not yet known, with their addresses
/// 4. removals of addresses that were not matched
/// 5. removals of devices that were not matched
pub struct UpdateMachineLinkLayerOp<M> {
    machine: M,
    incoming: InterfaceInfos,
    processed: ProcessedSet,
    audit: Option<Arc<ReconcileAuditLogger>>,
    on_done: Option<DoneCallback>,
}

impl<M: LinkLayerMachine> UpdateMachineLinkLayerOp<M> {
    pub fn new(machine: M, incoming: InterfaceInfos) -> Self {
        Self {
            machine,
            incoming,
            processed: ProcessedSet::new(),
            audit: None,
            on_done: None,
        }
    }

    /// Report the outcome to the audit log.
    pub fn with_audit(mut self, audit: Arc<ReconcileAuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register a callback receiving the final outcome.
    pub fn on_done(mut self, callback: DoneCallback) -> Self {
        self.on_done = Some(callback);
        self
    }

    async fn ensure_alive(&self) -> Result<()> {
        match self.machine.refresh().await {
            Ok(Life::Alive) => Ok(()),
            Ok(_) => Err(ReconcileError::NotAlive(self.machine.id().to_string())),
            Err(StoreError::NotFound(_)) => {
                Err(ReconcileError::NotFound(self.machine.id().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Operations bringing a known address in line with its observation.
    async fn address_update_ops(
        &self,
        addr: &M::Address,
        observed: &LinkLayerDeviceAddress,
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>> {
        let mut ops = Vec::new();

        if addr.provider_id().is_none()
            && let Some(pid) = &observed.provider_id
        {
            let set = addr.set_provider_id_ops(pid, removed).await;
            ops.extend(set.map_err(|e| self.op_error(address_record(addr.value()), e))?);
        }

        // Provider data is never overwritten by a machine observation
        if addr.origin() == Origin::Provider && observed.origin == Origin::Machine {
            return Ok(ops);
        }

        if observed.origin != addr.origin() {
            ops.extend(addr.set_origin_ops(observed.origin));
        }
        if observed.provider_network_id.is_some() || observed.provider_subnet_id.is_some() {
            let network_id = observed
                .provider_network_id
                .as_deref()
                .or(addr.provider_network_id());
            let subnet_id = observed
                .provider_subnet_id
                .as_deref()
                .or(addr.provider_subnet_id());
            ops.extend(addr.set_provider_net_ids_ops(network_id, subnet_id));
        }
        Ok(ops)
    }

    fn op_error(&self, record: String, err: StoreError) -> ReconcileError {
        match err {
            StoreError::Conflict(reason) => ReconcileError::Build { record, reason },
            StoreError::NotFound(_) => ReconcileError::NotFound(self.machine.id().to_string()),
            other => other.into(),
        }
    }
}

#[async_trait]
impl<M: LinkLayerMachine> ModelOperation for UpdateMachineLinkLayerOp<M> {
    fn target(&self) -> &str {
        self.machine.id()
    }

    async fn build(&mut self, attempt: usize) -> Result<Vec<Op>> {
        if attempt > 0 {
            self.ensure_alive().await?;
        }

        let incoming = normalize_incoming(&self.incoming)?;
        self.processed.clear();

        let snapshot = Snapshot::load(&self.machine)
            .await
            .map_err(|e| self.op_error(machine_record(self.machine.id()), e))?;

        // Match everything before building, so that provider IDs held by
        // records this batch removes can be handed to their successors.
        let mut matched = Vec::new();
        let mut stale_devices = Vec::new();
        for dev in &snapshot.devices {
            let Some(info) = matching_incoming(&incoming, dev.mac_address()) else {
                debug!(
                    machine = %self.machine.id(),
                    device = %dev.name(),
                    mac = %dev.mac_address(),
                    "device no longer observed, removing"
                );
                stale_devices.push(dev);
                continue;
            };
            self.processed.mark_device(dev.mac_address());

            let observed = matching_incoming_addresses(&incoming, dev.mac_address(), &info.name);
            for addr in snapshot.device_addresses(dev.name()) {
                let key = ip_key(addr.value());
                if observed.iter().any(|obs| ip_key(&obs.value) == key) {
                    self.processed.mark_address(dev.name(), addr.value());
                }
            }
            matched.push((dev, info, observed));
        }

        let stale_addresses: Vec<_> = snapshot
            .addresses
            .iter()
            .filter(|addr| {
                !self
                    .processed
                    .is_address_processed(addr.device_name(), addr.value())
            })
            .collect();
        let removed: HashSet<String> = stale_devices
            .iter()
            .map(|dev| dev.id().to_string())
            .chain(stale_addresses.iter().map(|addr| addr.id().to_string()))
            .collect();

        let mut ops = vec![self.machine.assert_alive_op()];

        for (dev, info, observed) in &matched {
            ops.extend(dev.update_ops(&LinkLayerDeviceArgs::from(*info)));
            if dev.provider_id().is_none()
                && let Some(pid) = &info.provider_id
            {
                let set = dev.set_provider_id_ops(pid, &removed).await;
                ops.extend(set.map_err(|e| self.op_error(device_record(dev.name()), e))?);
            }

            for addr in snapshot.device_addresses(dev.name()) {
                let key = ip_key(addr.value());
                let Some(obs) = observed.iter().find(|obs| ip_key(&obs.value) == key) else {
                    continue;
                };
                ops.extend(self.address_update_ops(addr, obs, &removed).await?);
            }

            let mut created = HashSet::new();
            for obs in observed {
                if self.processed.is_address_processed(dev.name(), &obs.value)
                    || !created.insert(ip_key(&obs.value))
                {
                    continue;
                }
                debug!(
                    machine = %self.machine.id(),
                    device = %info.name,
                    address = %obs.value,
                    "new address on known device"
                );
                let add = dev.add_address_ops(obs, &removed).await;
                ops.extend(add.map_err(|e| self.op_error(address_record(&obs.value), e))?);
            }
        }

        for info in &incoming {
            if self.processed.is_device_processed(info) {
                continue;
            }
            self.processed.mark_device(&info.mac_address);

            let mut created = HashSet::new();
            let addrs: Vec<_> = matching_incoming_addresses(&incoming, &info.mac_address, &info.name)
                .into_iter()
                .filter(|addr| created.insert(ip_key(&addr.value)))
                .collect();
            debug!(
                machine = %self.machine.id(),
                device = %info.name,
                mac = %info.mac_address,
                addresses = addrs.len(),
                "new device observed"
            );
            let add = self
                .machine
                .add_device_ops(&LinkLayerDeviceArgs::from(info), &addrs, &removed)
                .await;
            ops.extend(add.map_err(|e| self.op_error(device_record(&info.name), e))?);
        }

        for addr in stale_addresses {
            debug!(
                machine = %self.machine.id(),
                device = %addr.device_name(),
                address = %addr.value(),
                "address no longer observed, removing"
            );
            ops.extend(addr.remove_ops());
        }
        for dev in stale_devices {
            ops.extend(dev.remove_ops());
        }

        Ok(ops)
    }

    fn done(&mut self, result: Result<ApplyOutcome>) -> Result<ApplyOutcome> {
        if let Some(audit) = &self.audit {
            match &result {
                Ok(outcome) if outcome.applied => {
                    audit.link_layer_updated(self.machine.id(), outcome.ops, outcome.attempts)
                }
                Ok(_) => audit.link_layer_unchanged(self.machine.id()),
                Err(e) => audit.link_layer_update_failed(self.machine.id(), e),
            }
        }
        if let Some(callback) = self.on_done.take() {
            callback(&result);
        }
        result
    }
}

fn machine_record(id: &str) -> String {
    format!("machine \"{}\"", id)
}

fn device_record(name: &str) -> String {
    format!("device \"{}\"", name)
}

fn address_record(value: &str) -> String {
    format!("address \"{}\"", value)
}
