//! Link-layer capability traits.
//!
//! These traits abstract away the persistence backend. The reconciler only
//! reads records through them and asks them for the operations that would
//! change them; it never mutates a record directly.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::command::{Life, Op, Transaction};
use crate::network::{LinkLayerDeviceAddress, LinkLayerDeviceArgs, Origin};

use super::error::Result;

// =============================================================================
// Record Capabilities
// =============================================================================

/// A single persisted layer-2 network device.
#[async_trait]
pub trait LinkLayerDevice: Send + Sync {
    /// Unique identifier for the device.
    fn id(&self) -> &str;

    /// Hardware address of the device.
    fn mac_address(&self) -> &str;

    /// Name of the device, unique per machine.
    fn name(&self) -> &str;

    /// Provider-specific identifier, if one was assigned.
    fn provider_id(&self) -> Option<&str>;

    /// Name of this device's parent, if it has one.
    fn parent_name(&self) -> Option<&str>;

    /// Operations required to set the input provider ID.
    ///
    /// `removed` holds the IDs of records removed by the same batch; an ID
    /// they hold is released first. Fails with `StoreError::Conflict` if any
    /// other device holds the ID.
    async fn set_provider_id_ops(
        &self,
        provider_id: &str,
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>>;

    /// Operations required to remove this device and, if required, its
    /// provider ID.
    fn remove_ops(&self) -> Vec<Op>;

    /// Operations required to update the device so that it reflects the
    /// incoming arguments. The provider ID in `args` is ignored.
    fn update_ops(&self, args: &LinkLayerDeviceArgs) -> Vec<Op>;

    /// Operations required to add a new address to this device.
    async fn add_address_ops(
        &self,
        addr: &LinkLayerDeviceAddress,
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>>;
}

/// A single persisted layer-3 address assigned to a layer-2 device.
#[async_trait]
pub trait LinkLayerAddress: Send + Sync {
    /// Unique identifier for the address record.
    fn id(&self) -> &str;

    /// Name of the device to which this address is assigned.
    fn device_name(&self) -> &str;

    /// The IP address itself.
    fn value(&self) -> &str;

    /// The authority maintaining this address.
    fn origin(&self) -> Origin;

    /// Provider-specific identifier of the address.
    fn provider_id(&self) -> Option<&str>;

    /// Provider-specific identifier of the address's network.
    fn provider_network_id(&self) -> Option<&str>;

    /// Provider-specific identifier of the address's subnet.
    fn provider_subnet_id(&self) -> Option<&str>;

    /// Operations required to set the input provider ID.
    ///
    /// Fails with `StoreError::Conflict` if an address outside `removed`
    /// holds the ID.
    async fn set_provider_id_ops(
        &self,
        provider_id: &str,
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>>;

    /// Operations required to change the origin.
    fn set_origin_ops(&self, origin: Origin) -> Vec<Op>;

    /// Operations required to ensure the input provider network and subnet
    /// IDs are set against the address.
    fn set_provider_net_ids_ops(&self, network_id: Option<&str>, subnet_id: Option<&str>)
    -> Vec<Op>;

    /// Operations required to remove this address and, if required, its
    /// provider ID.
    fn remove_ops(&self) -> Vec<Op>;
}

// =============================================================================
// Machine Capabilities
// =============================================================================

/// An entity that can return the link-layer data related to it.
#[async_trait]
pub trait LinkLayerAccessor: Send + Sync {
    type Device: LinkLayerDevice;
    type Address: LinkLayerAddress;

    /// All currently known layer-2 devices of the machine.
    async fn all_link_layer_devices(&self) -> Result<Vec<Self::Device>>;

    /// All IP addresses assigned to the machine's devices.
    async fn all_addresses(&self) -> Result<Vec<Self::Address>>;
}

/// A machine whose link-layer data can be read and updated.
#[async_trait]
pub trait LinkLayerMachine: LinkLayerAccessor {
    /// ID of the machine.
    fn id(&self) -> &str;

    /// Operation asserting that the machine is currently alive.
    fn assert_alive_op(&self) -> Op;

    /// Re-read the machine's life.
    ///
    /// Fails with `StoreError::NotFound` if the machine no longer exists.
    async fn refresh(&self) -> Result<Life>;

    /// Operations required to add a new device together with its addresses.
    ///
    /// Provider IDs held by records in `removed` are taken over.
    async fn add_device_ops(
        &self,
        args: &LinkLayerDeviceArgs,
        addrs: &[LinkLayerDeviceAddress],
        removed: &HashSet<String>,
    ) -> Result<Vec<Op>>;
}

// =============================================================================
// Transactions
// =============================================================================

/// Applies operation batches atomically.
#[async_trait]
pub trait TransactionRunner: Send + Sync {
    /// Apply every operation of the transaction, or none of them.
    ///
    /// Precondition failures are reported as retryable errors
    /// (`StoreError::is_retryable`).
    async fn run_transaction(&self, txn: Transaction) -> Result<()>;
}
