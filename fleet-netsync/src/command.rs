use serde::{Deserialize, Serialize};

use crate::network::Origin;

/// Operations that make up a link-layer transaction.
///
/// IMPORTANT: Record IDs and timestamps are set when the operation is built,
/// never by the store at apply time. A transaction that is re-submitted must
/// produce exactly the same records.
///
/// Operations on existing records carry the `revision` observed in the
/// snapshot they were built from. The store rejects the whole transaction if
/// any record moved on since then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    // Machine assertions
    AssertMachineAlive {
        machine_id: String,
    },

    // Device operations
    AddDevice {
        device: DeviceData,
    },
    UpdateDevice {
        id: String,
        revision: u64,
        timestamp: String,
        changes: DeviceChanges,
    },
    SetDeviceProviderId {
        id: String,
        revision: u64,
        timestamp: String,
        provider_id: String,
    },
    RemoveDevice {
        id: String,
        revision: u64,
    },

    // Address operations
    AddAddress {
        address: AddressData,
    },
    SetAddressOrigin {
        id: String,
        revision: u64,
        timestamp: String,
        origin: Origin,
    },
    SetAddressProviderId {
        id: String,
        revision: u64,
        timestamp: String,
        provider_id: String,
    },
    SetAddressProviderNetIds {
        id: String,
        revision: u64,
        timestamp: String,
        network_id: Option<String>,
        subnet_id: Option<String>,
    },
    RemoveAddress {
        id: String,
        revision: u64,
    },

    // Provider ID registry
    InsertProviderId {
        kind: ProviderIdKind,
        provider_id: String,
        owner_id: String,
    },
    RemoveProviderId {
        kind: ProviderIdKind,
        provider_id: String,
        owner_id: String,
    },
}

impl Op {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Op::AssertMachineAlive { .. } => "assert-machine-alive",
            Op::AddDevice { .. } => "add-device",
            Op::UpdateDevice { .. } => "update-device",
            Op::SetDeviceProviderId { .. } => "set-device-provider-id",
            Op::RemoveDevice { .. } => "remove-device",
            Op::AddAddress { .. } => "add-address",
            Op::SetAddressOrigin { .. } => "set-address-origin",
            Op::SetAddressProviderId { .. } => "set-address-provider-id",
            Op::SetAddressProviderNetIds { .. } => "set-address-provider-net-ids",
            Op::RemoveAddress { .. } => "remove-address",
            Op::InsertProviderId { .. } => "insert-provider-id",
            Op::RemoveProviderId { .. } => "remove-provider-id",
        }
    }

    /// Whether this operation only asserts a precondition.
    pub fn is_assertion(&self) -> bool {
        matches!(self, Op::AssertMachineAlive { .. })
    }

    /// Whether applying this operation changes nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            Op::UpdateDevice { changes, .. } => changes.is_empty(),
            _ => false,
        }
    }

    /// Whether this operation has an observable effect on the store.
    pub fn is_effective(&self) -> bool {
        !self.is_assertion() && !self.is_noop()
    }
}

/// A batch of operations applied all-or-nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique ID used by the store to de-duplicate re-submissions.
    pub id: String,
    pub ops: Vec<Op>,
}

impl Transaction {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ops,
        }
    }
}

// =============================================================================
// Machine Types
// =============================================================================

/// Machine data stored in the state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineData {
    pub id: String,
    #[serde(default)]
    pub life: Life,
}

/// Machine life cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

// =============================================================================
// Link-Layer Types
// =============================================================================

/// Layer-2 device data stored in the state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceData {
    pub id: String,
    pub machine_id: String,
    pub name: String,
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub revision: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Attribute changes carried by an `UpdateDevice` operation.
///
/// Only locally observed attributes appear here. Provider IDs are set through
/// `SetDeviceProviderId`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_parent: bool,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.parent_name.is_none() && !self.clear_parent
    }
}

/// Layer-3 address data stored in the state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressData {
    pub id: String,
    pub machine_id: String,
    pub device_name: String,
    pub value: String,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_subnet_id: Option<String>,
    #[serde(default)]
    pub revision: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Kinds of records that can hold a provider ID.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderIdKind {
    Device,
    Address,
}

impl ProviderIdKind {
    /// Registry key for a provider ID of this kind.
    pub fn key(&self, provider_id: &str) -> String {
        match self {
            ProviderIdKind::Device => format!("device:{}", provider_id),
            ProviderIdKind::Address => format!("address:{}", provider_id),
        }
    }
}
