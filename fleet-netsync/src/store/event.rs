//! Events emitted by state machine changes.

use crate::command::{AddressData, DeviceData};

/// Events emitted when link-layer state changes.
///
/// These events are dispatched via broadcast channels to subscribers.
/// They are only emitted after a whole transaction was applied.
#[derive(Debug, Clone)]
pub enum Event {
    // Device events
    /// A new device was added.
    DeviceAdded(DeviceData),
    /// A device was updated (attributes, provider ID).
    DeviceUpdated {
        id: String,
        old: DeviceData,
        new: DeviceData,
    },
    /// A device was removed.
    DeviceRemoved { id: String, machine_id: String },

    // Address events
    /// A new address was added.
    AddressAdded(AddressData),
    /// An address was updated (origin, provider data, owning device name).
    AddressUpdated {
        id: String,
        old: AddressData,
        new: AddressData,
    },
    /// An address was removed.
    AddressRemoved { id: String, machine_id: String },
}

impl Event {
    /// Get the resource type for this event.
    pub fn resource_type(&self) -> &'static str {
        match self {
            Event::DeviceAdded(_) | Event::DeviceUpdated { .. } | Event::DeviceRemoved { .. } => {
                "device"
            }
            Event::AddressAdded(_)
            | Event::AddressUpdated { .. }
            | Event::AddressRemoved { .. } => "address",
        }
    }

    /// Get the resource ID for this event.
    pub fn resource_id(&self) -> &str {
        match self {
            Event::DeviceAdded(d) => &d.id,
            Event::DeviceUpdated { id, .. } => id,
            Event::DeviceRemoved { id, .. } => id,
            Event::AddressAdded(a) => &a.id,
            Event::AddressUpdated { id, .. } => id,
            Event::AddressRemoved { id, .. } => id,
        }
    }

    /// Get the machine the changed resource belongs to.
    pub fn machine_id(&self) -> &str {
        match self {
            Event::DeviceAdded(d) => &d.machine_id,
            Event::DeviceUpdated { new, .. } => &new.machine_id,
            Event::DeviceRemoved { machine_id, .. } => machine_id,
            Event::AddressAdded(a) => &a.machine_id,
            Event::AddressUpdated { new, .. } => &new.machine_id,
            Event::AddressRemoved { machine_id, .. } => machine_id,
        }
    }
}
