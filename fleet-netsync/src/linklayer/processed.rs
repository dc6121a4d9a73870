use std::collections::HashSet;

use crate::network::{InterfaceInfo, ip_key, mac_key};

/// Records which hardware addresses and known addresses a pass has matched.
///
/// Addresses are tracked per persisted device name, so a value stored on two
/// devices is matched separately on each.
///
/// Cleared at the start of every attempt; nothing carries over between
/// passes.
#[derive(Debug, Default)]
pub struct ProcessedSet {
    devices: HashSet<String>,
    addresses: HashSet<(String, String)>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.addresses.clear();
    }

    /// Mark the device with this hardware address as handled.
    pub fn mark_device(&mut self, mac: &str) {
        self.devices.insert(mac_key(mac));
    }

    /// Whether an incoming interface's hardware address was handled.
    pub fn is_device_processed(&self, info: &InterfaceInfo) -> bool {
        self.devices.contains(&mac_key(&info.mac_address))
    }

    /// Mark the address `value` on the persisted device `device` as matched.
    pub fn mark_address(&mut self, device: &str, value: &str) {
        self.addresses.insert((device.to_string(), ip_key(value)));
    }

    pub fn is_address_processed(&self, device: &str, value: &str) -> bool {
        self.addresses.contains(&(device.to_string(), ip_key(value)))
    }
}
