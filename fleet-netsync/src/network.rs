//! Observed network topology as reported by machine agents.
//!
//! These types describe what an agent saw on a host. They are never persisted
//! directly; the reconciler turns them into store operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

// =============================================================================
// Origin
// =============================================================================

/// Authority that last asserted the truth of an address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The infrastructure provider (cloud/network substrate).
    Provider,
    /// The machine's own observation.
    #[default]
    Machine,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Provider => write!(f, "provider"),
            Origin::Machine => write!(f, "machine"),
        }
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Normalize a hardware address to lower-case, colon-separated octets.
///
/// Accepts `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF` and `aabb.ccdd.eeff`
/// forms, as well as 8-octet (EUI-64) addresses. Returns `None` for anything
/// else.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let digits: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();

    if !(digits.len() == 12 || digits.len() == 16) || !digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }

    let lower = digits.to_ascii_lowercase();
    let octets: Vec<&str> = (0..lower.len())
        .step_by(2)
        .map(|i| &lower[i..i + 2])
        .collect();
    Some(octets.join(":"))
}

/// Key used to compare hardware addresses: the normalized form when the
/// address is well-formed, the lower-cased raw text otherwise.
pub fn mac_key(raw: &str) -> String {
    normalize_mac(raw).unwrap_or_else(|| raw.trim().to_ascii_lowercase())
}

/// Normalize a textual IP address to its canonical display form.
pub fn normalize_ip(raw: &str) -> Option<String> {
    raw.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Key used to compare address values.
pub fn ip_key(raw: &str) -> String {
    normalize_ip(raw).unwrap_or_else(|| raw.trim().to_string())
}

// =============================================================================
// Incoming Interfaces
// =============================================================================

/// A single network interface observed on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub mac_address: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub addresses: Vec<InterfaceAddress>,
}

/// An IP address observed on an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub value: String,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_subnet_id: Option<String>,
}

impl InterfaceAddress {
    /// A machine-origin address with no provider data.
    pub fn machine(value: &str) -> Self {
        Self {
            value: value.to_string(),
            origin: Origin::Machine,
            provider_id: None,
            provider_network_id: None,
            provider_subnet_id: None,
        }
    }
}

/// The full set of interfaces reported for one machine, in observation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceInfos(Vec<InterfaceInfo>);

impl InterfaceInfos {
    pub fn new(infos: Vec<InterfaceInfo>) -> Self {
        Self(infos)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InterfaceInfo> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All interfaces with the given hardware address, in observation order.
    pub fn get_by_hardware_address(&self, mac: &str) -> Vec<&InterfaceInfo> {
        let key = mac_key(mac);
        self.0
            .iter()
            .filter(|info| mac_key(&info.mac_address) == key)
            .collect()
    }
}

impl From<Vec<InterfaceInfo>> for InterfaceInfos {
    fn from(infos: Vec<InterfaceInfo>) -> Self {
        Self(infos)
    }
}

impl<'a> IntoIterator for &'a InterfaceInfos {
    type Item = &'a InterfaceInfo;
    type IntoIter = std::slice::Iter<'a, InterfaceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// =============================================================================
// State Arguments
// =============================================================================

/// Device attributes used to create or update a persisted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLayerDeviceArgs {
    pub name: String,
    pub mac_address: String,
    pub parent_name: Option<String>,
    /// Carried for creation. Updates never write it; provider IDs are set
    /// through dedicated operations only.
    pub provider_id: Option<String>,
}

impl From<&InterfaceInfo> for LinkLayerDeviceArgs {
    fn from(info: &InterfaceInfo) -> Self {
        Self {
            name: info.name.clone(),
            mac_address: info.mac_address.clone(),
            parent_name: info.parent_name.clone(),
            provider_id: info.provider_id.clone(),
        }
    }
}

/// Address attributes used to create or compare a persisted address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLayerDeviceAddress {
    pub device_name: String,
    pub value: String,
    pub origin: Origin,
    pub provider_id: Option<String>,
    pub provider_network_id: Option<String>,
    pub provider_subnet_id: Option<String>,
}

impl LinkLayerDeviceAddress {
    pub fn from_observation(device_name: &str, addr: &InterfaceAddress) -> Self {
        Self {
            device_name: device_name.to_string(),
            value: addr.value.clone(),
            origin: addr.origin,
            provider_id: addr.provider_id.clone(),
            provider_network_id: addr.provider_network_id.clone(),
            provider_subnet_id: addr.provider_subnet_id.clone(),
        }
    }
}

/// Address observations of every interface sharing `mac`, attributed to
/// `device_name`.
pub fn address_args_for_hardware_address(
    infos: &InterfaceInfos,
    mac: &str,
    device_name: &str,
) -> Vec<LinkLayerDeviceAddress> {
    infos
        .get_by_hardware_address(mac)
        .into_iter()
        .flat_map(|info| info.addresses.iter())
        .map(|addr| LinkLayerDeviceAddress::from_observation(device_name, addr))
        .collect()
}
