use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{ReconcileError, Result};
use crate::network::{
    InterfaceAddress, InterfaceInfo, InterfaceInfos, LinkLayerDeviceAddress,
    address_args_for_hardware_address, normalize_ip, normalize_mac,
};

/// The first incoming interface with the given hardware address.
pub fn matching_incoming<'a>(incoming: &'a InterfaceInfos, mac: &str) -> Option<&'a InterfaceInfo> {
    incoming.get_by_hardware_address(mac).into_iter().next()
}

/// Address observations of every incoming interface with the given hardware
/// address, attributed to `device_name`.
pub fn matching_incoming_addresses(
    incoming: &InterfaceInfos,
    mac: &str,
    device_name: &str,
) -> Vec<LinkLayerDeviceAddress> {
    address_args_for_hardware_address(incoming, mac, device_name)
}

/// Validate an observation and bring it into canonical form.
///
/// Hardware addresses and address values are normalized and empty provider
/// IDs dropped. Contradictory observations are rejected with
/// `ReconcileError::Build`.
pub fn normalize_incoming(incoming: &InterfaceInfos) -> Result<InterfaceInfos> {
    let mut infos = Vec::with_capacity(incoming.len());
    for info in incoming {
        infos.push(normalize_info(info)?);
    }

    let parents = check_consistency(&infos)?;
    for (info, parent) in infos.iter_mut().zip(parents) {
        info.parent_name = parent;
    }
    Ok(InterfaceInfos::new(infos))
}

/// Reject observations that contradict themselves and return the resolved
/// parent of every interface.
fn check_consistency(infos: &[InterfaceInfo]) -> Result<Vec<Option<String>>> {
    let mut macs_by_name: HashMap<&str, &str> = HashMap::new();
    let mut names_by_mac: HashMap<&str, &str> = HashMap::new();
    let mut macs_by_provider_id: HashMap<&str, &str> = HashMap::new();
    for info in infos {
        if let Some(mac) = macs_by_name.insert(&info.name, &info.mac_address)
            && mac != info.mac_address
        {
            return Err(ReconcileError::build(
                interface_record(&info.name),
                format!(
                    "reported with hardware addresses {} and {}",
                    mac, info.mac_address
                ),
            ));
        }
        match names_by_mac.get(info.mac_address.as_str()) {
            Some(first) if *first != info.name => warn!(
                mac = %info.mac_address,
                first = %first,
                duplicate = %info.name,
                "multiple interfaces share a hardware address; using the first"
            ),
            Some(_) => {}
            None => {
                names_by_mac.insert(&info.mac_address, &info.name);
            }
        }
        if let Some(pid) = &info.provider_id
            && let Some(mac) = macs_by_provider_id.insert(pid, &info.mac_address)
            && mac != info.mac_address
        {
            return Err(ReconcileError::build(
                interface_record(&info.name),
                format!(
                    "provider ID \"{}\" reported for hardware addresses {} and {}",
                    pid, mac, info.mac_address
                ),
            ));
        }
    }

    let mut parents = Vec::with_capacity(infos.len());
    let mut macs_by_value: HashMap<&str, &str> = HashMap::new();
    let mut values_by_provider_id: HashMap<&str, &str> = HashMap::new();
    for info in infos {
        parents.push(resolve_parent(info, &macs_by_name, &names_by_mac)?);
        for addr in &info.addresses {
            if let Some(mac) = macs_by_value.insert(&addr.value, &info.mac_address)
                && mac != info.mac_address
            {
                return Err(ReconcileError::build(
                    address_record(&addr.value),
                    format!(
                        "observed on hardware addresses {} and {}",
                        mac, info.mac_address
                    ),
                ));
            }
            if let Some(pid) = &addr.provider_id
                && let Some(value) = values_by_provider_id.insert(pid, &addr.value)
                && value != addr.value
            {
                return Err(ReconcileError::build(
                    address_record(&addr.value),
                    format!("provider ID \"{}\" also reported for {}", pid, value),
                ));
            }
        }
    }

    Ok(parents)
}

/// The parent an interface ends up with once duplicate hardware addresses
/// are collapsed into their first interface.
///
/// A parent sharing the child's hardware address is the child's own device
/// and is dropped; a parent that is a later duplicate is renamed to the
/// interface it collapses into.
fn resolve_parent(
    info: &InterfaceInfo,
    macs_by_name: &HashMap<&str, &str>,
    names_by_mac: &HashMap<&str, &str>,
) -> Result<Option<String>> {
    let Some(parent) = &info.parent_name else {
        return Ok(None);
    };
    if *parent == info.name {
        return Err(ReconcileError::build(
            interface_record(&info.name),
            "interface is its own parent",
        ));
    }
    let Some(parent_mac) = macs_by_name.get(parent.as_str()) else {
        return Err(ReconcileError::build(
            interface_record(&info.name),
            format!("parent interface \"{}\" was not observed", parent),
        ));
    };

    if *parent_mac == info.mac_address {
        warn!(
            interface = %info.name,
            parent = %parent,
            mac = %info.mac_address,
            "parent shares the interface's hardware address; dropping it"
        );
        return Ok(None);
    }
    match names_by_mac.get(parent_mac) {
        Some(first) if *first != parent.as_str() => {
            debug!(
                interface = %info.name,
                parent = %parent,
                device = %first,
                "parent collapses into an earlier interface"
            );
            Ok(Some(first.to_string()))
        }
        _ => Ok(Some(parent.clone())),
    }
}

fn normalize_info(info: &InterfaceInfo) -> Result<InterfaceInfo> {
    let name = info.name.trim();
    if name.is_empty() {
        return Err(ReconcileError::build(
            format!("interface with hardware address {}", info.mac_address),
            "empty interface name",
        ));
    }
    let Some(mac_address) = normalize_mac(&info.mac_address) else {
        return Err(ReconcileError::build(
            interface_record(name),
            format!("invalid hardware address \"{}\"", info.mac_address),
        ));
    };

    let mut addresses = Vec::with_capacity(info.addresses.len());
    for addr in &info.addresses {
        let Some(value) = normalize_ip(&addr.value) else {
            return Err(ReconcileError::build(
                interface_record(name),
                format!("invalid address \"{}\"", addr.value),
            ));
        };
        addresses.push(InterfaceAddress {
            value,
            origin: addr.origin,
            provider_id: non_empty(&addr.provider_id),
            provider_network_id: non_empty(&addr.provider_network_id),
            provider_subnet_id: non_empty(&addr.provider_subnet_id),
        });
    }

    Ok(InterfaceInfo {
        mac_address,
        name: name.to_string(),
        parent_name: non_empty(&info.parent_name),
        provider_id: non_empty(&info.provider_id),
        addresses,
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn interface_record(name: &str) -> String {
    format!("interface \"{}\"", name)
}

fn address_record(value: &str) -> String {
    format!("address \"{}\"", value)
}
