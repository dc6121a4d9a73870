use tracing::debug;

use crate::store::{LinkLayerAccessor, LinkLayerAddress, LinkLayerDevice, Result};

/// Point-in-time view of a machine's persisted link-layer records.
pub struct Snapshot<D, A> {
    pub devices: Vec<D>,
    pub addresses: Vec<A>,
}

impl<D: LinkLayerDevice, A: LinkLayerAddress> Snapshot<D, A> {
    /// Read all devices and addresses of the machine.
    pub async fn load<M>(machine: &M) -> Result<Self>
    where
        M: LinkLayerAccessor<Device = D, Address = A>,
    {
        let devices = machine.all_link_layer_devices().await?;
        let addresses = machine.all_addresses().await?;
        debug!(
            devices = devices.len(),
            addresses = addresses.len(),
            "loaded link-layer snapshot"
        );
        Ok(Self { devices, addresses })
    }

    /// Known addresses assigned to the named device.
    pub fn device_addresses(&self, device_name: &str) -> Vec<&A> {
        self.addresses
            .iter()
            .filter(|addr| addr.device_name() == device_name)
            .collect()
    }
}
