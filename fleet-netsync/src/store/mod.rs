//! Link-layer storage layer.
//!
//! The capability traits in `traits` are what the reconciler is written
//! against; `MemoryStore` is the in-process implementation backed by
//! `LinkLayerState`.

mod error;
mod event;
mod memory;
mod traits;

pub use error::{Result, StoreError};
pub use event::Event;
pub use memory::{AddressRecord, DeviceRecord, MachineHandle, MemoryStore};
pub use traits::{
    LinkLayerAccessor, LinkLayerAddress, LinkLayerDevice, LinkLayerMachine, TransactionRunner,
};
