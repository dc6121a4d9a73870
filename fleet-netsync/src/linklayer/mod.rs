//! Machine link-layer reconciliation.
//!
//! An agent reports the interfaces it observed on a machine. The reconciler
//! compares them with the persisted devices and addresses of that machine and
//! builds one batch of operations that brings the store in line, preserving
//! identifiers assigned by the infrastructure provider.
//!
//! - `snapshot` reads the persisted records once per attempt
//! - `matcher` pairs persisted devices with observed interfaces
//! - `processed` tracks what a pass has matched
//! - `update` builds the batch
//! - `apply` submits it, retrying from a fresh snapshot on conflicts

mod apply;
mod matcher;
mod processed;
mod snapshot;
mod update;

pub use apply::{ApplyOutcome, ModelOperation, apply_operation};
pub use matcher::{matching_incoming, matching_incoming_addresses, normalize_incoming};
pub use processed::ProcessedSet;
pub use snapshot::Snapshot;
pub use update::{DoneCallback, UpdateMachineLinkLayerOp};
