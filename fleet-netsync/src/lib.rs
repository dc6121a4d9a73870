pub mod audit;
pub mod command;
pub mod config;
pub mod error;
pub mod linklayer;
pub mod network;
pub mod state;
pub mod store;

pub use audit::{ReconcileAuditLogger, create_audit_logger};
pub use command::{Op, Transaction};
pub use config::ReconcileConfig;
pub use error::ReconcileError;
pub use linklayer::{ApplyOutcome, ModelOperation, UpdateMachineLinkLayerOp, apply_operation};
pub use network::{InterfaceAddress, InterfaceInfo, InterfaceInfos, Origin};
pub use state::LinkLayerState;
pub use store::{Event, MemoryStore, StoreError, TransactionRunner};
