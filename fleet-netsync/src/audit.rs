use std::sync::Arc;

use tracing::info;

use crate::error::ReconcileError;
use crate::store::Event;

/// Reconciliation audit logger
///
/// Audit records are `tracing` events with target `audit`, so they can be
/// routed separately from diagnostic output.
pub struct ReconcileAuditLogger {
    enabled: bool,
}

impl ReconcileAuditLogger {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    fn log(&self, message: String, object_ids: Vec<String>) {
        if !self.enabled {
            return;
        }
        info!(target: "audit", objects = ?object_ids, "{}", message);
    }

    // Reconciliation outcomes
    pub fn link_layer_updated(&self, machine_id: &str, ops: usize, attempts: usize) {
        self.log(
            format!(
                "Link-layer devices updated for machine {}: {} operations after {} attempt(s)",
                machine_id, ops, attempts
            ),
            vec![format!("machine-{}", machine_id)],
        );
    }

    pub fn link_layer_unchanged(&self, machine_id: &str) {
        self.log(
            format!("Link-layer devices unchanged for machine {}", machine_id),
            vec![format!("machine-{}", machine_id)],
        );
    }

    pub fn link_layer_update_failed(&self, machine_id: &str, err: &ReconcileError) {
        self.log(
            format!(
                "Link-layer update failed for machine {}: {}",
                machine_id, err
            ),
            vec![format!("machine-{}", machine_id)],
        );
    }

    // Store events
    pub fn record_event(&self, event: &Event) {
        let action = match event {
            Event::DeviceAdded(_) | Event::AddressAdded(_) => "created",
            Event::DeviceUpdated { .. } | Event::AddressUpdated { .. } => "updated",
            Event::DeviceRemoved { .. } | Event::AddressRemoved { .. } => "removed",
        };
        self.log(
            format!(
                "{} {} on machine {}: {}",
                capitalize(event.resource_type()),
                action,
                event.machine_id(),
                event.resource_id()
            ),
            vec![
                format!("machine-{}", event.machine_id()),
                event.resource_id().to_string(),
            ],
        );
    }
}

impl Default for ReconcileAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn create_audit_logger() -> Arc<ReconcileAuditLogger> {
    Arc::new(ReconcileAuditLogger::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_logger_doesnt_panic() {
        let logger = ReconcileAuditLogger::new_noop();

        logger.link_layer_updated("0", 3, 1);
        logger.link_layer_unchanged("0");
        logger.link_layer_update_failed("0", &ReconcileError::NotFound("0".into()));
        logger.record_event(&Event::DeviceRemoved {
            id: "dev-1".into(),
            machine_id: "0".into(),
        });
    }

    #[test]
    fn test_logger_without_subscriber() {
        let logger = create_audit_logger();
        logger.link_layer_unchanged("0");
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("device"), "Device");
        assert_eq!(capitalize(""), "");
    }
}
