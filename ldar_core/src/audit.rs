//! Per-replicate audit log of recovered anomalies.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Category of a recovered anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A drawn value was re-sampled or clamped into a physical range
    SamplingRecovered,

    /// A site visit could not fit any crew's day and was deferred
    VisitDeferred,

    /// A follow-up request could not be served today and was deferred
    FollowUpDeferred,

    /// A detection was dropped by the follow-up rules
    FollowUpDropped,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Simulation day index
    pub day: u32,

    /// Anomaly category
    pub kind: AuditKind,

    /// Context (program, method, site)
    pub message: String,
}

/// Append-only log owned by one replicate.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an anomaly and traces it.
    ///
    /// Sampling recoveries are warnings; deferrals and drops are routine
    /// outcomes of capacity limits and only show at debug level.
    pub fn record(&mut self, day: u32, kind: AuditKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            AuditKind::SamplingRecovered => warn!(day, ?kind, "{}", message),
            _ => debug!(day, ?kind, "{}", message),
        }
        self.entries.push(AuditEntry { day, kind, message });
    }

    /// Returns all entries in insertion order.
    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Counts entries of one kind.
    pub fn count(&self, kind: AuditKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// Moves every entry of `other` into this log.
    pub fn absorb(&mut self, other: AuditLog) {
        self.entries.extend(other.entries);
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_counts_by_kind() {
        let mut log = AuditLog::new();
        log.record(0, AuditKind::VisitDeferred, "site 3");
        log.record(1, AuditKind::VisitDeferred, "site 4");
        log.record(1, AuditKind::SamplingRecovered, "clamped");

        assert_eq!(log.len(), 3);
        assert_eq!(log.count(AuditKind::VisitDeferred), 2);
        assert_eq!(log.count(AuditKind::FollowUpDropped), 0);
    }
}
