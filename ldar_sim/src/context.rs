//! Per-replicate context: identity, seed streams and the audit log.

use crate::seeds::{leak_seed, program_seed};
use ldar_core::AuditLog;
use ldar_env::RunId;

/// Everything one replicate owns besides its programs.
///
/// Nothing here is shared between replicates; a replicate's randomness is a
/// pure function of its seed.
#[derive(Debug, Clone)]
pub struct ReplicateContext {
    /// Replicate index within the batch
    index: u32,

    /// Replicate seed
    seed: u64,

    /// Identifier derived from the seed
    run_id: RunId,

    /// Recovered anomalies
    audit: AuditLog,
}

impl ReplicateContext {
    pub fn new(index: u32, seed: u64) -> Self {
        Self {
            index,
            seed,
            run_id: RunId::from_seed(seed),
            audit: AuditLog::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Seed of the shared leak timeline.
    pub fn leak_seed(&self) -> u64 {
        leak_seed(self.seed)
    }

    /// Seed of one program's scheduling, detection, follow-up and repair streams.
    pub fn program_seed(&self, program: &str) -> u64 {
        program_seed(self.seed, program)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut AuditLog {
        &mut self.audit
    }

    /// Consumes the context, keeping the audit log.
    pub fn into_audit(self) -> AuditLog {
        self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_streams_are_deterministic() {
        let a = ReplicateContext::new(0, 99);
        let b = ReplicateContext::new(0, 99);
        assert_eq!(a.leak_seed(), b.leak_seed());
        assert_eq!(a.program_seed("P_OGI"), b.program_seed("P_OGI"));
        assert_eq!(a.run_id(), b.run_id());
    }

    #[test]
    fn test_context_starts_with_empty_audit() {
        let ctx = ReplicateContext::new(3, 1);
        assert_eq!(ctx.index(), 3);
        assert!(ctx.audit().is_empty());
    }
}
