//! LDAR Simulator Core - Leak Detection and Repair Program Engine
//!
//! This library models a population of oil and gas sites that develop
//! methane leaks, and the programs of survey methods, follow-ups and repairs
//! an operator runs against them:
//! 1. **Virtual World**: leaks spawn per site-day and emit until repaired
//! 2. **Methods**: crews visit sites under calendar, weather and workday limits
//! 3. **Follow-up**: screening flags are filtered, queued and re-surveyed
//! 4. **Economics**: survey, repair and carbon costs in an exact-decimal ledger
//!
//! A [`ProgramRunner`] advances one program through one replicate, one
//! [`SimDay`] at a time. Programs in the same replicate each own a clone of
//! the same [`VirtualWorld`] and never share mutable state.

pub mod audit;
pub mod clock;
pub mod config;
pub mod detection;
pub mod distributions;
pub mod economics;
pub mod error;
pub mod events;
pub mod followup;
pub mod program;
pub mod scheduler;
pub mod world;

// Re-export key types for convenience
pub use audit::{AuditEntry, AuditKind, AuditLog};
pub use clock::{Clock, SimDay};
pub use config::{MethodConfig, ProgramConfig, SimulationConfig, VirtualWorldConfig};
pub use detection::{DetectionModel, Observation};
pub use economics::{EconomicsLedger, RepairEconomics};
pub use error::{ConfigError, SimError};
pub use events::{RepairEvent, SurveyEvent};
pub use followup::{Flag, FollowUpEngine, FollowUpRequest};
pub use program::{DailyRecord, MethodStats, ProgramOutcome, ProgramRunner};
pub use scheduler::{MethodScheduler, Visit};
pub use world::{Leak, LeakGenerator, LeakId, LeakState, LeakSupply, LeakTimeline, Site, VirtualWorld};

/// Derives an independent seed for `stream` from `seed`.
///
/// Distinct streams of the same seed never collide for small stream
/// indices, and changing one stream index leaves every other stream alone.
pub fn mix_seed(seed: u64, stream: u64) -> u64 {
    seed.wrapping_mul(0x9e3779b97f4a7c15)
        .wrapping_add(stream.wrapping_mul(0x517cc1b727220a95))
}
