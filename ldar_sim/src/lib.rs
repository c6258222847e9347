//! LDAR Simulator Monte-Carlo Harness
//!
//! This crate runs an LDAR configuration as a batch of independent,
//! reproducible replicates and writes their result tables.
//!
//! # Core Principle: One Seed, One Replicate
//!
//! All randomness inside a replicate is derived from its seed:
//! - **Leaks**: one stream for the leak timeline, shared by every program
//! - **Programs**: one stream per program name for scheduling, detection,
//!   follow-up and repair draws
//! - **Replicates**: seeds mixed from the base seed by replicate index
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      BatchRunner                         │
//! │   Semaphore(n_processes) + JoinSet::spawn_blocking       │
//! │       │                │                │                │
//! │  ┌────▼─────┐     ┌────▼─────┐     ┌────▼─────┐          │
//! │  │Replicate │     │Replicate │     │Replicate │   ...    │
//! │  │ Driver 0 │     │ Driver 1 │     │ Driver 2 │          │
//! │  └────┬─────┘     └────┬─────┘     └────┬─────┘          │
//! │       │   ProgramRunner per program, day-major           │
//! │       ▼                ▼                ▼                │
//! │  ┌────────────────────────────────────────────┐          │
//! │  │ exporter → ResultSink (ordered by replicate)│         │
//! │  └────────────────────────────────────────────┘          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ldar_sim::BatchRunner;
//! use ldar_env::{JsonCatalog, MemorySink};
//!
//! let config = ldar_core::SimulationConfig::from_path("config.json".as_ref())?;
//! let runner = BatchRunner::new(config, Arc::new(JsonCatalog::new("inputs")), Arc::new(MemorySink::new()))?;
//! let report = runner.run().await?;
//! ```

mod context;
pub mod exporter;
mod replicate;
mod runner;
pub mod scenarios;
mod seeds;

pub use context::ReplicateContext;
pub use exporter::{ProgramSummary, ReplicateSummary, SiteRow};
pub use replicate::{ReplicateDriver, ReplicateOutcome, ReplicateStatus};
pub use runner::{aggregate, BatchError, BatchReport, BatchRunner, ProgramAggregate};
pub use seeds::{leak_seed, program_seed, replicate_seed, SeedSchedule};
