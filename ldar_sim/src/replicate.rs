//! ReplicateDriver - one Monte-Carlo replicate of every program.
//!
//! A replicate loads the site table, weather and leak model, builds one
//! [`ProgramRunner`] per program over identical copies of the virtual world,
//! and steps them day-major through the horizon. All work inside a
//! replicate is single-threaded; the only shared state is the read-only
//! configuration and input catalog.

use crate::context::ReplicateContext;
use ldar_core::world::{load_sites, LeakSpawn};
use ldar_core::{
    AuditLog, Clock, LeakGenerator, LeakSupply, ProgramOutcome, ProgramRunner, SimError, SimulationConfig,
    VirtualWorld,
};
use ldar_env::{InputCatalog, RunId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a replicate ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ReplicateStatus {
    Success,
    InputDataError(String),
    NumericalError(String),
    Panicked(String),
}

impl ReplicateStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Status name as written to the batch summary.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InputDataError(_) => "input_data_error",
            Self::NumericalError(_) => "numerical_error",
            Self::Panicked(_) => "panicked",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::InputDataError(r) | Self::NumericalError(r) | Self::Panicked(r) => Some(r),
        }
    }

    fn from_error(err: &SimError) -> Self {
        match err {
            SimError::Numerical(msg) => Self::NumericalError(msg.clone()),
            // Configuration problems surfacing this late come from input data
            // (e.g. a catalog series that fails a distribution check).
            other => Self::InputDataError(other.to_string()),
        }
    }
}

/// Everything one replicate produced.
#[derive(Debug, Clone)]
pub struct ReplicateOutcome {
    pub index: u32,
    pub seed: u64,
    pub run_id: RunId,
    pub status: ReplicateStatus,
    /// Site table the programs ran against; empty when loading failed
    pub sites: Arc<[ldar_core::Site]>,
    /// One per program, in program-name order; empty unless successful
    pub programs: Vec<ProgramOutcome>,
    pub audit: AuditLog,
}

impl ReplicateOutcome {
    /// Outcome of a replicate whose worker panicked.
    pub fn panicked(index: u32, seed: u64, reason: impl Into<String>) -> Self {
        Self {
            index,
            seed,
            run_id: RunId::from_seed(seed),
            status: ReplicateStatus::Panicked(reason.into()),
            sites: Arc::from(Vec::new()),
            programs: Vec::new(),
            audit: AuditLog::new(),
        }
    }

    pub fn program(&self, name: &str) -> Option<&ProgramOutcome> {
        self.programs.iter().find(|p| p.name == name)
    }
}

/// Runs replicates of one configuration.
#[derive(Clone)]
pub struct ReplicateDriver {
    config: Arc<SimulationConfig>,
    catalog: Arc<dyn InputCatalog>,
    injected: Arc<[LeakSpawn]>,
}

impl ReplicateDriver {
    pub fn new(config: Arc<SimulationConfig>, catalog: Arc<dyn InputCatalog>) -> Self {
        Self {
            config,
            catalog,
            injected: Arc::from(Vec::new()),
        }
    }

    /// Adds leaks that exist in every program's world on top of generated ones.
    pub fn with_injected_leaks(mut self, leaks: Vec<LeakSpawn>) -> Self {
        self.injected = Arc::from(leaks);
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Runs replicate `index` with `seed`. Failures become a status, never
    /// an error.
    pub fn run(&self, index: u32, seed: u64) -> ReplicateOutcome {
        let mut ctx = ReplicateContext::new(index, seed);
        info!(replicate = index, seed, run_id = %ctx.run_id(), "Starting replicate");

        let (status, sites, programs) = match self.try_run(&mut ctx) {
            Ok((sites, programs)) => (ReplicateStatus::Success, sites, programs),
            Err(err) => {
                warn!(replicate = index, error = %err, "Replicate failed");
                (ReplicateStatus::from_error(&err), Arc::from(Vec::new()), Vec::new())
            }
        };

        info!(replicate = index, status = status.name(), audit = ctx.audit().len(), "Replicate finished");
        ReplicateOutcome {
            index,
            seed,
            run_id: ctx.run_id(),
            status,
            sites,
            programs,
            audit: ctx.into_audit(),
        }
    }

    fn try_run(
        &self,
        ctx: &mut ReplicateContext,
    ) -> Result<(Arc<[ldar_core::Site]>, Vec<ProgramOutcome>), SimError> {
        let config = &self.config;
        let catalog = self.catalog.as_ref();
        let clock = Clock::new(config.start_date, config.end_date)?;

        let records = catalog.sites(&config.virtual_world.infrastructure_file)?;
        let sites = load_sites(&records)?;
        let weather = catalog.weather(config.virtual_world.weather_file.as_deref())?;
        let generator = Arc::new(LeakGenerator::from_config(&config.virtual_world, catalog)?);

        let mut leak_rng = ChaCha8Rng::seed_from_u64(ctx.leak_seed());
        let supply = if config.pregenerate_leaks {
            let timeline = generator.pregenerate(&sites, &clock, &mut leak_rng, ctx.audit_mut());
            debug!(replicate = ctx.index(), leaks = timeline.len(), "Pregenerated leak timeline");
            LeakSupply::Pregenerated(Arc::new(timeline))
        } else {
            LeakSupply::Incremental {
                generator,
                rng: leak_rng,
            }
        };

        let mut runners = Vec::with_capacity(config.programs.len());
        for (name, program) in &config.programs {
            let mut world = VirtualWorld::new(Arc::clone(&sites), supply.clone());
            for leak in self.injected.iter() {
                if leak.site >= sites.len() {
                    return Err(SimError::InputData(ldar_env::EnvError::malformed(
                        "injected leaks",
                        format!("site index {} out of range", leak.site),
                    )));
                }
                world.inject_leak(leak.site, leak.equipment, leak.day, leak.rate_gps);
            }
            runners.push(ProgramRunner::new(
                name,
                program,
                world,
                catalog,
                Arc::clone(&weather),
                ctx.program_seed(name),
            )?);
        }

        for day in clock.days() {
            for runner in &mut runners {
                runner.step(day, &clock, ctx.audit_mut())?;
            }
        }

        let programs = runners
            .into_iter()
            .map(ProgramRunner::finish)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((sites, programs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ldar_core::config::ProgramConfig;
    use ldar_env::{InMemoryCatalog, SiteRecord};

    fn config(lpr: f64, pregenerate: bool) -> SimulationConfig {
        let mut config = SimulationConfig::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
        );
        config.programs.insert("P_none".to_string(), ProgramConfig::default());
        config.pregenerate_leaks = pregenerate;
        config.virtual_world.lpr = lpr;
        config
    }

    fn catalog() -> Arc<dyn InputCatalog> {
        let sites = (0..20)
            .map(|i| SiteRecord::new(format!("F-{}", i), 51.0 + f64::from(i) * 0.01, -114.0))
            .collect();
        Arc::new(InMemoryCatalog::new().with_sites("sites.json", sites))
    }

    #[test]
    fn test_replicate_is_reproducible() {
        let driver = ReplicateDriver::new(Arc::new(config(0.01, true)), catalog());
        let a = driver.run(0, 1234);
        let b = driver.run(0, 1234);
        assert!(a.status.is_success());
        assert_eq!(a.programs[0].leaks, b.programs[0].leaks);
        assert_eq!(a.programs[0].timeseries, b.programs[0].timeseries);
    }

    #[test]
    fn test_pregenerated_matches_incremental() {
        let pre = ReplicateDriver::new(Arc::new(config(0.02, true)), catalog()).run(0, 77);
        let inc = ReplicateDriver::new(Arc::new(config(0.02, false)), catalog()).run(0, 77);
        assert!(!pre.programs[0].leaks.is_empty());
        assert_eq!(pre.programs[0].leaks, inc.programs[0].leaks);
    }

    #[test]
    fn test_missing_sites_is_input_data_error() {
        let driver = ReplicateDriver::new(Arc::new(config(0.01, true)), Arc::new(InMemoryCatalog::new()));
        let outcome = driver.run(0, 1);
        assert_eq!(outcome.status.name(), "input_data_error");
        assert!(outcome.programs.is_empty());
    }

    #[test]
    fn test_injected_leak_out_of_range_fails_replicate() {
        let driver = ReplicateDriver::new(Arc::new(config(0.0, true)), catalog()).with_injected_leaks(vec![
            LeakSpawn {
                day: 0,
                site: 99,
                equipment: 0,
                rate_gps: 1.0,
            },
        ]);
        assert_eq!(driver.run(0, 1).status.name(), "input_data_error");
    }
}
