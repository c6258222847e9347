//! Batch runner - fans replicates across a bounded worker pool.

use crate::exporter::{replicate_batches, summarize, ProgramSummary, ReplicateSummary};
use crate::replicate::{ReplicateDriver, ReplicateOutcome, ReplicateStatus};
use crate::seeds::SeedSchedule;
use ldar_core::world::LeakSpawn;
use ldar_core::{ConfigError, SimulationConfig};
use ldar_env::{EnvError, InputCatalog, ResultSink, RunId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Errors that stop a whole batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The configuration is unusable; no replicate ran
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The result sink failed
    #[error("Output error: {0}")]
    Output(#[from] EnvError),

    /// The worker pool itself failed
    #[error("Worker pool error: {0}")]
    Pool(String),
}

/// Program results averaged over successful replicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramAggregate {
    pub program: String,
    pub replicates: usize,
    pub mean_emitted_kg: f64,
    pub mean_total_cost: Decimal,
    pub mean_avoided_kg: Option<f64>,
}

/// Everything a batch produced, ordered by replicate index.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub run_id: RunId,
    /// Full replicate results; empty unless the runner retains them
    pub outcomes: Vec<ReplicateOutcome>,
    pub replicates: Vec<ReplicateSummary>,
    pub programs: Vec<ProgramSummary>,
    pub aggregates: Vec<ProgramAggregate>,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.replicates.iter().filter(|r| r.status != ReplicateStatus::Success.name()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.replicates.len() - self.failed()
    }

    pub fn aggregate(&self, program: &str) -> Option<&ProgramAggregate> {
        self.aggregates.iter().find(|a| a.program == program)
    }
}

/// Replicates exported so far, plus those that finished ahead of their turn.
#[derive(Default)]
struct Collector {
    next: u32,
    waiting: BTreeMap<u32, ReplicateOutcome>,
    outcomes: Vec<ReplicateOutcome>,
    replicates: Vec<ReplicateSummary>,
    programs: Vec<ProgramSummary>,
}

/// Runs every replicate of a configuration and writes the result tables.
pub struct BatchRunner {
    config: Arc<SimulationConfig>,
    driver: ReplicateDriver,
    sink: Arc<dyn ResultSink>,
    processes: usize,
    retain_outcomes: bool,
}

impl BatchRunner {
    /// Validates the configuration and prepares the pool.
    pub fn new(
        config: SimulationConfig,
        catalog: Arc<dyn InputCatalog>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let processes = config
            .n_processes
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
        let config = Arc::new(config);
        Ok(Self {
            driver: ReplicateDriver::new(Arc::clone(&config), catalog),
            config,
            sink,
            processes,
            retain_outcomes: true,
        })
    }

    /// Adds leaks present in every replicate and program.
    pub fn with_injected_leaks(mut self, leaks: Vec<LeakSpawn>) -> Self {
        self.driver = self.driver.with_injected_leaks(leaks);
        self
    }

    /// Overrides the worker count.
    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes.max(1);
        self
    }

    /// Whether the report keeps every replicate's leaks and events after
    /// export. Without them memory stays flat in the number of replicates.
    pub fn with_retained_outcomes(mut self, retain: bool) -> Self {
        self.retain_outcomes = retain;
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Runs all replicates and exports each in replicate order as soon as
    /// its predecessors are out, then closes the sink.
    ///
    /// A failing replicate never fails the batch; only configuration,
    /// pool and sink errors do.
    pub async fn run(&self) -> Result<BatchReport, BatchError> {
        let n = self.config.n_simulations;
        let schedule = SeedSchedule::new(self.config.base_seed, self.config.preseed_random);
        let seeds = schedule.seeds(n);
        let run_id = RunId::from_seed(self.config.base_seed);
        info!(
            run_id = %run_id,
            replicates = n,
            processes = self.processes,
            programs = self.config.programs.len(),
            "Starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.processes));
        let mut workers = JoinSet::new();
        let mut collector = Collector::default();
        for (index, seed) in (0..n).zip(seeds) {
            // Drain finished replicates while the pool is full
            let permit = loop {
                match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => break permit,
                    Err(TryAcquireError::NoPermits) => {
                        let joined = workers
                            .join_next()
                            .await
                            .ok_or_else(|| BatchError::Pool("no running replicate holds a permit".into()))?;
                        let outcome = joined.map_err(|e| BatchError::Pool(e.to_string()))?;
                        self.collect(outcome, &mut collector).await?;
                    }
                    Err(TryAcquireError::Closed) => return Err(BatchError::Pool("worker pool closed".into())),
                }
            };
            let driver = self.driver.clone();
            workers.spawn_blocking(move || {
                let _permit = permit;
                panic::catch_unwind(AssertUnwindSafe(|| driver.run(index, seed)))
                    .unwrap_or_else(|payload| ReplicateOutcome::panicked(index, seed, panic_message(payload.as_ref())))
            });
        }
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(|e| BatchError::Pool(e.to_string()))?;
            self.collect(outcome, &mut collector).await?;
        }
        self.sink.close().await?;

        let aggregates = aggregate(&collector.programs);
        let report = BatchReport {
            run_id,
            outcomes: collector.outcomes,
            replicates: collector.replicates,
            programs: collector.programs,
            aggregates,
        };
        info!(
            run_id = %run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Buffers a finished replicate and exports every replicate whose turn
    /// has come.
    async fn collect(&self, outcome: ReplicateOutcome, collector: &mut Collector) -> Result<(), BatchError> {
        if let Some(reason) = outcome.status.reason() {
            error!(replicate = outcome.index, status = outcome.status.name(), "{}", reason);
        }
        collector.waiting.insert(outcome.index, outcome);

        while let Some(outcome) = collector.waiting.remove(&collector.next) {
            let summaries = summarize(&self.config, &outcome);
            for batch in replicate_batches(&self.config, &outcome, &summaries)? {
                self.sink.write(batch).await?;
            }
            debug!(replicate = outcome.index, buffered = collector.waiting.len(), "Exported replicate");
            collector.replicates.push(ReplicateSummary::from_outcome(&outcome));
            collector.programs.extend(summaries);
            if self.retain_outcomes {
                collector.outcomes.push(outcome);
            }
            collector.next += 1;
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Means per program over the summaries of successful replicates.
pub fn aggregate(summaries: &[ProgramSummary]) -> Vec<ProgramAggregate> {
    let mut by_program: BTreeMap<&str, Vec<&ProgramSummary>> = BTreeMap::new();
    for s in summaries {
        by_program.entry(s.program.as_str()).or_default().push(s);
    }

    by_program
        .into_iter()
        .map(|(program, rows)| {
            let n = rows.len();
            let total_cost: Decimal = rows.iter().map(|r| r.total_cost).sum();
            let avoided: Option<Vec<f64>> = rows.iter().map(|r| r.avoided_kg).collect();
            ProgramAggregate {
                program: program.to_string(),
                replicates: n,
                mean_emitted_kg: rows.iter().map(|r| r.emitted_kg).sum::<f64>() / n as f64,
                mean_total_cost: total_cost
                    .checked_div(Decimal::from(n))
                    .unwrap_or_default()
                    .round_dp(ldar_core::economics::MONEY_DP),
                mean_avoided_kg: avoided.map(|v| v.iter().sum::<f64>() / n as f64),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ldar_core::ProgramConfig;
    use ldar_env::{InMemoryCatalog, MemorySink, SiteRecord};

    fn config(n: u32) -> SimulationConfig {
        let mut config = SimulationConfig::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 2, 1).unwrap(),
        );
        config.n_simulations = n;
        config.base_seed = 11;
        config.virtual_world.lpr = 0.05;
        config.programs.insert("P_none".into(), ProgramConfig::default());
        config
    }

    fn catalog() -> Arc<dyn InputCatalog> {
        Arc::new(InMemoryCatalog::new().with_sites(
            "sites.json",
            (0..5).map(|i| SiteRecord::new(format!("F-{}", i), 50.0, -110.0 + f64::from(i))).collect(),
        ))
    }

    #[tokio::test]
    async fn test_batch_runs_every_replicate_in_order() {
        let sink = Arc::new(MemorySink::new());
        let runner = BatchRunner::new(config(4), catalog(), sink.clone())
            .unwrap()
            .with_processes(2);
        let report = runner.run().await.unwrap();

        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.succeeded(), 4);
        let indices: Vec<u32> = report.outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(sink.table("replicates").len(), 4);
    }

    /// Sink that records the replicate of every write, in arrival order.
    #[derive(Default)]
    struct OrderSink {
        order: std::sync::Mutex<Vec<u32>>,
    }

    #[async_trait::async_trait]
    impl ResultSink for OrderSink {
        async fn write(&self, batch: ldar_env::RecordBatch) -> Result<(), EnvError> {
            self.order.lock().unwrap().push(batch.replicate);
            Ok(())
        }

        async fn close(&self) -> Result<(), EnvError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_replicates_are_written_in_index_order() {
        let sink = Arc::new(OrderSink::default());
        BatchRunner::new(config(8), catalog(), sink.clone())
            .unwrap()
            .with_processes(4)
            .run()
            .await
            .unwrap();

        let order = sink.order.lock().unwrap().clone();
        assert!(!order.is_empty());
        assert!(order.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(order.last(), Some(&7));
    }

    #[tokio::test]
    async fn test_outcomes_can_be_released_after_export() {
        let sink = Arc::new(MemorySink::new());
        let report = BatchRunner::new(config(5), catalog(), sink.clone())
            .unwrap()
            .with_processes(2)
            .with_retained_outcomes(false)
            .run()
            .await
            .unwrap();

        assert!(report.outcomes.is_empty());
        assert_eq!(report.replicates.len(), 5);
        assert_eq!(report.succeeded(), 5);
        assert_eq!(report.programs.len(), 5);
        assert_eq!(sink.table("timeseries").len(), 5);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_running() {
        let mut bad = config(1);
        bad.n_simulations = 0;
        let result = BatchRunner::new(bad, catalog(), Arc::new(MemorySink::new()));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_aggregate_means() {
        let row = |replicate: u32, kg: f64, cost: i64| ProgramSummary {
            replicate,
            program: "P".into(),
            emitted_kg: kg,
            leaks: 0,
            repairs: 0,
            surveys: 0,
            survey_cost: Decimal::ZERO,
            repair_cost: Decimal::ZERO,
            carbon_cost: Decimal::from(cost),
            ccus_cost: None,
            gas_value_lost: Decimal::ZERO,
            total_cost: Decimal::from(cost),
            avoided_kg: None,
            avoided_value: None,
            cost_ratio: None,
            emissions_ratio: None,
            methods: Vec::new(),
        };
        let aggregates = aggregate(&[row(0, 10.0, 100), row(1, 30.0, 300)]);
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].replicates, 2);
        assert!((aggregates[0].mean_emitted_kg - 20.0).abs() < 1e-12);
        assert_eq!(aggregates[0].mean_total_cost, Decimal::from(200));
        assert_eq!(aggregates[0].mean_avoided_kg, None);
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("worker exploded");
        assert_eq!(panic_message(payload.as_ref()), "worker exploded");
    }
}
