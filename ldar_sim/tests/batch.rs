//! End-to-end batch tests: determinism, isolation and scenario checks.

use async_trait::async_trait;
use ldar_core::SimulationConfig;
use ldar_env::{
    Coordinates, EnvError, InMemoryCatalog, InputCatalog, JsonLinesSink, MemorySink, RecordBatch, ResultSink,
    SiteRecord, WeatherField,
};
use ldar_sim::scenarios::ScenarioId;
use ldar_sim::{BatchError, BatchReport, BatchRunner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn run_scenario(id: ScenarioId, processes: usize) -> (BatchReport, Arc<MemorySink>) {
    let scenario = id.build();
    let sink = Arc::new(MemorySink::new());
    let runner = BatchRunner::new(scenario.config, Arc::new(scenario.catalog), sink.clone())
        .unwrap()
        .with_injected_leaks(scenario.injected)
        .with_processes(processes);
    (runner.run().await.unwrap(), sink)
}

#[tokio::test]
async fn test_single_leak_scenario_passes() {
    let (report, sink) = run_scenario(ScenarioId::SingleLeakOgi, 1).await;
    ScenarioId::SingleLeakOgi.verify(&report).unwrap();

    let repairs = sink.table("repair_events");
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].rows[0]["completed_day"], 14);
}

#[tokio::test]
async fn test_zero_coverage_never_detects() {
    let (report, _) = run_scenario(ScenarioId::ZeroCoverage, 1).await;
    ScenarioId::ZeroCoverage.verify(&report).unwrap();
}

#[tokio::test]
async fn test_no_program_matches_unmitigated_baseline() {
    let (report, _) = run_scenario(ScenarioId::NoProgram, 2).await;
    ScenarioId::NoProgram.verify(&report).unwrap();
}

#[tokio::test]
async fn test_program_comparison_reconciles() {
    let (report, _) = run_scenario(ScenarioId::OgiVsTruck, 2).await;
    ScenarioId::OgiVsTruck.verify(&report).unwrap();
    for outcome in &report.outcomes {
        assert_eq!(outcome.programs.len(), 3);
        for program in &outcome.programs {
            assert!(program.reconciles(), "{} does not reconcile", program.name);
        }
    }
}

#[tokio::test]
async fn test_route_limited_defers_visits() {
    let (report, _) = run_scenario(ScenarioId::RouteLimited, 1).await;
    ScenarioId::RouteLimited.verify(&report).unwrap();
}

#[tokio::test]
async fn test_tables_identical_across_worker_counts() {
    let (_, serial) = run_scenario(ScenarioId::OgiVsTruck, 1).await;
    let (_, parallel) = run_scenario(ScenarioId::OgiVsTruck, 4).await;
    assert_eq!(serial.batches(), parallel.batches());
}

#[tokio::test]
async fn test_same_seed_same_tables() {
    let (first, a) = run_scenario(ScenarioId::NoProgram, 2).await;
    let (second, b) = run_scenario(ScenarioId::NoProgram, 2).await;
    assert_eq!(a.table("leaks"), b.table("leaks"));
    assert_eq!(a.table("timeseries"), b.table("timeseries"));
    let seeds = |r: &BatchReport| r.outcomes.iter().map(|o| o.seed).collect::<Vec<_>>();
    assert_eq!(seeds(&first), seeds(&second));
}

#[tokio::test]
async fn test_rerun_into_same_directory_reproduces_files() {
    let dir = std::env::temp_dir().join(format!("ldar_batch_{}", uuid::Uuid::new_v4()));
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let scenario = ScenarioId::SingleLeakOgi.build();
        let sink = Arc::new(JsonLinesSink::create(&dir).await.unwrap());
        BatchRunner::new(scenario.config, Arc::new(scenario.catalog), sink)
            .unwrap()
            .with_injected_leaks(scenario.injected)
            .run()
            .await
            .unwrap();
        let mut files = Vec::new();
        for table in ["leaks", "timeseries", "repair_events"] {
            files.push(tokio::fs::read_to_string(dir.join(format!("{}.jsonl", table))).await.unwrap());
        }
        snapshots.push(files);
    }

    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(snapshots[1][2].lines().count(), 1);
    tokio::fs::remove_dir_all(dir).await.ok();
}

#[tokio::test]
async fn test_pregenerated_and_incremental_leaks_agree() {
    let mut scenario = ScenarioId::NoProgram.build();
    scenario.config.pregenerate_leaks = true;
    let pre = Arc::new(MemorySink::new());
    BatchRunner::new(scenario.config.clone(), Arc::new(scenario.catalog.clone()), pre.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    scenario.config.pregenerate_leaks = false;
    let inc = Arc::new(MemorySink::new());
    BatchRunner::new(scenario.config, Arc::new(scenario.catalog), inc.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(!pre.table("leaks")[0].rows.is_empty());
    assert_eq!(pre.table("leaks"), inc.table("leaks"));
}

#[tokio::test]
async fn test_config_document_runs_end_to_end() {
    let json = r#"{
        "start_date": "2023-01-01",
        "end_date": "2023-04-01",
        "n_simulations": 2,
        "base_seed": 5,
        "baseline_program": "P_none",
        "virtual_world": { "LPR": 0.02 },
        "outputs": { "survey_events": true },
        "programs": {
            "P_none": {},
            "P_OGI": {
                "methods": [{
                    "label": "OGI",
                    "t_bw_sites": 30,
                    "sensor": { "type": "ogi_camera", "MDL": [0.01275, 4.0] },
                    "cost": { "per_site": 600 }
                }],
                "repair_delay": { "type": "fixed", "val": 14 }
            }
        }
    }"#;
    let config = SimulationConfig::from_json_str(json).unwrap();
    let catalog = InMemoryCatalog::new().with_sites(
        "sites.json",
        (0..10).map(|i| SiteRecord::new(format!("F-{}", i), 49.0 + f64::from(i) * 0.05, -112.0)).collect(),
    );
    let sink = Arc::new(MemorySink::new());
    let report = BatchRunner::new(config, Arc::new(catalog), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.programs.len(), 4);
    assert!(!sink.table("survey_events").is_empty());
    let ogi = report.aggregate("P_OGI").unwrap();
    assert!(ogi.mean_avoided_kg.unwrap() >= 0.0);
}

/// Catalog whose site lookup misbehaves on one call.
struct FlakyCatalog {
    inner: InMemoryCatalog,
    calls: AtomicUsize,
    fail_on: usize,
    panic: bool,
}

impl InputCatalog for FlakyCatalog {
    fn sites(&self, name: &str) -> Result<Vec<SiteRecord>, EnvError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            if self.panic {
                panic!("site registry exploded");
            }
            return Err(EnvError::malformed(name, "truncated file"));
        }
        self.inner.sites(name)
    }

    fn home_bases(&self, name: &str) -> Result<Vec<Coordinates>, EnvError> {
        self.inner.home_bases(name)
    }

    fn series(&self, name: &str) -> Result<Vec<f64>, EnvError> {
        self.inner.series(name)
    }

    fn weather(&self, name: Option<&str>) -> Result<Arc<dyn WeatherField>, EnvError> {
        self.inner.weather(name)
    }
}

async fn run_flaky(panic: bool) -> BatchReport {
    let mut scenario = ScenarioId::NoProgram.build();
    scenario.config.n_simulations = 3;
    let catalog = FlakyCatalog {
        inner: scenario.catalog,
        calls: AtomicUsize::new(0),
        fail_on: 1,
        panic,
    };
    BatchRunner::new(scenario.config, Arc::new(catalog), Arc::new(MemorySink::new()))
        .unwrap()
        .with_processes(1)
        .run()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_input_error_isolated_to_one_replicate() {
    let report = run_flaky(false).await;
    let statuses: Vec<&str> = report.outcomes.iter().map(|o| o.status.name()).collect();
    assert_eq!(statuses, vec!["success", "input_data_error", "success"]);
    assert_eq!(report.aggregate("P_none").unwrap().replicates, 2);
}

#[tokio::test]
async fn test_panic_isolated_to_one_replicate() {
    let report = run_flaky(true).await;
    let statuses: Vec<&str> = report.outcomes.iter().map(|o| o.status.name()).collect();
    assert_eq!(statuses, vec!["success", "panicked", "success"]);
    assert!(report.outcomes[1].status.reason().unwrap().contains("exploded"));
}

/// Sink that rejects every write.
struct BrokenSink;

#[async_trait]
impl ResultSink for BrokenSink {
    async fn write(&self, _batch: RecordBatch) -> Result<(), EnvError> {
        Err(EnvError::SinkClosed)
    }

    async fn close(&self) -> Result<(), EnvError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_sink_failure_fails_batch() {
    let scenario = ScenarioId::SingleLeakOgi.build();
    let result = BatchRunner::new(scenario.config, Arc::new(scenario.catalog), Arc::new(BrokenSink))
        .unwrap()
        .run()
        .await;
    assert!(matches!(result, Err(BatchError::Output(EnvError::SinkClosed))));
}
