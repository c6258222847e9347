//! Result tables.
//!
//! Turns replicate outcomes into [`RecordBatch`]es for the result sink,
//! honouring the configured output toggles, and derives the per-program
//! comparison rows of the batch summary.

use crate::replicate::{ReplicateOutcome, ReplicateStatus};
use ldar_core::economics::EmissionCosts;
use ldar_core::{AuditKind, MethodStats, ProgramOutcome, SimulationConfig};
use ldar_env::{EnvError, RecordBatch};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TABLE_LEAKS: &str = "leaks";
pub const TABLE_SITES: &str = "sites";
pub const TABLE_TIMESERIES: &str = "timeseries";
pub const TABLE_SURVEY_EVENTS: &str = "survey_events";
pub const TABLE_REPAIR_EVENTS: &str = "repair_events";
pub const TABLE_BATCH_SUMMARY: &str = "batch_summary";
pub const TABLE_REPLICATES: &str = "replicates";

/// Program label used for rows that describe a whole replicate.
pub const ALL_PROGRAMS: &str = "*";

/// Per-site totals for one program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRow {
    pub site: usize,
    pub facility_id: String,
    pub lat: f64,
    pub lon: f64,
    pub subtype: Option<String>,
    pub leaks: usize,
    pub repaired: usize,
    pub emitted_kg: f64,
    pub surveys: usize,
    pub follow_up_surveys: usize,
}

/// One replicate's status line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateSummary {
    pub replicate: u32,
    pub seed: u64,
    pub run_id: Uuid,
    pub status: String,
    pub reason: Option<String>,
    pub sampling_recoveries: usize,
    pub deferred_visits: usize,
    pub deferred_follow_ups: usize,
    pub dropped_follow_ups: usize,
}

/// One program in one successful replicate, compared against the
/// baseline and reference programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSummary {
    pub replicate: u32,
    pub program: String,
    pub emitted_kg: f64,
    pub leaks: usize,
    pub repairs: usize,
    pub surveys: usize,
    pub survey_cost: Decimal,
    pub repair_cost: Decimal,
    pub carbon_cost: Decimal,
    pub ccus_cost: Option<Decimal>,
    pub gas_value_lost: Decimal,
    pub total_cost: Decimal,
    /// Baseline emissions minus this program's
    pub avoided_kg: Option<f64>,
    /// Carbon and gas value of the avoided mass
    pub avoided_value: Option<Decimal>,
    /// Total cost relative to the reference program
    pub cost_ratio: Option<Decimal>,
    /// Emitted mass relative to the reference program
    pub emissions_ratio: Option<f64>,
    pub methods: Vec<MethodStats>,
}

impl ReplicateSummary {
    pub fn from_outcome(outcome: &ReplicateOutcome) -> Self {
        Self {
            replicate: outcome.index,
            seed: outcome.seed,
            run_id: outcome.run_id.as_uuid(),
            status: outcome.status.name().to_string(),
            reason: outcome.status.reason().map(str::to_string),
            sampling_recoveries: outcome.audit.count(AuditKind::SamplingRecovered),
            deferred_visits: outcome.audit.count(AuditKind::VisitDeferred),
            deferred_follow_ups: outcome.audit.count(AuditKind::FollowUpDeferred),
            dropped_follow_ups: outcome.audit.count(AuditKind::FollowUpDropped),
        }
    }
}

/// Builds the comparison rows for every program of a successful replicate.
pub fn summarize(config: &SimulationConfig, outcome: &ReplicateOutcome) -> Vec<ProgramSummary> {
    if outcome.status != ReplicateStatus::Success {
        return Vec::new();
    }
    let baseline = config.baseline_program.as_deref().and_then(|n| outcome.program(n));
    let reference = config.reference_program.as_deref().and_then(|n| outcome.program(n));

    outcome
        .programs
        .iter()
        .map(|p| {
            let ledger = &p.ledger;
            let total_cost = ledger.total();

            let avoided_kg = baseline.map(|b| b.ledger.emitted_kg - ledger.emitted_kg);
            let avoided_value = avoided_kg.and_then(|kg| {
                let econ = &config.programs.get(&p.name)?.economics;
                let value = EmissionCosts::for_mass(econ, kg);
                Some(value.carbon + value.gas_value)
            });

            let cost_ratio = reference.and_then(|r| total_cost.checked_div(r.ledger.total()));
            let emissions_ratio = reference
                .filter(|r| r.ledger.emitted_kg > 0.0)
                .map(|r| ledger.emitted_kg / r.ledger.emitted_kg);

            ProgramSummary {
                replicate: outcome.index,
                program: p.name.clone(),
                emitted_kg: ledger.emitted_kg,
                leaks: p.leaks.len(),
                repairs: p.repairs.len(),
                surveys: p.surveys.len(),
                survey_cost: ledger.survey_cost,
                repair_cost: ledger.repair_cost,
                carbon_cost: ledger.carbon_cost,
                ccus_cost: ledger.ccus_cost,
                gas_value_lost: ledger.gas_value_lost,
                total_cost,
                avoided_kg,
                avoided_value,
                cost_ratio,
                emissions_ratio,
                methods: p.methods.clone(),
            }
        })
        .collect()
}

/// Per-site rows of one program.
pub fn site_rows(outcome: &ReplicateOutcome, program: &ProgramOutcome) -> Vec<SiteRow> {
    let mut rows: Vec<SiteRow> = outcome
        .sites
        .iter()
        .map(|s| SiteRow {
            site: s.index,
            facility_id: s.facility_id.clone(),
            lat: s.location.lat,
            lon: s.location.lon,
            subtype: s.subtype.clone(),
            leaks: 0,
            repaired: 0,
            emitted_kg: 0.0,
            surveys: 0,
            follow_up_surveys: 0,
        })
        .collect();

    for leak in &program.leaks {
        if let Some(row) = rows.get_mut(leak.site) {
            row.leaks += 1;
            row.emitted_kg += leak.emitted_kg;
            if leak.is_repaired() {
                row.repaired += 1;
            }
        }
    }
    for event in &program.surveys {
        if let Some(row) = rows.get_mut(event.site) {
            if event.follow_up {
                row.follow_up_surveys += 1;
            } else {
                row.surveys += 1;
            }
        }
    }
    rows
}

/// All batches for one replicate, in a fixed table order.
pub fn replicate_batches(
    config: &SimulationConfig,
    outcome: &ReplicateOutcome,
    summaries: &[ProgramSummary],
) -> Result<Vec<RecordBatch>, EnvError> {
    let toggles = config.outputs;
    let index = outcome.index;
    let mut batches = Vec::new();

    for program in &outcome.programs {
        let name = program.name.as_str();
        if toggles.leaks {
            batches.push(RecordBatch::from_rows(TABLE_LEAKS, name, index, &program.leaks)?);
        }
        if toggles.sites {
            batches.push(RecordBatch::from_rows(TABLE_SITES, name, index, &site_rows(outcome, program))?);
        }
        if toggles.timeseries {
            batches.push(RecordBatch::from_rows(TABLE_TIMESERIES, name, index, &program.timeseries)?);
        }
        if toggles.survey_events {
            batches.push(RecordBatch::from_rows(TABLE_SURVEY_EVENTS, name, index, &program.surveys)?);
        }
        if toggles.repair_events {
            batches.push(RecordBatch::from_rows(TABLE_REPAIR_EVENTS, name, index, &program.repairs)?);
        }
    }

    if toggles.batch_summary {
        batches.push(RecordBatch::from_rows(
            TABLE_REPLICATES,
            ALL_PROGRAMS,
            index,
            &[ReplicateSummary::from_outcome(outcome)],
        )?);
        for summary in summaries {
            batches.push(RecordBatch::from_rows(
                TABLE_BATCH_SUMMARY,
                &summary.program,
                index,
                std::slice::from_ref(summary),
            )?);
        }
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicate::ReplicateDriver;
    use chrono::NaiveDate;
    use ldar_core::config::{MethodConfig, RevisitInterval};
    use ldar_core::world::LeakSpawn;
    use ldar_core::ProgramConfig;
    use ldar_env::{InMemoryCatalog, SiteRecord};
    use std::sync::Arc;

    fn config() -> SimulationConfig {
        let mut config = SimulationConfig::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 3, 1).unwrap(),
        );
        config.virtual_world.lpr = 0.0;
        let mut ogi = MethodConfig::new("OGI");
        ogi.t_bw_sites = RevisitInterval::Days(30);
        ogi.cost.per_site = 100.0;
        config.programs.insert("P_none".into(), ProgramConfig::default());
        config.programs.insert(
            "P_OGI".into(),
            ProgramConfig {
                methods: vec![ogi],
                ..ProgramConfig::default()
            },
        );
        config.baseline_program = Some("P_none".into());
        config.reference_program = Some("P_none".into());
        config
    }

    fn outcome(config: &SimulationConfig) -> ReplicateOutcome {
        let catalog = InMemoryCatalog::new().with_sites(
            "sites.json",
            vec![SiteRecord::new("F-1", 51.0, -114.0), SiteRecord::new("F-2", 51.1, -114.1)],
        );
        ReplicateDriver::new(Arc::new(config.clone()), Arc::new(catalog))
            .with_injected_leaks(vec![LeakSpawn {
                day: 0,
                site: 1,
                equipment: 0,
                rate_gps: 2.0,
            }])
            .run(0, 5)
    }

    #[test]
    fn test_summary_avoided_emissions_against_baseline() {
        let config = config();
        let outcome = outcome(&config);
        let summaries = summarize(&config, &outcome);
        assert_eq!(summaries.len(), 2);

        let none = summaries.iter().find(|s| s.program == "P_none").unwrap();
        let ogi = summaries.iter().find(|s| s.program == "P_OGI").unwrap();
        assert_eq!(none.avoided_kg, Some(0.0));
        assert!(ogi.avoided_kg.unwrap() > 0.0);
        assert!(ogi.avoided_value.unwrap() > Decimal::ZERO);
        assert!(ogi.emissions_ratio.unwrap() < 1.0);
    }

    #[test]
    fn test_site_rows_attribute_leaks_to_sites() {
        let config = config();
        let outcome = outcome(&config);
        let program = outcome.program("P_none").unwrap();
        let rows = site_rows(&outcome, program);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].leaks, 0);
        assert_eq!(rows[1].leaks, 1);
        assert!(rows[1].emitted_kg > 0.0);
    }

    #[test]
    fn test_toggles_select_tables() {
        let mut config = config();
        config.outputs.leaks = false;
        config.outputs.repair_events = true;
        let outcome = outcome(&config);
        let summaries = summarize(&config, &outcome);
        let batches = replicate_batches(&config, &outcome, &summaries).unwrap();

        assert!(batches.iter().all(|b| b.table != TABLE_LEAKS));
        assert!(batches.iter().any(|b| b.table == TABLE_REPAIR_EVENTS));
        assert!(batches.iter().all(|b| b.table != TABLE_SURVEY_EVENTS));
        assert_eq!(batches.iter().filter(|b| b.table == TABLE_REPLICATES).count(), 1);
        assert_eq!(batches.iter().filter(|b| b.table == TABLE_BATCH_SUMMARY).count(), 2);
    }

    #[test]
    fn test_failed_replicate_has_no_program_rows() {
        let config = config();
        let failed = ReplicateOutcome::panicked(2, 9, "boom");
        assert!(summarize(&config, &failed).is_empty());
        let batches = replicate_batches(&config, &failed, &[]).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].table, TABLE_REPLICATES);
        assert_eq!(batches[0].rows[0]["status"], "panicked");
    }
}
