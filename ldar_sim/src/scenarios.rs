//! Built-in scenarios.
//!
//! Each scenario is a self-contained configuration with an in-memory site
//! table, plus a check that its batch report must pass.

use crate::runner::BatchReport;
use chrono::NaiveDate;
use ldar_core::config::{
    DeploymentType, FollowUpConfig, MdlSpec, MeasurementScale, RepairDelayConfig, RepairCostConfig, RevisitInterval,
};
use ldar_core::economics::EmissionCosts;
use ldar_core::world::LeakSpawn;
use ldar_core::{MethodConfig, ProgramConfig, SimulationConfig};
use ldar_env::{InMemoryCatalog, SiteRecord};
use rust_decimal::Decimal;

const SITES: &str = "sites.json";

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// One leak far above MDL, one OGI survey, one repair
    SingleLeakOgi,

    /// Spatial coverage zero: nothing is ever detected
    ZeroCoverage,

    /// Do-nothing program against generated leaks
    NoProgram,

    /// OGI vs truck screening with OGI follow-up, against a baseline
    OgiVsTruck,

    /// One crew, far-apart sites: visits spill over to later days
    RouteLimited,
}

/// A runnable scenario.
#[derive(Clone)]
pub struct Scenario {
    pub config: SimulationConfig,
    pub catalog: InMemoryCatalog,
    pub injected: Vec<LeakSpawn>,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SingleLeakOgi,
            ScenarioId::ZeroCoverage,
            ScenarioId::NoProgram,
            ScenarioId::OgiVsTruck,
            ScenarioId::RouteLimited,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SingleLeakOgi => "single_leak_ogi",
            ScenarioId::ZeroCoverage => "zero_coverage",
            ScenarioId::NoProgram => "no_program",
            ScenarioId::OgiVsTruck => "ogi_vs_truck",
            ScenarioId::RouteLimited => "route_limited",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SingleLeakOgi => "1 site, 1 leak on day 0, monthly OGI, 14-day repair, 30 days",
            ScenarioId::ZeroCoverage => "OGI with spatial coverage 0 against large leaks",
            ScenarioId::NoProgram => "Generated leaks with no LDAR program",
            ScenarioId::OgiVsTruck => "Quarterly OGI vs monthly truck screening with OGI follow-up, 1 year",
            ScenarioId::RouteLimited => "1 crew, 20 sites 50 km apart, 8 h workday",
        }
    }

    /// Builds the scenario.
    pub fn build(&self) -> Scenario {
        match self {
            ScenarioId::SingleLeakOgi => single_leak_ogi(),
            ScenarioId::ZeroCoverage => zero_coverage(),
            ScenarioId::NoProgram => no_program(),
            ScenarioId::OgiVsTruck => ogi_vs_truck(),
            ScenarioId::RouteLimited => route_limited(),
        }
    }

    /// Checks a batch report of this scenario.
    pub fn verify(&self, report: &BatchReport) -> Result<(), String> {
        if report.failed() > 0 {
            return Err(format!("{} replicate(s) failed", report.failed()));
        }
        if report.outcomes.len() != report.replicates.len() {
            return Err("batch was run without retained outcomes".into());
        }
        for outcome in &report.outcomes {
            for program in &outcome.programs {
                if !program.reconciles() {
                    return Err(format!(
                        "replicate {} program {}: ledger {} != events {}",
                        outcome.index,
                        program.name,
                        program.ledger.total(),
                        program.event_total()
                    ));
                }
            }
        }
        match self {
            ScenarioId::SingleLeakOgi => verify_single_leak(report),
            ScenarioId::ZeroCoverage => verify_zero_coverage(report),
            ScenarioId::NoProgram => verify_no_program(report),
            ScenarioId::OgiVsTruck => verify_ogi_vs_truck(report),
            ScenarioId::RouteLimited => verify_route_limited(report),
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single_leak_ogi" | "single_leak" => Ok(ScenarioId::SingleLeakOgi),
            "zero_coverage" => Ok(ScenarioId::ZeroCoverage),
            "no_program" | "p_none" => Ok(ScenarioId::NoProgram),
            "ogi_vs_truck" => Ok(ScenarioId::OgiVsTruck),
            "route_limited" => Ok(ScenarioId::RouteLimited),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

fn grid_sites(n: u32, spacing_deg: f64) -> Vec<SiteRecord> {
    (0..n)
        .map(|i| {
            let row = f64::from(i / 5);
            let col = f64::from(i % 5);
            SiteRecord::new(format!("FAC-{:03}", i), 52.0 + row * spacing_deg, -113.0 + col * spacing_deg)
        })
        .collect()
}

fn ogi(revisit_days: u32) -> MethodConfig {
    let mut m = MethodConfig::new("OGI");
    m.t_bw_sites = RevisitInterval::Days(revisit_days);
    m.sensor.kind = "ogi_camera".into();
    m.sensor.mdl = MdlSpec::Params(vec![0.01275, 4.0]);
    m.cost.per_site = 600.0;
    m
}

fn single_leak_program() -> ProgramConfig {
    let mut m = ogi(30);
    m.sensor.kind = "default".into();
    m.sensor.mdl = MdlSpec::Single(0.01);
    let mut program = ProgramConfig {
        methods: vec![m],
        repair_delay: RepairDelayConfig::Fixed { val: 14.0 },
        ..ProgramConfig::default()
    };
    program.economics.repair_costs = RepairCostConfig {
        values: vec![200.0],
        ..RepairCostConfig::default()
    };
    program
}

fn single_leak_ogi() -> Scenario {
    let mut config = SimulationConfig::new(date(2023, 1, 1), date(2023, 1, 31));
    config.base_seed = 42;
    config.virtual_world.lpr = 0.0;
    config.programs.insert("P_OGI".into(), single_leak_program());
    config.outputs.survey_events = true;
    config.outputs.repair_events = true;
    Scenario {
        config,
        catalog: InMemoryCatalog::new().with_sites(SITES, vec![SiteRecord::new("FAC-000", 52.0, -113.0)]),
        injected: vec![LeakSpawn {
            day: 0,
            site: 0,
            equipment: 0,
            rate_gps: 5.0,
        }],
    }
}

fn verify_single_leak(report: &BatchReport) -> Result<(), String> {
    for outcome in &report.outcomes {
        let p = outcome.program("P_OGI").ok_or("missing P_OGI")?;
        if p.surveys.len() != 1 || p.surveys[0].day != 0 || p.surveys[0].detected.len() != 1 {
            return Err(format!("expected one detecting survey on day 0, got {:?}", p.surveys));
        }
        if p.repairs.len() != 1 || p.repairs[0].completed_day != 14 {
            return Err(format!("expected one repair on day 14, got {:?}", p.repairs));
        }
        let expected_kg = 14.0 * 5.0 * 86.4;
        if (p.ledger.emitted_kg - expected_kg).abs() > 1e-6 {
            return Err(format!("emitted {} kg, expected {}", p.ledger.emitted_kg, expected_kg));
        }
        let carbon = EmissionCosts::for_mass(&single_leak_program().economics, expected_kg).carbon;
        if p.ledger.total() != Decimal::from(800) + carbon {
            return Err(format!("ledger total {} != 800 + {}", p.ledger.total(), carbon));
        }
    }
    Ok(())
}

fn zero_coverage() -> Scenario {
    let mut config = SimulationConfig::new(date(2023, 1, 1), date(2023, 7, 1));
    config.base_seed = 7;
    config.virtual_world.lpr = 0.0;
    let mut m = ogi(7);
    m.coverage.spatial = 0.0;
    config.programs.insert(
        "P_blind".into(),
        ProgramConfig {
            methods: vec![m],
            ..ProgramConfig::default()
        },
    );
    Scenario {
        config,
        catalog: InMemoryCatalog::new().with_sites(SITES, grid_sites(5, 0.1)),
        injected: (0..5)
            .map(|site| LeakSpawn {
                day: 0,
                site,
                equipment: 0,
                rate_gps: 1_000.0,
            })
            .collect(),
    }
}

fn verify_zero_coverage(report: &BatchReport) -> Result<(), String> {
    for outcome in &report.outcomes {
        let p = outcome.program("P_blind").ok_or("missing P_blind")?;
        if p.surveys.is_empty() {
            return Err("the blind method never surveyed".into());
        }
        if let Some(e) = p.surveys.iter().find(|e| !e.detected.is_empty() || !e.observed.is_empty()) {
            return Err(format!("survey on day {} observed leaks", e.day));
        }
        if !p.repairs.is_empty() {
            return Err("repairs without detections".into());
        }
    }
    Ok(())
}

fn no_program() -> Scenario {
    let mut config = SimulationConfig::new(date(2023, 1, 1), date(2024, 1, 1));
    config.base_seed = 3;
    config.n_simulations = 2;
    config.virtual_world.lpr = 0.01;
    config.programs.insert("P_none".into(), ProgramConfig::default());
    Scenario {
        config,
        catalog: InMemoryCatalog::new().with_sites(SITES, grid_sites(20, 0.2)),
        injected: Vec::new(),
    }
}

fn verify_no_program(report: &BatchReport) -> Result<(), String> {
    for outcome in &report.outcomes {
        let p = outcome.program("P_none").ok_or("missing P_none")?;
        if !p.surveys.is_empty() || !p.repairs.is_empty() {
            return Err("do-nothing program produced events".into());
        }
        let horizon = p.timeseries.len() as f64;
        let unmitigated: f64 = p
            .leaks
            .iter()
            .map(|l| l.rate_gps * 86.4 * (horizon - f64::from(l.created_day)))
            .sum();
        if (p.ledger.emitted_kg - unmitigated).abs() > 1e-6 * unmitigated.max(1.0) {
            return Err(format!("emitted {} kg, unmitigated {}", p.ledger.emitted_kg, unmitigated));
        }
    }
    Ok(())
}

fn ogi_vs_truck() -> Scenario {
    let mut config = SimulationConfig::new(date(2023, 1, 1), date(2024, 1, 1));
    config.base_seed = 2024;
    config.n_simulations = 2;
    config.virtual_world.lpr = 0.0065;

    let mut truck = MethodConfig::new("truck");
    truck.t_bw_sites = RevisitInterval::Days(30);
    truck.measurement_scale = MeasurementScale::Site;
    truck.time = 10.0;
    truck.sensor.mdl = MdlSpec::Single(0.5);
    truck.sensor.qe = 0.2;
    truck.cost.per_site = 50.0;
    truck.follow_up = Some(FollowUpConfig {
        preferred_method: Some("OGI_FU".into()),
        delay: 3,
        ..FollowUpConfig::default()
    });
    let mut follow_up = ogi(0);
    follow_up.label = "OGI_FU".into();
    follow_up.is_follow_up = true;

    config.programs.insert("P_none".into(), ProgramConfig::default());
    config.programs.insert(
        "P_OGI".into(),
        ProgramConfig {
            methods: vec![ogi(90)],
            ..ProgramConfig::default()
        },
    );
    config.programs.insert(
        "P_truck".into(),
        ProgramConfig {
            methods: vec![truck, follow_up],
            ..ProgramConfig::default()
        },
    );
    config.baseline_program = Some("P_none".into());
    config.reference_program = Some("P_OGI".into());

    Scenario {
        config,
        catalog: InMemoryCatalog::new().with_sites(SITES, grid_sites(30, 0.1)),
        injected: Vec::new(),
    }
}

fn verify_ogi_vs_truck(report: &BatchReport) -> Result<(), String> {
    for summary in &report.programs {
        match summary.avoided_kg {
            Some(kg) if kg >= -1e-9 => {}
            other => return Err(format!("{} avoided {:?} kg", summary.program, other)),
        }
    }
    let ogi = report.aggregate("P_OGI").ok_or("missing P_OGI aggregate")?;
    let none = report.aggregate("P_none").ok_or("missing P_none aggregate")?;
    if none.mean_emitted_kg > 0.0 && ogi.mean_emitted_kg >= none.mean_emitted_kg {
        return Err(format!(
            "OGI emitted {} kg, baseline {} kg",
            ogi.mean_emitted_kg, none.mean_emitted_kg
        ));
    }
    Ok(())
}

fn route_limited() -> Scenario {
    let mut config = SimulationConfig::new(date(2023, 6, 1), date(2023, 7, 1));
    config.base_seed = 99;
    config.virtual_world.lpr = 0.0;
    let mut m = ogi(365);
    m.deployment_type = DeploymentType::Mobile;
    m.scheduling.route_planning = true;
    m.n_crews = Some(1);
    m.max_workday = 8.0;
    m.time = 60.0;
    m.cost.per_site = 0.0;
    m.cost.per_hour = 100.0;
    m.cost.per_day = 500.0;
    config.programs.insert(
        "P_OGI".into(),
        ProgramConfig {
            methods: vec![m],
            ..ProgramConfig::default()
        },
    );
    config.outputs.survey_events = true;
    Scenario {
        config,
        catalog: InMemoryCatalog::new().with_sites(SITES, grid_sites(20, 0.5)),
        injected: Vec::new(),
    }
}

fn verify_route_limited(report: &BatchReport) -> Result<(), String> {
    for (outcome, summary) in report.outcomes.iter().zip(&report.replicates) {
        let p = outcome.program("P_OGI").ok_or("missing P_OGI")?;
        if summary.deferred_visits == 0 {
            return Err("one crew visited every site on the first day".into());
        }
        let first_day = p.surveys.iter().filter(|e| e.day == 0).count();
        if first_day == 0 || first_day >= 20 {
            return Err(format!("{} visits on day 0", first_day));
        }
        if p.surveys.iter().any(|e| e.survey_minutes + e.travel_minutes > 8.0 * 60.0) {
            return Err("a visit exceeded the workday".into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>().unwrap(), id);
        }
        assert!("no_such".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_every_scenario_config_validates() {
        for id in ScenarioId::all() {
            let scenario = id.build();
            assert!(scenario.config.validate().is_ok(), "{} failed validation", id);
        }
    }
}
