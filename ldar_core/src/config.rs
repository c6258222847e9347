//! Simulation configuration.
//!
//! The JSON document is deserialized into these structs and validated once.
//! Absent optional fields resolve to their documented defaults here, so the
//! engine never deals with missing values:
//!
//! | field | absent / null means |
//! |-------|---------------------|
//! | `n_crews` | start crews while any site still fits a fresh workday |
//! | `RS` | no annual cap on surveys per site |
//! | `follow_up` | detections go straight to repair |
//! | `instant_threshold` | no bypass of follow-up |
//! | `n_processes` | available parallelism |

use crate::distributions::{DistType, RateUnits};
use crate::error::ConfigError;
use chrono::NaiveDate;
use ldar_env::Coordinates;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// First simulated day (inclusive)
    pub start_date: NaiveDate,

    /// Last simulated day (exclusive)
    pub end_date: NaiveDate,

    /// Replicates allowed to run at once
    #[serde(default)]
    pub n_processes: Option<usize>,

    /// Number of Monte-Carlo replicates
    #[serde(default = "default_simulations")]
    pub n_simulations: u32,

    /// Seed every replicate seed is mixed from
    #[serde(default)]
    pub base_seed: u64,

    /// Program name -> program
    pub programs: BTreeMap<String, ProgramConfig>,

    /// Program other programs are compared against for cost ratios
    #[serde(default)]
    pub reference_program: Option<String>,

    /// Program avoided emissions are measured against
    #[serde(default)]
    pub baseline_program: Option<String>,

    /// Site population and leak model
    #[serde(default)]
    pub virtual_world: VirtualWorldConfig,

    /// Directory the JSON input catalog reads from
    #[serde(default)]
    pub input_directory: Option<PathBuf>,

    /// Directory result tables are written to
    #[serde(default)]
    pub output_directory: Option<PathBuf>,

    /// Which result tables to emit
    #[serde(default)]
    pub outputs: OutputToggles,

    /// Derive replicate seeds from `base_seed` instead of OS entropy
    #[serde(default = "default_true")]
    pub preseed_random: bool,

    /// Draw each replicate's leak timeline up front and share it across programs
    #[serde(default = "default_true")]
    pub pregenerate_leaks: bool,
}

fn default_simulations() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Result table toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputToggles {
    pub leaks: bool,
    pub sites: bool,
    pub timeseries: bool,
    pub batch_summary: bool,
    pub survey_events: bool,
    pub repair_events: bool,
}

impl Default for OutputToggles {
    fn default() -> Self {
        Self {
            leaks: true,
            sites: true,
            timeseries: true,
            batch_summary: true,
            survey_events: false,
            repair_events: false,
        }
    }
}

/// Site population and leak-generation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualWorldConfig {
    /// Catalog name of the site registry
    pub infrastructure_file: String,

    /// Leak production rate: expected new leaks per site per day
    #[serde(rename = "LPR")]
    pub lpr: f64,

    /// Default leak-rate model
    pub leak_rate: LeakRateConfig,

    /// Per-subtype overrides keyed by `SiteRecord::subtype`
    pub subtypes: BTreeMap<String, SubtypeConfig>,

    /// Catalog name of the weather field (constant mild weather when absent)
    pub weather_file: Option<String>,
}

impl Default for VirtualWorldConfig {
    fn default() -> Self {
        Self {
            infrastructure_file: "sites.json".to_string(),
            lpr: 0.0065,
            leak_rate: LeakRateConfig::default(),
            subtypes: BTreeMap::new(),
            weather_file: None,
        }
    }
}

/// Subtype override of the leak model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtypeConfig {
    #[serde(rename = "LPR")]
    pub lpr: Option<f64>,
    pub leak_rate: Option<LeakRateConfig>,
}

/// Where leak rates come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakRateSource {
    /// Parametric distribution
    #[default]
    Dist,
    /// Uniform resampling of recorded rates
    Sample,
}

/// Leak-rate model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakRateConfig {
    pub source: LeakRateSource,

    pub dist_type: DistType,

    /// Location parameter (`mu` for lognorm, mean for exponential, scale for
    /// gamma/weibull, the value itself for fixed)
    pub dist_scale: f64,

    /// Shape parameters (`sigma` for lognorm, `k` for gamma/weibull)
    pub dist_shape: Vec<f64>,

    /// Units drawn values are expressed in
    pub units: RateUnits,

    /// Largest physical rate in g/s; larger draws are re-sampled
    pub max_leak_rate: Option<f64>,

    /// Inline recorded rates for `source: sample`
    pub samples: Vec<f64>,

    /// Catalog series of recorded rates for `source: sample`
    pub leak_rates_file: Option<String>,
}

impl Default for LeakRateConfig {
    fn default() -> Self {
        Self {
            source: LeakRateSource::Dist,
            dist_type: DistType::Lognorm,
            dist_scale: -2.776,
            dist_shape: vec![1.462],
            units: RateUnits::default(),
            max_leak_rate: None,
            samples: Vec::new(),
            leak_rates_file: None,
        }
    }
}

/// One LDAR program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// Methods in deployment order; empty means a do-nothing baseline
    pub methods: Vec<MethodConfig>,

    /// Default follow-up method for rules without `preferred_method`
    pub follow_up_method: Option<String>,

    pub economics: EconomicsConfig,

    pub repair_delay: RepairDelayConfig,
}

/// Program economics parameters. Money is in the configured currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomicsConfig {
    #[serde(rename = "carbon_price_tonnesCO2e")]
    pub carbon_price_tonnes_co2e: f64,

    #[serde(rename = "GWP_CH4")]
    pub gwp_ch4: f64,

    /// Sale price of natural gas per mcf
    pub sale_price_natgas: f64,

    pub repair_costs: RepairCostConfig,

    /// Charged per repaired leak on top of the repair cost
    pub verification_cost: f64,

    /// Capture/storage cost per tonne CO2e; not modelled when absent
    #[serde(rename = "cost_CCUS")]
    pub cost_ccus: Option<f64>,
}

impl Default for EconomicsConfig {
    fn default() -> Self {
        Self {
            carbon_price_tonnes_co2e: 40.0,
            gwp_ch4: 28.0,
            sale_price_natgas: 3.0,
            repair_costs: RepairCostConfig::default(),
            verification_cost: 0.0,
            cost_ccus: None,
        }
    }
}

/// How a repair cost is chosen from the cost table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostPolicy {
    #[default]
    Uniform,
    /// Cycle through the table by repair count
    Index,
}

/// Repair cost table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairCostConfig {
    pub values: Vec<f64>,
    /// Catalog series replacing `values`
    pub file: Option<String>,
    pub policy: CostPolicy,
}

impl Default for RepairCostConfig {
    fn default() -> Self {
        Self {
            values: vec![200.0],
            file: None,
            policy: CostPolicy::Uniform,
        }
    }
}

/// Days between a repair being scheduled and completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairDelayConfig {
    Fixed {
        val: f64,
    },
    /// Uniform pick from a list
    List {
        values: Vec<f64>,
        #[serde(default)]
        min: f64,
    },
    /// Log-normal in days
    Distribution {
        mu: f64,
        sigma: f64,
        #[serde(default)]
        min: f64,
    },
}

impl Default for RepairDelayConfig {
    fn default() -> Self {
        Self::Fixed { val: 14.0 }
    }
}

impl RepairDelayConfig {
    /// Smallest delay the model can produce, in whole days.
    pub fn min_delay(&self) -> u32 {
        let days = match self {
            Self::Fixed { val } => *val,
            Self::List { values, min } => values
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min)
                .max(*min),
            Self::Distribution { min, .. } => *min,
        };
        if days.is_finite() {
            days.max(0.0).round() as u32
        } else {
            0
        }
    }
}

/// Mobile crews travel between sites; stationary sensors are always on site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    #[default]
    Mobile,
    Stationary,
}

/// Unit a measurement resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementScale {
    #[default]
    Component,
    Equipment,
    Site,
}

/// Fixed revisit interval, or one drawn per site from a catalog series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RevisitInterval {
    Days(u32),
    File { file: String },
}

impl Default for RevisitInterval {
    fn default() -> Self {
        Self::Days(0)
    }
}

/// One detection method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodConfig {
    pub label: String,

    pub deployment_type: DeploymentType,

    pub measurement_scale: MeasurementScale,

    /// Only deployed by the follow-up engine
    pub is_follow_up: bool,

    /// Required surveys per site per year (cap)
    #[serde(rename = "RS")]
    pub rs: Option<u32>,

    /// Survey time per site in minutes
    pub time: f64,

    pub t_bw_sites: RevisitInterval,

    pub min_time_bt_surveys: Option<u32>,

    /// Crew workday in hours
    pub max_workday: f64,

    pub n_crews: Option<u32>,

    /// Days between a detection and its release to the follow-up engine
    pub reporting_delay: u32,

    pub coverage: CoverageConfig,

    pub scheduling: SchedulingConfig,

    pub sensor: SensorConfig,

    pub follow_up: Option<FollowUpConfig>,

    pub cost: CostConfig,

    pub consider_weather: bool,

    pub weather_envs: WeatherEnvelope,
}

impl Default for MethodConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            deployment_type: DeploymentType::Mobile,
            measurement_scale: MeasurementScale::Component,
            is_follow_up: false,
            rs: None,
            time: 60.0,
            t_bw_sites: RevisitInterval::default(),
            min_time_bt_surveys: None,
            max_workday: 8.0,
            n_crews: None,
            reporting_delay: 0,
            coverage: CoverageConfig::default(),
            scheduling: SchedulingConfig::default(),
            sensor: SensorConfig::default(),
            follow_up: None,
            cost: CostConfig::default(),
            consider_weather: false,
            weather_envs: WeatherEnvelope::default(),
        }
    }
}

impl MethodConfig {
    /// Creates a method with default settings.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Minimum days between two surveys of the same site, before any
    /// per-site file-driven interval is applied.
    pub fn fixed_revisit_days(&self) -> u32 {
        let t_bw = match &self.t_bw_sites {
            RevisitInterval::Days(d) => *d,
            RevisitInterval::File { .. } => 0,
        };
        t_bw.max(self.min_time_bt_surveys.unwrap_or(0))
    }
}

/// Coverage fractions in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub spatial: f64,
    pub temporal: f64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            spatial: 1.0,
            temporal: 1.0,
        }
    }
}

/// Deployment calendar and crew routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Months (1-12) the method deploys; empty means all
    pub deployment_months: Vec<u32>,

    /// Years the method deploys; empty means all
    pub deployment_years: Vec<i32>,

    pub route_planning: bool,

    /// Catalog name of crew home bases
    pub home_bases_file: Option<String>,

    #[serde(rename = "LDAR_crew_init_location")]
    pub crew_init_location: Option<Coordinates>,

    /// Crew travel speed in km/h
    pub travel_speed: f64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            deployment_months: Vec::new(),
            deployment_years: Vec::new(),
            route_planning: false,
            home_bases_file: None,
            crew_init_location: None,
            travel_speed: 60.0,
        }
    }
}

/// Minimum detection limit: a bare threshold or `[threshold, steepness]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MdlSpec {
    Single(f64),
    Params(Vec<f64>),
}

impl MdlSpec {
    /// Detection threshold in g/s.
    pub fn threshold(&self) -> Option<f64> {
        match self {
            Self::Single(v) => Some(*v),
            Self::Params(p) => p.first().copied(),
        }
    }

    /// Optional curve steepness.
    pub fn steepness(&self) -> Option<f64> {
        match self {
            Self::Single(_) => None,
            Self::Params(p) => p.get(1).copied(),
        }
    }
}

/// Sensor model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Detection curve name
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "MDL")]
    pub mdl: MdlSpec,

    /// Quantification error: relative standard deviation of reported rates
    #[serde(rename = "QE")]
    pub qe: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: "default".to_string(),
            mdl: MdlSpec::Single(0.01),
            qe: 0.0,
        }
    }
}

/// Absolute g/s, or a share of the day's flagged emissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    #[default]
    Absolute,
    Relative,
}

/// Horizon the follow-up cut-off is measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinFollowUpType {
    #[default]
    Absolute,
    Annual,
}

/// How repeated flags for a site awaiting follow-up are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedundancyFilter {
    #[default]
    Recent,
    Max,
    Average,
}

/// Which selection rule filters and which only ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionPriority {
    #[default]
    Threshold,
    Proportion,
}

/// Follow-up rule set attached to a screening method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowUpConfig {
    pub threshold: f64,
    pub threshold_type: ThresholdType,
    pub instant_threshold: Option<f64>,
    pub instant_threshold_type: ThresholdType,
    pub preferred_method: Option<String>,
    /// Days between a flag being kept and the follow-up being due
    pub delay: u32,
    pub proportion: f64,
    pub min_followup_days_to_end: u32,
    pub min_followup_type: MinFollowUpType,
    pub redundancy_filter: RedundancyFilter,
    pub sort_by_rate: bool,
    pub interaction_priority: InteractionPriority,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            threshold_type: ThresholdType::Absolute,
            instant_threshold: None,
            instant_threshold_type: ThresholdType::Absolute,
            preferred_method: None,
            delay: 0,
            proportion: 1.0,
            min_followup_days_to_end: 0,
            min_followup_type: MinFollowUpType::Absolute,
            redundancy_filter: RedundancyFilter::Recent,
            sort_by_rate: true,
            interaction_priority: InteractionPriority::Threshold,
        }
    }
}

/// Survey cost schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub per_day: f64,
    pub per_hour: f64,
    pub per_site: f64,
    pub upfront: f64,
}

/// Inclusive `[min, max]` ranges a mobile crew can work in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherEnvelope {
    /// Celsius
    pub temp: [f64; 2],
    /// m/s
    pub wind: [f64; 2],
    /// mm/day
    pub precip: [f64; 2],
}

impl Default for WeatherEnvelope {
    fn default() -> Self {
        Self {
            temp: [-30.0, 40.0],
            wind: [0.0, 10.0],
            precip: [0.0, 1.0],
        }
    }
}

impl SimulationConfig {
    /// A configuration with no programs and defaults everywhere else.
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
            n_processes: None,
            n_simulations: default_simulations(),
            base_seed: 0,
            programs: BTreeMap::new(),
            reference_program: None,
            baseline_program: None,
            virtual_world: VirtualWorldConfig::default(),
            input_directory: None,
            output_directory: None,
            outputs: OutputToggles::default(),
            preseed_random: true,
            pregenerate_leaks: true,
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Number of simulated days.
    pub fn horizon_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days()
    }

    /// Checks every field that can be checked without input data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.end_date <= self.start_date {
            return Err(ConfigError::invalid(
                "end_date",
                format!("must be after start_date ({})", self.start_date),
            ));
        }
        if self.n_simulations == 0 {
            return Err(ConfigError::invalid("n_simulations", "must be at least 1"));
        }
        if self.n_processes == Some(0) {
            return Err(ConfigError::invalid("n_processes", "must be at least 1"));
        }
        if self.programs.is_empty() {
            return Err(ConfigError::invalid("programs", "at least one program is required"));
        }
        for (field, name) in [
            ("reference_program", &self.reference_program),
            ("baseline_program", &self.baseline_program),
        ] {
            if let Some(name) = name {
                if !self.programs.contains_key(name) {
                    return Err(ConfigError::invalid(field, format!("unknown program '{}'", name)));
                }
            }
        }

        self.virtual_world.validate("virtual_world")?;

        for (name, program) in &self.programs {
            program.validate(&format!("programs.{}", name))?;
            resolve_follow_ups(name, program)?;
        }
        Ok(())
    }
}

impl VirtualWorldConfig {
    fn validate(&self, path: &str) -> Result<(), ConfigError> {
        check_non_negative(&format!("{}.LPR", path), self.lpr)?;
        self.leak_rate.validate(&format!("{}.leak_rate", path))?;
        for (subtype, cfg) in &self.subtypes {
            let sub_path = format!("{}.subtypes.{}", path, subtype);
            if let Some(lpr) = cfg.lpr {
                check_non_negative(&format!("{}.LPR", sub_path), lpr)?;
            }
            if let Some(rate) = &cfg.leak_rate {
                rate.validate(&format!("{}.leak_rate", sub_path))?;
            }
        }
        Ok(())
    }
}

impl LeakRateConfig {
    fn validate(&self, path: &str) -> Result<(), ConfigError> {
        if let Some(max) = self.max_leak_rate {
            if !(max.is_finite() && max > 0.0) {
                return Err(ConfigError::invalid(
                    format!("{}.max_leak_rate", path),
                    "must be a positive number",
                ));
            }
        }
        match self.source {
            LeakRateSource::Dist => {
                self.dist_type
                    .build(self.dist_scale, &self.dist_shape)
                    .map_err(|msg| ConfigError::invalid(format!("{}.dist_type", path), msg))?;
            }
            LeakRateSource::Sample => {
                if self.samples.is_empty() && self.leak_rates_file.is_none() {
                    return Err(ConfigError::invalid(
                        format!("{}.samples", path),
                        "sample source needs inline samples or leak_rates_file",
                    ));
                }
                if self.samples.iter().any(|v| !v.is_finite() || *v < 0.0) {
                    return Err(ConfigError::invalid(
                        format!("{}.samples", path),
                        "samples must be finite and non-negative",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl ProgramConfig {
    fn validate(&self, path: &str) -> Result<(), ConfigError> {
        let mut labels = HashSet::new();
        for (i, method) in self.methods.iter().enumerate() {
            let m_path = format!("{}.methods[{}]", path, i);
            if !labels.insert(method.label.as_str()) {
                return Err(ConfigError::invalid(
                    format!("{}.label", m_path),
                    format!("duplicate method label '{}'", method.label),
                ));
            }
            method.validate(&m_path)?;
        }

        let econ = &self.economics;
        let e_path = format!("{}.economics", path);
        check_non_negative(&format!("{}.carbon_price_tonnesCO2e", e_path), econ.carbon_price_tonnes_co2e)?;
        check_non_negative(&format!("{}.GWP_CH4", e_path), econ.gwp_ch4)?;
        check_non_negative(&format!("{}.sale_price_natgas", e_path), econ.sale_price_natgas)?;
        check_non_negative(&format!("{}.verification_cost", e_path), econ.verification_cost)?;
        if let Some(ccus) = econ.cost_ccus {
            check_non_negative(&format!("{}.cost_CCUS", e_path), ccus)?;
        }
        let rc = &econ.repair_costs;
        if rc.file.is_none() && rc.values.is_empty() {
            return Err(ConfigError::invalid(
                format!("{}.repair_costs.values", e_path),
                "needs at least one cost or a cost file",
            ));
        }
        for v in &rc.values {
            check_non_negative(&format!("{}.repair_costs.values", e_path), *v)?;
        }

        let d_path = format!("{}.repair_delay", path);
        match &self.repair_delay {
            RepairDelayConfig::Fixed { val } => check_non_negative(&format!("{}.val", d_path), *val)?,
            RepairDelayConfig::List { values, min } => {
                if values.is_empty() {
                    return Err(ConfigError::invalid(format!("{}.values", d_path), "must not be empty"));
                }
                for v in values {
                    check_non_negative(&format!("{}.values", d_path), *v)?;
                }
                check_non_negative(&format!("{}.min", d_path), *min)?;
            }
            RepairDelayConfig::Distribution { mu, sigma, min } => {
                if !mu.is_finite() || !(sigma.is_finite() && *sigma >= 0.0) {
                    return Err(ConfigError::invalid(
                        d_path.clone(),
                        "mu must be finite and sigma non-negative",
                    ));
                }
                check_non_negative(&format!("{}.min", d_path), *min)?;
            }
        }
        Ok(())
    }
}

impl MethodConfig {
    fn validate(&self, path: &str) -> Result<(), ConfigError> {
        if self.label.trim().is_empty() {
            return Err(ConfigError::invalid(format!("{}.label", path), "must not be empty"));
        }
        check_fraction(&format!("{}.coverage.spatial", path), self.coverage.spatial)?;
        check_fraction(&format!("{}.coverage.temporal", path), self.coverage.temporal)?;
        check_non_negative(&format!("{}.time", path), self.time)?;
        if !(self.max_workday.is_finite() && self.max_workday > 0.0) {
            return Err(ConfigError::invalid(format!("{}.max_workday", path), "must be positive"));
        }
        if self.n_crews == Some(0) {
            return Err(ConfigError::invalid(format!("{}.n_crews", path), "must be at least 1 or null"));
        }
        if let Some(m) = self.scheduling.deployment_months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(ConfigError::invalid(
                format!("{}.scheduling.deployment_months", path),
                format!("{} is not a month", m),
            ));
        }
        let speed = self.scheduling.travel_speed;
        if !(speed.is_finite() && speed > 0.0) {
            return Err(ConfigError::invalid(
                format!("{}.scheduling.travel_speed", path),
                "must be positive",
            ));
        }
        if let Some(loc) = self.scheduling.crew_init_location {
            if !loc.is_valid() {
                return Err(ConfigError::invalid(
                    format!("{}.scheduling.LDAR_crew_init_location", path),
                    "invalid coordinates",
                ));
            }
        }

        match self.sensor.mdl.threshold() {
            Some(mdl) if mdl.is_finite() && mdl > 0.0 => {}
            _ => {
                return Err(ConfigError::invalid(
                    format!("{}.sensor.MDL", path),
                    "must be a positive detection limit",
                ))
            }
        }
        if let Some(k) = self.sensor.mdl.steepness() {
            if !(k.is_finite() && k > 0.0) {
                return Err(ConfigError::invalid(format!("{}.sensor.MDL", path), "steepness must be positive"));
            }
        }
        check_non_negative(&format!("{}.sensor.QE", path), self.sensor.qe)?;

        for (name, range) in [
            ("temp", self.weather_envs.temp),
            ("wind", self.weather_envs.wind),
            ("precip", self.weather_envs.precip),
        ] {
            if range[0] > range[1] {
                return Err(ConfigError::invalid(
                    format!("{}.weather_envs.{}", path, name),
                    "min exceeds max",
                ));
            }
        }

        let c_path = format!("{}.cost", path);
        check_non_negative(&format!("{}.per_day", c_path), self.cost.per_day)?;
        check_non_negative(&format!("{}.per_hour", c_path), self.cost.per_hour)?;
        check_non_negative(&format!("{}.per_site", c_path), self.cost.per_site)?;
        check_non_negative(&format!("{}.upfront", c_path), self.cost.upfront)?;

        if let Some(rule) = &self.follow_up {
            let f_path = format!("{}.follow_up", path);
            check_non_negative(&format!("{}.threshold", f_path), rule.threshold)?;
            if rule.threshold_type == ThresholdType::Relative {
                check_fraction(&format!("{}.threshold", f_path), rule.threshold)?;
            }
            if let Some(instant) = rule.instant_threshold {
                check_non_negative(&format!("{}.instant_threshold", f_path), instant)?;
                if rule.instant_threshold_type == ThresholdType::Relative {
                    check_fraction(&format!("{}.instant_threshold", f_path), instant)?;
                }
            }
            check_fraction(&format!("{}.proportion", f_path), rule.proportion)?;
        }
        Ok(())
    }
}

/// Resolves every method's follow-up target to a method index.
///
/// Entry `i` is `Some(j)` when method `i` escalates to method `j`, `None`
/// when its detections go straight to repair. Targets must exist, be marked
/// `is_follow_up`, and the resulting chains must be acyclic.
pub fn resolve_follow_ups(program_name: &str, program: &ProgramConfig) -> Result<Vec<Option<usize>>, ConfigError> {
    let path = format!("programs.{}", program_name);
    let index_of = |label: &str| program.methods.iter().position(|m| m.label == label);

    if let Some(default) = &program.follow_up_method {
        match index_of(default) {
            Some(j) if program.methods[j].is_follow_up => {}
            Some(_) => {
                return Err(ConfigError::invalid(
                    format!("{}.follow_up_method", path),
                    format!("'{}' is not marked is_follow_up", default),
                ))
            }
            None => {
                return Err(ConfigError::UnknownFollowUp {
                    path: format!("{}.follow_up_method", path),
                    target: default.clone(),
                })
            }
        }
    }

    let mut targets = Vec::with_capacity(program.methods.len());
    for (i, method) in program.methods.iter().enumerate() {
        let Some(rule) = &method.follow_up else {
            targets.push(None);
            continue;
        };
        let rule_path = format!("{}.methods[{}].follow_up.preferred_method", path, i);
        let label = rule
            .preferred_method
            .as_ref()
            .or(program.follow_up_method.as_ref())
            .ok_or_else(|| {
                ConfigError::invalid(rule_path.clone(), "no preferred_method and no program follow_up_method")
            })?;
        let j = index_of(label).ok_or_else(|| ConfigError::UnknownFollowUp {
            path: rule_path.clone(),
            target: label.clone(),
        })?;
        if !program.methods[j].is_follow_up {
            return Err(ConfigError::invalid(
                rule_path,
                format!("'{}' is not marked is_follow_up", label),
            ));
        }
        targets.push(Some(j));
    }

    // Each method has at most one successor, so a walk longer than the
    // method count must revisit a node.
    for start in 0..targets.len() {
        let mut seen = vec![false; targets.len()];
        let mut cursor = Some(start);
        while let Some(i) = cursor {
            if seen[i] {
                return Err(ConfigError::FollowUpCycle {
                    program: program_name.to_string(),
                    method: program.methods[i].label.clone(),
                });
            }
            seen[i] = true;
            cursor = targets[i];
        }
    }

    Ok(targets)
}

fn check_non_negative(path: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(path, format!("must be finite and non-negative, got {}", value)))
    }
}

fn check_fraction(path: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(path, format!("must be within [0, 1], got {}", value)))
    }
}
