//! Virtual world: sites, leak generation and emission accrual.
//!
//! Leaks are spawned from a [`LeakSupply`]. A pregenerated supply replays a
//! timeline drawn once per replicate; an incremental supply draws each day
//! from its own stream. Both consume the stream site-by-site, day-by-day, so
//! for the same seed they yield the same leak population.

use crate::audit::AuditLog;
use crate::clock::{Clock, SimDay};
use crate::config::{LeakRateConfig, LeakRateSource, VirtualWorldConfig};
use crate::distributions::{daily_mass_kg, draw_leak_rate, EmpiricalSampler, LeakRateSampler, ParametricSampler};
use crate::error::{ConfigError, SimError};
use chrono::NaiveDate;
use ldar_env::{Coordinates, EnvError, InputCatalog, SiteRecord};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Leak identifier, unique within one program's world.
pub type LeakId = u64;

/// An immutable facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Position in the site table
    pub index: usize,
    pub facility_id: String,
    pub location: Coordinates,
    pub subtype: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub equipment_groups: u32,
}

impl Site {
    pub fn from_record(index: usize, record: &SiteRecord) -> Self {
        Self {
            index,
            facility_id: record.facility_id.clone(),
            location: record.coordinates(),
            subtype: record.subtype.clone(),
            start_date: record.start_date,
            end_date: record.end_date,
            equipment_groups: record.equipment_groups.max(1),
        }
    }

    /// True when `date` is inside the site's active range (both ends inclusive).
    pub fn is_active(&self, date: NaiveDate) -> bool {
        self.start_date.map_or(true, |s| date >= s) && self.end_date.map_or(true, |e| date <= e)
    }
}

/// Builds the site table from catalog records.
pub fn load_sites(records: &[SiteRecord]) -> Result<Arc<[Site]>, EnvError> {
    if records.is_empty() {
        return Err(EnvError::MissingInput("site registry is empty".to_string()));
    }
    Ok(records
        .iter()
        .enumerate()
        .map(|(i, r)| Site::from_record(i, r))
        .collect())
}

/// Lifecycle of a leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakState {
    Undetected,
    PendingFollowUp,
    FollowUpConfirmed,
    RepairScheduled,
    Repaired,
}

/// One leak and its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leak {
    pub id: LeakId,
    pub site: usize,
    pub equipment: u32,
    pub created_day: u32,
    /// True emission rate in g/s
    pub rate_gps: f64,
    /// Cumulative emitted mass in kg
    pub emitted_kg: f64,
    pub state: LeakState,
    pub first_detected_day: Option<u32>,
    pub detected_by: Option<String>,
    pub repair_scheduled_day: Option<u32>,
    pub repair_day: Option<u32>,
}

impl Leak {
    pub fn is_repaired(&self) -> bool {
        self.state == LeakState::Repaired
    }

    /// True while the leak exists and still emits on `day`.
    pub fn is_emitting(&self, day: u32) -> bool {
        !self.is_repaired() && self.created_day <= day
    }
}

/// A leak to be created on `day`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakSpawn {
    pub day: u32,
    pub site: usize,
    pub equipment: u32,
    pub rate_gps: f64,
}

#[derive(Debug, Clone)]
struct LeakModel {
    poisson: Option<Poisson<f64>>,
    sampler: Arc<dyn LeakRateSampler>,
}

impl LeakModel {
    fn new(lpr: f64, sampler: Arc<dyn LeakRateSampler>) -> Result<Self, String> {
        let poisson = if lpr > 0.0 {
            Some(Poisson::new(lpr).map_err(|e| e.to_string())?)
        } else {
            None
        };
        Ok(Self { poisson, sampler })
    }
}

/// Draws new leaks per active site per day.
#[derive(Debug, Clone)]
pub struct LeakGenerator {
    default: LeakModel,
    subtypes: HashMap<String, LeakModel>,
}

impl LeakGenerator {
    /// One model for every site.
    pub fn new(lpr: f64, sampler: Arc<dyn LeakRateSampler>) -> Result<Self, ConfigError> {
        Ok(Self {
            default: LeakModel::new(lpr, sampler).map_err(|e| ConfigError::invalid("virtual_world.LPR", e))?,
            subtypes: HashMap::new(),
        })
    }

    /// Builds the default and per-subtype models, reading sample series
    /// from the catalog where configured.
    pub fn from_config(cfg: &VirtualWorldConfig, catalog: &dyn InputCatalog) -> Result<Self, SimError> {
        let default_sampler = build_sampler(&cfg.leak_rate, "virtual_world.leak_rate", catalog)?;
        let mut generator = Self::new(cfg.lpr, Arc::clone(&default_sampler))?;

        for (name, sub) in &cfg.subtypes {
            let path = format!("virtual_world.subtypes.{}", name);
            let sampler = match &sub.leak_rate {
                Some(rate) => build_sampler(rate, &format!("{}.leak_rate", path), catalog)?,
                None => Arc::clone(&default_sampler),
            };
            let model = LeakModel::new(sub.lpr.unwrap_or(cfg.lpr), sampler)
                .map_err(|e| ConfigError::invalid(format!("{}.LPR", path), e))?;
            generator.subtypes.insert(name.clone(), model);
        }
        Ok(generator)
    }

    fn model_for(&self, site: &Site) -> &LeakModel {
        site.subtype
            .as_ref()
            .and_then(|s| self.subtypes.get(s))
            .unwrap_or(&self.default)
    }

    /// Draws the leaks created on `day`, in site order.
    pub fn spawn_day(&self, sites: &[Site], day: SimDay, rng: &mut ChaCha8Rng, audit: &mut AuditLog) -> Vec<LeakSpawn> {
        let mut spawns = Vec::new();
        for site in sites.iter().filter(|s| s.is_active(day.date)) {
            let model = self.model_for(site);
            let Some(poisson) = &model.poisson else {
                continue;
            };
            let count = poisson.sample(rng) as u64;
            for _ in 0..count {
                let equipment = rng.gen_range(0..site.equipment_groups);
                let rate_gps = draw_leak_rate(model.sampler.as_ref(), rng, audit, day.index);
                spawns.push(LeakSpawn {
                    day: day.index,
                    site: site.index,
                    equipment,
                    rate_gps,
                });
            }
        }
        spawns
    }

    /// Draws the whole horizon up front.
    pub fn pregenerate(
        &self,
        sites: &[Site],
        clock: &Clock,
        rng: &mut ChaCha8Rng,
        audit: &mut AuditLog,
    ) -> LeakTimeline {
        let mut spawns = Vec::new();
        let mut offsets = Vec::with_capacity(clock.n_days() as usize + 1);
        for day in clock.days() {
            offsets.push(spawns.len());
            spawns.extend(self.spawn_day(sites, day, rng, audit));
        }
        offsets.push(spawns.len());
        debug!("Pregenerated {} leaks over {} days", spawns.len(), clock.n_days());
        LeakTimeline { spawns, offsets }
    }
}

fn build_sampler(
    cfg: &LeakRateConfig,
    path: &str,
    catalog: &dyn InputCatalog,
) -> Result<Arc<dyn LeakRateSampler>, SimError> {
    match cfg.source {
        LeakRateSource::Dist => {
            let dist = cfg
                .dist_type
                .build(cfg.dist_scale, &cfg.dist_shape)
                .map_err(|e| ConfigError::invalid(format!("{}.dist_type", path), e))?;
            Ok(Arc::new(ParametricSampler::new(dist, cfg.units, cfg.max_leak_rate)))
        }
        LeakRateSource::Sample => {
            let values = match &cfg.leak_rates_file {
                Some(file) => catalog.series(file)?,
                None => cfg.samples.clone(),
            };
            if values.iter().any(|v| *v < 0.0) {
                return Err(EnvError::malformed(
                    cfg.leak_rates_file.as_deref().unwrap_or(path),
                    "negative leak rate in sample set",
                )
                .into());
            }
            let sampler = EmpiricalSampler::new(values, cfg.units, cfg.max_leak_rate).ok_or_else(|| {
                EnvError::malformed(cfg.leak_rates_file.as_deref().unwrap_or(path), "empty leak rate sample set")
            })?;
            Ok(Arc::new(sampler))
        }
    }
}

/// Leak spawns for a whole horizon, grouped by day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeakTimeline {
    spawns: Vec<LeakSpawn>,
    offsets: Vec<usize>,
}

impl LeakTimeline {
    /// Spawns for day `index`; empty outside the horizon.
    pub fn for_day(&self, index: u32) -> &[LeakSpawn] {
        let i = index as usize;
        match (self.offsets.get(i), self.offsets.get(i + 1)) {
            (Some(&a), Some(&b)) => &self.spawns[a..b],
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.spawns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spawns.is_empty()
    }

    pub fn spawns(&self) -> &[LeakSpawn] {
        &self.spawns
    }
}

/// Where a world's new leaks come from.
#[derive(Debug, Clone)]
pub enum LeakSupply {
    /// Replay a shared timeline
    Pregenerated(Arc<LeakTimeline>),
    /// Draw day by day from an owned stream
    Incremental {
        generator: Arc<LeakGenerator>,
        rng: ChaCha8Rng,
    },
    /// Only injected leaks
    Manual,
}

/// Sites plus the leaks of one program in one replicate.
#[derive(Debug, Clone)]
pub struct VirtualWorld {
    sites: Arc<[Site]>,
    leaks: Vec<Leak>,
    by_site: Vec<Vec<LeakId>>,
    supply: LeakSupply,
}

impl VirtualWorld {
    pub fn new(sites: Arc<[Site]>, supply: LeakSupply) -> Self {
        let by_site = vec![Vec::new(); sites.len()];
        Self {
            sites,
            leaks: Vec::new(),
            by_site,
            supply,
        }
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn site(&self, index: usize) -> Option<&Site> {
        self.sites.get(index)
    }

    /// Creates the day's new leaks. Returns how many were created.
    pub fn spawn_day(&mut self, day: SimDay, audit: &mut AuditLog) -> usize {
        let spawns = match &mut self.supply {
            LeakSupply::Pregenerated(timeline) => timeline.for_day(day.index).to_vec(),
            LeakSupply::Incremental { generator, rng } => generator.spawn_day(&self.sites, day, rng, audit),
            LeakSupply::Manual => Vec::new(),
        };
        for spawn in &spawns {
            self.inject_leak(spawn.site, spawn.equipment, spawn.day, spawn.rate_gps);
        }
        spawns.len()
    }

    /// Adds a leak directly.
    ///
    /// # Panics
    /// Panics if `site` is not a valid site index.
    pub fn inject_leak(&mut self, site: usize, equipment: u32, day: u32, rate_gps: f64) -> LeakId {
        let id = self.leaks.len() as LeakId;
        self.leaks.push(Leak {
            id,
            site,
            equipment,
            created_day: day,
            rate_gps,
            emitted_kg: 0.0,
            state: LeakState::Undetected,
            first_detected_day: None,
            detected_by: None,
            repair_scheduled_day: None,
            repair_day: None,
        });
        self.by_site[site].push(id);
        id
    }

    /// Adds one day of emissions to every emitting leak; returns the day's kg.
    pub fn accrue_day(&mut self, day: SimDay) -> f64 {
        let mut total = 0.0;
        for leak in self.leaks.iter_mut().filter(|l| l.is_emitting(day.index)) {
            let kg = daily_mass_kg(leak.rate_gps);
            leak.emitted_kg += kg;
            total += kg;
        }
        total
    }

    pub fn leaks(&self) -> &[Leak] {
        &self.leaks
    }

    pub fn leak(&self, id: LeakId) -> Option<&Leak> {
        self.leaks.get(id as usize)
    }

    pub fn leak_mut(&mut self, id: LeakId) -> Option<&mut Leak> {
        self.leaks.get_mut(id as usize)
    }

    /// Leaks at `site` still emitting on `day`, in creation order.
    pub fn emitting_at(&self, site: usize, day: u32) -> impl Iterator<Item = &Leak> + '_ {
        self.by_site
            .get(site)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.leaks.get(*id as usize))
            .filter(move |l| l.is_emitting(day))
    }

    /// Number of leaks not yet repaired.
    pub fn active_leak_count(&self) -> usize {
        self.leaks.iter().filter(|l| !l.is_repaired()).count()
    }

    pub fn total_emitted_kg(&self) -> f64 {
        self.leaks.iter().map(|l| l.emitted_kg).sum()
    }

    /// Total true rate of leaks still emitting, in g/s.
    pub fn active_rate_gps(&self, day: u32) -> f64 {
        self.leaks.iter().filter(|l| l.is_emitting(day)).map(|l| l.rate_gps).sum()
    }
}
