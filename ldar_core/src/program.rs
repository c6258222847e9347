//! One LDAR program over one replicate.
//!
//! [`ProgramRunner::step`] advances the program by one day:
//!
//! 1. spawn the day's leaks
//! 2. complete repairs due today
//! 3. release delayed detections to the follow-up engine
//! 4. run due follow-up surveys
//! 5. run primary surveys, then release same-day detections
//! 6. accrue emissions
//! 7. record the timeseries row

use crate::audit::AuditLog;
use crate::clock::{Clock, SimDay};
use crate::config::{resolve_follow_ups, MethodConfig, ProgramConfig};
use crate::detection::{DetectionModel, Observation};
use crate::economics::{survey_cost, EconomicsLedger, RepairEconomics};
use crate::error::SimError;
use crate::events::{RepairEvent, SurveyEvent};
use crate::followup::{Flag, FollowUpEngine, FollowUpRequest};
use crate::mix_seed;
use crate::scheduler::{MethodScheduler, Visit};
use crate::world::{Leak, LeakState, VirtualWorld};
use ldar_env::{InputCatalog, WeatherField};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const STREAM_SCHEDULING: u64 = 1;
const STREAM_DETECTION: u64 = 2;
const STREAM_FOLLOW_UP: u64 = 3;
const STREAM_REPAIR: u64 = 4;

/// Per-method totals for one program run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MethodStats {
    pub label: String,
    pub visits: u64,
    pub follow_up_visits: u64,
    pub leaks_detected: u64,
    pub survey_cost: Decimal,
    /// Longest run of days the method could not deploy
    pub longest_idle_gap: usize,
}

/// One timeseries row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub day: u32,
    pub date: chrono::NaiveDate,
    pub new_leaks: usize,
    pub active_leaks: usize,
    pub repairs: usize,
    pub emitted_kg: f64,
    pub cumulative_kg: f64,
    /// Total true rate of emitting leaks at day end, g/s
    pub active_rate_gps: f64,
    pub surveys: usize,
    pub survey_cost: Decimal,
    pub pending_follow_ups: usize,
    pub pending_repairs: usize,
}

/// Everything a finished program run produced.
#[derive(Debug, Clone)]
pub struct ProgramOutcome {
    pub name: String,
    pub leaks: Vec<Leak>,
    pub surveys: Vec<SurveyEvent>,
    pub repairs: Vec<RepairEvent>,
    pub timeseries: Vec<DailyRecord>,
    pub ledger: EconomicsLedger,
    pub methods: Vec<MethodStats>,
}

impl ProgramOutcome {
    /// Recomputes the ledger total from the event log.
    pub fn event_total(&self) -> Decimal {
        let surveys: Decimal = self.surveys.iter().map(|e| e.cost).sum();
        let repairs: Decimal = self.repairs.iter().map(|e| e.total_cost).sum();
        surveys + repairs + self.ledger.carbon_cost + self.ledger.ccus_cost.unwrap_or(Decimal::ZERO)
    }

    /// True when the ledger matches its events exactly.
    pub fn reconciles(&self) -> bool {
        self.ledger.total() == self.event_total()
    }
}

struct MethodRuntime {
    config: MethodConfig,
    detection: DetectionModel,
    scheduler: MethodScheduler,
    rng: ChaCha8Rng,
    visited: bool,
    stats: MethodStats,
}

/// Drives one program's methods, follow-ups and repairs through a replicate.
pub struct ProgramRunner {
    name: String,
    world: VirtualWorld,
    methods: Vec<MethodRuntime>,
    follow_up: FollowUpEngine,
    economics: RepairEconomics,
    surveys: Vec<SurveyEvent>,
    repairs: Vec<RepairEvent>,
    timeseries: Vec<DailyRecord>,
    cumulative_kg: f64,
}

impl ProgramRunner {
    /// Builds the runner. Every random component gets its own stream
    /// derived from `seed`.
    pub fn new(
        name: &str,
        program: &ProgramConfig,
        world: VirtualWorld,
        catalog: &dyn InputCatalog,
        weather: Arc<dyn WeatherField>,
        seed: u64,
    ) -> Result<Self, SimError> {
        let targets = resolve_follow_ups(name, program)?;

        let mut methods = Vec::with_capacity(program.methods.len());
        for (i, config) in program.methods.iter().enumerate() {
            let i = i as u64;
            let scheduler = MethodScheduler::new(
                config,
                world.sites(),
                catalog,
                Arc::clone(&weather),
                mix_seed(mix_seed(seed, STREAM_SCHEDULING), i),
            )?;
            methods.push(MethodRuntime {
                detection: DetectionModel::from_method(config)?,
                scheduler,
                rng: ChaCha8Rng::seed_from_u64(mix_seed(mix_seed(seed, STREAM_DETECTION), i)),
                visited: false,
                stats: MethodStats {
                    label: config.label.clone(),
                    ..MethodStats::default()
                },
                config: config.clone(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            world,
            methods,
            follow_up: FollowUpEngine::new(&program.methods, &targets, mix_seed(seed, STREAM_FOLLOW_UP)),
            economics: RepairEconomics::new(program, catalog, mix_seed(seed, STREAM_REPAIR))?,
            surveys: Vec::new(),
            repairs: Vec::new(),
            timeseries: Vec::new(),
            cumulative_kg: 0.0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn world(&self) -> &VirtualWorld {
        &self.world
    }

    /// Advances the program by one day.
    pub fn step(&mut self, day: SimDay, clock: &Clock, audit: &mut AuditLog) -> Result<(), SimError> {
        let surveys_before = self.surveys.len();

        let new_leaks = self.world.spawn_day(day, audit);

        let completed = self.economics.complete_due(&mut self.world, day.index);
        let repairs_today = completed.len();
        self.repairs.extend(completed);

        self.release_detections(day, clock, audit);
        self.run_follow_ups(day, audit)?;
        self.run_primary(day, audit)?;
        self.release_detections(day, clock, audit);

        let emitted_kg = self.world.accrue_day(day);
        self.cumulative_kg += emitted_kg;

        let todays = &self.surveys[surveys_before..];
        self.timeseries.push(DailyRecord {
            day: day.index,
            date: day.date,
            new_leaks,
            active_leaks: self.world.active_leak_count(),
            repairs: repairs_today,
            emitted_kg,
            cumulative_kg: self.cumulative_kg,
            active_rate_gps: self.world.active_rate_gps(day.index),
            surveys: todays.len(),
            survey_cost: todays.iter().map(|e| e.cost).sum(),
            pending_follow_ups: self.follow_up.pending(),
            pending_repairs: self.economics.pending_repairs(),
        });
        Ok(())
    }

    fn release_detections(&mut self, day: SimDay, clock: &Clock, audit: &mut AuditLog) {
        let confirmed = self.follow_up.release_due(day, clock, &mut self.world, audit);
        if !confirmed.is_empty() {
            self.economics.schedule(&mut self.world, &confirmed, day.index);
        }
    }

    fn run_follow_ups(&mut self, day: SimDay, audit: &mut AuditLog) -> Result<(), SimError> {
        for t in 0..self.methods.len() {
            if !self.methods[t].config.is_follow_up {
                continue;
            }
            let mut requests = self.follow_up.take_due(day.index, t);
            let order: Vec<usize> = requests.iter().map(|r| r.site).collect();
            let (visits, deferred_sites) = self.methods[t]
                .scheduler
                .plan_requested(day, &order, self.world.sites())?;

            let deferred: Vec<FollowUpRequest> = requests
                .iter()
                .filter(|r| deferred_sites.contains(&r.site))
                .cloned()
                .collect();
            requests.retain(|r| !deferred_sites.contains(&r.site));
            self.follow_up.defer(deferred, day.index + 1, audit);

            for visit in visits {
                let Some(pos) = requests.iter().position(|r| r.site == visit.site) else {
                    continue;
                };
                let request = requests.swap_remove(pos);
                let observation = self.survey(t, day, &visit, true, audit);
                let confirmed = self.follow_up.resolve(&request, &observation, day.index, &mut self.world);
                self.methods[t].stats.leaks_detected += confirmed.len() as u64;
                if confirmed.is_empty() {
                    continue;
                }

                if self.follow_up.has_rule(t) {
                    let reported_rate = observation
                        .detected
                        .iter()
                        .filter(|d| confirmed.contains(&d.leak))
                        .map(|d| d.reported_rate)
                        .sum();
                    self.follow_up.report(Flag {
                        site: visit.site,
                        day: day.index,
                        source: t,
                        leaks: confirmed,
                        reported_rate,
                        chained: true,
                    });
                } else {
                    self.economics.schedule(&mut self.world, &confirmed, day.index);
                }
            }
        }
        Ok(())
    }

    fn run_primary(&mut self, day: SimDay, audit: &mut AuditLog) -> Result<(), SimError> {
        for m in 0..self.methods.len() {
            if self.methods[m].config.is_follow_up {
                continue;
            }
            let visits = self.methods[m].scheduler.plan_primary(day, self.world.sites(), audit)?;
            for visit in visits {
                let observation = self.survey(m, day, &visit, false, audit);
                let flagged: Vec<_> = observation
                    .detected
                    .iter()
                    .map(|d| d.leak)
                    .filter(|id| self.world.leak(*id).is_some_and(|l| l.state == LeakState::Undetected))
                    .collect();
                if flagged.is_empty() {
                    continue;
                }
                self.methods[m].stats.leaks_detected += flagged.len() as u64;
                self.follow_up.report(Flag {
                    site: visit.site,
                    day: day.index,
                    source: m,
                    leaks: flagged,
                    reported_rate: observation.site_reported_rate,
                    chained: false,
                });
            }
        }
        Ok(())
    }

    /// Performs one visit: detection, cost and the survey event.
    fn survey(&mut self, m: usize, day: SimDay, visit: &Visit, follow_up: bool, audit: &mut AuditLog) -> Observation {
        let runtime = &mut self.methods[m];
        let observation = runtime
            .detection
            .survey(&self.world, visit.site, day.index, &mut runtime.rng, audit);

        let cost = survey_cost(&runtime.config.cost, visit, !runtime.visited);
        runtime.visited = true;
        runtime.stats.visits += 1;
        if follow_up {
            runtime.stats.follow_up_visits += 1;
        }
        runtime.stats.survey_cost += cost;
        self.economics.charge_survey(cost);

        let facility_id = self
            .world
            .site(visit.site)
            .map(|s| s.facility_id.clone())
            .unwrap_or_default();
        self.surveys.push(SurveyEvent {
            day: day.index,
            date: day.date,
            method: runtime.config.label.clone(),
            site: visit.site,
            facility_id,
            crew: visit.crew,
            follow_up,
            observed: observation.observed.clone(),
            detected: observation.detected_ids(),
            reported_rates: observation.detected.iter().map(|d| d.reported_rate).collect(),
            site_reported_rate: observation.site_reported_rate,
            survey_minutes: visit.survey_minutes,
            travel_minutes: visit.travel_minutes,
            cost,
        });
        observation
    }

    /// Closes the books.
    ///
    /// # Errors
    /// `SimError::Numerical` if emissions are not finite and non-negative.
    pub fn finish(self) -> Result<ProgramOutcome, SimError> {
        let emitted_kg = self.world.total_emitted_kg();
        if !emitted_kg.is_finite() || emitted_kg < 0.0 {
            return Err(SimError::numerical(format!(
                "program {} emitted a non-physical {} kg",
                self.name, emitted_kg
            )));
        }
        let methods = self
            .methods
            .into_iter()
            .map(|rt| MethodStats {
                longest_idle_gap: rt.scheduler.longest_idle_gap(),
                ..rt.stats
            })
            .collect();
        let ledger = self.economics.close(emitted_kg);
        info!(
            program = %self.name,
            surveys = self.surveys.len(),
            repairs = self.repairs.len(),
            emitted_kg,
            total_cost = %ledger.total(),
            "Program finished"
        );
        debug!(program = %self.name, leaks = self.world.leaks().len(), "Closing world");

        Ok(ProgramOutcome {
            name: self.name,
            leaks: self.world.leaks().to_vec(),
            surveys: self.surveys,
            repairs: self.repairs,
            timeseries: self.timeseries,
            ledger,
            methods,
        })
    }
}
