//! Repair scheduling and the program cost ledger.
//!
//! Money is held as [`Decimal`] and every ledger line is the exact sum of
//! the events that produced it, so a program's total reconciles with its
//! event log to the last digit.

use crate::config::{CostConfig, CostPolicy, EconomicsConfig, ProgramConfig};
use crate::distributions::{kg_to_mcf, RepairDelay};
use crate::error::{ConfigError, SimError};
use crate::events::RepairEvent;
use crate::scheduler::Visit;
use crate::world::{LeakId, LeakState, VirtualWorld};
use ldar_env::{EnvError, InputCatalog};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Decimal places kept on every monetary amount.
pub const MONEY_DP: u32 = 4;

/// Converts a float amount to money, rounded to [`MONEY_DP`].
pub fn money(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO).round_dp(MONEY_DP)
}

/// Cost of one visit.
///
/// `per_site` always; `per_hour` for survey plus travel time; `per_day` on
/// the visit that opens a crew-day; `upfront` on the method's first visit.
pub fn survey_cost(cost: &CostConfig, visit: &Visit, first_visit: bool) -> Decimal {
    let hours = (visit.survey_minutes + visit.travel_minutes) / 60.0;
    let mut total = money(cost.per_site) + money(cost.per_hour * hours);
    if visit.opens_crew_day {
        total += money(cost.per_day);
    }
    if first_visit {
        total += money(cost.upfront);
    }
    total
}

/// Emissions-derived costs for a mass of methane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmissionCosts {
    pub carbon: Decimal,
    pub ccus: Option<Decimal>,
    pub gas_value: Decimal,
}

impl EmissionCosts {
    pub fn for_mass(econ: &EconomicsConfig, emitted_kg: f64) -> Self {
        let tonnes_co2e = emitted_kg / 1_000.0 * econ.gwp_ch4;
        Self {
            carbon: money(tonnes_co2e * econ.carbon_price_tonnes_co2e),
            ccus: econ.cost_ccus.map(|c| money(tonnes_co2e * c)),
            gas_value: money(kg_to_mcf(emitted_kg) * econ.sale_price_natgas),
        }
    }
}

/// Per-program, per-replicate cost totals.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EconomicsLedger {
    pub survey_cost: Decimal,
    /// Repair plus verification
    pub repair_cost: Decimal,
    pub carbon_cost: Decimal,
    pub ccus_cost: Option<Decimal>,
    /// Informational; not part of the total
    pub gas_value_lost: Decimal,
    pub emitted_kg: f64,
}

impl EconomicsLedger {
    pub fn total(&self) -> Decimal {
        self.survey_cost + self.repair_cost + self.carbon_cost + self.ccus_cost.unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy)]
struct ScheduledRepair {
    leak: LeakId,
    detection_day: u32,
    scheduled_day: u32,
    due_day: u32,
}

/// Schedules repairs, completes them and keeps the ledger.
#[derive(Debug)]
pub struct RepairEconomics {
    delay: RepairDelay,
    costs: Vec<Decimal>,
    policy: CostPolicy,
    verification: Decimal,
    econ: EconomicsConfig,
    scheduled: Vec<ScheduledRepair>,
    completed: usize,
    rng: ChaCha8Rng,
    ledger: EconomicsLedger,
}

impl RepairEconomics {
    /// Builds the repair model; a cost file is read from the catalog.
    pub fn new(program: &ProgramConfig, catalog: &dyn InputCatalog, seed: u64) -> Result<Self, SimError> {
        let econ = &program.economics;
        let values = match &econ.repair_costs.file {
            Some(file) => {
                let series = catalog.series(file)?;
                if series.is_empty() || series.iter().any(|v| *v < 0.0) {
                    let reason = "repair costs must be non-empty and non-negative";
                    return Err(EnvError::malformed(file.as_str(), reason).into());
                }
                series
            }
            None => econ.repair_costs.values.clone(),
        };
        if values.is_empty() {
            return Err(ConfigError::invalid("economics.repair_costs.values", "must not be empty").into());
        }
        let delay = RepairDelay::from_config(&program.repair_delay)
            .map_err(|e| ConfigError::invalid("repair_delay", e))?;

        Ok(Self {
            delay,
            costs: values.into_iter().map(money).collect(),
            policy: econ.repair_costs.policy,
            verification: money(econ.verification_cost),
            econ: econ.clone(),
            scheduled: Vec::new(),
            completed: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            ledger: EconomicsLedger::default(),
        })
    }

    /// Moves confirmed leaks to `repair_scheduled` and draws their completion day.
    pub fn schedule(&mut self, world: &mut VirtualWorld, leaks: &[LeakId], day: u32) -> usize {
        let mut count = 0;
        for &id in leaks {
            let Some(leak) = world.leak_mut(id) else {
                continue;
            };
            if matches!(leak.state, LeakState::RepairScheduled | LeakState::Repaired) {
                continue;
            }
            let due_day = day.saturating_add(self.delay.draw_days(&mut self.rng));
            leak.state = LeakState::RepairScheduled;
            leak.repair_scheduled_day = Some(day);
            self.scheduled.push(ScheduledRepair {
                leak: id,
                detection_day: leak.first_detected_day.unwrap_or(day),
                scheduled_day: day,
                due_day,
            });
            count += 1;
        }
        count
    }

    /// Completes the repairs due by `day`, in scheduling order.
    pub fn complete_due(&mut self, world: &mut VirtualWorld, day: u32) -> Vec<RepairEvent> {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|r| r.due_day <= day);
        self.scheduled = pending;

        let mut events = Vec::with_capacity(due.len());
        for repair in due {
            let Some(leak) = world.leak_mut(repair.leak) else {
                continue;
            };
            leak.state = LeakState::Repaired;
            leak.repair_day = Some(day);

            let repair_cost = self.next_cost();
            let total_cost = repair_cost + self.verification;
            self.ledger.repair_cost += total_cost;
            events.push(RepairEvent {
                leak: repair.leak,
                site: leak.site,
                detection_day: repair.detection_day,
                scheduled_day: repair.scheduled_day,
                completed_day: day,
                repair_cost,
                verification_cost: self.verification,
                total_cost,
            });
        }
        if !events.is_empty() {
            debug!(day, repaired = events.len(), "Completed repairs");
        }
        events
    }

    fn next_cost(&mut self) -> Decimal {
        let i = match self.policy {
            CostPolicy::Uniform => self.rng.gen_range(0..self.costs.len()),
            CostPolicy::Index => self.completed % self.costs.len(),
        };
        self.completed += 1;
        self.costs[i]
    }

    pub fn charge_survey(&mut self, cost: Decimal) {
        self.ledger.survey_cost += cost;
    }

    /// Repairs scheduled but not yet completed.
    pub fn pending_repairs(&self) -> usize {
        self.scheduled.len()
    }

    pub fn ledger(&self) -> &EconomicsLedger {
        &self.ledger
    }

    /// Prices the program's total emissions and returns the final ledger.
    pub fn close(mut self, emitted_kg: f64) -> EconomicsLedger {
        let costs = EmissionCosts::for_mass(&self.econ, emitted_kg);
        self.ledger.carbon_cost = costs.carbon;
        self.ledger.ccus_cost = costs.ccus;
        self.ledger.gas_value_lost = costs.gas_value;
        self.ledger.emitted_kg = emitted_kg;
        self.ledger
    }
}
