//! Append-only event records.

use crate::world::LeakId;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One site visit by one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyEvent {
    pub day: u32,
    pub date: NaiveDate,
    pub method: String,
    pub site: usize,
    pub facility_id: String,
    pub crew: Option<u32>,
    /// Visit requested by the follow-up engine
    pub follow_up: bool,
    /// Leaks the sensor covered
    pub observed: Vec<LeakId>,
    pub detected: Vec<LeakId>,
    /// Reported rate per entry of `detected`, g/s
    pub reported_rates: Vec<f64>,
    pub site_reported_rate: f64,
    pub survey_minutes: f64,
    pub travel_minutes: f64,
    pub cost: Decimal,
}

/// One completed repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairEvent {
    pub leak: LeakId,
    pub site: usize,
    pub detection_day: u32,
    pub scheduled_day: u32,
    pub completed_day: u32,
    pub repair_cost: Decimal,
    pub verification_cost: Decimal,
    /// `repair_cost + verification_cost`
    pub total_cost: Decimal,
}
