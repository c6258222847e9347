//! Detection model: which leaks a visit observes, detects and reports.
//!
//! A visit first decides coverage (which units the sensor sees at all), then
//! evaluates each covered unit against the method's [`DetectionCurve`], and
//! finally perturbs the reported rate of every detected unit by the
//! quantification error. True rates are never modified.

use crate::audit::{AuditKind, AuditLog};
use crate::config::{MeasurementScale, MethodConfig, SensorConfig};
use crate::error::ConfigError;
use crate::world::{Leak, LeakId, VirtualWorld};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::fmt::Debug;
use std::sync::Arc;

/// Default steepness of the logistic curve.
pub const DEFAULT_LOGISTIC_STEEPNESS: f64 = 4.0;

/// Probability of detecting an emission source of a given rate.
pub trait DetectionCurve: Send + Sync + Debug {
    /// Detection probability for a source emitting `rate_gps`, in [0, 1].
    fn probability(&self, rate_gps: f64) -> f64;

    fn name(&self) -> &'static str;
}

/// Certain detection at or above the MDL, none below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCurve {
    pub mdl: f64,
}

impl DetectionCurve for StepCurve {
    fn probability(&self, rate_gps: f64) -> f64 {
        if rate_gps >= self.mdl {
            1.0
        } else {
            0.0
        }
    }

    fn name(&self) -> &'static str {
        "step"
    }
}

/// Logistic in log-rate, centred on the MDL: p(MDL) = 0.5.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogisticCurve {
    pub mdl: f64,
    pub steepness: f64,
}

impl DetectionCurve for LogisticCurve {
    fn probability(&self, rate_gps: f64) -> f64 {
        if rate_gps <= 0.0 {
            return 0.0;
        }
        let x = self.steepness * (rate_gps.ln() - self.mdl.ln());
        1.0 / (1.0 + (-x).exp())
    }

    fn name(&self) -> &'static str {
        "logistic"
    }
}

/// Picks the curve named by `sensor.type`.
pub fn curve_for(sensor: &SensorConfig) -> Result<Arc<dyn DetectionCurve>, ConfigError> {
    let mdl = sensor
        .mdl
        .threshold()
        .ok_or_else(|| ConfigError::invalid("sensor.MDL", "missing detection limit"))?;
    match sensor.kind.as_str() {
        "default" | "step" => Ok(Arc::new(StepCurve { mdl })),
        "logistic" | "ogi_camera" => Ok(Arc::new(LogisticCurve {
            mdl,
            steepness: sensor.mdl.steepness().unwrap_or(DEFAULT_LOGISTIC_STEEPNESS),
        })),
        other => Err(ConfigError::invalid("sensor.type", format!("unknown sensor type '{}'", other))),
    }
}

/// A detected leak and the rate the sensor reported for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedLeak {
    pub leak: LeakId,
    pub reported_rate: f64,
}

/// Result of one visit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Leaks the sensor covered
    pub observed: Vec<LeakId>,
    pub detected: Vec<DetectedLeak>,
    /// Sum of reported rates of detected units
    pub site_reported_rate: f64,
}

impl Observation {
    pub fn detected_ids(&self) -> Vec<LeakId> {
        self.detected.iter().map(|d| d.leak).collect()
    }
}

/// Per-method detection model.
#[derive(Debug, Clone)]
pub struct DetectionModel {
    curve: Arc<dyn DetectionCurve>,
    scale: MeasurementScale,
    spatial: f64,
    qe: f64,
}

impl DetectionModel {
    pub fn new(curve: Arc<dyn DetectionCurve>, scale: MeasurementScale, spatial: f64, qe: f64) -> Self {
        Self {
            curve,
            scale,
            spatial,
            qe,
        }
    }

    pub fn from_method(method: &MethodConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            curve_for(&method.sensor)?,
            method.measurement_scale,
            method.coverage.spatial,
            method.sensor.qe,
        ))
    }

    pub fn curve(&self) -> &dyn DetectionCurve {
        self.curve.as_ref()
    }

    /// Surveys `site` on `day`.
    ///
    /// Every leak emitting at the site is a candidate, whatever its state;
    /// the follow-up engine decides what a detection means for each state.
    pub fn survey(
        &self,
        world: &VirtualWorld,
        site: usize,
        day: u32,
        rng: &mut ChaCha8Rng,
        audit: &mut AuditLog,
    ) -> Observation {
        let leaks: Vec<&Leak> = world.emitting_at(site, day).collect();
        let mut obs = Observation::default();
        if leaks.is_empty() {
            return obs;
        }

        let units: Vec<Vec<&Leak>> = match self.scale {
            MeasurementScale::Component => leaks.into_iter().map(|l| vec![l]).collect(),
            MeasurementScale::Equipment => {
                let groups = world.site(site).map_or(1, |s| s.equipment_groups);
                (0..groups)
                    .map(|g| leaks.iter().copied().filter(|l| l.equipment == g).collect::<Vec<_>>())
                    .filter(|unit| !unit.is_empty())
                    .collect()
            }
            MeasurementScale::Site => vec![leaks],
        };

        for unit in units {
            if !rng.gen_bool(self.spatial) {
                continue;
            }
            obs.observed.extend(unit.iter().map(|l| l.id));

            let unit_rate: f64 = unit.iter().map(|l| l.rate_gps).sum();
            let p = self.curve.probability(unit_rate).clamp(0.0, 1.0);
            if !rng.gen_bool(p) {
                continue;
            }

            let factor = self.qe_factor(rng, audit, day);
            for leak in unit {
                let reported_rate = leak.rate_gps * factor;
                obs.site_reported_rate += reported_rate;
                obs.detected.push(DetectedLeak {
                    leak: leak.id,
                    reported_rate,
                });
            }
        }
        obs
    }

    fn qe_factor(&self, rng: &mut ChaCha8Rng, audit: &mut AuditLog, day: u32) -> f64 {
        if self.qe == 0.0 {
            return 1.0;
        }
        let z: f64 = StandardNormal.sample(rng);
        let factor = 1.0 + self.qe * z;
        if factor < 0.0 {
            audit.record(
                day,
                AuditKind::SamplingRecovered,
                format!("negative quantification factor {:.3} clamped to 0", factor),
            );
            return 0.0;
        }
        factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MdlSpec;
    use crate::world::{load_sites, LeakSupply};
    use ldar_env::SiteRecord;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn world(groups: u32) -> VirtualWorld {
        let mut record = SiteRecord::new("F-1", 51.0, -114.0);
        record.equipment_groups = groups;
        VirtualWorld::new(load_sites(&[record]).unwrap(), LeakSupply::Manual)
    }

    fn step_model(scale: MeasurementScale, spatial: f64, qe: f64) -> DetectionModel {
        DetectionModel::new(Arc::new(StepCurve { mdl: 1.0 }), scale, spatial, qe)
    }

    #[test]
    fn test_step_curve_threshold() {
        let curve = StepCurve { mdl: 0.5 };
        assert_eq!(curve.probability(0.49), 0.0);
        assert_eq!(curve.probability(0.5), 1.0);
        assert_eq!(curve.probability(10.0), 1.0);
    }

    #[test]
    fn test_logistic_curve_shape() {
        let curve = LogisticCurve {
            mdl: 1.0,
            steepness: DEFAULT_LOGISTIC_STEEPNESS,
        };
        assert!((curve.probability(1.0) - 0.5).abs() < 1e-12);
        assert!(curve.probability(1e-4) < 1e-6);
        assert!(curve.probability(1e4) > 1.0 - 1e-6);
        assert_eq!(curve.probability(0.0), 0.0);
    }

    #[test]
    fn test_curve_selection_by_sensor_type() {
        let sensor = SensorConfig {
            kind: "ogi_camera".into(),
            mdl: MdlSpec::Params(vec![0.02, 2.0]),
            qe: 0.0,
        };
        let curve = curve_for(&sensor).unwrap();
        assert_eq!(curve.name(), "logistic");

        let unknown = SensorConfig {
            kind: "laser".into(),
            ..SensorConfig::default()
        };
        assert!(curve_for(&unknown).is_err());
    }

    #[test]
    fn test_component_scale_evaluates_each_leak() {
        let mut w = world(1);
        let big = w.inject_leak(0, 0, 0, 5.0);
        let small = w.inject_leak(0, 0, 0, 0.1);
        let model = step_model(MeasurementScale::Component, 1.0, 0.0);

        let obs = model.survey(&w, 0, 0, &mut ChaCha8Rng::seed_from_u64(1), &mut AuditLog::new());

        assert_eq!(obs.observed, vec![big, small]);
        assert_eq!(obs.detected_ids(), vec![big]);
        assert_eq!(obs.site_reported_rate, 5.0);
    }

    #[test]
    fn test_equipment_scale_flags_whole_group() {
        let mut w = world(2);
        let a = w.inject_leak(0, 1, 0, 0.6);
        let b = w.inject_leak(0, 1, 0, 0.6);
        let c = w.inject_leak(0, 0, 0, 0.6);
        let model = step_model(MeasurementScale::Equipment, 1.0, 0.0);

        let obs = model.survey(&w, 0, 0, &mut ChaCha8Rng::seed_from_u64(1), &mut AuditLog::new());

        // Group 1 sums to 1.2 >= MDL; group 0 alone is below it.
        assert_eq!(obs.detected_ids(), vec![a, b]);
        assert_eq!(obs.observed.len(), 3);
        assert!(!obs.detected_ids().contains(&c));
    }

    #[test]
    fn test_site_scale_sums_all_leaks() {
        let mut w = world(3);
        w.inject_leak(0, 0, 0, 0.4);
        w.inject_leak(0, 1, 0, 0.4);
        w.inject_leak(0, 2, 0, 0.4);
        let model = step_model(MeasurementScale::Site, 1.0, 0.0);

        let obs = model.survey(&w, 0, 0, &mut ChaCha8Rng::seed_from_u64(1), &mut AuditLog::new());
        assert_eq!(obs.detected.len(), 3);
    }

    #[test]
    fn test_zero_spatial_coverage_never_detects() {
        let mut w = world(1);
        w.inject_leak(0, 0, 0, 1_000.0);
        let model = step_model(MeasurementScale::Component, 0.0, 0.0);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let obs = model.survey(&w, 0, 0, &mut rng, &mut AuditLog::new());
            assert!(obs.observed.is_empty());
            assert!(obs.detected.is_empty());
        }
    }

    #[test]
    fn test_future_leaks_are_invisible() {
        let mut w = world(1);
        w.inject_leak(0, 0, 10, 5.0);
        let model = step_model(MeasurementScale::Component, 1.0, 0.0);

        let obs = model.survey(&w, 0, 9, &mut ChaCha8Rng::seed_from_u64(1), &mut AuditLog::new());
        assert!(obs.observed.is_empty());
    }

    #[test]
    fn test_quantification_error_leaves_true_rate() {
        let mut w = world(1);
        let id = w.inject_leak(0, 0, 0, 5.0);
        let model = step_model(MeasurementScale::Component, 1.0, 0.5);

        let obs = model.survey(&w, 0, 0, &mut ChaCha8Rng::seed_from_u64(8), &mut AuditLog::new());
        assert_eq!(w.leak(id).unwrap().rate_gps, 5.0);
        assert!(obs.detected[0].reported_rate >= 0.0);
    }

    proptest! {
        #[test]
        fn prop_logistic_is_monotonic(
            mdl in 0.001f64..10.0,
            k in 0.5f64..10.0,
            a in 0.0001f64..100.0,
            b in 0.0001f64..100.0,
        ) {
            let curve = LogisticCurve { mdl, steepness: k };
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(curve.probability(lo) <= curve.probability(hi));
        }

        #[test]
        fn prop_reported_rates_non_negative(seed in any::<u64>(), qe in 0.0f64..3.0) {
            let mut w = world(1);
            w.inject_leak(0, 0, 0, 2.0);
            let model = step_model(MeasurementScale::Component, 1.0, qe);
            let obs = model.survey(&w, 0, 0, &mut ChaCha8Rng::seed_from_u64(seed), &mut AuditLog::new());
            prop_assert!(obs.detected.iter().all(|d| d.reported_rate >= 0.0));
        }
    }
}
