//! Random draws: leak rates, repair delays and unit conversion.
//!
//! Every sampler takes the caller's `ChaCha8Rng` so the owning component
//! decides which stream the randomness comes from.

use crate::audit::{AuditKind, AuditLog};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp, Gamma, LogNormal, Weibull};
use serde::{Deserialize, Serialize};

/// Seconds in a simulated day.
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Methane density at 15 °C and 1 atm (kg/m³).
pub const METHANE_DENSITY_KG_M3: f64 = 0.678;

/// Cubic metres in one thousand cubic feet.
pub const M3_PER_MCF: f64 = 28.316_846_6;

/// Re-draws allowed before an oversized leak rate is clamped.
pub const MAX_RESAMPLE_ATTEMPTS: u32 = 100;

/// Mass (or volume of methane) unit of a leak rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MassUnit {
    #[default]
    Gram,
    Kilogram,
    CubicMeter,
    Mcf,
}

impl MassUnit {
    /// Grams of methane per unit.
    pub fn grams(self) -> f64 {
        match self {
            Self::Gram => 1.0,
            Self::Kilogram => 1_000.0,
            Self::CubicMeter => METHANE_DENSITY_KG_M3 * 1_000.0,
            Self::Mcf => M3_PER_MCF * METHANE_DENSITY_KG_M3 * 1_000.0,
        }
    }
}

/// Time increment of a leak rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Seconds per unit.
    pub fn seconds(self) -> f64 {
        match self {
            Self::Second => 1.0,
            Self::Minute => 60.0,
            Self::Hour => 3_600.0,
            Self::Day => SECONDS_PER_DAY,
        }
    }
}

/// Units of a configured leak rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateUnits {
    pub metric: MassUnit,
    pub increment: TimeUnit,
}

impl RateUnits {
    /// Converts a rate in these units to g/s.
    pub fn to_grams_per_second(&self, value: f64) -> f64 {
        value * self.metric.grams() / self.increment.seconds()
    }
}

/// Mass emitted in one day at `rate_gps`, in kg.
pub fn daily_mass_kg(rate_gps: f64) -> f64 {
    rate_gps * SECONDS_PER_DAY / 1_000.0
}

/// Thousand cubic feet of methane in `kg`.
pub fn kg_to_mcf(kg: f64) -> f64 {
    kg / (METHANE_DENSITY_KG_M3 * M3_PER_MCF)
}

/// Parametric leak-rate family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistType {
    /// Log-normal; scale = exp(mu), shape = sigma
    #[default]
    Lognorm,
    /// Exponential with the given mean
    Exponential,
    Gamma,
    Weibull,
    /// Always the same value
    Fixed,
}

impl DistType {
    /// Builds the distribution, rejecting unusable parameters.
    pub fn build(self, scale: f64, shape: &[f64]) -> Result<RateDistribution, String> {
        if !scale.is_finite() {
            return Err(format!("scale must be finite, got {}", scale));
        }
        let first_shape = || {
            shape
                .first()
                .copied()
                .filter(|k| k.is_finite() && *k > 0.0)
                .ok_or_else(|| format!("{:?} needs a positive shape parameter, got {:?}", self, shape))
        };
        match self {
            Self::Lognorm => {
                let sigma = first_shape()?;
                LogNormal::new(scale, sigma)
                    .map(RateDistribution::LogNormal)
                    .map_err(|e| e.to_string())
            }
            Self::Exponential => {
                if scale <= 0.0 {
                    return Err(format!("exponential mean must be positive, got {}", scale));
                }
                Exp::new(1.0 / scale)
                    .map(RateDistribution::Exponential)
                    .map_err(|e| e.to_string())
            }
            Self::Gamma => {
                let k = first_shape()?;
                if scale <= 0.0 {
                    return Err(format!("gamma scale must be positive, got {}", scale));
                }
                Gamma::new(k, scale)
                    .map(RateDistribution::Gamma)
                    .map_err(|e| e.to_string())
            }
            Self::Weibull => {
                let k = first_shape()?;
                if scale <= 0.0 {
                    return Err(format!("weibull scale must be positive, got {}", scale));
                }
                Weibull::new(scale, k)
                    .map(RateDistribution::Weibull)
                    .map_err(|e| e.to_string())
            }
            Self::Fixed => {
                if scale < 0.0 {
                    return Err(format!("fixed rate must be non-negative, got {}", scale));
                }
                Ok(RateDistribution::Fixed(scale))
            }
        }
    }
}

/// A built parametric distribution.
#[derive(Debug, Clone, Copy)]
pub enum RateDistribution {
    LogNormal(LogNormal<f64>),
    Exponential(Exp<f64>),
    Gamma(Gamma<f64>),
    Weibull(Weibull<f64>),
    Fixed(f64),
}

impl RateDistribution {
    /// Draws one value in the configured units.
    pub fn draw(&self, rng: &mut ChaCha8Rng) -> f64 {
        match self {
            Self::LogNormal(d) => d.sample(rng),
            Self::Exponential(d) => d.sample(rng),
            Self::Gamma(d) => d.sample(rng),
            Self::Weibull(d) => d.sample(rng),
            Self::Fixed(v) => *v,
        }
    }
}

/// Source of leak emission rates.
///
/// Implementations return raw draws in their own units; [`draw_leak_rate`]
/// applies conversion and recovery so every source behaves the same way at
/// the physical limits.
pub trait LeakRateSampler: Send + Sync + std::fmt::Debug {
    /// Draws one rate in the sampler's units.
    fn draw_raw(&self, rng: &mut ChaCha8Rng) -> f64;

    /// Units of [`LeakRateSampler::draw_raw`].
    fn units(&self) -> RateUnits;

    /// Largest physical rate in g/s, if capped.
    fn max_rate_gps(&self) -> Option<f64>;
}

/// Draws from a parametric distribution.
#[derive(Debug, Clone)]
pub struct ParametricSampler {
    dist: RateDistribution,
    units: RateUnits,
    max_gps: Option<f64>,
}

impl ParametricSampler {
    pub fn new(dist: RateDistribution, units: RateUnits, max_gps: Option<f64>) -> Self {
        Self { dist, units, max_gps }
    }
}

impl LeakRateSampler for ParametricSampler {
    fn draw_raw(&self, rng: &mut ChaCha8Rng) -> f64 {
        self.dist.draw(rng)
    }

    fn units(&self) -> RateUnits {
        self.units
    }

    fn max_rate_gps(&self) -> Option<f64> {
        self.max_gps
    }
}

/// Uniformly resamples recorded rates.
#[derive(Debug, Clone)]
pub struct EmpiricalSampler {
    values: Vec<f64>,
    units: RateUnits,
    max_gps: Option<f64>,
}

impl EmpiricalSampler {
    /// Returns `None` for an empty record set.
    pub fn new(values: Vec<f64>, units: RateUnits, max_gps: Option<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        Some(Self { values, units, max_gps })
    }
}

impl LeakRateSampler for EmpiricalSampler {
    fn draw_raw(&self, rng: &mut ChaCha8Rng) -> f64 {
        self.values[rng.gen_range(0..self.values.len())]
    }

    fn units(&self) -> RateUnits {
        self.units
    }

    fn max_rate_gps(&self) -> Option<f64> {
        self.max_gps
    }
}

/// Draws a physical leak rate in g/s.
///
/// Draws above the cap are re-drawn up to [`MAX_RESAMPLE_ATTEMPTS`] times and
/// then clamped; non-finite or negative draws become zero. Each recovery is
/// audited.
pub fn draw_leak_rate(
    sampler: &dyn LeakRateSampler,
    rng: &mut ChaCha8Rng,
    audit: &mut AuditLog,
    day: u32,
) -> f64 {
    let units = sampler.units();
    let mut rate = units.to_grams_per_second(sampler.draw_raw(rng));

    if let Some(max) = sampler.max_rate_gps() {
        let mut attempts = 0;
        while rate > max && attempts < MAX_RESAMPLE_ATTEMPTS {
            rate = units.to_grams_per_second(sampler.draw_raw(rng));
            attempts += 1;
        }
        if rate > max {
            audit.record(
                day,
                AuditKind::SamplingRecovered,
                format!("leak rate {:.4} g/s clamped to max_leak_rate {:.4}", rate, max),
            );
            rate = max;
        }
    }

    if !rate.is_finite() || rate < 0.0 {
        audit.record(
            day,
            AuditKind::SamplingRecovered,
            format!("non-physical leak rate {} clamped to 0", rate),
        );
        rate = 0.0;
    }
    rate
}

/// Built repair-delay model.
#[derive(Debug, Clone)]
pub enum RepairDelay {
    Fixed(u32),
    List { values: Vec<f64>, min: f64 },
    Distribution { dist: LogNormal<f64>, min: f64 },
}

impl RepairDelay {
    /// Builds the model from validated configuration.
    pub fn from_config(cfg: &crate::config::RepairDelayConfig) -> Result<Self, String> {
        use crate::config::RepairDelayConfig as C;
        match cfg {
            C::Fixed { val } => Ok(Self::Fixed(val.max(0.0).round() as u32)),
            C::List { values, min } => {
                if values.is_empty() {
                    return Err("repair delay list is empty".to_string());
                }
                Ok(Self::List {
                    values: values.clone(),
                    min: *min,
                })
            }
            C::Distribution { mu, sigma, min } => LogNormal::new(*mu, *sigma)
                .map(|dist| Self::Distribution { dist, min: *min })
                .map_err(|e| e.to_string()),
        }
    }

    /// Draws a delay in whole days.
    pub fn draw_days(&self, rng: &mut ChaCha8Rng) -> u32 {
        let (days, min) = match self {
            Self::Fixed(d) => return *d,
            Self::List { values, min } => (values[rng.gen_range(0..values.len())], *min),
            Self::Distribution { dist, min } => (dist.sample(rng), *min),
        };
        let days = if days.is_finite() { days } else { min };
        days.max(min).max(0.0).round() as u32
    }
}

/// Emission rate that separates the top `proportion` of emitters.
///
/// Rates are sorted ascending and accumulated into shares of the total.
/// The share at emitter rank `1 - proportion` (ranks spread evenly over
/// [0, 1]) is interpolated, scaled back to a cumulative rate, and mapped to
/// an emission rate by a second interpolation over the cumulative curve.
/// A proportion of 0 returns the largest rate, 1 the smallest. A single
/// rate is returned as is; no rates, or a zero total, give 0.
pub fn prop_rate(proportion: f64, rates: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = rates
        .iter()
        .copied()
        .filter(|r| r.is_finite())
        .map(|r| r.max(0.0))
        .collect();
    sorted.sort_by(f64::total_cmp);
    match sorted.len() {
        0 => return 0.0,
        1 => return sorted[0],
        _ => {}
    }

    let cumulative: Vec<f64> = sorted
        .iter()
        .scan(0.0, |sum, r| {
            *sum += r;
            Some(*sum)
        })
        .collect();
    let total = cumulative[cumulative.len() - 1];
    if total <= 0.0 {
        return 0.0;
    }
    let shares: Vec<f64> = cumulative.iter().map(|c| c / total).collect();
    let last = (sorted.len() - 1) as f64;
    let ranks: Vec<f64> = (0..sorted.len()).map(|i| i as f64 / last).collect();

    let share = interp(1.0 - proportion.clamp(0.0, 1.0), &ranks, &shares);
    interp(share * total, &cumulative, &sorted)
}

/// Piecewise-linear interpolation over non-decreasing `xp`, clamped to the
/// end values outside its range.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len();
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    // xp[i] <= x < xp[i + 1]
    let i = xp.partition_point(|v| *v <= x) - 1;
    let t = (x - xp[i]) / (xp[i + 1] - xp[i]);
    fp[i] + t * (fp[i + 1] - fp[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;

    #[test]
    fn test_unit_conversion_to_gps() {
        let kg_per_hour = RateUnits {
            metric: MassUnit::Kilogram,
            increment: TimeUnit::Hour,
        };
        assert_relative_eq!(kg_per_hour.to_grams_per_second(3.6), 1.0);

        let m3_per_day = RateUnits {
            metric: MassUnit::CubicMeter,
            increment: TimeUnit::Day,
        };
        assert_relative_eq!(m3_per_day.to_grams_per_second(86.4), 0.678, epsilon = 1e-12);
    }

    #[test]
    fn test_daily_mass() {
        assert_relative_eq!(daily_mass_kg(1.0), 86.4);
        assert_relative_eq!(kg_to_mcf(METHANE_DENSITY_KG_M3 * M3_PER_MCF), 1.0);
    }

    #[test]
    fn test_lognorm_scale_is_exp_mu() {
        let dist = DistType::Lognorm.build(0.0, &[1.0]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut draws: Vec<f64> = (0..20_001).map(|_| dist.draw(&mut rng)).collect();
        draws.sort_by(|a, b| a.total_cmp(b));
        // Median of a log-normal is its scale.
        assert_relative_eq!(draws[10_000], 1.0, epsilon = 0.05);
    }

    #[test]
    fn test_build_rejects_bad_parameters() {
        assert!(DistType::Lognorm.build(0.0, &[]).is_err());
        assert!(DistType::Gamma.build(-1.0, &[2.0]).is_err());
        assert!(DistType::Exponential.build(0.0, &[]).is_err());
        assert!(DistType::Fixed.build(f64::NAN, &[]).is_err());
    }

    #[test]
    fn test_oversized_draws_are_clamped_and_audited() {
        let sampler = ParametricSampler::new(RateDistribution::Fixed(50.0), RateUnits::default(), Some(10.0));
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut audit = AuditLog::new();

        let rate = draw_leak_rate(&sampler, &mut rng, &mut audit, 3);

        assert_eq!(rate, 10.0);
        assert_eq!(audit.count(AuditKind::SamplingRecovered), 1);
    }

    #[test]
    fn test_empirical_sampler_resamples_records() {
        let sampler = EmpiricalSampler::new(vec![1.0, 2.0, 3.0], RateUnits::default(), None).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut audit = AuditLog::new();

        for _ in 0..100 {
            let r = draw_leak_rate(&sampler, &mut rng, &mut audit, 0);
            assert!([1.0, 2.0, 3.0].contains(&r));
        }
        assert!(audit.is_empty());
        assert!(EmpiricalSampler::new(vec![], RateUnits::default(), None).is_none());
    }

    #[test]
    fn test_repair_delay_respects_minimum() {
        let delay = RepairDelay::from_config(&crate::config::RepairDelayConfig::Distribution {
            mu: 0.0,
            sigma: 2.0,
            min: 5.0,
        })
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..500 {
            assert!(delay.draw_days(&mut rng) >= 5);
        }

        let fixed = RepairDelay::from_config(&crate::config::RepairDelayConfig::Fixed { val: 14.0 }).unwrap();
        assert_eq!(fixed.draw_days(&mut rng), 14);
    }

    #[test]
    fn test_prop_rate() {
        let rates = [10.0, 5.0, 3.0, 2.0];
        // Rank 0.5 sits between shares 0.25 and 0.5; 7.5 cumulative maps to 4.0
        assert_relative_eq!(prop_rate(0.5, &rates), 4.0, epsilon = 1e-12);
        assert_relative_eq!(prop_rate(0.7, &rates), 2.9, epsilon = 1e-12);
        assert_relative_eq!(prop_rate(0.0, &rates), 10.0);
        assert_relative_eq!(prop_rate(1.0, &rates), 2.0);
        assert_eq!(prop_rate(0.5, &[]), 0.0);
        assert_eq!(prop_rate(0.5, &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_prop_rate_single_emitter_is_its_own_threshold() {
        assert_eq!(prop_rate(0.1, &[7.5]), 7.5);
        assert_eq!(prop_rate(0.9, &[7.5]), 7.5);
    }

    proptest! {
        #[test]
        fn prop_drawn_rates_are_physical(seed in any::<u64>(), mu in -5.0f64..3.0, sigma in 0.1f64..3.0) {
            let dist = DistType::Lognorm.build(mu, &[sigma]).unwrap();
            let sampler = ParametricSampler::new(dist, RateUnits::default(), Some(5.0));
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut audit = AuditLog::new();

            let rate = draw_leak_rate(&sampler, &mut rng, &mut audit, 0);
            prop_assert!(rate.is_finite());
            prop_assert!((0.0..=5.0).contains(&rate));
        }

        #[test]
        fn prop_prop_rate_within_rate_range(rates in prop::collection::vec(0.01f64..100.0, 1..30), p in 0.0f64..=1.0) {
            let r = prop_rate(p, &rates);
            let lo = rates.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = rates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(r >= lo - 1e-9 && r <= hi + 1e-9);
        }

        #[test]
        fn prop_prop_rate_falls_as_proportion_grows(
            rates in prop::collection::vec(0.01f64..100.0, 2..30),
            a in 0.0f64..=1.0,
            b in 0.0f64..=1.0,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(prop_rate(hi, &rates) <= prop_rate(lo, &rates) + 1e-9);
        }
    }
}
