//! Method deployment scheduling and crew routing.
//!
//! Each method owns one [`MethodScheduler`]. For primary methods it picks the
//! day's eligible sites (calendar, revisit interval, annual cap, weather,
//! temporal coverage); for follow-up methods it receives the requested sites
//! from the follow-up engine. Either way the chosen sites go through the same
//! routing step, which assigns crews within their workday.

use crate::audit::{AuditKind, AuditLog};
use crate::clock::{longest_gap, SimDay};
use crate::config::{DeploymentType, MethodConfig, RevisitInterval, WeatherEnvelope};
use crate::error::SimError;
use crate::world::Site;
use geo::{HaversineDistance, Point};
use ldar_env::{Coordinates, EnvError, InputCatalog, WeatherField, WeatherSample};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::debug;

/// One planned site visit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Visit {
    pub site: usize,
    /// Crew that made the visit; `None` without route planning
    pub crew: Option<u32>,
    pub survey_minutes: f64,
    pub travel_minutes: f64,
    /// First visit of a crew-day (carries the per-day cost)
    pub opens_crew_day: bool,
}

/// Mutable crew state, persisted across days.
#[derive(Debug, Clone, PartialEq)]
pub struct Crew {
    pub id: u32,
    /// Where the crew starts its next day
    pub position: Option<Coordinates>,
    /// Work time left at the end of its last day, in minutes
    pub remaining_minutes: f64,
}

/// Scheduling state for one method in one program.
pub struct MethodScheduler {
    label: String,
    deployment_type: DeploymentType,
    months: Vec<u32>,
    years: Vec<i32>,
    temporal: f64,
    rs: Option<u32>,
    revisit_days: Vec<u32>,
    route_planning: bool,
    workday_minutes: f64,
    survey_minutes: f64,
    n_crews: Option<u32>,
    speed_kmh: f64,
    home_bases: Vec<Coordinates>,
    init_location: Option<Coordinates>,
    consider_weather: bool,
    envelope: WeatherEnvelope,
    weather: Arc<dyn WeatherField>,

    last_survey: Vec<Option<u32>>,
    year_counts: Vec<(i32, u32)>,
    crews: Vec<Crew>,
    deployable: Vec<bool>,
    rng: ChaCha8Rng,
}

impl MethodScheduler {
    /// Creates the scheduler, loading home bases and per-site revisit
    /// intervals from the catalog when configured.
    pub fn new(
        method: &MethodConfig,
        sites: &[Site],
        catalog: &dyn InputCatalog,
        weather: Arc<dyn WeatherField>,
        seed: u64,
    ) -> Result<Self, SimError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let fixed = method.fixed_revisit_days();

        let revisit_days = match &method.t_bw_sites {
            RevisitInterval::Days(_) => vec![fixed; sites.len()],
            RevisitInterval::File { file } => {
                let series = catalog.series(file)?;
                if series.is_empty() || series.iter().any(|v| *v < 0.0) {
                    let reason = "revisit intervals must be non-empty and non-negative";
                    return Err(EnvError::malformed(file.as_str(), reason).into());
                }
                (0..sites.len())
                    .map(|_| {
                        let drawn = series[rng.gen_range(0..series.len())].round() as u32;
                        drawn.max(fixed)
                    })
                    .collect()
            }
        };

        let home_bases = match &method.scheduling.home_bases_file {
            Some(file) => {
                let bases = catalog.home_bases(file)?;
                if let Some(bad) = bases.iter().find(|b| !b.is_valid()) {
                    return Err(EnvError::malformed(file.as_str(), format!("invalid home base {:?}", bad)).into());
                }
                bases
            }
            None => Vec::new(),
        };

        let survey_minutes = match method.deployment_type {
            DeploymentType::Stationary => 0.0,
            DeploymentType::Mobile => method.time,
        };

        Ok(Self {
            label: method.label.clone(),
            deployment_type: method.deployment_type,
            months: method.scheduling.deployment_months.clone(),
            years: method.scheduling.deployment_years.clone(),
            temporal: method.coverage.temporal,
            rs: method.rs,
            revisit_days,
            route_planning: method.scheduling.route_planning,
            workday_minutes: method.max_workday * 60.0,
            survey_minutes,
            n_crews: method.n_crews,
            speed_kmh: method.scheduling.travel_speed,
            home_bases,
            init_location: method.scheduling.crew_init_location,
            consider_weather: method.consider_weather,
            envelope: method.weather_envs,
            weather,
            last_survey: vec![None; sites.len()],
            year_counts: vec![(i32::MIN, 0); sites.len()],
            crews: Vec::new(),
            deployable: Vec::new(),
            rng,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn crews(&self) -> &[Crew] {
        &self.crews
    }

    /// Minimum days between surveys of `site`.
    pub fn revisit_days(&self, site: usize) -> u32 {
        self.revisit_days.get(site).copied().unwrap_or(0)
    }

    /// True when the deployment calendar covers `day`.
    pub fn is_deployed(&self, day: SimDay) -> bool {
        (self.months.is_empty() || self.months.contains(&day.month()))
            && (self.years.is_empty() || self.years.contains(&day.year()))
    }

    /// Longest run of consecutive days the method could not deploy at all.
    ///
    /// Days are counted once each, whether or not work was waiting.
    pub fn longest_idle_gap(&self) -> usize {
        longest_gap(&self.deployable)
    }

    fn weather_ok(&self, site: &Site, day: SimDay) -> Result<bool, EnvError> {
        if !self.consider_weather {
            return Ok(true);
        }
        let sample = self.weather.conditions(site.location, day.date)?;
        Ok(inside_envelope(&self.envelope, &sample))
    }

    fn is_due(&self, site: usize, day: SimDay) -> bool {
        let interval_ok = match self.last_survey[site] {
            None => true,
            Some(last) => day.index - last >= self.revisit_days[site],
        };
        let cap_ok = match self.rs {
            None => true,
            Some(rs) => {
                let (year, count) = self.year_counts[site];
                year != day.year() || count < rs
            }
        };
        interval_ok && cap_ok
    }

    /// Selects and routes today's visits for a primary method.
    ///
    /// Sites that are due but cannot be fitted into any crew's day stay due
    /// and compete again on the next deployable day.
    pub fn plan_primary(&mut self, day: SimDay, sites: &[Site], audit: &mut AuditLog) -> Result<Vec<Visit>, EnvError> {
        if !self.is_deployed(day) {
            self.deployable.push(false);
            return Ok(Vec::new());
        }

        let mut checked = 0usize;
        let mut passed = 0usize;
        let mut candidates = Vec::new();
        for site in sites.iter().filter(|s| s.is_active(day.date)) {
            if !self.is_due(site.index, day) {
                continue;
            }
            checked += 1;
            if !self.weather_ok(site, day)? {
                continue;
            }
            passed += 1;
            if self.rng.gen_bool(self.temporal) {
                candidates.push(site.index);
            }
        }
        self.deployable.push(!(self.consider_weather && checked > 0 && passed == 0));

        candidates.sort_by_key(|&s| (self.last_survey[s].is_some(), self.last_survey[s].unwrap_or(0), s));

        let (visits, deferred) = self.route(candidates, sites);
        for site in deferred {
            audit.record(
                day.index,
                AuditKind::VisitDeferred,
                format!("{}: site {} did not fit any crew day", self.label, sites[site].facility_id),
            );
        }
        for visit in &visits {
            self.record_visit(day, visit.site);
        }
        debug!(day = day.index, method = %self.label, visits = visits.len(), "Planned primary visits");
        Ok(visits)
    }

    /// Routes the follow-up requests for today, in the given priority order.
    ///
    /// Called every simulated day, with no requests on quiet days, so the
    /// idle-gap statistic covers the whole horizon.
    ///
    /// Returns the visits made and the sites that must wait (calendar,
    /// weather or capacity).
    pub fn plan_requested(
        &mut self,
        day: SimDay,
        requested: &[usize],
        sites: &[Site],
    ) -> Result<(Vec<Visit>, Vec<usize>), EnvError> {
        if !self.is_deployed(day) {
            self.deployable.push(false);
            return Ok((Vec::new(), requested.to_vec()));
        }

        let mut candidates = Vec::with_capacity(requested.len());
        let mut deferred = Vec::new();
        for &site in requested {
            if self.weather_ok(&sites[site], day)? {
                candidates.push(site);
            } else {
                deferred.push(site);
            }
        }
        self.deployable.push(!(self.consider_weather && !requested.is_empty() && candidates.is_empty()));

        let (visits, unrouted) = self.route(candidates, sites);
        deferred.extend(unrouted);
        for visit in &visits {
            self.record_visit(day, visit.site);
        }
        Ok((visits, deferred))
    }

    fn record_visit(&mut self, day: SimDay, site: usize) {
        self.last_survey[site] = Some(day.index);
        let entry = &mut self.year_counts[site];
        if entry.0 != day.year() {
            *entry = (day.year(), 0);
        }
        entry.1 += 1;
    }

    /// Assigns ordered candidates to visits; returns (visits, unvisited).
    fn route(&mut self, candidates: Vec<usize>, sites: &[Site]) -> (Vec<Visit>, Vec<usize>) {
        match (self.deployment_type, self.route_planning) {
            (DeploymentType::Stationary, _) => {
                let visits = candidates
                    .into_iter()
                    .map(|site| Visit {
                        site,
                        crew: None,
                        survey_minutes: 0.0,
                        travel_minutes: 0.0,
                        opens_crew_day: true,
                    })
                    .collect();
                (visits, Vec::new())
            }
            (DeploymentType::Mobile, false) => {
                let visits = candidates
                    .into_iter()
                    .enumerate()
                    .map(|(k, site)| Visit {
                        site,
                        crew: None,
                        survey_minutes: self.survey_minutes,
                        travel_minutes: 0.0,
                        opens_crew_day: k == 0,
                    })
                    .collect();
                (visits, Vec::new())
            }
            (DeploymentType::Mobile, true) => self.route_crews(candidates, sites),
        }
    }

    /// Greedy nearest-neighbour routing, one crew at a time.
    fn route_crews(&mut self, mut remaining: Vec<usize>, sites: &[Site]) -> (Vec<Visit>, Vec<usize>) {
        let mut visits = Vec::new();
        let mut crew_idx = 0usize;

        while let Some(&first) = remaining.first() {
            if self.n_crews.is_some_and(|n| crew_idx >= n as usize) {
                break;
            }
            if crew_idx == self.crews.len() {
                self.crews.push(Crew {
                    id: crew_idx as u32,
                    position: None,
                    remaining_minutes: self.workday_minutes,
                });
            }

            let first_loc = sites[first].location;
            let mut pos = self.crews[crew_idx]
                .position
                .or_else(|| self.nearest_home_base(first_loc))
                .or(self.init_location)
                .unwrap_or(first_loc);
            let mut left = self.workday_minutes;
            let mut opened = false;

            loop {
                let best = remaining
                    .iter()
                    .enumerate()
                    .map(|(k, &s)| (k, self.travel_minutes(pos, sites[s].location)))
                    .filter(|(_, t)| t + self.survey_minutes <= left)
                    .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
                let Some((k, travel)) = best else {
                    break;
                };
                let site = remaining.remove(k);
                visits.push(Visit {
                    site,
                    crew: Some(self.crews[crew_idx].id),
                    survey_minutes: self.survey_minutes,
                    travel_minutes: travel,
                    opens_crew_day: !opened,
                });
                opened = true;
                left -= travel + self.survey_minutes;
                pos = sites[site].location;
            }

            if !opened {
                // Stranded: restart from a home base or the next site tomorrow.
                self.crews[crew_idx].position = None;
                break;
            }
            let overnight = self.nearest_home_base(pos).unwrap_or(pos);
            let crew = &mut self.crews[crew_idx];
            crew.position = Some(overnight);
            crew.remaining_minutes = left;
            crew_idx += 1;
        }

        (visits, remaining)
    }

    fn nearest_home_base(&self, from: Coordinates) -> Option<Coordinates> {
        self.home_bases
            .iter()
            .copied()
            .min_by(|a, b| haversine_km(from, *a).total_cmp(&haversine_km(from, *b)))
    }

    fn travel_minutes(&self, from: Coordinates, to: Coordinates) -> f64 {
        haversine_km(from, to) / self.speed_kmh * 60.0
    }
}

/// Great-circle distance in km.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    Point::new(a.lon, a.lat).haversine_distance(&Point::new(b.lon, b.lat)) / 1_000.0
}

/// True when every weather variable lies inside its inclusive range.
pub fn inside_envelope(envelope: &WeatherEnvelope, sample: &WeatherSample) -> bool {
    let within = |range: [f64; 2], v: f64| range[0] <= v && v <= range[1];
    within(envelope.temp, sample.temp) && within(envelope.wind, sample.wind) && within(envelope.precip, sample.precip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::world::load_sites;
    use chrono::NaiveDate;
    use ldar_env::{ConstantWeather, InMemoryCatalog, SiteRecord};

    fn sites(coords: &[(f64, f64)]) -> Arc<[Site]> {
        let records: Vec<SiteRecord> = coords
            .iter()
            .enumerate()
            .map(|(i, (lat, lon))| SiteRecord::new(format!("F-{}", i), *lat, *lon))
            .collect();
        load_sites(&records).unwrap()
    }

    fn clock() -> Clock {
        Clock::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        )
        .unwrap()
    }

    fn scheduler(method: &MethodConfig, sites: &[Site]) -> MethodScheduler {
        MethodScheduler::new(
            method,
            sites,
            &InMemoryCatalog::new(),
            Arc::new(ConstantWeather::default()),
            42,
        )
        .unwrap()
    }

    #[test]
    fn test_deployment_calendar() {
        let mut method = MethodConfig::new("OGI");
        method.scheduling.deployment_months = vec![6, 7];
        method.scheduling.deployment_years = vec![2023];
        let sites = sites(&[(51.0, -114.0)]);
        let s = scheduler(&method, &sites);
        let clock = clock();

        assert!(!s.is_deployed(clock.day(0).unwrap()));
        assert!(s.is_deployed(clock.day(160).unwrap()));
        // June 2024 is outside the deployment years
        assert!(!s.is_deployed(clock.day(365 + 160).unwrap()));
    }

    #[test]
    fn test_revisit_interval_and_annual_cap() {
        let mut method = MethodConfig::new("OGI");
        method.t_bw_sites = RevisitInterval::Days(30);
        method.rs = Some(2);
        let sites = sites(&[(51.0, -114.0)]);
        let mut s = scheduler(&method, &sites);
        let clock = clock();
        let mut audit = AuditLog::new();

        let mut visit_days = Vec::new();
        for day in clock.days().take(365) {
            if !s.plan_primary(day, &sites, &mut audit).unwrap().is_empty() {
                visit_days.push(day.index);
            }
        }
        assert_eq!(visit_days, vec![0, 30]);

        // The cap resets with the new year.
        let jan_1 = clock.day(365).unwrap();
        assert_eq!(s.plan_primary(jan_1, &sites, &mut audit).unwrap().len(), 1);
    }

    #[test]
    fn test_most_overdue_first() {
        let method = MethodConfig::new("OGI");
        let sites = sites(&[(51.0, -114.0), (51.1, -114.0), (51.2, -114.0)]);
        let mut s = scheduler(&method, &sites);
        let clock = clock();
        s.record_visit(clock.day(0).unwrap(), 0);
        s.record_visit(clock.day(1).unwrap(), 2);

        let visits = s.plan_primary(clock.day(5).unwrap(), &sites, &mut AuditLog::new()).unwrap();
        let order: Vec<usize> = visits.iter().map(|v| v.site).collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_workday_limits_crew_and_defers() {
        let mut method = MethodConfig::new("OGI");
        method.scheduling.route_planning = true;
        method.n_crews = Some(1);
        method.t_bw_sites = RevisitInterval::Days(30);
        method.time = 180.0;
        method.max_workday = 8.0;
        // Three sites roughly 1 km apart: two 3-hour surveys fit, a third does not.
        let sites = sites(&[(51.0, -114.0), (51.01, -114.0), (51.02, -114.0)]);
        let mut s = scheduler(&method, &sites);
        let mut audit = AuditLog::new();

        let visits = s.plan_primary(clock().day(0).unwrap(), &sites, &mut audit).unwrap();

        assert_eq!(visits.len(), 2);
        assert!(visits[0].opens_crew_day && !visits[1].opens_crew_day);
        assert!(visits.iter().all(|v| v.crew == Some(0)));
        assert_eq!(audit.count(AuditKind::VisitDeferred), 1);

        let next = s.plan_primary(clock().day(1).unwrap(), &sites, &mut audit).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].site, 2);
    }

    #[test]
    fn test_unbounded_crews_cover_everything_that_fits() {
        let mut method = MethodConfig::new("OGI");
        method.scheduling.route_planning = true;
        method.time = 300.0;
        let sites = sites(&[(51.0, -114.0), (51.01, -114.0), (51.02, -114.0)]);
        let mut s = scheduler(&method, &sites);

        let visits = s.plan_primary(clock().day(0).unwrap(), &sites, &mut AuditLog::new()).unwrap();
        assert_eq!(visits.len(), 3);
        assert_eq!(s.crews().len(), 3);
    }

    #[test]
    fn test_crews_start_at_nearest_home_base() {
        let mut method = MethodConfig::new("OGI");
        method.scheduling.route_planning = true;
        method.scheduling.home_bases_file = Some("bases.json".into());
        method.n_crews = Some(1);
        let sites = sites(&[(51.0, -114.0)]);
        let catalog = InMemoryCatalog::new().with_home_bases(
            "bases.json",
            vec![Coordinates::new(52.0, -114.0), Coordinates::new(51.1, -114.0)],
        );
        let mut s = MethodScheduler::new(&method, &sites, &catalog, Arc::new(ConstantWeather::default()), 1).unwrap();

        let visits = s.plan_primary(clock().day(0).unwrap(), &sites, &mut AuditLog::new()).unwrap();
        // ~11 km from the near base at 60 km/h
        assert!((visits[0].travel_minutes - 11.1).abs() < 0.2);
        assert_eq!(s.crews()[0].position, Some(Coordinates::new(51.1, -114.0)));
    }

    #[test]
    fn test_weather_envelope_blocks_deployment() {
        let mut method = MethodConfig::new("OGI");
        method.consider_weather = true;
        method.weather_envs.wind = [0.0, 5.0];
        let sites = sites(&[(51.0, -114.0)]);
        let windy = ConstantWeather(WeatherSample {
            temp: 10.0,
            wind: 12.0,
            precip: 0.0,
        });
        let mut s = MethodScheduler::new(&method, &sites, &InMemoryCatalog::new(), Arc::new(windy), 1).unwrap();

        for day in clock().days().take(10) {
            assert!(s.plan_primary(day, &sites, &mut AuditLog::new()).unwrap().is_empty());
        }
        assert_eq!(s.longest_idle_gap(), 10);
    }

    #[test]
    fn test_zero_temporal_coverage_never_visits() {
        let mut method = MethodConfig::new("OGI");
        method.coverage.temporal = 0.0;
        let sites = sites(&[(51.0, -114.0), (51.5, -114.0)]);
        let mut s = scheduler(&method, &sites);
        for day in clock().days().take(30) {
            assert!(s.plan_primary(day, &sites, &mut AuditLog::new()).unwrap().is_empty());
        }
    }

    #[test]
    fn test_file_driven_revisit_interval() {
        let mut method = MethodConfig::new("OGI");
        method.t_bw_sites = RevisitInterval::File { file: "tbw.json".into() };
        let sites = sites(&[(51.0, -114.0), (51.5, -114.0)]);
        let catalog = InMemoryCatalog::new().with_series("tbw.json", vec![45.0]);
        let s = MethodScheduler::new(&method, &sites, &catalog, Arc::new(ConstantWeather::default()), 1).unwrap();
        assert_eq!(s.revisit_days(0), 45);
        assert_eq!(s.revisit_days(1), 45);

        let weather = Arc::new(ConstantWeather::default());
        let missing = MethodScheduler::new(&method, &sites, &InMemoryCatalog::new(), weather, 1);
        assert!(matches!(missing, Err(SimError::InputData(_))));
    }

    #[test]
    fn test_stationary_visits_every_site_without_travel() {
        let mut method = MethodConfig::new("CM");
        method.deployment_type = DeploymentType::Stationary;
        let sites = sites(&[(51.0, -114.0), (55.0, -120.0)]);
        let mut s = scheduler(&method, &sites);

        let visits = s.plan_primary(clock().day(0).unwrap(), &sites, &mut AuditLog::new()).unwrap();
        assert_eq!(visits.len(), 2);
        assert!(visits.iter().all(|v| v.survey_minutes == 0.0 && v.opens_crew_day));
    }

    #[test]
    fn test_requested_sites_respect_capacity() {
        let mut method = MethodConfig::new("OGI_FU");
        method.is_follow_up = true;
        method.scheduling.route_planning = true;
        method.n_crews = Some(1);
        method.time = 240.0;
        let sites = sites(&[(51.0, -114.0), (51.01, -114.0), (51.02, -114.0)]);
        let mut s = scheduler(&method, &sites);

        let (visits, deferred) = s.plan_requested(clock().day(0).unwrap(), &[2, 0, 1], &sites).unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].site, 2);
        assert_eq!(deferred.len(), 2);
    }

    #[test]
    fn test_follow_up_idle_gap_counts_every_day() {
        let mut method = MethodConfig::new("OGI_FU");
        method.is_follow_up = true;
        method.scheduling.deployment_months = vec![1];
        let sites = sites(&[(51.0, -114.0)]);
        let mut s = scheduler(&method, &sites);

        // January and February 2023, work requested only on the first day
        for day in clock().days().take(59) {
            let requested: &[usize] = if day.index == 0 { &[0] } else { &[] };
            s.plan_requested(day, requested, &sites).unwrap();
        }
        assert_eq!(s.longest_idle_gap(), 28);
    }
}
