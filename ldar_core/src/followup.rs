//! Follow-up state machine.
//!
//! Screening detections arrive as site-level [`Flag`]s. After the method's
//! reporting delay each day's flags are released as one batch per source
//! method, run through that method's rule set, and either handed to repair,
//! queued for a follow-up survey, or dropped.
//!
//! ```text
//! undetected -> pending_follow_up -> follow_up_confirmed -> repair_scheduled -> repaired
//!      ^               |
//!      +---- dropped --+
//! ```

use crate::audit::{AuditKind, AuditLog};
use crate::clock::{Clock, SimDay};
use crate::config::{
    FollowUpConfig, InteractionPriority, MethodConfig, MinFollowUpType, RedundancyFilter, ThresholdType,
};
use crate::detection::Observation;
use crate::distributions::prop_rate;
use crate::world::{LeakId, LeakState, VirtualWorld};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use tracing::debug;

/// A detection reported by one method at one site.
#[derive(Debug, Clone, PartialEq)]
pub struct Flag {
    pub site: usize,
    /// Day of the survey that raised it
    pub day: u32,
    /// Method index that raised it
    pub source: usize,
    pub leaks: Vec<LeakId>,
    pub reported_rate: f64,
    /// Raised by a follow-up survey continuing a chain
    pub chained: bool,
}

/// A queued follow-up survey.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpRequest {
    pub site: usize,
    /// Method index that will perform the follow-up
    pub target: usize,
    pub due_day: u32,
    pub reported_rate: f64,
    pub exceeds_threshold: bool,
    pub leaks: Vec<LeakId>,
    sort_by_rate: bool,
    rate_sum: f64,
    merged: u32,
    seq: u64,
}

#[derive(Debug, Clone)]
struct Rule {
    target: usize,
    cfg: FollowUpConfig,
}

/// Per-program follow-up engine.
#[derive(Debug)]
pub struct FollowUpEngine {
    labels: Vec<String>,
    rules: Vec<Option<Rule>>,
    reporting_delays: Vec<u32>,
    reports: Vec<(u32, Flag)>,
    queue: Vec<FollowUpRequest>,
    rng: ChaCha8Rng,
    next_seq: u64,
}

impl FollowUpEngine {
    /// `targets[i]` is the resolved follow-up method of method `i`.
    pub fn new(methods: &[MethodConfig], targets: &[Option<usize>], seed: u64) -> Self {
        let rules = methods
            .iter()
            .zip(targets)
            .map(|(m, t)| match (&m.follow_up, t) {
                (Some(cfg), Some(target)) => Some(Rule {
                    target: *target,
                    cfg: cfg.clone(),
                }),
                _ => None,
            })
            .collect();
        Self {
            labels: methods.iter().map(|m| m.label.clone()).collect(),
            rules,
            reporting_delays: methods.iter().map(|m| m.reporting_delay).collect(),
            reports: Vec::new(),
            queue: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_seq: 0,
        }
    }

    /// True when detections of `method` escalate to a follow-up.
    pub fn has_rule(&self, method: usize) -> bool {
        matches!(self.rules.get(method), Some(Some(_)))
    }

    /// Flags waiting for release plus queued requests.
    pub fn pending(&self) -> usize {
        self.reports.len() + self.queue.len()
    }

    /// Accepts a detection; it is released after the source's reporting delay.
    pub fn report(&mut self, flag: Flag) {
        let delay = self.reporting_delays.get(flag.source).copied().unwrap_or(0);
        self.reports.push((flag.day.saturating_add(delay), flag));
    }

    /// Releases every flag whose reporting delay has elapsed.
    ///
    /// Returns the leaks confirmed for repair without a follow-up survey.
    pub fn release_due(
        &mut self,
        day: SimDay,
        clock: &Clock,
        world: &mut VirtualWorld,
        audit: &mut AuditLog,
    ) -> Vec<LeakId> {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.reports)
            .into_iter()
            .partition(|(release, _)| *release <= day.index);
        self.reports = waiting;

        // Keep only leaks this flag can still claim.
        let mut batches: Vec<Vec<Flag>> = vec![Vec::new(); self.rules.len()];
        for (_, mut flag) in due {
            let claimable = if flag.chained {
                LeakState::FollowUpConfirmed
            } else {
                LeakState::Undetected
            };
            flag.leaks.retain(|id| world.leak(*id).is_some_and(|l| l.state == claimable));
            if flag.leaks.is_empty() {
                continue;
            }
            for id in &flag.leaks {
                if let Some(leak) = world.leak_mut(*id) {
                    if leak.first_detected_day.is_none() {
                        leak.first_detected_day = Some(flag.day);
                        leak.detected_by = self.labels.get(flag.source).cloned();
                    }
                }
            }
            if let Some(batch) = batches.get_mut(flag.source) {
                batch.push(flag);
            }
        }

        let mut to_repair = Vec::new();
        for (source, flags) in batches.into_iter().enumerate() {
            if flags.is_empty() {
                continue;
            }
            match self.rules[source].clone() {
                None => {
                    for flag in flags {
                        to_repair.extend(confirm_all(world, &flag.leaks));
                    }
                }
                Some(rule) => {
                    to_repair.extend(self.apply_rule(&rule, flags, day, clock, world, audit));
                }
            }
        }
        to_repair
    }

    fn apply_rule(
        &mut self,
        rule: &Rule,
        flags: Vec<Flag>,
        day: SimDay,
        clock: &Clock,
        world: &mut VirtualWorld,
        audit: &mut AuditLog,
    ) -> Vec<LeakId> {
        let cfg = &rule.cfg;
        let rates: Vec<f64> = flags.iter().map(|f| f.reported_rate).collect();
        let mut to_repair = Vec::new();

        let instant = cfg.instant_threshold.map(|t| resolve_threshold(t, cfg.instant_threshold_type, &rates));
        let (instant_flags, flags): (Vec<Flag>, Vec<Flag>) = flags
            .into_iter()
            .partition(|f| instant.is_some_and(|t| f.reported_rate >= t));
        for flag in instant_flags {
            to_repair.extend(confirm_all(world, &flag.leaks));
        }

        let threshold = resolve_threshold(cfg.threshold, cfg.threshold_type, &rates);
        let mut ranked: Vec<(Flag, bool)> = flags
            .into_iter()
            .map(|f| {
                let exceeds = f.reported_rate >= threshold;
                (f, exceeds)
            })
            .collect();
        if !cfg.sort_by_rate {
            ranked.shuffle(&mut self.rng);
        }

        let (mut kept, mut dropped) = match cfg.interaction_priority {
            InteractionPriority::Threshold => {
                let (mut survivors, below): (Vec<_>, Vec<_>) = ranked.into_iter().partition(|(_, e)| *e);
                if cfg.sort_by_rate {
                    survivors.sort_by(|a, b| by_rate_desc(&a.0, &b.0));
                }
                let keep = keep_count(cfg.proportion, survivors.len(), &mut self.rng);
                let rest = survivors.split_off(keep);
                (survivors, below.into_iter().chain(rest).collect::<Vec<_>>())
            }
            InteractionPriority::Proportion => {
                ranked.sort_by(|a, b| {
                    b.1.cmp(&a.1).then_with(|| {
                        if cfg.sort_by_rate {
                            by_rate_desc(&a.0, &b.0)
                        } else {
                            Ordering::Equal
                        }
                    })
                });
                let keep = keep_count(cfg.proportion, ranked.len(), &mut self.rng);
                let rest = ranked.split_off(keep);
                (ranked, rest)
            }
        };

        let days_left = match cfg.min_followup_type {
            MinFollowUpType::Absolute => clock.days_to_end(day),
            MinFollowUpType::Annual => clock.days_to_year_end(day),
        };
        if days_left < cfg.min_followup_days_to_end {
            dropped.append(&mut kept);
        }

        for (flag, _) in &dropped {
            for id in &flag.leaks {
                if let Some(leak) = world.leak_mut(*id) {
                    leak.state = LeakState::Undetected;
                    leak.first_detected_day = None;
                    leak.detected_by = None;
                }
            }
            audit.record(
                day.index,
                AuditKind::FollowUpDropped,
                format!(
                    "{}: flag at site {} ({:.4} g/s) dropped",
                    self.labels[flag.source], flag.site, flag.reported_rate
                ),
            );
        }

        for (flag, exceeds) in kept {
            for id in &flag.leaks {
                if let Some(leak) = world.leak_mut(*id) {
                    leak.state = LeakState::PendingFollowUp;
                }
            }
            self.enqueue(rule, flag, exceeds, day.index.saturating_add(cfg.delay));
        }
        debug!(day = day.index, queued = self.queue.len(), "Released follow-up flags");
        to_repair
    }

    fn enqueue(&mut self, rule: &Rule, flag: Flag, exceeds: bool, due_day: u32) {
        if let Some(existing) = self
            .queue
            .iter_mut()
            .find(|r| r.site == flag.site && r.target == rule.target)
        {
            existing.merged += 1;
            existing.rate_sum += flag.reported_rate;
            existing.reported_rate = match rule.cfg.redundancy_filter {
                RedundancyFilter::Recent => flag.reported_rate,
                RedundancyFilter::Max => existing.reported_rate.max(flag.reported_rate),
                RedundancyFilter::Average => existing.rate_sum / f64::from(existing.merged),
            };
            existing.exceeds_threshold |= exceeds;
            for id in flag.leaks {
                if !existing.leaks.contains(&id) {
                    existing.leaks.push(id);
                }
            }
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(FollowUpRequest {
            site: flag.site,
            target: rule.target,
            due_day,
            reported_rate: flag.reported_rate,
            exceeds_threshold: exceeds,
            leaks: flag.leaks,
            sort_by_rate: rule.cfg.sort_by_rate,
            rate_sum: flag.reported_rate,
            merged: 1,
            seq,
        });
    }

    /// Removes and returns the requests for `target` due by `day`, in
    /// service order: threshold exceeders first, then by reported rate when
    /// the rule sorts by rate, otherwise first-in-first-out.
    pub fn take_due(&mut self, day: u32, target: usize) -> Vec<FollowUpRequest> {
        let (mut due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|r| r.target == target && r.due_day <= day);
        self.queue = rest;
        due.sort_by(|a, b| {
            b.exceeds_threshold
                .cmp(&a.exceeds_threshold)
                .then_with(|| {
                    if a.sort_by_rate && b.sort_by_rate {
                        b.reported_rate.total_cmp(&a.reported_rate)
                    } else {
                        Ordering::Equal
                    }
                })
                .then(a.seq.cmp(&b.seq))
        });
        due
    }

    /// Puts unserved requests back, due on `next_day`.
    pub fn defer(&mut self, requests: Vec<FollowUpRequest>, next_day: u32, audit: &mut AuditLog) {
        for mut req in requests {
            audit.record(
                next_day.saturating_sub(1),
                AuditKind::FollowUpDeferred,
                format!("{}: follow-up at site {} deferred", self.labels[req.target], req.site),
            );
            req.due_day = next_day;
            self.queue.push(req);
        }
    }

    /// Applies a follow-up survey's observation.
    ///
    /// Detected leaks that are undetected or awaiting follow-up become
    /// confirmed; requested leaks the survey missed return to undetected.
    /// Returns the confirmed leaks.
    pub fn resolve(
        &mut self,
        request: &FollowUpRequest,
        observation: &Observation,
        day: u32,
        world: &mut VirtualWorld,
    ) -> Vec<LeakId> {
        let mut confirmed = Vec::new();
        for d in &observation.detected {
            if let Some(leak) = world.leak_mut(d.leak) {
                if matches!(leak.state, LeakState::Undetected | LeakState::PendingFollowUp) {
                    leak.state = LeakState::FollowUpConfirmed;
                    if leak.first_detected_day.is_none() {
                        leak.first_detected_day = Some(day);
                        leak.detected_by = self.labels.get(request.target).cloned();
                    }
                    confirmed.push(d.leak);
                }
            }
        }
        for id in &request.leaks {
            if let Some(leak) = world.leak_mut(*id) {
                if leak.state == LeakState::PendingFollowUp {
                    leak.state = LeakState::Undetected;
                    leak.first_detected_day = None;
                    leak.detected_by = None;
                }
            }
        }
        confirmed
    }
}

fn confirm_all(world: &mut VirtualWorld, leaks: &[LeakId]) -> Vec<LeakId> {
    for id in leaks {
        if let Some(leak) = world.leak_mut(*id) {
            leak.state = LeakState::FollowUpConfirmed;
        }
    }
    leaks.to_vec()
}

fn resolve_threshold(value: f64, kind: ThresholdType, rates: &[f64]) -> f64 {
    match kind {
        ThresholdType::Absolute => value,
        ThresholdType::Relative => prop_rate(value, rates),
    }
}

/// Number of the `n` ranked flags an operator follows up.
///
/// The expected count is `proportion * n`; the fractional part is settled by
/// a draw so that batches of one or two flags still average `proportion`.
fn keep_count(proportion: f64, n: usize, rng: &mut ChaCha8Rng) -> usize {
    let expected = proportion.clamp(0.0, 1.0) * n as f64;
    let whole = expected.floor();
    let extra = usize::from(rng.gen::<f64>() < expected - whole);
    (whole as usize + extra).min(n)
}

fn by_rate_desc(a: &Flag, b: &Flag) -> Ordering {
    b.reported_rate.total_cmp(&a.reported_rate)
}
