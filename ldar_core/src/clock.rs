//! Simulation calendar.

use crate::error::ConfigError;
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// One simulated day: its index from the start and its calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimDay {
    pub index: u32,
    pub date: NaiveDate,
}

impl SimDay {
    /// Calendar month, 1-12.
    pub fn month(&self) -> u32 {
        self.date.month()
    }

    pub fn year(&self) -> i32 {
        self.date.year()
    }
}

/// Day counter from `start` (inclusive) to `end` (exclusive).
///
/// The clock is the only source of "today" in a replicate. Components are
/// handed a [`SimDay`] and never read wall time.
#[derive(Debug, Clone)]
pub struct Clock {
    start: NaiveDate,
    n_days: u32,
    next: u32,
}

impl Clock {
    /// Creates a clock over `[start, end)`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        let span = (end - start).num_days();
        if span <= 0 {
            return Err(ConfigError::invalid("end_date", "must be after start_date"));
        }
        let n_days = u32::try_from(span).map_err(|_| ConfigError::invalid("end_date", "horizon too long"))?;
        Ok(Self { start, n_days, next: 0 })
    }

    /// Number of simulated days.
    pub fn n_days(&self) -> u32 {
        self.n_days
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Returns the day at `index`, if inside the horizon.
    pub fn day(&self, index: u32) -> Option<SimDay> {
        if index >= self.n_days {
            return None;
        }
        let date = self.start.checked_add_days(Days::new(u64::from(index)))?;
        Some(SimDay { index, date })
    }

    /// Advances to the next day; `None` once the horizon is exhausted.
    pub fn tick(&mut self) -> Option<SimDay> {
        let day = self.day(self.next)?;
        self.next += 1;
        Some(day)
    }

    /// Iterates every day of the horizon without moving the clock.
    pub fn days(&self) -> impl Iterator<Item = SimDay> + '_ {
        (0..self.n_days).filter_map(move |i| self.day(i))
    }

    /// Days left after `day` before the horizon ends.
    pub fn days_to_end(&self, day: SimDay) -> u32 {
        self.n_days.saturating_sub(day.index + 1)
    }

    /// Days left after `day` before the end of its calendar year, capped by
    /// the horizon.
    pub fn days_to_year_end(&self, day: SimDay) -> u32 {
        let year_end = NaiveDate::from_ymd_opt(day.year(), 12, 31).unwrap_or(day.date);
        let to_year_end = u32::try_from((year_end - day.date).num_days()).unwrap_or(0);
        to_year_end.min(self.days_to_end(day))
    }
}

/// Length of the longest run of `false` in `flags`.
///
/// This counts idle days, so `[T, F, F, T]` gives 2. Measured as the index
/// distance between successful days the same series would give 3.
pub fn longest_gap(flags: &[bool]) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for &ok in flags {
        if ok {
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_clock_end_is_exclusive() {
        let mut clock = Clock::new(date(2023, 12, 30), date(2024, 1, 2)).unwrap();
        assert_eq!(clock.n_days(), 3);

        let days: Vec<SimDay> = std::iter::from_fn(|| clock.tick()).collect();
        assert_eq!(days.len(), 3);
        assert_eq!(days[0].index, 0);
        assert_eq!(days[2].date, date(2024, 1, 1));
        assert!(clock.tick().is_none());
    }

    #[test]
    fn test_clock_rejects_empty_horizon() {
        assert!(Clock::new(date(2023, 1, 1), date(2023, 1, 1)).is_err());
    }

    #[test]
    fn test_days_to_end_and_year_end() {
        let clock = Clock::new(date(2023, 12, 1), date(2024, 3, 1)).unwrap();
        let day = clock.day(20).unwrap();
        assert_eq!(day.date, date(2023, 12, 21));

        assert_eq!(clock.days_to_end(day), clock.n_days() - 21);
        assert_eq!(clock.days_to_year_end(day), 10);

        let last = clock.day(clock.n_days() - 1).unwrap();
        assert_eq!(clock.days_to_end(last), 0);
    }

    #[test]
    fn test_longest_gap() {
        assert_eq!(longest_gap(&[true, false, false, true, false]), 2);
        assert_eq!(longest_gap(&[true, true]), 0);
        assert_eq!(longest_gap(&[false; 4]), 4);
        assert_eq!(longest_gap(&[]), 0);
    }
}
