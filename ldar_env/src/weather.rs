//! Weather field abstraction.
//!
//! The scheduler only needs one question answered: what were the daily
//! conditions at this site on this date? Reanalysis grids, station data and
//! constant test fields all sit behind [`WeatherField`].

use crate::error::EnvError;
use crate::types::{Coordinates, WeatherSample};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily weather lookup by location and date.
pub trait WeatherField: Send + Sync {
    /// Returns the conditions at `location` on `date`.
    ///
    /// # Errors
    /// `EnvError::WeatherUnavailable` when the field does not cover the
    /// requested date or location.
    fn conditions(&self, location: Coordinates, date: NaiveDate) -> Result<WeatherSample, EnvError>;
}

/// The same conditions everywhere, every day.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantWeather(pub WeatherSample);

impl WeatherField for ConstantWeather {
    fn conditions(&self, _location: Coordinates, _date: NaiveDate) -> Result<WeatherSample, EnvError> {
        Ok(self.0)
    }
}

/// Regular lat/lon grid of daily samples.
///
/// `days[d][i][j]` is the sample for `start_date + d` at `lats[i]`, `lons[j]`.
/// Lookups snap to the nearest grid node on each axis independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GriddedWeather {
    /// Date of the first daily slice
    pub start_date: NaiveDate,

    /// Latitude axis (decimal degrees)
    pub lats: Vec<f64>,

    /// Longitude axis (decimal degrees)
    pub lons: Vec<f64>,

    /// Daily slices, each `lats.len()` rows of `lons.len()` samples
    pub days: Vec<Vec<Vec<WeatherSample>>>,
}

impl GriddedWeather {
    /// Checks that every slice matches the axis lengths.
    pub fn validate(&self, name: &str) -> Result<(), EnvError> {
        if self.lats.is_empty() || self.lons.is_empty() {
            return Err(EnvError::malformed(name, "empty grid axis"));
        }
        for (d, slice) in self.days.iter().enumerate() {
            if slice.len() != self.lats.len() || slice.iter().any(|row| row.len() != self.lons.len()) {
                return Err(EnvError::malformed(
                    name,
                    format!("day {} does not match a {}x{} grid", d, self.lats.len(), self.lons.len()),
                ));
            }
        }
        Ok(())
    }
}

/// Index of the axis value closest to `value`.
pub fn nearest_index(value: f64, axis: &[f64]) -> Option<usize> {
    axis.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - value).abs().total_cmp(&(*b - value).abs())
        })
        .map(|(idx, _)| idx)
}

impl WeatherField for GriddedWeather {
    fn conditions(&self, location: Coordinates, date: NaiveDate) -> Result<WeatherSample, EnvError> {
        let unavailable = || EnvError::WeatherUnavailable {
            lat: location.lat,
            lon: location.lon,
            date,
        };

        let offset = (date - self.start_date).num_days();
        let day = usize::try_from(offset).ok().and_then(|d| self.days.get(d)).ok_or_else(unavailable)?;
        let i = nearest_index(location.lat, &self.lats).ok_or_else(unavailable)?;
        let j = nearest_index(location.lon, &self.lons).ok_or_else(unavailable)?;

        day.get(i).and_then(|row| row.get(j)).copied().ok_or_else(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(temp: f64) -> WeatherSample {
        WeatherSample { temp, wind: 1.0, precip: 0.0 }
    }

    fn grid() -> GriddedWeather {
        GriddedWeather {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            lats: vec![50.0, 51.0],
            lons: vec![-115.0, -114.0],
            days: vec![
                vec![vec![sample(1.0), sample(2.0)], vec![sample(3.0), sample(4.0)]],
                vec![vec![sample(5.0), sample(6.0)], vec![sample(7.0), sample(8.0)]],
            ],
        }
    }

    #[test]
    fn test_nearest_index() {
        let axis = [9.0, 10.0, 11.0, 12.0, 13.0];
        assert_eq!(nearest_index(10.123, &axis), Some(1));
        assert_eq!(nearest_index(100.0, &axis), Some(4));
        assert_eq!(nearest_index(1.0, &[]), None);
    }

    #[test]
    fn test_gridded_lookup_snaps_to_nearest_node() {
        let weather = grid();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        let s = weather.conditions(Coordinates::new(50.9, -114.2), date).unwrap();
        assert_eq!(s.temp, 8.0);
    }

    #[test]
    fn test_gridded_lookup_outside_dates_fails() {
        let weather = grid();
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();

        let err = weather.conditions(Coordinates::new(50.0, -115.0), date).unwrap_err();
        assert!(matches!(err, EnvError::WeatherUnavailable { .. }));
    }

    #[test]
    fn test_grid_validation_catches_ragged_rows() {
        let mut weather = grid();
        weather.days[1][0].pop();
        assert!(weather.validate("weather.json").is_err());
    }
}
