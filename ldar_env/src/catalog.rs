//! Input catalog: where the simulation gets everything it does not generate.
//!
//! The engine asks a catalog for the site registry, crew home bases, named
//! numeric series (historical leak rates, repair-cost lists, per-site revisit
//! intervals) and the weather field. Production runs read JSON files from the
//! configured input directory; tests and built-in scenarios assemble an
//! in-memory catalog.

use crate::error::EnvError;
use crate::types::{Coordinates, SiteRecord};
use crate::weather::{ConstantWeather, GriddedWeather, WeatherField};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Source of the simulation's external inputs.
///
/// Implementations must be shareable across replicate workers; every method
/// takes `&self` and returns owned data.
pub trait InputCatalog: Send + Sync {
    /// Returns the site registry.
    fn sites(&self, name: &str) -> Result<Vec<SiteRecord>, EnvError>;

    /// Returns crew home-base locations.
    fn home_bases(&self, name: &str) -> Result<Vec<Coordinates>, EnvError>;

    /// Returns a named numeric series.
    fn series(&self, name: &str) -> Result<Vec<f64>, EnvError>;

    /// Returns the weather field, or a benign constant field if none is named.
    fn weather(&self, name: Option<&str>) -> Result<Arc<dyn WeatherField>, EnvError>;
}

/// Catalog assembled in memory.
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    sites: HashMap<String, Vec<SiteRecord>>,
    home_bases: HashMap<String, Vec<Coordinates>>,
    series: HashMap<String, Vec<f64>>,
    weather: HashMap<String, Arc<dyn WeatherField>>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a site table.
    pub fn with_sites(mut self, name: impl Into<String>, sites: Vec<SiteRecord>) -> Self {
        self.sites.insert(name.into(), sites);
        self
    }

    /// Registers a home-base table.
    pub fn with_home_bases(mut self, name: impl Into<String>, bases: Vec<Coordinates>) -> Self {
        self.home_bases.insert(name.into(), bases);
        self
    }

    /// Registers a numeric series.
    pub fn with_series(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.series.insert(name.into(), values);
        self
    }

    /// Registers a weather field.
    pub fn with_weather(mut self, name: impl Into<String>, field: Arc<dyn WeatherField>) -> Self {
        self.weather.insert(name.into(), field);
        self
    }
}

impl InputCatalog for InMemoryCatalog {
    fn sites(&self, name: &str) -> Result<Vec<SiteRecord>, EnvError> {
        self.sites.get(name).cloned().ok_or_else(|| EnvError::MissingInput(name.to_string()))
    }

    fn home_bases(&self, name: &str) -> Result<Vec<Coordinates>, EnvError> {
        self.home_bases.get(name).cloned().ok_or_else(|| EnvError::MissingInput(name.to_string()))
    }

    fn series(&self, name: &str) -> Result<Vec<f64>, EnvError> {
        self.series.get(name).cloned().ok_or_else(|| EnvError::MissingInput(name.to_string()))
    }

    fn weather(&self, name: Option<&str>) -> Result<Arc<dyn WeatherField>, EnvError> {
        match name {
            None => Ok(Arc::new(ConstantWeather::default())),
            Some(name) => self
                .weather
                .get(name)
                .cloned()
                .ok_or_else(|| EnvError::MissingInput(name.to_string())),
        }
    }
}

/// Catalog backed by JSON files in a directory.
///
/// File names are the input names. Parsed files are cached, so replicate
/// workers sharing one catalog read each file once.
pub struct JsonCatalog {
    root: PathBuf,
    series_cache: Mutex<HashMap<String, Vec<f64>>>,
    weather_cache: Mutex<HashMap<String, Arc<dyn WeatherField>>>,
}

impl JsonCatalog {
    /// Creates a catalog rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            series_cache: Mutex::new(HashMap::new()),
            weather_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the catalog root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, name: &str) -> Result<String, EnvError> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(EnvError::MissingInput(path.display().to_string()));
        }
        debug!("Reading input {}", path.display());
        std::fs::read_to_string(&path).map_err(|e| EnvError::io(&path, e))
    }

    fn parse<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, EnvError> {
        let text = self.read(name)?;
        serde_json::from_str(&text).map_err(|e| EnvError::malformed(name, e))
    }
}

impl InputCatalog for JsonCatalog {
    fn sites(&self, name: &str) -> Result<Vec<SiteRecord>, EnvError> {
        let sites: Vec<SiteRecord> = self.parse(name)?;
        if let Some(bad) = sites.iter().find(|s| !s.coordinates().is_valid()) {
            return Err(EnvError::malformed(
                name,
                format!("site '{}' has invalid coordinates", bad.facility_id),
            ));
        }
        Ok(sites)
    }

    fn home_bases(&self, name: &str) -> Result<Vec<Coordinates>, EnvError> {
        self.parse(name)
    }

    fn series(&self, name: &str) -> Result<Vec<f64>, EnvError> {
        let mut cache = self.series_cache.lock().map_err(|_| EnvError::malformed(name, "cache poisoned"))?;
        if let Some(values) = cache.get(name) {
            return Ok(values.clone());
        }
        let values: Vec<f64> = self.parse(name)?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EnvError::malformed(name, "series contains non-finite values"));
        }
        cache.insert(name.to_string(), values.clone());
        Ok(values)
    }

    fn weather(&self, name: Option<&str>) -> Result<Arc<dyn WeatherField>, EnvError> {
        let Some(name) = name else {
            return Ok(Arc::new(ConstantWeather::default()));
        };
        let mut cache = self.weather_cache.lock().map_err(|_| EnvError::malformed(name, "cache poisoned"))?;
        if let Some(field) = cache.get(name) {
            return Ok(Arc::clone(field));
        }
        let grid: GriddedWeather = self.parse(name)?;
        grid.validate(name)?;
        let field: Arc<dyn WeatherField> = Arc::new(grid);
        cache.insert(name.to_string(), Arc::clone(&field));
        Ok(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ldar_env_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_in_memory_catalog_lookup() {
        let catalog = InMemoryCatalog::new()
            .with_sites("sites", vec![SiteRecord::new("A", 50.0, -110.0)])
            .with_series("repair_costs", vec![100.0, 200.0]);

        assert_eq!(catalog.sites("sites").unwrap().len(), 1);
        assert_eq!(catalog.series("repair_costs").unwrap(), vec![100.0, 200.0]);
        assert!(matches!(catalog.series("nope"), Err(EnvError::MissingInput(_))));
    }

    #[test]
    fn test_unnamed_weather_is_constant() {
        let catalog = InMemoryCatalog::new();
        let field = catalog.weather(None).unwrap();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

        assert!(field.conditions(Coordinates::new(0.0, 0.0), date).is_ok());
    }

    #[test]
    fn test_json_catalog_reads_sites_and_series() {
        let dir = scratch_dir();
        std::fs::write(
            dir.join("sites.json"),
            r#"[{"facility_id": "A", "lat": 50.0, "lon": -110.0, "equipment_groups": 3}]"#,
        )
        .unwrap();
        std::fs::write(dir.join("rates.json"), "[0.5, 1.5, 2.5]").unwrap();

        let catalog = JsonCatalog::new(&dir);
        let sites = catalog.sites("sites.json").unwrap();
        assert_eq!(sites[0].equipment_groups, 3);
        assert_eq!(catalog.series("rates.json").unwrap().len(), 3);
        // Served from the cache the second time
        assert_eq!(catalog.series("rates.json").unwrap().len(), 3);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_json_catalog_rejects_bad_coordinates() {
        let dir = scratch_dir();
        std::fs::write(dir.join("sites.json"), r#"[{"facility_id": "A", "lat": 123.0, "lon": 0.0}]"#).unwrap();

        let catalog = JsonCatalog::new(&dir);
        assert!(matches!(catalog.sites("sites.json"), Err(EnvError::MalformedInput { .. })));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_json_catalog_missing_file() {
        let catalog = JsonCatalog::new(std::env::temp_dir().join("ldar_env_does_not_exist"));
        assert!(matches!(catalog.sites("sites.json"), Err(EnvError::MissingInput(_))));
    }
}
