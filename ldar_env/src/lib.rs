//! LDAR Simulator Environment Abstraction Layer
//!
//! This crate separates the simulation engine from everything it reads and
//! writes, so the same engine runs against JSON input directories, in-memory
//! fixtures, files or test collectors.
//!
//! # Core Concept: Inputs In, Records Out
//!
//! - **Inputs** come from an [`InputCatalog`]: site registry, crew home bases,
//!   named numeric series and a [`WeatherField`].
//! - **Outputs** go to a [`ResultSink`] as [`RecordBatch`]es tagged with
//!   program and replicate index.
//!
//! Any failure here is an [`EnvError`]: an input-data problem that aborts the
//! replicate that hit it and nothing else.
//!
//! # Example
//!
//! ```ignore
//! use ldar_env::{InMemoryCatalog, InputCatalog, SiteRecord};
//!
//! let catalog = InMemoryCatalog::new()
//!     .with_sites("sites", vec![SiteRecord::new("F-1", 51.0, -114.0)]);
//! let sites = catalog.sites("sites")?;
//! ```

mod catalog;
mod error;
mod sink;
mod tokio_impl;
mod types;
mod weather;

pub use catalog::{InMemoryCatalog, InputCatalog, JsonCatalog};
pub use error::EnvError;
pub use sink::{MemorySink, RecordBatch, ResultSink};
pub use tokio_impl::JsonLinesSink;
pub use types::{Coordinates, RunId, SiteRecord, WeatherSample};
pub use weather::{nearest_index, ConstantWeather, GriddedWeather, WeatherField};
