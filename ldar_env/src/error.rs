//! Error types for the LDAR input/output abstraction.

use thiserror::Error;

/// Errors raised while loading simulation inputs or writing results.
///
/// Every variant is an input-data failure from the simulation's point of
/// view: it aborts the replicate that hit it and nothing else.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A named input (site table, series, weather field) does not exist
    #[error("Missing input '{0}'")]
    MissingInput(String),

    /// An input exists but its content is unusable
    #[error("Malformed input '{name}': {reason}")]
    MalformedInput {
        /// Input name (file or series label)
        name: String,
        /// What was wrong with it
        reason: String,
    },

    /// No weather value covers the requested location/date
    #[error("No weather data for ({lat:.4}, {lon:.4}) on {date}")]
    WeatherUnavailable {
        /// Latitude of the request
        lat: f64,
        /// Longitude of the request
        lon: f64,
        /// Requested date
        date: chrono::NaiveDate,
    },

    /// Filesystem failure while reading inputs or writing outputs
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Offending path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Record (de)serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The sink no longer accepts records
    #[error("Result sink closed")]
    SinkClosed,
}

impl EnvError {
    /// Creates a malformed-input error.
    pub fn malformed(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::MalformedInput {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an I/O error tagged with the path it happened on.
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
