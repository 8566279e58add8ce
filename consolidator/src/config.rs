//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program.

use std::{
    fs,
    num::{NonZeroU64, NonZeroUsize},
    path::Path,
    time::Duration,
};

use serde::Deserialize;

use crate::generator;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading the config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

const DEFAULT_SPOTS: NonZeroUsize = NonZeroUsize::new(8).unwrap();
const DEFAULT_FLUSH_INTERVAL_MILLIS: NonZeroU64 = NonZeroU64::new(1_000).unwrap();

fn default_spots() -> NonZeroUsize {
    DEFAULT_SPOTS
}

fn default_flush_interval_millis() -> NonZeroU64 {
    DEFAULT_FLUSH_INTERVAL_MILLIS
}

fn default_sink_capacity() -> NonZeroUsize {
    NonZeroUsize::MIN
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Main configuration struct for the consolidator
pub struct Config {
    /// The number of accumulators in the pool, and in every flushed batch
    #[serde(default = "default_spots")]
    pub spots: NonZeroUsize,
    /// The period of the flush loop, in milliseconds
    #[serde(default = "default_flush_interval_millis")]
    pub flush_interval_millis: NonZeroU64,
    /// The number of flushed batches the sink may hold before flush waits
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: NonZeroUsize,
    /// The synthetic load to drive through the consolidator, if any
    #[serde(default)]
    pub generator: Option<generator::Config>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spots: default_spots(),
            flush_interval_millis: default_flush_interval_millis(),
            sink_capacity: default_sink_capacity(),
            generator: None,
        }
    }
}

impl Config {
    /// The flush period as a [`Duration`]
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_millis.get())
    }

    /// Parse a [`Config`] from YAML contents
    ///
    /// # Errors
    ///
    /// Function will error if the contents are not valid YAML or do not match
    /// the expected structure.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse a [`Config`] from the file at `path`
    ///
    /// # Errors
    ///
    /// Function will error if the file cannot be read or does not parse.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}
