use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{errors::Result, inventory::CACHE_VERSION};

/// Settings for a forecast model run collection.
///
/// Usually built with `Default` and tweaked, or read from a JSON document with `from_json`.
/// Missing fields in JSON take their default values.
///
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FmrcConfig {
    /// Synthesize a shared expected time axis for runs with the same hour of day
    pub regularize: bool,

    /// Which run is used to build the prototype dataset
    pub proto: ProtoChoice,

    /// Size limit, in bytes, of the in memory cache of per file inventories
    pub inventory_cache_bytes: u64,

    /// Persisted inventory records older than this version are regenerated
    pub min_cache_version: u32,

    /// Ignore persisted inventory records entirely and always regenerate them
    pub force_inventory: bool,
}

impl Default for FmrcConfig {
    fn default() -> Self {
        Self {
            regularize: false,
            proto: ProtoChoice::Penultimate,
            inventory_cache_bytes: 64 * 1024 * 1024,
            min_cache_version: CACHE_VERSION,
            force_inventory: false,
        }
    }
}

impl FmrcConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Selects the run whose files define the prototype dataset.
///
/// The latest run is often still being written, so the default is the one before it.
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProtoChoice {
    First,
    Penultimate,
    Latest,
    Run(DateTime<Utc>),
}

impl ProtoChoice {
    /// Pick an index into `runs`, which must be sorted ascending.
    ///
    /// An explicit run that isn't in the collection falls back to the penultimate run.
    ///
    pub fn select(&self, runs: &[DateTime<Utc>]) -> Option<usize> {
        if runs.is_empty() {
            return None;
        }
        let penultimate = if runs.len() > 1 { runs.len() - 2 } else { 0 };
        let index = match self {
            ProtoChoice::First => 0,
            ProtoChoice::Latest => runs.len() - 1,
            ProtoChoice::Penultimate => penultimate,
            ProtoChoice::Run(date) => runs
                .iter()
                .position(|run| run == date)
                .unwrap_or(penultimate),
        };

        Some(index)
    }
}

/// Configuration for the "best" time series view.
///
#[derive(Clone, Debug, Deserialize)]
pub struct BestConfig {
    /// Name given to the view
    pub name: String,

    /// Only forecast offsets (hours since run time) at or above this are used. Set to a small
    /// positive number to skip analysis times.
    #[serde(default)]
    pub min_offset: f64,
}

impl Default for BestConfig {
    fn default() -> Self {
        Self {
            name: String::from("best"),
            min_offset: 0.0,
        }
    }
}
