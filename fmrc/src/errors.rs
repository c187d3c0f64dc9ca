use std::io;
use std::result;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    IO(#[from] io::Error),

    #[error("unable to determine run date for {0}")]
    MissingRunDate(String),

    #[error("unusable inventory record: {0}")]
    BadCache(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no such variable: {0}")]
    BadName(String),

    #[error("file {location} belongs to run {found}, not {expected}")]
    RunDateMismatch {
        location: String,
        expected: String,
        found: String,
    },

    #[error("failed to load {0}")]
    Load(String),

    #[error("reader error: {0}")]
    Reader(String),

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("collection has not been successfully scanned yet")]
    NotReady,

    #[error("bad configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;
