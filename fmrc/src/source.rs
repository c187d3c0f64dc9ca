//! Interfaces to the collaborators that find and read the physical files of a collection.
//!
use std::ops::Range;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    buffer::TypedArray,
    coord::{EnsCoord, TimeValues, VertCoord},
    errors::Result,
    schema::{AttributeValue, FileSchema},
};

/// A file in the collection, as reported by `Discovery`.
///
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub last_modified: DateTime<Utc>,
}

impl FileEntry {
    pub fn new<S: Into<String>>(path: S, last_modified: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            last_modified,
        }
    }
}

/// Finds the files that make up a collection.
///
#[async_trait]
pub trait Discovery: Send + Sync {
    /// List all files currently in the collection, sorted by path.
    ///
    async fn list_files_sorted(&self) -> Result<Vec<FileEntry>>;

    /// Work out a file's run date from its path alone, if the collection's naming scheme
    /// encodes it. Returning `None` defers to the file's own metadata.
    ///
    fn extract_run_date(&self, path: &str) -> Option<DateTime<Utc>>;
}

/// Opens files of the collection for reading.
///
#[async_trait]
pub trait FileReader: Send + Sync {
    async fn open(&self, path: &str) -> Result<Box<dyn GridFile>>;
}

/// A time axis as it appears in a file. Offsets are in hours from the file's run date.
///
#[derive(Clone, Debug)]
pub struct TimeAxis {
    pub name: String,
    pub values: TimeValues,
}

/// A gridded variable and the axes it is laid out on.
///
/// When present, the time axis is the variable's outermost dimension. Variables without a time
/// axis are not aggregated.
///
#[derive(Clone, Debug)]
pub struct GridVariableInfo {
    pub name: String,
    pub time: Option<TimeAxis>,
    pub vert: Option<VertCoord>,
    pub ens: Option<EnsCoord>,
}

/// An open file.
///
#[async_trait]
pub trait GridFile: Send + Sync {
    fn location(&self) -> &str;

    /// The file's gridded variables with their axes
    fn grid_variables(&self) -> Vec<GridVariableInfo>;

    /// Dimensions, variables and global attributes, without bulk data
    fn schema(&self) -> FileSchema;

    fn global_attribute(&self, name: &str) -> Option<AttributeValue> {
        self.schema().attribute(name).cloned()
    }

    /// Start of the time range covered by the file, if known
    fn start_time(&self) -> Option<DateTime<Utc>>;

    /// Read the hyperslab of variable `name` selected by one range per dimension.
    ///
    async fn read_slice(&self, name: &str, ranges: &[Range<usize>]) -> Result<TypedArray>;

    /// Release any resources held by the file. Further reads are an error.
    ///
    fn close(&mut self);
}
