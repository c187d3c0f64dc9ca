//! In memory stand-ins for the collaborators of a collection, and fixtures built on them.
//!
use std::{
    collections::{HashMap, HashSet},
    io,
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;

use crate::{
    buffer::{DataType, Fill, TypedArray},
    collection::{CollectionAggregate, CollectionBuilder},
    coord::{EnsCoord, TimeValues, VertCoord, VertValues},
    errors::{Error, Result},
    inventory::{FileInventory, INVENTORY_KEY},
    run::{RunAggregate, RunBuilder},
    schema::{Attribute, Dimension, FileSchema, VariableSchema},
    source::{Discovery, FileEntry, FileReader, GridFile, GridVariableInfo, TimeAxis},
    store::InventoryStore,
    time::to_iso,
};

pub(crate) fn date(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

/// A file held entirely in memory.
///
/// Every element of a grid at time step `t` has the value `marker + offset[t]`. Files made with
/// `for_run` use `100 * day + hour` of the run date as their marker, so values identify both
/// the run and the forecast hour they came from. Interval steps add a quarter of their start,
/// so intervals sharing an end hold different values.
///
#[derive(Clone)]
pub(crate) struct MemoryFile {
    location: String,
    start_time: Option<DateTime<Utc>>,
    marker: f64,
    grids: Vec<GridVariableInfo>,
    schema: FileSchema,
    data: HashMap<String, TypedArray>,
    closed: bool,
    open_files: Option<Arc<AtomicUsize>>,
}

impl MemoryFile {
    pub(crate) fn new<S: Into<String>>(location: S) -> Self {
        Self {
            location: location.into(),
            start_time: None,
            marker: 0.0,
            grids: vec![],
            schema: FileSchema::default(),
            data: HashMap::new(),
            closed: false,
            open_files: None,
        }
    }

    /// A file that declares its run date in its global attributes
    pub(crate) fn for_run<S: Into<String>>(location: S, run_date: DateTime<Utc>) -> Self {
        let mut file = Self::new(location).with_attribute(Attribute::text(
            "_CoordinateModelRunDate",
            to_iso(&run_date),
        ));
        file.marker = (run_date.day() * 100 + run_date.hour()) as f64;

        file
    }

    pub(crate) fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.schema.attributes.push(attribute);
        self
    }

    pub(crate) fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub(crate) fn with_grid(
        self,
        name: &str,
        time: &str,
        offsets: &[f64],
        vert: Option<VertCoord>,
        ens: Option<EnsCoord>,
        inner: &[usize],
    ) -> Self {
        let axis = TimeAxis {
            name: String::from(time),
            values: TimeValues::Points(offsets.to_vec()),
        };
        self.with_grid_axis(name, axis, vert, ens, inner)
    }

    /// A grid on an interval time axis, such as an accumulation
    pub(crate) fn with_interval_grid(
        self,
        name: &str,
        time: &str,
        bounds: &[[f64; 2]],
        inner: &[usize],
    ) -> Self {
        let axis = TimeAxis {
            name: String::from(time),
            values: TimeValues::Intervals(bounds.to_vec()),
        };
        self.with_grid_axis(name, axis, None, None, inner)
    }

    pub(crate) fn with_grid_axis(
        mut self,
        name: &str,
        time: TimeAxis,
        vert: Option<VertCoord>,
        ens: Option<EnsCoord>,
        inner: &[usize],
    ) -> Self {
        let (offsets, values): (Vec<f64>, Vec<f64>) = match &time.values {
            TimeValues::Points(offsets) => (offsets.clone(), offsets.clone()),
            TimeValues::Intervals(bounds) => bounds
                .iter()
                .map(|[start, end]| (*end, end + start / 4.0))
                .unzip(),
        };
        self.add_coordinate(&time.name, DataType::F64, offsets.clone());

        let mut dims: Vec<(String, usize)> = vec![(time.name.clone(), offsets.len())];
        if let Some(ens) = &ens {
            let members = (0..ens.members).map(|m| m as f64).collect();
            self.add_coordinate(&ens.name, DataType::I32, members);
            dims.push((ens.name.clone(), ens.members));
        }
        if let Some(vert) = &vert {
            let levels = match &vert.values {
                VertValues::Levels(levels) => levels.clone(),
                VertValues::Layers(layers) => layers.iter().map(|[a, b]| (a + b) / 2.0).collect(),
            };
            self.add_coordinate(&vert.name, DataType::F64, levels);
            dims.push((vert.name.clone(), vert.len()));
        }
        for (dim, len) in inner_dims(inner) {
            self.add_coordinate(&dim, DataType::F32, (0..len).map(|i| i as f64).collect());
            dims.push((dim, len));
        }

        let shape: Vec<usize> = dims.iter().map(|(_, len)| *len).collect();
        let marker = self.marker;
        let data =
            ArrayD::from_shape_fn(IxDyn(&shape), |index| (marker + values[index[0]]) as f32);
        self.add_variable(name, DataType::F32, &dims, TypedArray::F32(data));

        self.grids.push(GridVariableInfo {
            name: String::from(name),
            time: Some(time),
            vert,
            ens,
        });

        self
    }

    /// A variable without a time axis
    pub(crate) fn with_static(mut self, name: &str, inner: &[usize]) -> Self {
        let dims = inner_dims(inner);
        for (dim, len) in &dims {
            self.add_coordinate(dim, DataType::F32, (0..*len).map(|i| i as f64).collect());
        }
        let data = TypedArray::filled(DataType::F32, inner, Fill::Float(self.marker));
        self.add_variable(name, DataType::F32, &dims, data);
        self.grids.push(GridVariableInfo {
            name: String::from(name),
            time: None,
            vert: None,
            ens: None,
        });

        self
    }

    fn add_coordinate(&mut self, name: &str, data_type: DataType, values: Vec<f64>) {
        if self.schema.variable(name).is_some() {
            return;
        }
        let len = values.len();
        let data = TypedArray::from(ArrayD::from_shape_vec(IxDyn(&[len]), values).unwrap())
            .convert(data_type);
        self.add_variable(name, data_type, &[(String::from(name), len)], data);
    }

    fn add_variable(
        &mut self,
        name: &str,
        data_type: DataType,
        dims: &[(String, usize)],
        data: TypedArray,
    ) {
        for (dim, len) in dims {
            if self.schema.dimension(dim).is_none() {
                self.schema.dimensions.push(Dimension::new(dim.as_str(), *len));
            }
        }
        let dims = dims.iter().map(|(dim, len)| (dim.as_str(), *len)).collect();
        let attributes = vec![Attribute::text("units", "1")];
        self.schema
            .variables
            .push(VariableSchema::new(name, data_type, dims, attributes));
        self.data.insert(String::from(name), data);
    }
}

fn inner_dims(inner: &[usize]) -> Vec<(String, usize)> {
    let names: Vec<String> = match inner.len() {
        1 => vec![String::from("x")],
        2 => vec![String::from("y"), String::from("x")],
        n => (0..n).map(|i| format!("dim{i}")).collect(),
    };

    names.into_iter().zip(inner.iter().copied()).collect()
}

#[async_trait]
impl GridFile for MemoryFile {
    fn location(&self) -> &str {
        &self.location
    }

    fn grid_variables(&self) -> Vec<GridVariableInfo> {
        self.grids.clone()
    }

    fn schema(&self) -> FileSchema {
        self.schema.clone()
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    async fn read_slice(&self, name: &str, ranges: &[Range<usize>]) -> Result<TypedArray> {
        if self.closed {
            return Err(Error::Reader(format!("{} is closed", self.location)));
        }
        let data = self
            .data
            .get(name)
            .ok_or_else(|| Error::BadName(String::from(name)))?;

        data.slice(ranges)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(open_files) = &self.open_files {
                open_files.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Hands out copies of `MemoryFile`s and keeps track of how many are open.
///
pub(crate) struct MemoryReader {
    files: Mutex<HashMap<String, MemoryFile>>,
    failing: Mutex<HashSet<String>>,
    opens: AtomicUsize,
    open_files: Arc<AtomicUsize>,
}

impl MemoryReader {
    pub(crate) fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            opens: AtomicUsize::new(0),
            open_files: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn add(&self, file: MemoryFile) {
        self.files.lock().insert(file.location.clone(), file);
    }

    pub(crate) fn remove(&self, location: &str) {
        self.files.lock().remove(location);
    }

    /// Make opening `location` fail
    pub(crate) fn fail(&self, location: &str) {
        self.failing.lock().insert(String::from(location));
    }

    /// Total number of successful opens
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of files opened and not yet closed
    pub(crate) fn open_files(&self) -> usize {
        self.open_files.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileReader for MemoryReader {
    async fn open(&self, path: &str) -> Result<Box<dyn GridFile>> {
        if self.failing.lock().contains(path) {
            return Err(Error::Reader(format!("unable to open {path}")));
        }
        let mut file = self
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(String::from(path)))?;
        file.open_files = Some(Arc::clone(&self.open_files));
        self.open_files.fetch_add(1, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(file))
    }
}

pub(crate) struct MemoryStore {
    records: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn contains(&self, file_id: &str) -> bool {
        self.records
            .lock()
            .contains_key(&(String::from(file_id), String::from(INVENTORY_KEY)))
    }

    /// Chop an inventory record in half
    pub(crate) fn corrupt(&self, file_id: &str) {
        let key = (String::from(file_id), String::from(INVENTORY_KEY));
        if let Some(bytes) = self.records.lock().get_mut(&key) {
            bytes.truncate(bytes.len() / 2);
        }
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn get(&self, file_id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let key = (String::from(file_id), String::from(key));
        Ok(self.records.lock().get(&key).cloned())
    }

    async fn put(&self, file_id: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let key = (String::from(file_id), String::from(key));
        self.records.lock().insert(key, bytes.to_vec());

        Ok(())
    }
}

pub(crate) struct MemoryDiscovery {
    files: Mutex<Vec<FileEntry>>,
    failing: AtomicBool,
}

impl MemoryDiscovery {
    pub(crate) fn new() -> Self {
        Self {
            files: Mutex::new(vec![]),
            failing: AtomicBool::new(false),
        }
    }

    /// Add a file, or update its modification time if already present
    pub(crate) fn add(&self, path: &str, last_modified: DateTime<Utc>) {
        let mut files = self.files.lock();
        match files.iter_mut().find(|entry| entry.path == path) {
            Some(entry) => entry.last_modified = last_modified,
            None => files.push(FileEntry::new(path, last_modified)),
        }
    }

    pub(crate) fn remove(&self, path: &str) {
        self.files.lock().retain(|entry| entry.path != path);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn list_files_sorted(&self) -> Result<Vec<FileEntry>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "listing failed").into());
        }
        let mut files = self.files.lock().clone();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(files)
    }

    fn extract_run_date(&self, _path: &str) -> Option<DateTime<Utc>> {
        None
    }
}

/// Inventory of a file, without going through a store
pub(crate) fn inventory(file: &MemoryFile) -> Arc<FileInventory> {
    let run_date = FileInventory::resolve_run_date(file, None).unwrap();
    Arc::new(FileInventory::build(file, run_date, run_date))
}

/// Aggregate files that share a run date
pub(crate) fn run_of(files: &[MemoryFile]) -> Arc<RunAggregate> {
    let inventories: Vec<Arc<FileInventory>> = files.iter().map(inventory).collect();
    let mut builder = RunBuilder::new(inventories[0].run_date);
    for inventory in inventories {
        builder.add_file(inventory).unwrap();
    }

    Arc::new(builder.finish())
}

/// Aggregate runs, each given as the files making it up
pub(crate) fn aggregate(runs: Vec<Vec<MemoryFile>>, regularize: bool) -> CollectionAggregate {
    let mut builder = CollectionBuilder::new(regularize);
    for files in runs {
        builder.add_run(run_of(&files)).unwrap();
    }

    builder.finish().unwrap()
}

/// A reader serving every file of `runs`
pub(crate) fn reader_for(runs: &[Vec<MemoryFile>]) -> Arc<MemoryReader> {
    let reader = MemoryReader::new();
    for file in runs.iter().flatten() {
        reader.add(file.clone());
    }

    Arc::new(reader)
}
