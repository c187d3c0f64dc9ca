//! The virtual dataset: a prototype schema from one representative run, expanded to a
//! run × time array per grid, with data read lazily from the collection's files.
//!
use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use ndarray::Array1;
use tracing::{debug, info, warn};

use crate::{
    buffer::{DataType, TypedArray},
    collection::CollectionAggregate,
    config::ProtoChoice,
    errors::{Error, Result},
    lite::{LiteInventory, TimeInstance},
    schema::{Attribute, Dimension, FileSchema, VariableSchema},
    source::{FileReader, GridFile},
    time::{hours_between, hours_since, to_iso},
};

/// Name of the run dimension and coordinate
pub const RUN: &str = "run";

/// How the data of a virtual variable is obtained.
///
#[derive(Clone, Debug)]
pub enum Payload {
    /// An aggregated grid, read cell by cell from whichever file holds each run and time
    Grid {
        /// Index into `CollectionAggregate::grids`
        grid: usize,

        /// Index into `LiteInventory::time_tables`
        table: usize,
    },

    /// Data held in memory
    Cached(TypedArray),

    /// A variable read directly from a single file
    File { location: String, name: String },
}

#[derive(Clone, Debug)]
pub struct VirtualVariable {
    pub schema: VariableSchema,
    pub payload: Payload,
}

/// Opens files on demand and closes all of them when dropped.
///
/// A scope lives for one top level read call and is never shared.
///
struct FileScope<'a> {
    reader: &'a dyn FileReader,
    files: HashMap<String, Box<dyn GridFile>>,
}

impl<'a> FileScope<'a> {
    fn new(reader: &'a dyn FileReader) -> Self {
        Self {
            reader,
            files: HashMap::new(),
        }
    }

    async fn open(&mut self, location: &str) -> Result<&dyn GridFile> {
        if !self.files.contains_key(location) {
            let file = self.reader.open(location).await?;
            self.files.insert(String::from(location), file);
        }

        Ok(&*self.files[location])
    }
}

impl Drop for FileScope<'_> {
    fn drop(&mut self) {
        for file in self.files.values_mut() {
            file.close();
        }
    }
}

/// Structure of one representative run: dimensions, variables and attributes merged across its
/// files, plus the data of its coordinate variables.
///
#[derive(Clone, Debug)]
pub struct Prototype {
    pub run_date: DateTime<Utc>,
    pub schema: FileSchema,

    /// File each variable's schema came from
    sources: HashMap<String, String>,

    /// Data of one dimensional variables named after their dimension
    coordinates: HashMap<String, TypedArray>,
}

impl Prototype {
    pub async fn build(
        agg: &CollectionAggregate,
        reader: &dyn FileReader,
        choice: &ProtoChoice,
    ) -> Result<Self> {
        let index = choice
            .select(&agg.run_dates())
            .ok_or_else(|| Error::NotFound(String::from("no runs to build prototype from")))?;
        let run = &agg.runs[index];
        info!(
            run_date = %to_iso(&run.run_date),
            files = run.files.len(),
            "building prototype dataset"
        );

        let mut proto = Self {
            run_date: run.run_date,
            schema: FileSchema::default(),
            sources: HashMap::new(),
            coordinates: HashMap::new(),
        };
        let mut scope = FileScope::new(reader);
        for file in &run.files {
            let handle = match scope.open(&file.location).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(location = %file.location, %err, "skipping file for prototype");
                    continue;
                }
            };
            let schema = handle.schema();
            let names: Vec<String> = schema.variables.iter().map(|v| v.name.clone()).collect();
            proto.merge(handle, &schema, &names).await?;
        }

        if proto.schema.variables.is_empty() {
            return Err(Error::NotFound(format!(
                "no readable files in run {}",
                to_iso(&run.run_date)
            )));
        }

        Ok(proto)
    }

    /// Merge the variables `names` of `schema`, with the dimensions and coordinate variables
    /// they use. Anything already present wins.
    ///
    async fn merge(
        &mut self,
        file: &dyn GridFile,
        schema: &FileSchema,
        names: &[String],
    ) -> Result<()> {
        let mut wanted: Vec<&VariableSchema> = vec![];
        for name in names {
            if let Some(var) = schema.variable(name) {
                wanted.push(var);
                for dim in &var.dims {
                    match schema.variable(dim) {
                        Some(coord) if coord.is_coordinate() => wanted.push(coord),
                        _ => {}
                    }
                }
            }
        }

        let mut partial = FileSchema {
            attributes: schema.attributes.clone(),
            ..FileSchema::default()
        };
        for var in wanted {
            if self.schema.variable(&var.name).is_some() || partial.variable(&var.name).is_some()
            {
                continue;
            }
            for dim in &var.dims {
                if partial.dimension(dim).is_none() {
                    if let Some(dim) = schema.dimension(dim) {
                        partial.dimensions.push(dim.clone());
                    }
                }
            }
            if var.is_coordinate() {
                let data = file.read_slice(&var.name, &[0..var.shape[0]]).await?;
                self.coordinates.insert(var.name.clone(), data);
            }
            self.sources
                .insert(var.name.clone(), String::from(file.location()));
            partial.variables.push(var.clone());
        }
        self.schema.merge(&partial);

        Ok(())
    }

    /// A copy of this prototype extended with any grids of `agg` it doesn't have. Each missing
    /// grid's schema comes from the latest run that has it.
    ///
    pub async fn complete(
        &self,
        agg: &CollectionAggregate,
        reader: &dyn FileReader,
    ) -> Result<Self> {
        let mut proto = self.clone();
        let mut scope = FileScope::new(reader);
        for grid in agg.grids.iter().rev() {
            if proto.schema.variable(&grid.name).is_some() {
                continue;
            }
            let entry = match grid.runs.last() {
                Some(entry) => entry,
                None => continue,
            };
            let run = &agg.runs[entry.run];
            let part = &agg.run_grid(entry).parts[0];
            let location = &run.files[part.file].location;
            let handle = match scope.open(location).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(grid = %grid.name, %location, %err, "unable to get schema for grid");
                    continue;
                }
            };
            debug!(grid = %grid.name, %location, "grid missing from prototype run");
            let schema = handle.schema();
            proto.merge(handle, &schema, &[grid.name.clone()]).await?;
        }

        Ok(proto)
    }

    pub fn coordinate(&self, name: &str) -> Option<&TypedArray> {
        self.coordinates.get(name)
    }
}

fn check_section(schema: &VariableSchema, section: &[Range<usize>]) -> Result<()> {
    if section.len() != schema.shape.len()
        || section
            .iter()
            .zip(&schema.shape)
            .any(|(range, len)| range.start > range.end || range.end > *len)
    {
        return Err(Error::Reader(format!(
            "section {section:?} out of bounds for {} with shape {:?}",
            schema.name, schema.shape
        )));
    }

    Ok(())
}

fn whole(schema: &VariableSchema) -> Vec<Range<usize>> {
    schema.shape.iter().map(|len| 0..*len).collect()
}

fn cached_f64(values: Vec<f64>, shape: &[usize]) -> Result<TypedArray> {
    TypedArray::from(Array1::from(values).into_dyn()).into_shape(shape)
}

/// The full run × time dataset of a collection.
///
pub struct VirtualDataset {
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub variables: Vec<VirtualVariable>,

    aggregate: Arc<CollectionAggregate>,
    lite: Arc<LiteInventory>,
    reader: Arc<dyn FileReader>,
}

impl VirtualDataset {
    pub fn build(
        aggregate: Arc<CollectionAggregate>,
        lite: Arc<LiteInventory>,
        proto: &Prototype,
        reader: Arc<dyn FileReader>,
    ) -> Result<Self> {
        let runs = lite.run_dates.len();
        let base_units = hours_since(&lite.base_date);

        // Per file time dimensions are replaced by the run and run sequence dimensions
        let time_dims: HashSet<&str> = aggregate
            .grids
            .iter()
            .filter_map(|grid| proto.schema.variable(&grid.name))
            .filter_map(|var| var.dims.first().map(|dim| dim.as_str()))
            .collect();

        let mut dimensions: Vec<Dimension> = proto
            .schema
            .dimensions
            .iter()
            .filter(|dim| !time_dims.contains(dim.name.as_str()))
            .cloned()
            .collect();
        dimensions.push(Dimension::new(RUN, runs));

        let mut variables = vec![VirtualVariable {
            schema: VariableSchema::new(
                RUN,
                DataType::F64,
                vec![(RUN, runs)],
                vec![
                    Attribute::text("units", base_units.as_str()),
                    Attribute::text("long_name", "run times"),
                    Attribute::text("standard_name", "forecast_reference_time"),
                ],
            ),
            payload: Payload::Cached(cached_f64(
                lite.run_dates
                    .iter()
                    .map(|run_date| hours_between(&lite.base_date, run_date))
                    .collect(),
                &[runs],
            )?),
        }];

        for table in &lite.time_tables {
            let slots = table.slots();
            dimensions.push(Dimension::new(table.name.as_str(), slots));
            let dims = vec![(RUN, runs), (table.name.as_str(), slots)];
            let offsets = table.offset_array();
            let mut relative = offsets.clone();
            for (mut row, run_offset) in relative.rows_mut().into_iter().zip(&table.run_offsets) {
                row -= *run_offset;
            }

            variables.push(VirtualVariable {
                schema: VariableSchema::new(
                    table.name.as_str(),
                    DataType::F64,
                    dims.clone(),
                    vec![
                        Attribute::text("units", base_units.as_str()),
                        Attribute::text("long_name", "forecast times"),
                        Attribute::text("standard_name", "time"),
                        Attribute::number("_FillValue", f64::NAN),
                    ],
                ),
                payload: Payload::Cached(TypedArray::from(offsets.into_dyn())),
            });
            variables.push(VirtualVariable {
                schema: VariableSchema::new(
                    format!("{}_offset", table.name),
                    DataType::F64,
                    dims,
                    vec![
                        Attribute::text("units", "hours"),
                        Attribute::text("long_name", "offset hour from start of run"),
                        Attribute::text("standard_name", "forecast_period"),
                        Attribute::number("_FillValue", f64::NAN),
                    ],
                ),
                payload: Payload::Cached(TypedArray::from(relative.into_dyn())),
            });
        }

        let synthesized: HashSet<String> =
            variables.iter().map(|v| v.schema.name.clone()).collect();
        for var in &proto.schema.variables {
            if synthesized.contains(&var.name) {
                debug!(variable = %var.name, "replaced by aggregation variable");
                continue;
            }

            if let Some(grid) = aggregate.grid_index(&var.name) {
                let table = match lite.grid(&var.name) {
                    Some(lite_grid) => lite_grid.time_table,
                    None => {
                        return Err(Error::Invariant(format!(
                            "grid {} missing from lite inventory",
                            var.name
                        )))
                    }
                };
                let table_name = lite.time_tables[table].name.as_str();
                let mut dims = vec![(RUN, runs), (table_name, lite.time_tables[table].slots())];
                dims.extend(
                    var.dims[1..]
                        .iter()
                        .map(|dim| dim.as_str())
                        .zip(var.shape[1..].iter().copied()),
                );
                variables.push(VirtualVariable {
                    schema: VariableSchema::new(
                        var.name.as_str(),
                        var.data_type,
                        dims,
                        var.attributes.clone(),
                    ),
                    payload: Payload::Grid { grid, table },
                });
                continue;
            }

            if var.dims.iter().any(|dim| time_dims.contains(dim.as_str())) {
                debug!(variable = %var.name, "not aggregated, dropping");
                continue;
            }

            let payload = match (proto.coordinate(&var.name), proto.sources.get(&var.name)) {
                (Some(data), _) => Payload::Cached(data.clone()),
                (None, Some(location)) => Payload::File {
                    location: location.clone(),
                    name: var.name.clone(),
                },
                (None, None) => {
                    return Err(Error::Invariant(format!(
                        "no source for prototype variable {}",
                        var.name
                    )))
                }
            };
            variables.push(VirtualVariable {
                schema: var.clone(),
                payload,
            });
        }

        for grid in &aggregate.grids {
            if proto.schema.variable(&grid.name).is_none() {
                warn!(grid = %grid.name, "no schema available, leaving grid out of dataset");
            }
        }

        Ok(Self {
            dimensions,
            attributes: proto.schema.attributes.clone(),
            variables,
            aggregate,
            lite,
            reader,
        })
    }

    pub fn variable(&self, name: &str) -> Option<&VirtualVariable> {
        self.variables.iter().find(|var| var.schema.name == name)
    }

    pub fn schema(&self) -> FileSchema {
        FileSchema {
            dimensions: self.dimensions.clone(),
            variables: self.variables.iter().map(|v| v.schema.clone()).collect(),
            attributes: self.attributes.clone(),
        }
    }

    pub fn aggregate(&self) -> &Arc<CollectionAggregate> {
        &self.aggregate
    }

    pub fn lite(&self) -> &Arc<LiteInventory> {
        &self.lite
    }

    pub async fn read_whole(&self, name: &str) -> Result<TypedArray> {
        let var = self
            .variable(name)
            .ok_or_else(|| Error::BadName(String::from(name)))?;

        self.read(name, &whole(&var.schema)).await
    }

    /// Read the hyperslab of `name` selected by one range per dimension.
    ///
    pub async fn read(&self, name: &str, section: &[Range<usize>]) -> Result<TypedArray> {
        let var = self
            .variable(name)
            .ok_or_else(|| Error::BadName(String::from(name)))?;
        check_section(&var.schema, section)?;

        match &var.payload {
            Payload::Grid { grid, table } => {
                let cells: Vec<(usize, usize)> = section[0]
                    .clone()
                    .flat_map(|run| section[1].clone().map(move |index| (run, index)))
                    .collect();
                let shape: Vec<usize> = section.iter().map(|range| range.len()).collect();
                let data = self
                    .read_cells(*grid, *table, &var.schema, &cells, &section[2..])
                    .await?;

                data.into_shape(&shape)
            }
            Payload::Cached(data) => data.slice(section),
            Payload::File { location, name } => {
                let mut scope = FileScope::new(&*self.reader);
                let file = scope.open(location).await?;
                let data = file.read_slice(name, section).await?;

                Ok(data)
            }
        }
    }

    /// Read `cells`, given as (run, slot) pairs of the grid's time table, restricted to `inner`
    /// in the remaining dimensions. The result has shape `[cells.len(), inner...]`.
    ///
    /// Cells with no data anywhere in the collection get the variable's missing value.
    ///
    async fn read_cells(
        &self,
        grid: usize,
        table: usize,
        schema: &VariableSchema,
        cells: &[(usize, usize)],
        inner: &[Range<usize>],
    ) -> Result<TypedArray> {
        let grid = &self.aggregate.grids[grid];
        let table = &self.lite.time_tables[table];
        let mut shape = vec![cells.len()];
        shape.extend(inner.iter().map(|range| range.len()));
        let mut data = TypedArray::filled(schema.data_type, &shape, schema.missing_value());
        let expected_inner = &schema.shape[2..];

        let mut scope = FileScope::new(&*self.reader);
        for (i, (run, index)) in cells.iter().enumerate() {
            let bounds = match table.run_bounds(*run, *index) {
                Some(bounds) => bounds,
                None => continue,
            };
            let entry = match grid.run(*run) {
                Some(entry) => entry,
                None => continue,
            };
            let (file, record) =
                match self.aggregate.runs[*run].locate(self.aggregate.run_grid(entry), bounds) {
                    Some(found) => found,
                    None => continue,
                };

            let handle = scope.open(&file.location).await?;
            let file_shape = match handle.schema().variable(&grid.name) {
                Some(var) => var.shape.clone(),
                None => {
                    warn!(location = %file.location, grid = %grid.name, "grid missing from file");
                    continue;
                }
            };
            if file_shape.get(1..) != Some(expected_inner) {
                warn!(
                    location = %file.location,
                    grid = %grid.name,
                    expected = ?expected_inner,
                    found = ?file_shape,
                    "shape mismatch, treating as missing"
                );
                continue;
            }

            let mut ranges = vec![record..record + 1];
            ranges.extend(inner.iter().cloned());
            let slab = handle.read_slice(&grid.name, &ranges).await?;
            data.assign_at(i, slab)?;
        }

        Ok(data)
    }
}

/// Which one dimensional slice of the run × time grid a `TimeView` shows.
///
#[derive(Clone, Debug, PartialEq)]
pub enum ViewKind {
    /// The most recent forecast for each valid time
    Best { min_offset: f64 },

    /// Every forecast of one run
    SingleRun(DateTime<Utc>),

    /// Every forecast, from any run, valid at one time
    ConstantForecastTime(DateTime<Utc>),

    /// The forecast a fixed number of hours after each run
    ConstantOffset(f64),
}

#[derive(Clone, Debug)]
enum ViewSource {
    Grid { grid: usize, table: usize },
    Cached(TypedArray),
    Parent,
}

#[derive(Clone, Debug)]
pub struct ViewVariable {
    pub schema: VariableSchema,
    source: ViewSource,
}

/// A one dimensional time series view of a `VirtualDataset`.
///
/// Each run sequence's time dimension lists the table cells the view selected. Aggregated
/// grids read through the dataset's cell reader, everything else is delegated to the dataset.
///
pub struct TimeView {
    pub name: String,
    pub kind: ViewKind,
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub variables: Vec<ViewVariable>,

    /// Selected cells, per time table
    pub cells: Vec<Vec<TimeInstance>>,

    dataset: Arc<VirtualDataset>,
}

impl TimeView {
    pub fn build<S: Into<String>>(
        dataset: Arc<VirtualDataset>,
        name: S,
        kind: ViewKind,
    ) -> Result<Self> {
        let lite = Arc::clone(dataset.lite());
        let cells = lite
            .time_tables
            .iter()
            .map(|table| match &kind {
                ViewKind::Best { min_offset } => Ok(table.best_time_offsets(*min_offset)),
                ViewKind::SingleRun(run_date) => match lite.run_index(run_date) {
                    Some(run) => Ok(table.run_column(run)),
                    None => Err(Error::NotFound(format!("run {}", to_iso(run_date)))),
                },
                ViewKind::ConstantForecastTime(date) => {
                    Ok(table.constant_forecast_time(hours_between(&lite.base_date, date)))
                }
                ViewKind::ConstantOffset(hours) => Ok(table.constant_offset_column(*hours)),
            })
            .collect::<Result<Vec<_>>>()?;

        let table_names: HashSet<&str> =
            lite.time_tables.iter().map(|t| t.name.as_str()).collect();
        let mut dimensions: Vec<Dimension> = dataset
            .dimensions
            .iter()
            .filter(|dim| dim.name != RUN && !table_names.contains(dim.name.as_str()))
            .cloned()
            .collect();

        let base_units = hours_since(&lite.base_date);
        let mut variables = vec![];
        for (table, selected) in lite.time_tables.iter().zip(&cells) {
            let n = selected.len();
            dimensions.push(Dimension::new(table.name.as_str(), n));

            let time: Vec<f64> = selected.iter().map(|c| c.offset).collect();
            let runs: Vec<f64> = selected.iter().map(|c| table.run_offsets[c.run]).collect();
            let offsets: Vec<f64> = time.iter().zip(&runs).map(|(t, r)| t - r).collect();
            let run_name = format!("{}_run", table.name);
            let offset_name = format!("{}_offset", table.name);
            let columns = [
                (table.name.clone(), time, base_units.as_str(), "time"),
                (run_name, runs, base_units.as_str(), "forecast_reference_time"),
                (offset_name, offsets, "hours", "forecast_period"),
            ];
            for (name, values, units, standard_name) in columns {
                variables.push(ViewVariable {
                    schema: VariableSchema::new(
                        name,
                        DataType::F64,
                        vec![(table.name.as_str(), n)],
                        vec![
                            Attribute::text("units", units),
                            Attribute::text("standard_name", standard_name),
                        ],
                    ),
                    source: ViewSource::Cached(cached_f64(values, &[n])?),
                });
            }
        }

        for var in &dataset.variables {
            match &var.payload {
                Payload::Grid { grid, table } => {
                    let table_name = lite.time_tables[*table].name.as_str();
                    let mut dims = vec![(table_name, cells[*table].len())];
                    dims.extend(
                        var.schema.dims[2..]
                            .iter()
                            .map(|dim| dim.as_str())
                            .zip(var.schema.shape[2..].iter().copied()),
                    );
                    variables.push(ViewVariable {
                        schema: VariableSchema::new(
                            var.schema.name.as_str(),
                            var.schema.data_type,
                            dims,
                            var.schema.attributes.clone(),
                        ),
                        source: ViewSource::Grid {
                            grid: *grid,
                            table: *table,
                        },
                    });
                }
                _ if var.schema.dims.first().map(|d| d.as_str()) == Some(RUN) => {}
                _ => variables.push(ViewVariable {
                    schema: var.schema.clone(),
                    source: ViewSource::Parent,
                }),
            }
        }

        Ok(Self {
            name: name.into(),
            kind,
            dimensions,
            attributes: dataset.attributes.clone(),
            variables,
            cells,
            dataset,
        })
    }

    pub fn variable(&self, name: &str) -> Option<&ViewVariable> {
        self.variables.iter().find(|var| var.schema.name == name)
    }

    pub fn schema(&self) -> FileSchema {
        FileSchema {
            dimensions: self.dimensions.clone(),
            variables: self.variables.iter().map(|v| v.schema.clone()).collect(),
            attributes: self.attributes.clone(),
        }
    }

    pub async fn read_whole(&self, name: &str) -> Result<TypedArray> {
        let var = self
            .variable(name)
            .ok_or_else(|| Error::BadName(String::from(name)))?;

        self.read(name, &whole(&var.schema)).await
    }

    pub async fn read(&self, name: &str, section: &[Range<usize>]) -> Result<TypedArray> {
        let var = self
            .variable(name)
            .ok_or_else(|| Error::BadName(String::from(name)))?;
        check_section(&var.schema, section)?;

        match &var.source {
            ViewSource::Grid { grid, table } => {
                let cells: Vec<(usize, usize)> = self.cells[*table][section[0].clone()]
                    .iter()
                    .map(|cell| (cell.run, cell.index))
                    .collect();
                let parent = self
                    .dataset
                    .variable(name)
                    .ok_or_else(|| Error::Invariant(format!("{name} missing from dataset")))?;

                self.dataset
                    .read_cells(*grid, *table, &parent.schema, &cells, &section[1..])
                    .await
            }
            ViewSource::Cached(data) => data.slice(section),
            ViewSource::Parent => self.dataset.read(name, section).await,
        }
    }
}

/// Progress of the materializer through building a dataset.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterializerState {
    Empty,
    Proto,
    Full,
}

/// Builds virtual datasets, keeping the prototype between builds.
///
/// The prototype is built on first use and then reused until a rebuild is forced.
///
pub struct Materializer {
    state: MaterializerState,
    proto: Option<Arc<Prototype>>,
    proto_changed: Option<DateTime<Utc>>,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Materializer {
    pub fn new() -> Self {
        Self {
            state: MaterializerState::Empty,
            proto: None,
            proto_changed: None,
        }
    }

    pub fn state(&self) -> MaterializerState {
        self.state
    }

    pub fn proto(&self) -> Option<&Arc<Prototype>> {
        self.proto.as_ref()
    }

    /// When the prototype was last rebuilt
    pub fn proto_changed(&self) -> Option<DateTime<Utc>> {
        self.proto_changed
    }

    pub async fn materialize(
        &mut self,
        aggregate: Arc<CollectionAggregate>,
        lite: Arc<LiteInventory>,
        reader: Arc<dyn FileReader>,
        choice: &ProtoChoice,
        force_proto: bool,
    ) -> Result<Arc<VirtualDataset>> {
        let proto = match &self.proto {
            Some(proto) if !force_proto => Arc::clone(proto),
            _ => {
                let proto = Arc::new(Prototype::build(&aggregate, &*reader, choice).await?);
                self.proto = Some(Arc::clone(&proto));
                self.proto_changed = Some(Utc::now());
                self.state = MaterializerState::Proto;
                proto
            }
        };

        let proto = proto.complete(&aggregate, &*reader).await?;
        let dataset = VirtualDataset::build(aggregate, lite, &proto, reader)?;
        self.state = MaterializerState::Full;

        Ok(Arc::new(dataset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coord::VertCoord,
        testing::{aggregate, date, reader_for, MemoryFile, MemoryReader},
    };

    async fn materialize(
        runs: Vec<Vec<MemoryFile>>,
        regularize: bool,
        choice: ProtoChoice,
    ) -> Result<(Arc<MemoryReader>, Arc<VirtualDataset>)> {
        let reader = reader_for(&runs);
        let agg = Arc::new(aggregate(runs, regularize));
        let lite = Arc::new(LiteInventory::from_aggregate(&agg));
        let mut materializer = Materializer::new();
        let dataset = materializer
            .materialize(agg, lite, reader.clone(), &choice, false)
            .await?;

        Ok((reader, dataset))
    }

    fn two_runs() -> Vec<Vec<MemoryFile>> {
        vec![
            vec![MemoryFile::for_run("r1.grib2", date(1, 0))
                .with_grid("temp", "time", &[0.0, 3.0, 6.0], None, None, &[2])
                .with_static("orography", &[2])],
            vec![MemoryFile::for_run("r2.grib2", date(2, 0))
                .with_grid("temp", "time", &[0.0, 3.0, 6.0, 9.0], None, None, &[2])
                .with_static("orography", &[2])],
        ]
    }

    fn all_missing(data: &TypedArray) -> bool {
        data.to_f64_vec().iter().all(|v| v.is_nan())
    }

    fn values(data: &TypedArray) -> Vec<Option<f64>> {
        data.to_f64_vec()
            .into_iter()
            .map(|v| if v.is_nan() { None } else { Some(v) })
            .collect()
    }

    #[tokio::test]
    async fn test_structure() -> Result<()> {
        let (_, dataset) = materialize(two_runs(), false, ProtoChoice::Penultimate).await?;

        let dims: Vec<(&str, usize)> = dataset
            .dimensions
            .iter()
            .map(|d| (d.name.as_str(), d.len))
            .collect();
        assert_eq!(dims, vec![("x", 2), ("run", 2), ("time", 4)]);

        let temp = dataset.variable("temp").unwrap();
        assert_eq!(temp.schema.dims, vec!["run", "time", "x"]);
        assert_eq!(temp.schema.shape, vec![2, 4, 2]);
        assert!(matches!(temp.payload, Payload::Grid { .. }));

        assert!(matches!(
            dataset.variable("x").unwrap().payload,
            Payload::Cached(_)
        ));
        assert!(matches!(
            &dataset.variable("orography").unwrap().payload,
            Payload::File { location, .. } if location == "r1.grib2"
        ));

        let run = dataset.read_whole("run").await?;
        assert_eq!(run.to_f64_vec(), vec![0.0, 24.0]);
        assert_eq!(
            dataset.variable("run").unwrap().schema.attribute("units").unwrap().as_text(),
            Some("hours since 2024-01-01T00:00:00Z")
        );

        let time = dataset.read_whole("time").await?;
        assert_eq!(time.shape(), &[2, 4]);
        assert_eq!(
            values(&time),
            vec![
                Some(0.0),
                Some(3.0),
                Some(6.0),
                None,
                Some(24.0),
                Some(27.0),
                Some(30.0),
                Some(33.0)
            ]
        );
        let offset = dataset.read_whole("time_offset").await?;
        assert_eq!(values(&offset)[4..], [Some(0.0), Some(3.0), Some(6.0), Some(9.0)]);

        Ok(())
    }

    #[tokio::test]
    async fn test_read_whole_grid() -> Result<()> {
        let (reader, dataset) = materialize(two_runs(), false, ProtoChoice::Penultimate).await?;
        let temp = dataset.read_whole("temp").await?;
        assert_eq!(temp.shape(), &[2, 4, 2]);
        assert_eq!(
            values(&temp),
            vec![
                Some(100.0),
                Some(100.0),
                Some(103.0),
                Some(103.0),
                Some(106.0),
                Some(106.0),
                None,
                None,
                Some(200.0),
                Some(200.0),
                Some(203.0),
                Some(203.0),
                Some(206.0),
                Some(206.0),
                Some(209.0),
                Some(209.0),
            ]
        );
        assert_eq!(reader.open_files(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_regularized_missing_offset() -> Result<()> {
        let (reader, dataset) = materialize(two_runs(), true, ProtoChoice::Penultimate).await?;

        // Run one is expected to have hour 9 but doesn't
        let time = dataset.read("time", &[0..1, 3..4]).await?;
        assert_eq!(time.to_f64_vec(), vec![9.0]);

        let temp = dataset.read("temp", &[0..1, 3..4, 0..2]).await?;
        assert_eq!(temp.shape(), &[1, 1, 2]);
        assert!(all_missing(&temp));

        let temp = dataset.read("temp", &[1..2, 3..4, 0..2]).await?;
        assert_eq!(temp.to_f64_vec(), vec![209.0, 209.0]);
        assert_eq!(reader.open_files(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_read_section() -> Result<()> {
        let (_, dataset) = materialize(two_runs(), false, ProtoChoice::Penultimate).await?;
        let temp = dataset.read("temp", &[1..2, 1..3, 0..1]).await?;
        assert_eq!(temp.shape(), &[1, 2, 1]);
        assert_eq!(temp.to_f64_vec(), vec![203.0, 206.0]);

        let empty = dataset.read("temp", &[0..0, 0..4, 0..2]).await?;
        assert_eq!(empty.shape(), &[0, 4, 2]);

        assert!(matches!(
            dataset.read("temp", &[0..3, 0..4, 0..2]).await,
            Err(Error::Reader(_))
        ));
        assert!(matches!(
            dataset.read("temp", &[0..1]).await,
            Err(Error::Reader(_))
        ));
        assert!(matches!(
            dataset.read_whole("nope").await,
            Err(Error::BadName(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_cached_and_file_payloads() -> Result<()> {
        let (reader, dataset) = materialize(two_runs(), false, ProtoChoice::Penultimate).await?;
        let opens = reader.opens();

        let x = dataset.read_whole("x").await?;
        assert_eq!(x.to_f64_vec(), vec![0.0, 1.0]);
        assert_eq!(reader.opens(), opens);

        let orography = dataset.read("orography", &[1..2]).await?;
        assert_eq!(orography.to_f64_vec(), vec![100.0]);
        assert_eq!(reader.opens(), opens + 1);
        assert_eq!(reader.open_files(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_split_run_reads_both_files() -> Result<()> {
        let runs = vec![vec![
            MemoryFile::for_run("a.grib2", date(1, 0))
                .with_grid("temp", "time", &[0.0, 3.0], None, None, &[2]),
            MemoryFile::for_run("b.grib2", date(1, 0))
                .with_grid("temp", "time", &[6.0, 9.0], None, None, &[2]),
        ]];
        let (reader, dataset) = materialize(runs, false, ProtoChoice::Penultimate).await?;
        let opens = reader.opens();
        let temp = dataset.read("temp", &[0..1, 0..4, 0..1]).await?;
        assert_eq!(temp.to_f64_vec(), vec![100.0, 103.0, 106.0, 109.0]);

        // Each file opened once per call
        assert_eq!(reader.opens(), opens + 2);
        assert_eq!(reader.open_files(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_intervals_sharing_an_end_read_their_own_records() -> Result<()> {
        let runs = vec![vec![MemoryFile::for_run("a.grib2", date(1, 0))
            .with_interval_grid("precip", "time", &[[0.0, 6.0], [3.0, 6.0]], &[1])]];
        let (_, dataset) = materialize(runs, false, ProtoChoice::Penultimate).await?;

        let time = dataset.read_whole("time").await?;
        assert_eq!(time.to_f64_vec(), vec![6.0, 6.0]);
        let precip = dataset.read_whole("precip").await?;
        assert_eq!(precip.to_f64_vec(), vec![106.0, 106.75]);

        let view = TimeView::build(dataset, "best", ViewKind::Best { min_offset: 0.0 })?;
        let precip = view.read_whole("precip").await?;
        assert_eq!(precip.to_f64_vec(), vec![106.0, 106.75]);

        Ok(())
    }

    #[tokio::test]
    async fn test_files_closed_on_error() -> Result<()> {
        let (reader, dataset) = materialize(two_runs(), false, ProtoChoice::Penultimate).await?;
        reader.fail("r2.grib2");

        let result = dataset.read_whole("temp").await;
        assert!(matches!(result, Err(Error::Reader(_))));
        assert_eq!(reader.open_files(), 0);

        // Cells that don't touch the failing file are still readable
        let temp = dataset.read("temp", &[0..1, 0..1, 0..2]).await?;
        assert_eq!(temp.to_f64_vec(), vec![100.0, 100.0]);

        Ok(())
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_missing() -> Result<()> {
        let runs = vec![
            vec![MemoryFile::for_run("r1.grib2", date(1, 0))
                .with_grid("temp", "time", &[0.0, 3.0], None, None, &[2])],
            vec![MemoryFile::for_run("r2.grib2", date(2, 0))
                .with_grid("temp", "time", &[0.0, 3.0], None, None, &[3])],
        ];
        let (reader, dataset) = materialize(runs, false, ProtoChoice::First).await?;
        let temp = dataset.read_whole("temp").await?;
        assert_eq!(temp.shape(), &[2, 2, 2]);
        assert_eq!(
            values(&temp),
            vec![Some(100.0), Some(100.0), Some(103.0), Some(103.0), None, None, None, None]
        );
        assert_eq!(reader.open_files(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_vertical_levels_and_fill_value() -> Result<()> {
        let isobaric = VertCoord::levels("isobaric", Some("hPa"), vec![1000.0, 500.0]);
        let runs = vec![
            vec![MemoryFile::for_run("r1.grib2", date(1, 0))
                .with_grid("temp", "time", &[0.0, 3.0], Some(isobaric.clone()), None, &[1])
                .with_attribute(Attribute::text("title", "r1"))],
            vec![MemoryFile::for_run("r2.grib2", date(1, 12))
                .with_grid("temp", "time", &[0.0], Some(isobaric), None, &[1])
                .with_attribute(Attribute::text("title", "r2"))],
        ];
        let (_, dataset) = materialize(runs, false, ProtoChoice::Latest).await?;
        assert_eq!(
            dataset.attributes.iter().find(|a| a.name == "title").unwrap().value.as_text(),
            Some("r2")
        );
        let temp = dataset.variable("temp").unwrap();
        assert_eq!(temp.schema.dims, vec!["run", "time", "isobaric", "x"]);

        let data = dataset.read("temp", &[1..2, 0..2, 0..2, 0..1]).await?;
        assert_eq!(values(&data), vec![Some(112.0), Some(112.0), None, None]);

        let levels = dataset.read_whole("isobaric").await?;
        assert_eq!(levels.to_f64_vec(), vec![1000.0, 500.0]);

        Ok(())
    }

    #[tokio::test]
    async fn test_grid_missing_from_proto_run() -> Result<()> {
        let runs = vec![
            vec![MemoryFile::for_run("r1.grib2", date(1, 0))
                .with_grid("temp", "time", &[0.0, 3.0], None, None, &[2])],
            vec![MemoryFile::for_run("r2.grib2", date(2, 0))
                .with_grid("temp", "time", &[0.0, 3.0], None, None, &[2])
                .with_grid("rh", "time", &[0.0, 3.0], None, None, &[2])],
            vec![MemoryFile::for_run("r3.grib2", date(3, 0))
                .with_grid("temp", "time", &[0.0, 3.0], None, None, &[2])],
        ];
        let (_, dataset) = materialize(runs, false, ProtoChoice::First).await?;
        let rh = dataset.variable("rh").unwrap();
        assert_eq!(rh.schema.shape, vec![3, 2, 2]);

        let data = dataset.read("rh", &[0..3, 1..2, 0..1]).await?;
        assert_eq!(values(&data), vec![None, Some(203.0), None]);

        Ok(())
    }

    #[tokio::test]
    async fn test_materializer_reuses_proto() -> Result<()> {
        let runs = two_runs();
        let reader = reader_for(&runs);
        let agg = Arc::new(aggregate(runs, false));
        let lite = Arc::new(LiteInventory::from_aggregate(&agg));
        let mut materializer = Materializer::new();
        assert_eq!(materializer.state(), MaterializerState::Empty);
        assert!(materializer.proto_changed().is_none());

        let choice = ProtoChoice::Penultimate;
        materializer
            .materialize(agg.clone(), lite.clone(), reader.clone(), &choice, false)
            .await?;
        assert_eq!(materializer.state(), MaterializerState::Full);
        assert_eq!(materializer.proto().unwrap().run_date, date(1, 0));
        let changed = materializer.proto_changed();
        let opens = reader.opens();

        materializer
            .materialize(agg.clone(), lite.clone(), reader.clone(), &ProtoChoice::Latest, false)
            .await?;
        assert_eq!(materializer.proto_changed(), changed);
        assert_eq!(materializer.proto().unwrap().run_date, date(1, 0));
        assert_eq!(reader.opens(), opens);

        materializer
            .materialize(agg, lite, reader.clone(), &ProtoChoice::Latest, true)
            .await?;
        assert_eq!(materializer.proto().unwrap().run_date, date(2, 0));
        assert!(reader.opens() > opens);

        Ok(())
    }

    fn twelve_hourly() -> Vec<Vec<MemoryFile>> {
        vec![
            vec![MemoryFile::for_run("r1.grib2", date(1, 0))
                .with_grid("temp", "time", &[0.0, 6.0, 12.0, 18.0], None, None, &[1])],
            vec![MemoryFile::for_run("r2.grib2", date(1, 12))
                .with_grid("temp", "time", &[0.0, 6.0, 12.0], None, None, &[1])],
        ]
    }

    #[tokio::test]
    async fn test_best_view() -> Result<()> {
        let (reader, dataset) =
            materialize(twelve_hourly(), false, ProtoChoice::Penultimate).await?;
        let view = TimeView::build(dataset, "best", ViewKind::Best { min_offset: 0.0 })?;

        let dims: Vec<(&str, usize)> =
            view.dimensions.iter().map(|d| (d.name.as_str(), d.len)).collect();
        assert_eq!(dims, vec![("x", 1), ("time", 5)]);
        assert!(view.variable("run").is_none());

        let time = view.read_whole("time").await?;
        assert_eq!(time.to_f64_vec(), vec![0.0, 6.0, 12.0, 18.0, 24.0]);
        let runs = view.read_whole("time_run").await?;
        assert_eq!(runs.to_f64_vec(), vec![0.0, 0.0, 12.0, 12.0, 12.0]);
        let offsets = view.read_whole("time_offset").await?;
        assert_eq!(offsets.to_f64_vec(), vec![0.0, 6.0, 0.0, 6.0, 12.0]);

        let temp = view.read_whole("temp").await?;
        assert_eq!(temp.shape(), &[5, 1]);
        assert_eq!(temp.to_f64_vec(), vec![100.0, 106.0, 112.0, 118.0, 124.0]);

        let temp = view.read("temp", &[1..3, 0..1]).await?;
        assert_eq!(temp.to_f64_vec(), vec![106.0, 112.0]);

        let x = view.read_whole("x").await?;
        assert_eq!(x.to_f64_vec(), vec![0.0]);
        assert_eq!(reader.open_files(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_other_views() -> Result<()> {
        let (_, dataset) = materialize(twelve_hourly(), false, ProtoChoice::Penultimate).await?;

        let view = TimeView::build(dataset.clone(), "run", ViewKind::SingleRun(date(1, 0)))?;
        let time = view.read_whole("time").await?;
        assert_eq!(time.to_f64_vec(), vec![0.0, 6.0, 12.0, 18.0]);

        let missing = TimeView::build(dataset.clone(), "run", ViewKind::SingleRun(date(5, 0)));
        assert!(matches!(missing, Err(Error::NotFound(_))));

        let view = TimeView::build(dataset.clone(), "offset", ViewKind::ConstantOffset(6.0))?;
        assert_eq!(view.read_whole("time").await?.to_f64_vec(), vec![6.0, 18.0]);
        assert_eq!(view.read_whole("temp").await?.to_f64_vec(), vec![106.0, 118.0]);

        let view = TimeView::build(
            dataset,
            "valid",
            ViewKind::ConstantForecastTime(date(1, 18)),
        )?;
        assert_eq!(view.read_whole("time_run").await?.to_f64_vec(), vec![0.0, 12.0]);
        assert_eq!(view.read_whole("time_offset").await?.to_f64_vec(), vec![18.0, 6.0]);

        Ok(())
    }
}
