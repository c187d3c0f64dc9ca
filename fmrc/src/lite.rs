//! A flattened, serializable snapshot of a collection aggregate.
//!
//! The lite inventory answers "which file and record holds grid G at run R, slot J" and the
//! time views (best, constant offset, constant forecast time, single run) without holding on to
//! any of the aggregate's coordinate arenas.
//!
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    collection::CollectionAggregate,
    coord::{nearly_equals, TIME_TOLERANCE},
    time::add_hours,
};

/// Resolution, in hours, of the grid offsets are rounded to when used as keys
pub const OFFSET_GRID: f64 = 0.001;

fn offset_key(offset: f64) -> i64 {
    (offset / OFFSET_GRID).round() as i64
}

/// One cell of a time table.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeInstance {
    /// Run (row) of the table
    pub run: usize,

    /// Slot (column) of the table
    pub index: usize,

    /// Hours since the collection's base date
    pub offset: f64,
}

/// Absolute offsets of one run sequence, one row per run. `None` marks a slot the run doesn't
/// have.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeTable {
    pub name: String,

    /// Hours from the base date to each run
    pub run_offsets: Vec<f64>,

    /// End of each slot's time step
    pub offsets: Array2<Option<f64>>,

    /// Start of each slot's time step. Only interval sequences have them.
    pub starts: Option<Array2<Option<f64>>>,
}

impl TimeTable {
    pub fn runs(&self) -> usize {
        self.offsets.nrows()
    }

    pub fn slots(&self) -> usize {
        self.offsets.ncols()
    }

    pub fn offset(&self, run: usize, index: usize) -> Option<f64> {
        self.offsets[[run, index]]
    }

    /// `[start, end]` of a slot in hours since the base date. Points are zero width.
    ///
    pub fn bounds(&self, run: usize, index: usize) -> Option<[f64; 2]> {
        let end = self.offset(run, index)?;
        let start = match &self.starts {
            Some(starts) => starts[[run, index]].unwrap_or(end),
            None => end,
        };

        Some([start, end])
    }

    /// `[start, end]` of a slot in hours since its own run date
    pub fn run_bounds(&self, run: usize, index: usize) -> Option<[f64; 2]> {
        let [start, end] = self.bounds(run, index)?;
        let run_offset = self.run_offsets[run];

        Some([start - run_offset, end - run_offset])
    }

    /// Slot ends with NaN for missing slots
    pub fn offset_array(&self) -> Array2<f64> {
        self.offsets.mapv(|offset| offset.unwrap_or(f64::NAN))
    }

    fn cells(&self) -> impl Iterator<Item = TimeInstance> + '_ {
        self.offsets
            .indexed_iter()
            .filter_map(|((run, index), offset)| {
                offset.map(|offset| TimeInstance { run, index, offset })
            })
    }

    /// Key identifying a slot's time step across runs, on the `OFFSET_GRID`
    fn step_key(&self, cell: &TimeInstance) -> (i64, i64) {
        let start = match self.bounds(cell.run, cell.index) {
            Some([start, _]) => start,
            None => cell.offset,
        };

        (offset_key(cell.offset), offset_key(start))
    }

    /// Every filled slot of run `run`
    pub fn run_column(&self, run: usize) -> Vec<TimeInstance> {
        self.cells().filter(|cell| cell.run == run).collect()
    }

    /// For every run, the slot `hours` after the run date, if there is one.
    ///
    pub fn constant_offset_column(&self, hours: f64) -> Vec<TimeInstance> {
        self.cells()
            .filter(|cell| {
                nearly_equals(cell.offset - self.run_offsets[cell.run], hours, TIME_TOLERANCE)
            })
            .collect()
    }

    /// Every slot, from any run, valid at `hours` since the base date.
    ///
    pub fn constant_forecast_time(&self, hours: f64) -> Vec<TimeInstance> {
        self.cells()
            .filter(|cell| nearly_equals(cell.offset, hours, TIME_TOLERANCE))
            .collect()
    }

    /// One slot per distinct time step, taken from the latest run that has it.
    ///
    /// Slots less than `min_offset` hours after their run date are left out. Time steps are
    /// compared by both ends after rounding to `OFFSET_GRID`, so intervals sharing an end stay
    /// distinct. The result is ordered by end, then start.
    ///
    pub fn best_time_offsets(&self, min_offset: f64) -> Vec<TimeInstance> {
        let mut best: BTreeMap<(i64, i64), TimeInstance> = BTreeMap::new();
        for cell in self.cells() {
            if cell.offset - self.run_offsets[cell.run] < min_offset - OFFSET_GRID / 2.0 {
                continue;
            }
            best.entry(self.step_key(&cell))
                .and_modify(|kept| {
                    if cell.run > kept.run {
                        *kept = cell;
                    }
                })
                .or_insert(cell);
        }

        best.into_values().collect()
    }
}

/// Where each slot of one grid lives: file index plus one (zero meaning no data) and record
/// index within the file.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridInventory {
    pub files: Array2<u32>,
    pub records: Array2<u32>,
}

impl GridInventory {
    /// File index and record for a slot, if the slot has data
    pub fn locate(&self, run: usize, index: usize) -> Option<(usize, usize)> {
        match self.files[[run, index]] {
            0 => None,
            file => Some((file as usize - 1, self.records[[run, index]] as usize)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiteGrid {
    pub name: String,

    /// Index into `LiteInventory::time_tables`
    pub time_table: usize,

    /// Index into `LiteInventory::inventories`
    pub inventory: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiteInventory {
    pub base_date: DateTime<Utc>,
    pub run_dates: Vec<DateTime<Utc>>,
    pub locations: Vec<String>,
    pub time_tables: Vec<TimeTable>,

    /// Identical inventories are stored once
    pub inventories: Vec<GridInventory>,

    /// Sorted by name
    pub grids: Vec<LiteGrid>,
}

impl LiteInventory {
    pub fn from_aggregate(agg: &CollectionAggregate) -> Self {
        let mut locations: Vec<String> = vec![];
        let mut file_indexes: Vec<Vec<u32>> = Vec::with_capacity(agg.runs.len());
        for run in &agg.runs {
            let mut indexes = Vec::with_capacity(run.files.len());
            for file in &run.files {
                let index = match locations.iter().position(|l| *l == file.location) {
                    Some(index) => index,
                    None => {
                        locations.push(file.location.clone());
                        locations.len() - 1
                    }
                };
                indexes.push(index as u32);
            }
            file_indexes.push(indexes);
        }

        let run_offsets: Vec<f64> = (0..agg.runs.len()).map(|r| agg.run_offset(r)).collect();
        let time_tables: Vec<TimeTable> = agg
            .run_seqs
            .iter()
            .map(|seq| {
                let shape = (agg.runs.len(), seq.max_len(&agg.times));
                let mut offsets = Array2::from_elem(shape, None);
                let mut starts = Array2::from_elem(shape, None);
                let mut interval = false;
                for (run, row) in seq.rows.iter().enumerate() {
                    if let Some(id) = row {
                        let coord = agg.times.get(*id);
                        interval |= coord.is_interval();
                        for (index, [start, end]) in coord.bounds().into_iter().enumerate() {
                            offsets[[run, index]] = Some(end + run_offsets[run]);
                            starts[[run, index]] = Some(start + run_offsets[run]);
                        }
                    }
                }
                TimeTable {
                    name: seq.name.clone(),
                    run_offsets: run_offsets.clone(),
                    offsets,
                    starts: interval.then_some(starts),
                }
            })
            .collect();

        let mut inventories: Vec<GridInventory> = vec![];
        let mut grids = Vec::with_capacity(agg.grids.len());
        for grid in &agg.grids {
            let table = &time_tables[grid.run_seq];
            let mut files = Array2::zeros((table.runs(), table.slots()));
            let mut records = Array2::zeros((table.runs(), table.slots()));
            for entry in &grid.runs {
                let run = &agg.runs[entry.run];
                let run_grid = agg.run_grid(entry);
                for index in 0..table.slots() {
                    let bounds = match table.run_bounds(entry.run, index) {
                        Some(bounds) => bounds,
                        None => continue,
                    };
                    let found = run_grid.parts.iter().find_map(|part| {
                        run.times
                            .get(part.time)
                            .find_bounds(bounds)
                            .map(|record| (part.file, record))
                    });
                    if let Some((file, record)) = found {
                        files[[entry.run, index]] = file_indexes[entry.run][file] + 1;
                        records[[entry.run, index]] = record as u32;
                    }
                }
            }

            let inventory = GridInventory { files, records };
            let index = match inventories.iter().position(|i| *i == inventory) {
                Some(index) => index,
                None => {
                    inventories.push(inventory);
                    inventories.len() - 1
                }
            };
            grids.push(LiteGrid {
                name: grid.name.clone(),
                time_table: grid.run_seq,
                inventory: index,
            });
        }

        Self {
            base_date: agg.base_date,
            run_dates: agg.run_dates(),
            locations,
            time_tables,
            inventories,
            grids,
        }
    }

    pub fn grid(&self, name: &str) -> Option<&LiteGrid> {
        self.grids
            .binary_search_by(|grid| grid.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.grids[index])
    }

    pub fn inventory(&self, grid: &LiteGrid) -> &GridInventory {
        &self.inventories[grid.inventory]
    }

    pub fn time_table(&self, grid: &LiteGrid) -> &TimeTable {
        &self.time_tables[grid.time_table]
    }

    pub fn run_index(&self, run_date: &DateTime<Utc>) -> Option<usize> {
        self.run_dates.iter().position(|date| date == run_date)
    }

    pub fn date(&self, offset: f64) -> DateTime<Utc> {
        add_hours(&self.base_date, offset)
    }

    fn all_cells(&self) -> impl Iterator<Item = (&TimeTable, TimeInstance)> + '_ {
        self.time_tables
            .iter()
            .flat_map(|table| table.cells().map(move |cell| (table, cell)))
    }

    /// Every distinct valid time in the collection, ascending
    pub fn forecast_dates(&self) -> Vec<DateTime<Utc>> {
        let offsets: BTreeMap<i64, f64> = self
            .all_cells()
            .map(|(_, cell)| (offset_key(cell.offset), cell.offset))
            .collect();

        offsets.values().map(|offset| self.date(*offset)).collect()
    }

    /// Every distinct forecast hour (offset from run date) in the collection, ascending
    pub fn forecast_offsets(&self) -> Vec<f64> {
        let offsets: BTreeMap<i64, f64> = self
            .all_cells()
            .map(|(table, cell)| cell.offset - table.run_offsets[cell.run])
            .map(|offset| (offset_key(offset), offset))
            .collect();

        offsets.into_values().collect()
    }

    /// First and last valid times of one run
    pub fn date_range_for_run(&self, run: usize) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.range(self.all_cells().filter(|(_, cell)| cell.run == run))
    }

    /// First and last valid times of the slots `hours` after their run date
    pub fn date_range_for_offset(&self, hours: f64) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.range(self.all_cells().filter(|(table, cell)| {
            nearly_equals(cell.offset - table.run_offsets[cell.run], hours, TIME_TOLERANCE)
        }))
    }

    fn range<'a>(
        &self,
        cells: impl Iterator<Item = (&'a TimeTable, TimeInstance)>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let (min, max) = cells.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), (_, c)| {
            (min.min(c.offset), max.max(c.offset))
        });
        if min > max {
            None
        } else {
            Some((self.date(min), self.date(max)))
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;
    use crate::{
        errors::Result,
        testing::{aggregate, date, MemoryFile},
    };

    fn table(offsets: Array2<f64>, run_offsets: Vec<f64>) -> TimeTable {
        TimeTable {
            name: String::from("time"),
            run_offsets,
            offsets: offsets.mapv(|o| if o.is_nan() { None } else { Some(o) }),
            starts: None,
        }
    }

    fn sample() -> TimeTable {
        // Runs 6 hours apart, the middle one short
        table(
            arr2(&[
                [0.0, 3.0, 6.0, 9.0],
                [6.0, 9.0, f64::NAN, f64::NAN],
                [12.0, 15.0, 18.0, 21.0],
            ]),
            vec![0.0, 6.0, 12.0],
        )
    }

    #[test]
    fn test_run_column() {
        let table = sample();
        let offsets: Vec<f64> = table.run_column(1).iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![6.0, 9.0]);
        assert!(table.run_column(3).is_empty());
    }

    #[test]
    fn test_constant_offset_column() {
        let cells = sample().constant_offset_column(3.0);
        assert_eq!(
            cells,
            vec![
                TimeInstance { run: 0, index: 1, offset: 3.0 },
                TimeInstance { run: 1, index: 1, offset: 9.0 },
                TimeInstance { run: 2, index: 1, offset: 15.0 },
            ]
        );
    }

    #[test]
    fn test_constant_forecast_time() {
        let cells = sample().constant_forecast_time(9.0);
        assert_eq!(
            cells,
            vec![
                TimeInstance { run: 0, index: 3, offset: 9.0 },
                TimeInstance { run: 1, index: 1, offset: 9.0 },
            ]
        );
    }

    #[test]
    fn test_best_later_run_wins() {
        let best = sample().best_time_offsets(0.0);
        let cells: Vec<(usize, f64)> = best.iter().map(|c| (c.run, c.offset)).collect();
        assert_eq!(
            cells,
            vec![
                (0, 0.0),
                (0, 3.0),
                (1, 6.0),
                (1, 9.0),
                (2, 12.0),
                (2, 15.0),
                (2, 18.0),
                (2, 21.0)
            ]
        );

        let best = sample().best_time_offsets(3.0);
        let cells: Vec<(usize, f64)> = best.iter().map(|c| (c.run, c.offset)).collect();
        assert_eq!(
            cells,
            vec![(0, 3.0), (0, 6.0), (1, 9.0), (2, 15.0), (2, 18.0), (2, 21.0)]
        );
    }

    #[test]
    fn test_best_rounds_to_grid() {
        let table = table(arr2(&[[0.0, 3.0], [3.0002, 6.0]]), vec![0.0, 3.0]);
        let best = table.best_time_offsets(0.0);
        let cells: Vec<(usize, usize)> = best.iter().map(|c| (c.run, c.index)).collect();
        assert_eq!(cells, vec![(0, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_best_keeps_intervals_sharing_an_end() {
        let mut table = table(arr2(&[[6.0, 6.0], [12.0, 12.0]]), vec![0.0, 6.0]);
        table.starts = Some(arr2(&[[Some(0.0), Some(3.0)], [Some(6.0), Some(9.0)]]));
        let best = table.best_time_offsets(0.0);
        let cells: Vec<(usize, usize)> = best.iter().map(|c| (c.run, c.index)).collect();
        assert_eq!(cells, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(table.bounds(0, 1), Some([3.0, 6.0]));
        assert_eq!(table.run_bounds(1, 1), Some([3.0, 6.0]));
    }

    #[test]
    fn test_from_aggregate() {
        let r1 = MemoryFile::for_run("r1.grib2", date(1, 0))
            .with_grid("temp", "time", &[0.0, 3.0, 6.0], None, None, &[2])
            .with_grid("rh", "time", &[0.0, 3.0, 6.0], None, None, &[2]);
        let r2a = MemoryFile::for_run("r2a.grib2", date(1, 6))
            .with_grid("temp", "time", &[0.0, 3.0], None, None, &[2])
            .with_grid("rh", "time", &[0.0, 3.0], None, None, &[2]);
        let r2b = MemoryFile::for_run("r2b.grib2", date(1, 6))
            .with_grid("temp", "time", &[6.0, 9.0], None, None, &[2]);

        let agg = aggregate(vec![vec![r1], vec![r2a, r2b]], false);
        let lite = LiteInventory::from_aggregate(&agg);

        assert_eq!(lite.base_date, date(1, 0));
        assert_eq!(lite.run_dates, vec![date(1, 0), date(1, 6)]);
        assert_eq!(lite.locations, vec!["r1.grib2", "r2a.grib2", "r2b.grib2"]);

        let temp = lite.grid("temp").unwrap();
        let rh = lite.grid("rh").unwrap();
        assert_ne!(temp.time_table, rh.time_table);

        let table = lite.time_table(temp);
        assert_eq!(table.slots(), 4);
        assert_eq!(table.offset(1, 3), Some(15.0));
        assert_eq!(table.offset(0, 3), None);

        let inventory = lite.inventory(temp);
        assert_eq!(inventory.locate(0, 2), Some((0, 2)));
        assert_eq!(inventory.locate(1, 1), Some((1, 1)));
        assert_eq!(inventory.locate(1, 3), Some((2, 1)));
        assert_eq!(inventory.locate(0, 3), None);

        assert_eq!(lite.forecast_offsets(), vec![0.0, 3.0, 6.0, 9.0]);
        assert_eq!(lite.forecast_dates().len(), 6);
        assert_eq!(lite.date_range_for_run(1), Some((date(1, 6), date(1, 15))));
        assert_eq!(lite.date_range_for_offset(6.0), Some((date(1, 6), date(1, 12))));
        assert_eq!(lite.date_range_for_offset(7.0), None);
    }

    #[test]
    fn test_identical_inventories_shared() {
        let file = MemoryFile::for_run("a.grib2", date(1, 0))
            .with_grid("temp", "time", &[0.0, 3.0], None, None, &[2])
            .with_grid("rh", "time", &[0.0, 3.0], None, None, &[2]);
        let agg = aggregate(vec![vec![file]], false);
        let lite = LiteInventory::from_aggregate(&agg);

        assert_eq!(lite.inventories.len(), 1);
        assert_eq!(lite.grid("temp").unwrap().inventory, lite.grid("rh").unwrap().inventory);
    }

    #[test]
    fn test_intervals_sharing_an_end() {
        let file = MemoryFile::for_run("a.grib2", date(1, 0))
            .with_interval_grid("precip", "time", &[[0.0, 6.0], [3.0, 6.0]], &[2]);
        let agg = aggregate(vec![vec![file]], false);
        let lite = LiteInventory::from_aggregate(&agg);

        let precip = lite.grid("precip").unwrap();
        let table = lite.time_table(precip);
        assert!(table.starts.is_some());
        assert_eq!(table.bounds(0, 0), Some([0.0, 6.0]));
        assert_eq!(table.bounds(0, 1), Some([3.0, 6.0]));

        let inventory = lite.inventory(precip);
        assert_eq!(inventory.locate(0, 0), Some((0, 0)));
        assert_eq!(inventory.locate(0, 1), Some((0, 1)));
    }

    #[test]
    fn test_serde_round_trip() -> Result<()> {
        // The second run is short, so the table has empty slots
        let a = MemoryFile::for_run("a.grib2", date(1, 0))
            .with_grid("temp", "time", &[0.0, 3.0], None, None, &[2])
            .with_interval_grid("precip", "time1", &[[0.0, 6.0], [3.0, 6.0]], &[2]);
        let b = MemoryFile::for_run("b.grib2", date(1, 6))
            .with_grid("temp", "time", &[0.0], None, None, &[2]);
        let agg = aggregate(vec![vec![a], vec![b]], false);
        let lite = LiteInventory::from_aggregate(&agg);
        let temp = lite.time_table(lite.grid("temp").unwrap());
        assert_eq!(temp.offset(1, 1), None);

        let json = serde_json::to_string(&lite)?;
        let read: LiteInventory = serde_json::from_str(&json)?;
        assert_eq!(read, lite);
        assert_eq!(read.time_table(read.grid("temp").unwrap()).offset(1, 1), None);

        Ok(())
    }
}
