use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Timelike, Utc};
use tracing::debug;

use crate::{
    coord::{dedup_tolerant, Arena, CoordId, EnsCoord, TimeCoord, VertCoord, TIME_TOLERANCE},
    errors::{Error, Result},
    run::{RunAggregate, RunGrid},
    time::{hours_between, to_iso},
};

/// One run's contribution to an `UberGrid`.
///
#[derive(Clone, Debug, PartialEq)]
pub struct UberRun {
    /// Index of the run in `CollectionAggregate::runs`
    pub run: usize,

    /// Index of the grid in that run's `RunAggregate::grids`
    pub grid: usize,

    /// Time axis actually present in the run, in the collection's time arena
    pub actual: CoordId,

    /// Time axis the run is expected to have. Equal to `actual` unless regularized.
    pub expected: CoordId,
}

/// One variable across every run of the collection.
///
#[derive(Clone, Debug)]
pub struct UberGrid {
    pub name: String,

    /// Runs containing this grid, in run order
    pub runs: Vec<UberRun>,

    pub vert: Option<CoordId>,
    pub ens: Option<CoordId>,

    /// Index of this grid's run sequence in `CollectionAggregate::run_seqs`
    pub run_seq: usize,
}

impl UberGrid {
    /// This grid's entry for run `run`, if the run has it.
    ///
    pub fn run(&self, run: usize) -> Option<&UberRun> {
        self.runs.iter().find(|entry| entry.run == run)
    }
}

/// Expected time axis for every run of the collection, shared by all grids that agree on it.
///
#[derive(Clone, Debug)]
pub struct RunSeq {
    pub id: usize,
    pub name: String,

    /// One row per run of the collection. `None` means no data for that run.
    pub rows: Vec<Option<CoordId>>,

    /// Names of grids using this sequence
    pub grids: Vec<String>,
}

impl RunSeq {
    fn new(id: usize, rows: Vec<Option<CoordId>>) -> Self {
        let name = match id {
            0 => String::from("time"),
            _ => format!("time{id}"),
        };

        Self {
            id,
            name,
            rows,
            grids: vec![],
        }
    }

    /// True if `rows` agrees with this sequence wherever both have a time axis.
    ///
    fn agrees(&self, rows: &[Option<CoordId>]) -> bool {
        self.rows.iter().zip(rows).all(|pair| match pair {
            (Some(a), Some(b)) => a == b,
            _ => true,
        })
    }

    /// Adopt time axes from `rows` for runs this sequence has no axis for yet. Rows already
    /// recorded are never changed.
    ///
    fn fill_gaps(&mut self, rows: &[Option<CoordId>]) {
        for (row, candidate) in self.rows.iter_mut().zip(rows) {
            if row.is_none() {
                *row = *candidate;
            }
        }
    }

    /// Ascending union of the offsets of every run's expected time axis, in hours since
    /// `base_date`.
    ///
    pub fn union_offset_hours(
        &self,
        times: &Arena<TimeCoord>,
        base_date: &DateTime<Utc>,
    ) -> Vec<f64> {
        let all = self
            .rows
            .iter()
            .flatten()
            .flat_map(|id| times.get(*id).offsets_from(base_date));
        let mut offsets = dedup_tolerant(all, TIME_TOLERANCE);
        offsets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        offsets
    }

    /// Largest number of time steps in any one run
    pub fn max_len(&self, times: &Arena<TimeCoord>) -> usize {
        self.rows
            .iter()
            .flatten()
            .map(|id| times.get(*id).len())
            .max()
            .unwrap_or(0)
    }
}

/// Runs with the same hour of day, used to synthesize a common expected time axis.
///
struct HourGroup {
    hour: u32,
    entries: Vec<usize>,
}

/// Every run of the collection, merged.
///
#[derive(Debug)]
pub struct CollectionAggregate {
    /// Date of the earliest run
    pub base_date: DateTime<Utc>,

    /// Sorted ascending
    pub runs: Vec<Arc<RunAggregate>>,

    pub times: Arena<TimeCoord>,
    pub verts: Arena<VertCoord>,
    pub ens: Arena<EnsCoord>,

    /// Sorted by name
    pub grids: Vec<UberGrid>,

    pub run_seqs: Vec<RunSeq>,
}

impl CollectionAggregate {
    pub fn run_dates(&self) -> Vec<DateTime<Utc>> {
        self.runs.iter().map(|run| run.run_date).collect()
    }

    pub fn grid(&self, name: &str) -> Option<&UberGrid> {
        self.grids
            .binary_search_by(|grid| grid.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.grids[index])
    }

    pub fn grid_index(&self, name: &str) -> Option<usize> {
        self.grids
            .binary_search_by(|grid| grid.name.as_str().cmp(name))
            .ok()
    }

    /// The run scope grid behind an `UberRun`
    pub fn run_grid(&self, entry: &UberRun) -> &RunGrid {
        &self.runs[entry.run].grids[entry.grid]
    }

    /// Hours from the base date to the date of run `run`
    pub fn run_offset(&self, run: usize) -> f64 {
        hours_between(&self.base_date, &self.runs[run].run_date)
    }

    pub fn union_offset_hours(&self, run_seq: &RunSeq) -> Vec<f64> {
        run_seq.union_offset_hours(&self.times, &self.base_date)
    }
}

/// Collects the runs of a collection. Consumed by `finish`, which produces the immutable
/// `CollectionAggregate`.
///
pub struct CollectionBuilder {
    regularize: bool,
    runs: Vec<Arc<RunAggregate>>,
}

impl CollectionBuilder {
    pub fn new(regularize: bool) -> Self {
        Self {
            regularize,
            runs: vec![],
        }
    }

    pub fn add_run(&mut self, run: Arc<RunAggregate>) -> Result<()> {
        if self.runs.iter().any(|r| r.run_date == run.run_date) {
            return Err(Error::Invariant(format!(
                "run {} added twice",
                to_iso(&run.run_date)
            )));
        }
        self.runs.push(run);

        Ok(())
    }

    pub fn finish(self) -> Result<CollectionAggregate> {
        let mut runs = self.runs;
        runs.sort_by_key(|run| run.run_date);
        let base_date = match runs.first() {
            Some(run) => run.run_date,
            None => return Err(Error::NotFound(String::from("no runs in collection"))),
        };

        let mut times = Arena::new();
        let mut verts = Arena::new();
        let mut ens = Arena::new();

        // Grid name -> (run index, grid index)
        let mut found: BTreeMap<String, Vec<(usize, usize)>> = BTreeMap::new();
        for (run_index, run) in runs.iter().enumerate() {
            for (grid_index, grid) in run.grids.iter().enumerate() {
                found
                    .entry(grid.name.clone())
                    .or_default()
                    .push((run_index, grid_index));
            }
        }

        let mut grids = Vec::with_capacity(found.len());
        for (name, entries) in found {
            let mut uber_runs = Vec::with_capacity(entries.len());
            for (run_index, grid_index) in entries {
                let run = &runs[run_index];
                let actual = times.find_or_add(run.time_coord(&run.grids[grid_index]));
                uber_runs.push(UberRun {
                    run: run_index,
                    grid: grid_index,
                    actual,
                    expected: actual,
                });
            }

            let run_grid = |entry: &UberRun| &runs[entry.run].grids[entry.grid];
            let vert = VertCoord::union(uber_runs.iter().filter_map(|entry| {
                runs[entry.run].vert_coord(run_grid(entry))
            }))
            .map(|coord| verts.find_or_add(&coord));

            // Ensemble axes aren't unioned across runs
            let ens_id = uber_runs
                .iter()
                .find_map(|entry| runs[entry.run].ens_coord(run_grid(entry)))
                .map(|coord| ens.find_or_add(coord));

            if self.regularize && uber_runs.len() > 1 {
                regularize(&runs, &mut times, &mut uber_runs);
            }

            grids.push(UberGrid {
                name,
                runs: uber_runs,
                vert,
                ens: ens_id,
                run_seq: 0,
            });
        }

        let mut run_seqs: Vec<RunSeq> = vec![];
        for grid in grids.iter_mut() {
            let mut rows = vec![None; runs.len()];
            for entry in &grid.runs {
                rows[entry.run] = Some(entry.expected);
            }

            let run_seq = match run_seqs.iter_mut().find(|seq| seq.agrees(&rows)) {
                Some(seq) => {
                    seq.fill_gaps(&rows);
                    seq
                }
                None => {
                    let id = run_seqs.len();
                    run_seqs.push(RunSeq::new(id, rows));
                    &mut run_seqs[id]
                }
            };
            run_seq.grids.push(grid.name.clone());
            grid.run_seq = run_seq.id;
        }

        debug!(
            runs = runs.len(),
            grids = grids.len(),
            run_seqs = run_seqs.len(),
            base_date = %to_iso(&base_date),
            "collection aggregated"
        );

        Ok(CollectionAggregate {
            base_date,
            runs,
            times,
            verts,
            ens,
            grids,
            run_seqs,
        })
    }
}

/// Give every run of an hour group the union of the group's offsets as its expected time axis.
///
fn regularize(
    runs: &[Arc<RunAggregate>],
    times: &mut Arena<TimeCoord>,
    entries: &mut [UberRun],
) {
    let mut groups: Vec<HourGroup> = vec![];
    for (index, entry) in entries.iter().enumerate() {
        let hour = runs[entry.run].run_date.hour();
        match groups.iter_mut().find(|group| group.hour == hour) {
            Some(group) => group.entries.push(index),
            None => groups.push(HourGroup {
                hour,
                entries: vec![index],
            }),
        }
    }

    for group in groups {
        if group.entries.len() < 2 {
            continue;
        }

        // Offsets are relative to each member's own run date, so union them as if every member
        // shared the first member's date.
        let reference = runs[entries[group.entries[0]].run].run_date;
        let members: Vec<TimeCoord> = group
            .entries
            .iter()
            .map(|index| TimeCoord {
                run_date: reference,
                ..times.get(entries[*index].actual).clone()
            })
            .collect();
        let union = TimeCoord::union(&members, reference);

        for index in group.entries {
            let entry = &mut entries[index];
            let expected = TimeCoord {
                run_date: runs[entry.run].run_date,
                ..union.clone()
            };
            entry.expected = times.find_or_add(&expected);
        }
    }
}
