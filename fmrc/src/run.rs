use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    coord::{Arena, CoordId, EnsCoord, TimeCoord, VertCoord},
    errors::{Error, Result},
    inventory::FileInventory,
    time::to_iso,
};

/// One file's contribution to a `RunGrid`. Coordinate ids refer to the run's arenas.
///
#[derive(Clone, Debug, PartialEq)]
pub struct RunPart {
    /// Index of the file in `RunAggregate::files`
    pub file: usize,

    pub time: CoordId,
    pub vert: Option<CoordId>,
    pub ens: Option<CoordId>,
}

/// One variable across all files of a run.
///
#[derive(Clone, Debug)]
pub struct RunGrid {
    pub name: String,
    pub parts: Vec<RunPart>,

    /// Union of the time axes of all parts
    pub time: CoordId,
    pub vert: Option<CoordId>,
    pub ens: Option<CoordId>,
}

/// All of the files sharing one run date, merged.
///
#[derive(Debug)]
pub struct RunAggregate {
    pub run_date: DateTime<Utc>,
    pub files: Vec<Arc<FileInventory>>,
    pub times: Arena<TimeCoord>,
    pub verts: Arena<VertCoord>,
    pub ens: Arena<EnsCoord>,

    /// Sorted by name
    pub grids: Vec<RunGrid>,
}

impl RunAggregate {
    pub fn grid(&self, name: &str) -> Option<&RunGrid> {
        self.grids
            .binary_search_by(|grid| grid.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.grids[index])
    }

    pub fn time_coord(&self, grid: &RunGrid) -> &TimeCoord {
        self.times.get(grid.time)
    }

    pub fn vert_coord(&self, grid: &RunGrid) -> Option<&VertCoord> {
        grid.vert.map(|id| self.verts.get(id))
    }

    pub fn ens_coord(&self, grid: &RunGrid) -> Option<&EnsCoord> {
        grid.ens.map(|id| self.ens.get(id))
    }

    /// Find the file and record holding the time step of `grid` spanning `bounds`, in hours
    /// from the run date.
    ///
    /// Parts are scanned in file order and the first match wins.
    ///
    pub fn locate(&self, grid: &RunGrid, bounds: [f64; 2]) -> Option<(&FileInventory, usize)> {
        grid.parts.iter().find_map(|part| {
            self.times
                .get(part.time)
                .find_bounds(bounds)
                .map(|index| (&*self.files[part.file], index))
        })
    }
}

/// Collects the files of one run. Consumed by `finish`, which produces the immutable
/// `RunAggregate`.
///
pub struct RunBuilder {
    run_date: DateTime<Utc>,
    files: Vec<Arc<FileInventory>>,
}

impl RunBuilder {
    pub fn new(run_date: DateTime<Utc>) -> Self {
        Self {
            run_date,
            files: vec![],
        }
    }

    pub fn add_file(&mut self, inventory: Arc<FileInventory>) -> Result<()> {
        if inventory.run_date != self.run_date {
            return Err(Error::RunDateMismatch {
                location: inventory.location.clone(),
                expected: to_iso(&self.run_date),
                found: to_iso(&inventory.run_date),
            });
        }
        self.files.push(inventory);

        Ok(())
    }

    pub fn finish(self) -> RunAggregate {
        let mut times = Arena::new();
        let mut verts = Arena::new();
        let mut ens = Arena::new();
        let mut parts: BTreeMap<String, Vec<RunPart>> = BTreeMap::new();

        for (index, file) in self.files.iter().enumerate() {
            for grid in &file.grids {
                let part = RunPart {
                    file: index,
                    time: times.find_or_add(file.time_coord(grid)),
                    vert: file.vert_coord(grid).map(|coord| verts.find_or_add(coord)),
                    ens: file.ens_coord(grid).map(|coord| ens.find_or_add(coord)),
                };
                parts.entry(grid.name.clone()).or_default().push(part);
            }
        }

        let mut grids = Vec::with_capacity(parts.len());
        for (name, parts) in parts {
            let grid = if parts.len() == 1 {
                let part = &parts[0];
                RunGrid {
                    name,
                    time: part.time,
                    vert: part.vert,
                    ens: part.ens,
                    parts,
                }
            } else {
                let time =
                    TimeCoord::union(parts.iter().map(|p| times.get(p.time)), self.run_date);
                let time = times.find_or_add(&time);
                let vert =
                    VertCoord::union(parts.iter().filter_map(|p| p.vert.map(|id| verts.get(id))))
                        .map(|coord| verts.find_or_add(&coord));
                let ens_union =
                    EnsCoord::union(parts.iter().filter_map(|p| p.ens.map(|id| ens.get(id))))
                        .map(|coord| ens.find_or_add(&coord));

                RunGrid {
                    name,
                    parts,
                    time,
                    vert,
                    ens: ens_union,
                }
            };
            grids.push(grid);
        }

        RunAggregate {
            run_date: self.run_date,
            files: self.files,
            times,
            verts,
            ens,
            grids,
        }
    }
}
