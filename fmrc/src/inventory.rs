use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::io::Cursor;
use tracing::{debug, warn};

use crate::{
    cache::Cacheable,
    config::FmrcConfig,
    coord::{Arena, CoordId, Coordinate, EnsCoord, TimeCoord, TimeValues, VertCoord},
    errors::{Error, Result},
    extio::{ExtendedAsyncRead, ExtendedAsyncWrite, Serialize},
    source::{FileEntry, FileReader, GridFile},
    store::InventoryStore,
    time::{parse_iso, to_iso},
};

const MAGIC_NUMBER: u16 = 0xF4C0;

/// Current version of the persisted inventory record
pub const CACHE_VERSION: u32 = 2;

/// Key under which inventory records are kept in an `InventoryStore`
pub const INVENTORY_KEY: &str = "fmrInv";

/// Global attributes consulted, in order, for a file's run date
pub const RUN_DATE_ATTRIBUTES: [&str; 2] = ["_CoordinateModelBaseDate", "_CoordinateModelRunDate"];

/// One gridded variable of a file and the ids of its axes in the file's arenas.
///
#[derive(Clone, Debug, PartialEq)]
pub struct FileGrid {
    pub name: String,
    pub time: CoordId,
    pub vert: Option<CoordId>,
    pub ens: Option<CoordId>,
}

/// The coordinate inventory of one physical file.
///
#[derive(Clone, Debug)]
pub struct FileInventory {
    pub location: String,
    pub run_date: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,

    /// Version of the record this inventory was read from, or `CACHE_VERSION` if built fresh
    pub version: u32,

    pub times: Arena<TimeCoord>,
    pub verts: Arena<VertCoord>,
    pub ens: Arena<EnsCoord>,
    pub grids: Vec<FileGrid>,
}

impl FileInventory {
    /// Classify the gridded variables of an open file by their axes.
    ///
    /// Axes are matched by name first, so variables that share a named axis share a coordinate
    /// even before values are compared. Otherwise value equal axes are merged.
    ///
    pub fn build(
        file: &dyn GridFile,
        run_date: DateTime<Utc>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let mut times = Arena::new();
        let mut verts = Arena::new();
        let mut ens = Arena::new();
        let mut time_names: HashMap<String, CoordId> = HashMap::new();
        let mut vert_names: HashMap<String, CoordId> = HashMap::new();
        let mut grids = vec![];

        for var in file.grid_variables() {
            let time = match var.time {
                Some(axis) => axis,
                None => continue,
            };
            let time = match time_names.get(&time.name) {
                Some(id) => *id,
                None => {
                    let coord = TimeCoord {
                        id: 0,
                        name: time.name.clone(),
                        run_date,
                        values: time.values,
                    };
                    let id = times.find_or_add(&coord);
                    time_names.insert(time.name, id);
                    id
                }
            };
            let vert = var.vert.map(|coord| match vert_names.get(&coord.name) {
                Some(id) => *id,
                None => {
                    let id = verts.find_or_add(&coord);
                    vert_names.insert(coord.name.clone(), id);
                    id
                }
            });
            let ens = var.ens.map(|coord| ens.find_or_add(&coord));

            grids.push(FileGrid {
                name: var.name,
                time,
                vert,
                ens,
            });
        }

        Self {
            location: String::from(file.location()),
            run_date,
            last_modified,
            version: CACHE_VERSION,
            times,
            verts,
            ens,
            grids,
        }
    }

    /// Work out the run date of an open file.
    ///
    /// An explicit date, usually extracted from the file's path, wins. Then the model base date
    /// and model run date attributes are tried, and as a last resort the start of the file's
    /// time range.
    ///
    pub fn resolve_run_date(
        file: &dyn GridFile,
        explicit: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>> {
        if let Some(date) = explicit {
            return Ok(date);
        }

        for name in RUN_DATE_ATTRIBUTES {
            let date = file
                .global_attribute(name)
                .and_then(|value| value.as_text().and_then(parse_iso));
            if let Some(date) = date {
                return Ok(date);
            }
        }

        match file.start_time() {
            Some(date) => {
                warn!(
                    location = file.location(),
                    "no run date attribute, using start of time range"
                );
                Ok(date)
            }
            None => Err(Error::MissingRunDate(String::from(file.location()))),
        }
    }

    pub fn grid(&self, name: &str) -> Option<&FileGrid> {
        self.grids.iter().find(|grid| grid.name == name)
    }

    pub fn time_coord(&self, grid: &FileGrid) -> &TimeCoord {
        self.times.get(grid.time)
    }

    pub fn vert_coord(&self, grid: &FileGrid) -> Option<&VertCoord> {
        grid.vert.map(|id| self.verts.get(id))
    }

    pub fn ens_coord(&self, grid: &FileGrid) -> Option<&EnsCoord> {
        grid.ens.map(|id| self.ens.get(id))
    }

    /// Get an inventory for a file, from `store` if an up to date record is there, else by
    /// opening the file. Freshly built inventories are written back to `store`.
    ///
    /// A record is reused if its version is at least `config.min_cache_version` and it was
    /// written no earlier than the file was last modified. Unreadable records are treated as
    /// missing.
    ///
    pub async fn open(
        reader: &dyn FileReader,
        store: &dyn InventoryStore,
        entry: &FileEntry,
        explicit_run_date: Option<DateTime<Utc>>,
        config: &FmrcConfig,
    ) -> Result<Self> {
        if !config.force_inventory {
            if let Some(inventory) = Self::from_store(store, entry, config).await {
                return Ok(inventory);
            }
        }

        let mut file = reader.open(&entry.path).await?;
        let inventory = Self::resolve_run_date(&*file, explicit_run_date)
            .map(|run_date| Self::build(&*file, run_date, entry.last_modified));
        file.close();
        let inventory = inventory?;

        match inventory.encode().await {
            Ok(bytes) => {
                if let Err(err) = store.put(&entry.path, INVENTORY_KEY, &bytes).await {
                    warn!(location = %entry.path, %err, "unable to save inventory record");
                }
            }
            Err(err) => {
                warn!(location = %entry.path, %err, "unable to encode inventory record");
            }
        }

        Ok(inventory)
    }

    async fn from_store(
        store: &dyn InventoryStore,
        entry: &FileEntry,
        config: &FmrcConfig,
    ) -> Option<Self> {
        let bytes = match store.get(&entry.path, INVENTORY_KEY).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(location = %entry.path, %err, "unable to fetch inventory record");
                return None;
            }
        };

        match Self::decode(&bytes).await {
            Ok(inventory) => {
                if inventory.version < config.min_cache_version {
                    debug!(
                        location = %entry.path,
                        version = inventory.version,
                        "outdated inventory record"
                    );
                    None
                } else if inventory.last_modified < entry.last_modified {
                    debug!(location = %entry.path, "file modified since inventory was recorded");
                    None
                } else {
                    Some(inventory)
                }
            }
            Err(err) => {
                debug!(location = %entry.path, %err, "discarding unreadable inventory record");
                None
            }
        }
    }

    /// Encode the persisted record for this inventory.
    ///
    pub async fn encode(&self) -> Result<Vec<u8>> {
        let mut stream: Vec<u8> = vec![];
        stream.write_u16(MAGIC_NUMBER).await?;
        stream.write_u32(CACHE_VERSION).await?;
        stream.write_str(&self.location).await?;
        stream.write_str(&to_iso(&self.run_date)).await?;
        stream.write_str(&to_iso(&self.last_modified)).await?;

        stream.write_u32(self.verts.len() as u32).await?;
        for vert in self.verts.iter() {
            vert.write_to(&mut stream).await?;
        }

        stream.write_u32(self.ens.len() as u32).await?;
        for ens in self.ens.iter() {
            ens.write_to(&mut stream).await?;
        }

        stream.write_u32(self.times.len() as u32).await?;
        for time in self.times.iter() {
            stream.write_u32(time.id as u32).await?;
            stream.write_str(&time.name).await?;
            match &time.values {
                TimeValues::Points(offsets) => {
                    stream.write_byte(0).await?;
                    stream.write_f64s(offsets).await?;
                }
                TimeValues::Intervals(bounds) => {
                    stream.write_byte(1).await?;
                    let flat: Vec<f64> = bounds.iter().flatten().copied().collect();
                    stream.write_f64s(&flat).await?;
                }
            }

            let using: Vec<&FileGrid> = self.grids.iter().filter(|g| g.time == time.id).collect();
            stream.write_u32(using.len() as u32).await?;
            for grid in using {
                stream.write_str(&grid.name).await?;
                stream.write_opt_u32(grid.ens.map(|id| id as u32)).await?;
                stream.write_opt_u32(grid.vert.map(|id| id as u32)).await?;
            }
        }

        Ok(stream)
    }

    /// Decode a persisted record.
    ///
    pub async fn decode(bytes: &[u8]) -> Result<Self> {
        let mut stream = Cursor::new(bytes);
        let magic_number = stream.read_u16().await?;
        if magic_number != MAGIC_NUMBER {
            return Err(Error::BadCache(String::from("not an inventory record")));
        }
        let version = stream.read_u32().await?;
        let location = stream.read_str().await?;
        let run_date = read_date(&mut stream).await?;
        let last_modified = read_date(&mut stream).await?;

        let mut verts = Arena::new();
        for _ in 0..stream.read_u32().await? {
            let vert = VertCoord::read_from(&mut stream).await?;
            add_in_order(&mut verts, vert)?;
        }

        let mut ens = Arena::new();
        for _ in 0..stream.read_u32().await? {
            let coord = EnsCoord::read_from(&mut stream).await?;
            add_in_order(&mut ens, coord)?;
        }

        let mut times = Arena::new();
        let mut grids = vec![];
        for _ in 0..stream.read_u32().await? {
            let id = stream.read_u32().await? as CoordId;
            let name = stream.read_str().await?;
            let is_interval = stream.read_byte().await? != 0;
            let flat = stream.read_f64s().await?;
            let values = if is_interval {
                if flat.len() % 2 != 0 {
                    return Err(Error::BadCache(String::from("odd number of time bounds")));
                }
                TimeValues::Intervals(flat.chunks(2).map(|pair| [pair[0], pair[1]]).collect())
            } else {
                TimeValues::Points(flat)
            };
            let time = TimeCoord {
                id,
                name,
                run_date,
                values,
            };
            add_in_order(&mut times, time)?;

            for _ in 0..stream.read_u32().await? {
                let name = stream.read_str().await?;
                let ens_id = stream.read_opt_u32().await?.map(|id| id as CoordId);
                let vert_id = stream.read_opt_u32().await?.map(|id| id as CoordId);
                if ens_id.map_or(false, |id| id >= ens.len())
                    || vert_id.map_or(false, |id| id >= verts.len())
                {
                    return Err(Error::BadCache(format!("dangling axis id for {name}")));
                }
                grids.push(FileGrid {
                    name,
                    time: id,
                    vert: vert_id,
                    ens: ens_id,
                });
            }
        }

        Ok(Self {
            location,
            run_date,
            last_modified,
            version,
            times,
            verts,
            ens,
            grids,
        })
    }
}

async fn read_date(stream: &mut Cursor<&[u8]>) -> Result<DateTime<Utc>> {
    let text = stream.read_str().await?;
    parse_iso(&text).ok_or_else(|| Error::BadCache(format!("bad date: {text}")))
}

/// Records list axes in id order. Rebuild the arena so ids stay positions.
///
fn add_in_order<C: Coordinate>(arena: &mut Arena<C>, coord: C) -> Result<()> {
    if coord.id() != arena.len() {
        return Err(Error::BadCache(format!(
            "axis id {} out of order, expected {}",
            coord.id(),
            arena.len()
        )));
    }
    let id = arena.find_or_add(&coord);
    if id != coord.id() {
        return Err(Error::BadCache(format!("axis {} duplicates {id}", coord.id())));
    }

    Ok(())
}

impl Cacheable for FileInventory {
    fn size(&self) -> u64 {
        let strings = self.location.len()
            + self.grids.iter().map(|g| g.name.len() + 10).sum::<usize>()
            + self.times.iter().map(|t| t.name.len()).sum::<usize>()
            + self.verts.iter().map(|v| v.name.len()).sum::<usize>();
        let values = self.times.iter().map(|t| t.len() * 16).sum::<usize>()
            + self.verts.iter().map(|v| v.len() * 16).sum::<usize>()
            + self.ens.iter().map(|e| e.types.len() * 4 + 12).sum::<usize>();

        (64 + strings + values) as u64
    }
}
