use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{lock::Mutex, FutureExt};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    cache::Cache,
    collection::{CollectionAggregate, CollectionBuilder},
    config::{BestConfig, FmrcConfig},
    dataset::{Materializer, TimeView, ViewKind, VirtualDataset},
    errors::{Error, Result},
    inventory::FileInventory,
    lite::LiteInventory,
    run::RunBuilder,
    source::{Discovery, FileEntry, FileReader},
    store::InventoryStore,
    time::to_iso,
};

/// Everything built by one successful scan of the collection. Published as a whole and never
/// modified afterwards.
///
pub struct Snapshot {
    /// Files the snapshot was built from, sorted by path
    pub files: Vec<FileEntry>,

    pub aggregate: Arc<CollectionAggregate>,
    pub lite: Arc<LiteInventory>,
    pub dataset: Arc<VirtualDataset>,

    /// When the set of files last changed
    pub inventory_changed: DateTime<Utc>,

    /// When the prototype dataset was last rebuilt
    pub proto_changed: Option<DateTime<Utc>>,
}

/// A forecast model run collection.
///
/// Rescans run one at a time, serialized by the materializer lock. Queries work from the most
/// recently published `Snapshot` and never wait on a rescan.
///
pub struct Fmrc {
    config: FmrcConfig,
    discovery: Arc<dyn Discovery>,
    reader: Arc<dyn FileReader>,
    store: Arc<dyn InventoryStore>,
    inventories: Cache<(String, DateTime<Utc>), FileInventory>,
    materializer: Mutex<Materializer>,
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl Fmrc {
    pub fn new(
        config: FmrcConfig,
        discovery: Arc<dyn Discovery>,
        reader: Arc<dyn FileReader>,
        store: Arc<dyn InventoryStore>,
    ) -> Self {
        let inventories = Cache::new(config.inventory_cache_bytes);
        Self {
            config,
            discovery,
            reader,
            store,
            inventories,
            materializer: Mutex::new(Materializer::new()),
            current: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &FmrcConfig {
        &self.config
    }

    /// Rescan the collection and publish a new snapshot.
    ///
    /// If a snapshot has already been published, a failed rescan is logged and the previous
    /// snapshot stays in place. Otherwise the error is returned and the collection remains
    /// unusable until a later update succeeds.
    ///
    pub async fn update(&self, force_proto: bool) -> Result<()> {
        self.update_with(force_proto, false).await?;

        Ok(())
    }

    /// Rescan only if the list of files or their modification times have changed. Returns
    /// whether a new snapshot was published.
    ///
    pub async fn update_if_changed(&self) -> Result<bool> {
        self.update_with(false, true).await
    }

    pub async fn force_proto_rebuild(&self) -> Result<()> {
        self.update(true).await
    }

    async fn update_with(&self, force_proto: bool, only_if_changed: bool) -> Result<bool> {
        let mut materializer = self.materializer.lock().await;
        let previous = self.current.read().clone();

        let result = match self.discovery.list_files_sorted().await {
            Ok(files) => match &previous {
                Some(snapshot) if only_if_changed && snapshot.files == files => {
                    debug!(files = files.len(), "collection unchanged");
                    return Ok(false);
                }
                _ => {
                    self.rescan(&mut materializer, files, previous.as_deref(), force_proto)
                        .await
                }
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(snapshot) => {
                *self.current.write() = Some(Arc::new(snapshot));
                Ok(true)
            }
            Err(err) if previous.is_some() => {
                error!(%err, "rescan failed, keeping previous dataset");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn rescan(
        &self,
        materializer: &mut Materializer,
        files: Vec<FileEntry>,
        previous: Option<&Snapshot>,
        force_proto: bool,
    ) -> Result<Snapshot> {
        let mut runs: BTreeMap<DateTime<Utc>, RunBuilder> = BTreeMap::new();
        let mut skipped = 0;
        for entry in &files {
            let inventory = match self.inventory(entry).await {
                Ok(inventory) => inventory,
                Err(err) => {
                    warn!(location = %entry.path, %err, "skipping file");
                    skipped += 1;
                    continue;
                }
            };
            let run_date = inventory.run_date;
            runs.entry(run_date)
                .or_insert_with(|| RunBuilder::new(run_date))
                .add_file(inventory)?;
        }

        let mut builder = CollectionBuilder::new(self.config.regularize);
        for (_, run) in runs {
            builder.add_run(Arc::new(run.finish()))?;
        }
        let aggregate = Arc::new(builder.finish()?);
        let lite = Arc::new(LiteInventory::from_aggregate(&aggregate));
        let dataset = materializer
            .materialize(
                Arc::clone(&aggregate),
                Arc::clone(&lite),
                Arc::clone(&self.reader),
                &self.config.proto,
                force_proto,
            )
            .await?;

        info!(
            files = files.len(),
            skipped,
            runs = aggregate.runs.len(),
            grids = aggregate.grids.len(),
            base_date = %to_iso(&aggregate.base_date),
            "collection scanned"
        );

        let inventory_changed = match previous {
            Some(snapshot) if snapshot.files == files => snapshot.inventory_changed,
            _ => Utc::now(),
        };

        Ok(Snapshot {
            files,
            aggregate,
            lite,
            dataset,
            inventory_changed,
            proto_changed: materializer.proto_changed(),
        })
    }

    /// Inventory of one file, from the memory cache, the inventory store or the file itself,
    /// in that order of preference.
    ///
    async fn inventory(&self, entry: &FileEntry) -> Result<Arc<FileInventory>> {
        let key = (entry.path.clone(), entry.last_modified);
        let reader = Arc::clone(&self.reader);
        let store = Arc::clone(&self.store);
        let explicit_run_date = self.discovery.extract_run_date(&entry.path);
        let config = self.config.clone();
        let entry = entry.clone();
        let load = move |_key: (String, DateTime<Utc>)| {
            async move {
                let inventory =
                    FileInventory::open(&*reader, &*store, &entry, explicit_run_date, &config)
                        .await?;

                Ok(Some(inventory))
            }
            .boxed()
        };

        self.inventories.get(&key, load).await
    }

    /// The most recently published snapshot
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.current.read().clone().ok_or(Error::NotReady)
    }

    pub fn run_dates(&self) -> Result<Vec<DateTime<Utc>>> {
        Ok(self.snapshot()?.lite.run_dates.clone())
    }

    pub fn forecast_dates(&self) -> Result<Vec<DateTime<Utc>>> {
        Ok(self.snapshot()?.lite.forecast_dates())
    }

    pub fn forecast_offsets(&self) -> Result<Vec<f64>> {
        Ok(self.snapshot()?.lite.forecast_offsets())
    }

    /// First and last forecast dates of the run made at `run_date`
    pub fn date_range_for_run(
        &self,
        run_date: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let snapshot = self.snapshot()?;
        snapshot
            .lite
            .run_index(&run_date)
            .and_then(|run| snapshot.lite.date_range_for_run(run))
            .ok_or_else(|| Error::NotFound(format!("run {}", to_iso(&run_date))))
    }

    /// First and last dates forecast `hours` after their run
    pub fn date_range_for_offset(&self, hours: f64) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        self.snapshot()?
            .lite
            .date_range_for_offset(hours)
            .ok_or_else(|| Error::NotFound(format!("offset {hours}")))
    }

    pub fn dataset_2d(&self) -> Result<Arc<VirtualDataset>> {
        Ok(Arc::clone(&self.snapshot()?.dataset))
    }

    pub fn dataset_best(&self, config: &BestConfig) -> Result<TimeView> {
        self.view(
            config.name.as_str(),
            ViewKind::Best {
                min_offset: config.min_offset,
            },
        )
    }

    pub fn dataset_single_run(&self, run_date: DateTime<Utc>) -> Result<TimeView> {
        self.view(
            format!("run {}", to_iso(&run_date)),
            ViewKind::SingleRun(run_date),
        )
    }

    pub fn dataset_constant_forecast_time(&self, date: DateTime<Utc>) -> Result<TimeView> {
        self.view(
            format!("valid {}", to_iso(&date)),
            ViewKind::ConstantForecastTime(date),
        )
    }

    pub fn dataset_constant_offset(&self, hours: f64) -> Result<TimeView> {
        self.view(format!("offset {hours}h"), ViewKind::ConstantOffset(hours))
    }

    fn view<S: Into<String>>(&self, name: S, kind: ViewKind) -> Result<TimeView> {
        TimeView::build(Arc::clone(&self.snapshot()?.dataset), name, kind)
    }

    pub fn inventory_last_changed(&self) -> Option<DateTime<Utc>> {
        self.current
            .read()
            .as_ref()
            .map(|snapshot| snapshot.inventory_changed)
    }

    pub fn proto_last_changed(&self) -> Option<DateTime<Utc>> {
        self.current
            .read()
            .as_ref()
            .and_then(|snapshot| snapshot.proto_changed)
    }
}
