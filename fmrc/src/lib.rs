mod buffer;
mod cache;
mod collection;
mod config;
mod controller;
mod coord;
mod dataset;
mod errors;
mod extio;
mod inventory;
mod lite;
mod run;
mod schema;
mod source;
mod store;
mod time;

#[cfg(test)]
mod testing;

pub use buffer::{DataType, Fill, TypedArray};
pub use cache::{Cache, Cacheable};
pub use collection::{CollectionAggregate, CollectionBuilder, RunSeq, UberGrid, UberRun};
pub use config::{BestConfig, FmrcConfig, ProtoChoice};
pub use controller::{Fmrc, Snapshot};
pub use coord::{
    Arena, CoordId, Coordinate, EnsCoord, TimeCoord, TimeValues, VertCoord, VertValues,
};
pub use dataset::{
    Materializer, MaterializerState, Payload, Prototype, TimeView, ViewKind, ViewVariable,
    VirtualDataset, VirtualVariable,
};
pub use errors::{Error, Result};
pub use inventory::{FileGrid, FileInventory, CACHE_VERSION, INVENTORY_KEY};
pub use lite::{GridInventory, LiteGrid, LiteInventory, TimeInstance, TimeTable};
pub use run::{RunAggregate, RunBuilder, RunGrid, RunPart};
pub use schema::{Attribute, AttributeValue, Dimension, FileSchema, VariableSchema};
pub use source::{Discovery, FileEntry, FileReader, GridFile, GridVariableInfo, TimeAxis};
pub use store::{DirectoryStore, InventoryStore};
