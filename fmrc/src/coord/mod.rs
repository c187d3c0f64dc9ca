//! Coordinate axes and their canonicalization.
//!
//! Each aggregation scope (file, run, collection) owns one `Arena` per kind of coordinate.
//! Variables refer to coordinates by `CoordId`, the coordinate's position in its arena. Value
//! equal coordinates are stored once per arena, so within one scope comparing ids is the same
//! as comparing values.
//!
mod ens;
mod time;
mod vert;

pub use ens::EnsCoord;
pub use time::{TimeCoord, TimeValues};
pub use vert::{VertCoord, VertValues};

/// Relative tolerance used when comparing time offsets
pub const TIME_TOLERANCE: f64 = 1.0e-5;

/// Relative tolerance used when comparing vertical levels
pub const VERT_TOLERANCE: f64 = 1.0e-3;

/// Index of a coordinate in its `Arena`
pub type CoordId = usize;

/// Tolerant floating point comparison.
///
/// Values are equal if their difference is within `tolerance` relative to the larger magnitude.
/// Near zero, where relative error is meaningless, `tolerance` is used as an absolute bound.
///
pub fn nearly_equals(a: f64, b: f64, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    let scale = a.abs().max(b.abs());
    if scale < 1.0 {
        diff <= tolerance
    } else {
        diff <= tolerance * scale
    }
}

/// Collect `values` into a list with no two entries tolerantly equal. First occurrence wins.
///
pub(crate) fn dedup_tolerant(values: impl IntoIterator<Item = f64>, tolerance: f64) -> Vec<f64> {
    let mut unique: Vec<f64> = vec![];
    for value in values {
        if !unique.iter().any(|u| nearly_equals(*u, value, tolerance)) {
            unique.push(value);
        }
    }

    unique
}

/// Behavior common to all coordinate kinds that can be stored in an `Arena`.
///
pub trait Coordinate: Clone {
    /// Type specific value equality. Never exact floating point comparison for float valued
    /// coordinates.
    fn same_values(&self, other: &Self) -> bool;

    /// Canonical id, assigned when added to an arena
    fn id(&self) -> CoordId;

    fn set_id(&mut self, id: CoordId);
}

/// Owns the canonical coordinates of one kind for one aggregation scope.
///
#[derive(Clone, Debug)]
pub struct Arena<C: Coordinate> {
    items: Vec<C>,
}

impl<C: Coordinate> Default for Arena<C> {
    fn default() -> Self {
        Self { items: vec![] }
    }
}

impl<C: Coordinate> Arena<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of the canonical coordinate value equal to `candidate`, adding a copy of
    /// `candidate` if there isn't one yet.
    ///
    /// This is a linear scan. The number of distinct axes in a scope is small.
    ///
    pub fn find_or_add(&mut self, candidate: &C) -> CoordId {
        if let Some(existing) = self.find(candidate) {
            return existing;
        }

        let id = self.items.len();
        let mut copy = candidate.clone();
        copy.set_id(id);
        self.items.push(copy);

        id
    }

    /// Id of the canonical coordinate value equal to `candidate`, if any.
    ///
    pub fn find(&self, candidate: &C) -> Option<CoordId> {
        self.items
            .iter()
            .find(|item| item.same_values(candidate))
            .map(|item| item.id())
    }

    pub fn get(&self, id: CoordId) -> &C {
        &self.items[id]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &C> {
        self.items.iter()
    }
}
