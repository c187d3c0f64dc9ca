use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::{dedup_tolerant, nearly_equals, CoordId, Coordinate, TIME_TOLERANCE};
use crate::time::hours_between;

/// A forecast time axis: offsets, in hours, from a reference (run) date.
///
#[derive(Clone, Debug)]
pub struct TimeCoord {
    pub id: CoordId,
    pub name: String,
    pub run_date: DateTime<Utc>,
    pub values: TimeValues,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TimeValues {
    /// Instantaneous offsets
    Points(Vec<f64>),

    /// Offset intervals, eg for accumulations, as `[start, end]`
    Intervals(Vec<[f64; 2]>),
}

impl TimeCoord {
    pub fn points<S: Into<String>>(name: S, run_date: DateTime<Utc>, offsets: Vec<f64>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            run_date,
            values: TimeValues::Points(offsets),
        }
    }

    pub fn intervals<S: Into<String>>(
        name: S,
        run_date: DateTime<Utc>,
        bounds: Vec<[f64; 2]>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            run_date,
            values: TimeValues::Intervals(bounds),
        }
    }

    /// The sentinel for "no data in this run".
    ///
    pub fn empty(run_date: DateTime<Utc>) -> Self {
        Self::points("time", run_date, vec![])
    }

    pub fn len(&self) -> usize {
        match &self.values {
            TimeValues::Points(offsets) => offsets.len(),
            TimeValues::Intervals(bounds) => bounds.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_interval(&self) -> bool {
        matches!(self.values, TimeValues::Intervals(_))
    }

    /// Representative offset of each time step. For intervals this is the end of the interval.
    ///
    pub fn offsets(&self) -> Vec<f64> {
        match &self.values {
            TimeValues::Points(offsets) => offsets.clone(),
            TimeValues::Intervals(bounds) => bounds.iter().map(|[_, end]| *end).collect(),
        }
    }

    /// Representative offsets re-based to `origin`.
    ///
    pub fn offsets_from(&self, origin: &DateTime<Utc>) -> Vec<f64> {
        let shift = hours_between(origin, &self.run_date);
        self.offsets().into_iter().map(|o| o + shift).collect()
    }

    /// `[start, end]` of each time step. Points are zero width.
    ///
    pub fn bounds(&self) -> Vec<[f64; 2]> {
        match &self.values {
            TimeValues::Points(offsets) => offsets.iter().map(|o| [*o, *o]).collect(),
            TimeValues::Intervals(bounds) => bounds.clone(),
        }
    }

    /// Index of the time step spanning exactly `bounds`, if any.
    ///
    /// Intervals sharing an end are told apart by their start. A point only matches zero
    /// width bounds.
    ///
    pub fn find_bounds(&self, bounds: [f64; 2]) -> Option<usize> {
        match &self.values {
            TimeValues::Points(offsets) => offsets
                .iter()
                .position(|o| same_bounds(&[*o, *o], &bounds)),
            TimeValues::Intervals(steps) => {
                steps.iter().position(|step| same_bounds(step, &bounds))
            }
        }
    }

    /// Union of several time coordinates, expressed relative to `run_date`.
    ///
    /// Every input is reprojected onto `run_date` regardless of its own reference date.
    /// Tolerantly equal values are merged and the result is sorted ascending. If any input is
    /// an interval coordinate, the result is an interval coordinate and point inputs are
    /// treated as zero width intervals.
    ///
    pub fn union<'a, I>(coords: I, run_date: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a TimeCoord>,
    {
        let coords: Vec<&TimeCoord> = coords.into_iter().collect();
        let name = coords
            .first()
            .map(|c| c.name.clone())
            .unwrap_or_else(|| String::from("time"));

        if coords.iter().any(|c| c.is_interval()) {
            let mut bounds: Vec<[f64; 2]> = vec![];
            for coord in &coords {
                let shift = hours_between(&run_date, &coord.run_date);
                let shifted: Vec<[f64; 2]> = match &coord.values {
                    TimeValues::Points(offsets) => {
                        offsets.iter().map(|o| [o + shift, o + shift]).collect()
                    }
                    TimeValues::Intervals(b) => {
                        b.iter().map(|[s, e]| [s + shift, e + shift]).collect()
                    }
                };
                for bound in shifted {
                    if !bounds.iter().any(|b| same_bounds(b, &bound)) {
                        bounds.push(bound);
                    }
                }
            }
            bounds.sort_by(|a, b| {
                a[1].partial_cmp(&b[1])
                    .unwrap_or(Ordering::Equal)
                    .then(a[0].partial_cmp(&b[0]).unwrap_or(Ordering::Equal))
            });

            Self::intervals(name, run_date, bounds)
        } else {
            let all = coords.iter().flat_map(|c| c.offsets_from(&run_date));
            let mut offsets = dedup_tolerant(all, TIME_TOLERANCE);
            offsets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

            Self::points(name, run_date, offsets)
        }
    }
}

fn same_bounds(a: &[f64; 2], b: &[f64; 2]) -> bool {
    nearly_equals(a[0], b[0], TIME_TOLERANCE) && nearly_equals(a[1], b[1], TIME_TOLERANCE)
}

impl Coordinate for TimeCoord {
    fn same_values(&self, other: &Self) -> bool {
        if self.run_date != other.run_date {
            return false;
        }
        match (&self.values, &other.values) {
            (TimeValues::Points(a), TimeValues::Points(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|(x, y)| nearly_equals(*x, *y, TIME_TOLERANCE))
            }
            (TimeValues::Intervals(a), TimeValues::Intervals(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_bounds(x, y))
            }
            _ => false,
        }
    }

    fn id(&self) -> CoordId {
        self.id
    }

    fn set_id(&mut self, id: CoordId) {
        self.id = id;
    }
}
