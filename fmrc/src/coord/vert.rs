use std::cmp::Ordering;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};

use super::{nearly_equals, CoordId, Coordinate, VERT_TOLERANCE};
use crate::{
    errors::{Error, Result},
    extio::{ExtendedAsyncRead, ExtendedAsyncWrite, Serialize},
};

/// A vertical axis: pressure levels, heights, soil layers and such.
///
#[derive(Clone, Debug)]
pub struct VertCoord {
    pub id: CoordId,
    pub name: String,
    pub units: Option<String>,
    pub values: VertValues,
}

#[derive(Clone, Debug, PartialEq)]
pub enum VertValues {
    Levels(Vec<f64>),
    Layers(Vec<[f64; 2]>),
}

impl VertCoord {
    pub fn levels<S: Into<String>>(name: S, units: Option<&str>, levels: Vec<f64>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            units: units.map(String::from),
            values: VertValues::Levels(levels),
        }
    }

    pub fn layers<S: Into<String>>(name: S, units: Option<&str>, layers: Vec<[f64; 2]>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            units: units.map(String::from),
            values: VertValues::Layers(layers),
        }
    }

    pub fn len(&self) -> usize {
        match &self.values {
            VertValues::Levels(levels) => levels.len(),
            VertValues::Layers(layers) => layers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_layer(&self) -> bool {
        matches!(self.values, VertValues::Layers(_))
    }

    /// Every value as a `(lower, upper)` pair. Levels are zero width pairs.
    ///
    fn pairs(&self) -> Vec<[f64; 2]> {
        match &self.values {
            VertValues::Levels(levels) => levels.iter().map(|v| [*v, *v]).collect(),
            VertValues::Layers(layers) => layers.clone(),
        }
    }

    /// Merge the values of `others` into this coordinate.
    ///
    /// All value pairs of `self` and `others` are collected into a tolerantly deduplicated set,
    /// sorted by midpoint, and this coordinate's values replaced with the result. The name and
    /// units of `self` are kept.
    ///
    pub fn normalize<'a, I>(&mut self, others: I)
    where
        I: IntoIterator<Item = &'a VertCoord>,
    {
        let mut layered = self.is_layer();
        let mut pairs: Vec<[f64; 2]> = vec![];
        let others: Vec<&VertCoord> = others.into_iter().collect();
        for coord in std::iter::once(&*self).chain(others.iter().copied()) {
            layered |= coord.is_layer();
            for pair in coord.pairs() {
                if !pairs.iter().any(|p| same_pair(p, &pair)) {
                    pairs.push(pair);
                }
            }
        }
        pairs.sort_by(|a, b| {
            midpoint(a)
                .partial_cmp(&midpoint(b))
                .unwrap_or(Ordering::Equal)
        });

        self.values = if layered {
            VertValues::Layers(pairs)
        } else {
            VertValues::Levels(pairs.into_iter().map(|[v, _]| v).collect())
        };
    }

    /// Union of several vertical coordinates. Returns `None` if `coords` is empty.
    ///
    pub fn union<'a, I>(coords: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a VertCoord>,
    {
        let mut coords = coords.into_iter();
        let mut result = coords.next()?.clone();
        result.normalize(coords);

        Some(result)
    }
}

fn midpoint(pair: &[f64; 2]) -> f64 {
    (pair[0] + pair[1]) / 2.0
}

fn same_pair(a: &[f64; 2], b: &[f64; 2]) -> bool {
    nearly_equals(a[0], b[0], VERT_TOLERANCE) && nearly_equals(a[1], b[1], VERT_TOLERANCE)
}

impl Coordinate for VertCoord {
    fn same_values(&self, other: &Self) -> bool {
        match (&self.values, &other.values) {
            (VertValues::Levels(a), VertValues::Levels(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|(x, y)| nearly_equals(*x, *y, VERT_TOLERANCE))
            }
            (VertValues::Layers(a), VertValues::Layers(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_pair(x, y))
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

#[async_trait]
impl Serialize for VertCoord {
    async fn write_to(&self, stream: &mut (impl AsyncWrite + Unpin + Send)) -> Result<()> {
        stream.write_u32(self.id as u32).await?;
        stream.write_str(&self.name).await?;
        match &self.units {
            Some(units) => {
                stream.write_byte(1).await?;
                stream.write_str(units).await?;
            }
            None => stream.write_byte(0).await?,
        }
        match &self.values {
            VertValues::Levels(levels) => {
                stream.write_byte(0).await?;
                stream.write_f64s(levels).await?;
            }
            VertValues::Layers(layers) => {
                stream.write_byte(1).await?;
                let flat: Vec<f64> = layers.iter().flatten().copied().collect();
                stream.write_f64s(&flat).await?;
            }
        }

        Ok(())
    }

    async fn read_from(stream: &mut (impl AsyncRead + Unpin + Send)) -> Result<Self> {
        let id = stream.read_u32().await? as CoordId;
        let name = stream.read_str().await?;
        let units = match stream.read_byte().await? {
            0 => None,
            _ => Some(stream.read_str().await?),
        };
        let layered = stream.read_byte().await? != 0;
        let flat = stream.read_f64s().await?;
        let values = if layered {
            if flat.len() % 2 != 0 {
                return Err(Error::BadCache(String::from("odd number of layer bounds")));
            }
            VertValues::Layers(flat.chunks(2).map(|pair| [pair[0], pair[1]]).collect())
        } else {
            VertValues::Levels(flat)
        };

        Ok(Self {
            id,
            name,
            units,
            values,
        })
    }
}
