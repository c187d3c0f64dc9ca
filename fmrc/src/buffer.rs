use std::ops::Range;

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use num_traits::AsPrimitive;
use paste::paste;

use crate::errors::{Error, Result};

/// The numeric types a variable can hold.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    /// Value used to mark missing data when a variable doesn't declare its own.
    ///
    pub fn default_fill(&self) -> Fill {
        match self {
            DataType::I32 => Fill::Int(-2147483647),
            DataType::I64 => Fill::Int(-9223372036854775806),
            DataType::F32 | DataType::F64 => Fill::Float(f64::NAN),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

/// A missing data marker. Integer markers are kept as integers so 64 bit sentinels survive
/// exactly.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Fill {
    Int(i64),
    Float(f64),
}

impl Fill {
    fn cast<T>(self) -> T
    where
        T: Copy + 'static,
        i64: AsPrimitive<T>,
        f64: AsPrimitive<T>,
    {
        match self {
            Fill::Int(value) => value.as_(),
            Fill::Float(value) => value.as_(),
        }
    }
}

/// An n-dimensional array of one of the supported numeric types.
///
#[derive(Clone, Debug, PartialEq)]
pub enum TypedArray {
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

fn cast<A, B>(array: &ArrayD<A>) -> ArrayD<B>
where
    A: AsPrimitive<B>,
    B: Copy + 'static,
{
    array.mapv(|value| value.as_())
}

macro_rules! convert_to {
    ($array:expr, $variant:ident, $type:ty) => {
        match $array {
            TypedArray::I32(a) => TypedArray::$variant(cast::<i32, $type>(&a)),
            TypedArray::I64(a) => TypedArray::$variant(cast::<i64, $type>(&a)),
            TypedArray::F32(a) => TypedArray::$variant(cast::<f32, $type>(&a)),
            TypedArray::F64(a) => TypedArray::$variant(cast::<f64, $type>(&a)),
        }
    };
}

macro_rules! accessors {
    ($variant:ident, $type:ty) => {
        paste! {
            impl TypedArray {
                pub fn [<as_ $type>](&self) -> Option<&ArrayD<$type>> {
                    match self {
                        TypedArray::$variant(array) => Some(array),
                        _ => None,
                    }
                }

                pub fn [<into_ $type>](self) -> Option<ArrayD<$type>> {
                    match self {
                        TypedArray::$variant(array) => Some(array),
                        _ => None,
                    }
                }
            }

            impl From<ArrayD<$type>> for TypedArray {
                fn from(array: ArrayD<$type>) -> Self {
                    TypedArray::$variant(array)
                }
            }
        }
    };
}

accessors!(I32, i32);
accessors!(I64, i64);
accessors!(F32, f32);
accessors!(F64, f64);

impl TypedArray {
    /// An array of `shape` with every cell set to `fill`.
    ///
    pub fn filled(data_type: DataType, shape: &[usize], fill: Fill) -> Self {
        let shape = IxDyn(shape);
        match data_type {
            DataType::I32 => TypedArray::I32(ArrayD::from_elem(shape, fill.cast())),
            DataType::I64 => TypedArray::I64(ArrayD::from_elem(shape, fill.cast())),
            DataType::F32 => TypedArray::F32(ArrayD::from_elem(shape, fill.cast())),
            DataType::F64 => TypedArray::F64(ArrayD::from_elem(shape, fill.cast())),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TypedArray::I32(_) => DataType::I32,
            TypedArray::I64(_) => DataType::I64,
            TypedArray::F32(_) => DataType::F32,
            TypedArray::F64(_) => DataType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TypedArray::I32(a) => a.shape(),
            TypedArray::I64(a) => a.shape(),
            TypedArray::F32(a) => a.shape(),
            TypedArray::F64(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert to another numeric type, with `as` semantics.
    ///
    pub fn convert(self, data_type: DataType) -> Self {
        if self.data_type() == data_type {
            return self;
        }
        match data_type {
            DataType::I32 => convert_to!(self, I32, i32),
            DataType::I64 => convert_to!(self, I64, i64),
            DataType::F32 => convert_to!(self, F32, f32),
            DataType::F64 => convert_to!(self, F64, f64),
        }
    }

    /// Reinterpret with a new shape holding the same number of elements.
    ///
    pub fn into_shape(self, shape: &[usize]) -> Result<Self> {
        let bad_shape = |err: ndarray::ShapeError| Error::Reader(err.to_string());
        let shape = IxDyn(shape);
        let reshaped = match self {
            TypedArray::I32(a) => TypedArray::I32(a.into_shape(shape).map_err(bad_shape)?),
            TypedArray::I64(a) => TypedArray::I64(a.into_shape(shape).map_err(bad_shape)?),
            TypedArray::F32(a) => TypedArray::F32(a.into_shape(shape).map_err(bad_shape)?),
            TypedArray::F64(a) => TypedArray::F64(a.into_shape(shape).map_err(bad_shape)?),
        };

        Ok(reshaped)
    }

    /// Copy out the hyperslab selected by one range per axis.
    ///
    pub fn slice(&self, ranges: &[Range<usize>]) -> Result<Self> {
        let shape = self.shape();
        if ranges.len() != shape.len()
            || ranges
                .iter()
                .zip(shape)
                .any(|(range, len)| range.start > range.end || range.end > *len)
        {
            return Err(Error::Reader(format!(
                "section {ranges:?} out of bounds for shape {shape:?}"
            )));
        }
        let select = |ax: ndarray::AxisDescription| {
            let range = &ranges[ax.axis.index()];
            Slice::from(range.start..range.end)
        };
        let sliced = match self {
            TypedArray::I32(a) => TypedArray::I32(a.slice_each_axis(select).to_owned()),
            TypedArray::I64(a) => TypedArray::I64(a.slice_each_axis(select).to_owned()),
            TypedArray::F32(a) => TypedArray::F32(a.slice_each_axis(select).to_owned()),
            TypedArray::F64(a) => TypedArray::F64(a.slice_each_axis(select).to_owned()),
        };

        Ok(sliced)
    }

    /// Copy `source` into position `index` along the first axis.
    ///
    /// `source` is converted to this array's type and must hold exactly as many elements as one
    /// entry along the first axis. A leading axis of length one in `source` is fine.
    ///
    pub fn assign_at(&mut self, index: usize, source: TypedArray) -> Result<()> {
        let inner: Vec<usize> = self.shape()[1..].to_vec();
        if source.len() != inner.iter().product::<usize>() {
            return Err(Error::Reader(format!(
                "can't assign {:?} into {:?}",
                source.shape(),
                inner
            )));
        }
        let source = source.convert(self.data_type()).into_shape(&inner)?;
        match (self, source) {
            (TypedArray::I32(dest), TypedArray::I32(src)) => {
                dest.index_axis_mut(Axis(0), index).assign(&src)
            }
            (TypedArray::I64(dest), TypedArray::I64(src)) => {
                dest.index_axis_mut(Axis(0), index).assign(&src)
            }
            (TypedArray::F32(dest), TypedArray::F32(src)) => {
                dest.index_axis_mut(Axis(0), index).assign(&src)
            }
            (TypedArray::F64(dest), TypedArray::F64(src)) => {
                dest.index_axis_mut(Axis(0), index).assign(&src)
            }
            _ => unreachable!("source was converted to destination type"),
        }

        Ok(())
    }

    /// Every value as a 64 bit float, in logical order.
    ///
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            TypedArray::I32(a) => a.iter().map(|v| v.as_()).collect(),
            TypedArray::I64(a) => a.iter().map(|v| v.as_()).collect(),
            TypedArray::F32(a) => a.iter().map(|v| v.as_()).collect(),
            TypedArray::F64(a) => a.iter().copied().collect(),
        }
    }
}
