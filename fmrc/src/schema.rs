//! Structural metadata of gridded datasets: dimensions, attributes and variables.
//!
use crate::buffer::{DataType, Fill};

#[derive(Clone, Debug, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub len: usize,
}

impl Dimension {
    pub fn new<S: Into<String>>(name: S, len: usize) -> Self {
        Self {
            name: name.into(),
            len,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
    Numbers(Vec<f64>),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(value) => Some(*value),
            AttributeValue::Numbers(values) => values.first().copied(),
            AttributeValue::Text(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn text<S: Into<String>, T: Into<String>>(name: S, text: T) -> Self {
        Self {
            name: name.into(),
            value: AttributeValue::Text(text.into()),
        }
    }

    pub fn number<S: Into<String>>(name: S, value: f64) -> Self {
        Self {
            name: name.into(),
            value: AttributeValue::Number(value),
        }
    }
}

/// Find an attribute by name
pub fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a AttributeValue> {
    attributes
        .iter()
        .find(|attr| attr.name == name)
        .map(|attr| &attr.value)
}

/// Add or replace an attribute
pub fn set_attribute(attributes: &mut Vec<Attribute>, attribute: Attribute) {
    match attributes.iter_mut().find(|attr| attr.name == attribute.name) {
        Some(existing) => *existing = attribute,
        None => attributes.push(attribute),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableSchema {
    pub name: String,
    pub data_type: DataType,

    /// Dimension names, outermost first
    pub dims: Vec<String>,

    /// Length of each dimension in `dims`
    pub shape: Vec<usize>,

    pub attributes: Vec<Attribute>,
}

impl VariableSchema {
    pub fn new<S: Into<String>>(
        name: S,
        data_type: DataType,
        dims: Vec<(&str, usize)>,
        attributes: Vec<Attribute>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            dims: dims.iter().map(|(name, _)| String::from(*name)).collect(),
            shape: dims.iter().map(|(_, len)| *len).collect(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        find_attribute(&self.attributes, name)
    }

    /// The value marking missing data: the `_FillValue` attribute, else `missing_value`, else
    /// the default for the variable's type.
    ///
    pub fn missing_value(&self) -> Fill {
        self.attribute("_FillValue")
            .or_else(|| self.attribute("missing_value"))
            .and_then(|value| value.as_number())
            .map(Fill::Float)
            .unwrap_or_else(|| self.data_type.default_fill())
    }

    /// A coordinate variable is one dimensional and named after its dimension.
    ///
    pub fn is_coordinate(&self) -> bool {
        self.dims.len() == 1 && self.dims[0] == self.name
    }
}

/// Everything about a file except the bulk data.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileSchema {
    pub dimensions: Vec<Dimension>,
    pub variables: Vec<VariableSchema>,
    pub attributes: Vec<Attribute>,
}

impl FileSchema {
    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|dim| dim.name == name)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableSchema> {
        self.variables.iter().find(|var| var.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        find_attribute(&self.attributes, name)
    }

    /// Merge structure from `other` into this schema. Existing entries win.
    ///
    pub fn merge(&mut self, other: &FileSchema) {
        for dim in &other.dimensions {
            if self.dimension(&dim.name).is_none() {
                self.dimensions.push(dim.clone());
            }
        }
        for var in &other.variables {
            if self.variable(&var.name).is_none() {
                self.variables.push(var.clone());
            }
        }
        for attr in &other.attributes {
            if self.attribute(&attr.name).is_none() {
                self.attributes.push(attr.clone());
            }
        }
    }
}
