//! Typed instance sets built from raw feature maps.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::CoercionFailure;
use crate::error::ModelError;
use crate::error::Result;
use crate::model::ClassFeatureMeta;
use crate::model::FeatureMap;
use crate::model::FeatureMetas;
use crate::model::FeatureType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Text,
    Nominal(Vec<String>),
    Numeric,
}

impl From<&FeatureType> for AttributeKind {
    fn from(feature: &FeatureType) -> Self {
        match feature {
            FeatureType::String => Self::Text,
            FeatureType::Boolean => Self::Nominal(vec!["true".to_string(), "false".to_string()]),
            FeatureType::Numeric => Self::Numeric,
            FeatureType::Enum(values) => Self::Nominal(values.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    Number(f64),
    Label(String),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn as_label(&self) -> Option<&str> {
        match self {
            Self::Label(label) => Some(label),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(*number),
            _ => None,
        }
    }
}

/// A named, typed table of instances with an optional class attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSet {
    name: String,
    attributes: Vec<Attribute>,
    class_index: Option<usize>,
    rows: Vec<Vec<Cell>>,
}

impl InstanceSet {
    /// An empty set with the given schema.
    pub fn empty(
        name: impl Into<String>,
        attributes: Vec<Attribute>,
        class_index: Option<usize>,
    ) -> Result<Self> {
        if let Some(index) = class_index {
            if index >= attributes.len() {
                return Err(ModelError::SchemaMismatch(format!(
                    "class index {index} is out of range for {} attributes",
                    attributes.len()
                )));
            }
        }
        Ok(Self {
            name: name.into(),
            attributes,
            class_index,
            rows: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn class_index(&self) -> Option<usize> {
        self.class_index
    }

    pub fn class_attribute(&self) -> Option<&Attribute> {
        self.class_index.map(|index| &self.attributes[index])
    }

    /// Declared labels of the class attribute.
    pub fn class_labels(&self) -> Result<&[String]> {
        match self.class_attribute() {
            Some(Attribute {
                kind: AttributeKind::Nominal(values),
                ..
            }) => Ok(values),
            Some(attribute) => Err(ModelError::SchemaMismatch(format!(
                "class attribute '{}' is not nominal",
                attribute.name
            ))),
            None => Err(ModelError::SchemaMismatch(format!(
                "instance set '{}' has no class attribute",
                self.name
            ))),
        }
    }

    /// Gold label of `row`, if the class cell is set.
    pub fn class_value(&self, row: usize) -> Option<&str> {
        let index = self.class_index?;
        self.rows.get(row)?.get(index)?.as_label()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn cell(&self, row: usize, attribute: usize) -> Option<&Cell> {
        self.rows.get(row)?.get(attribute)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.attributes.len() {
            return Err(ModelError::SchemaMismatch(format!(
                "row has {} cells but '{}' has {} attributes",
                row.len(),
                self.name,
                self.attributes.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn set_cell(&mut self, row: usize, attribute: usize, cell: Cell) -> Result<()> {
        let slot = self
            .rows
            .get_mut(row)
            .and_then(|cells| cells.get_mut(attribute))
            .ok_or_else(|| {
                ModelError::SchemaMismatch(format!("no cell at row {row}, attribute {attribute}"))
            })?;
        *slot = cell;
        Ok(())
    }

    /// Rows at the given indices, same schema.
    pub fn subset(&self, name: impl Into<String>, indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            name: name.into(),
            attributes: self.attributes.clone(),
            class_index: self.class_index,
            rows: indices
                .into_iter()
                .filter_map(|index| self.rows.get(index).cloned())
                .collect(),
        }
    }

    /// Project onto the named feature attributes. The class attribute is
    /// always kept and stays last.
    pub fn select(&self, keep: &[String]) -> Result<Self> {
        for name in keep {
            if self.attribute_index(name).is_none() {
                return Err(ModelError::SchemaMismatch(format!(
                    "cannot select unknown attribute '{name}' from '{}'",
                    self.name
                )));
            }
        }

        let indices: Vec<usize> = (0..self.attributes.len())
            .filter(|&index| {
                Some(index) == self.class_index || keep.contains(&self.attributes[index].name)
            })
            .collect();
        let class_index = self
            .class_index
            .and_then(|class| indices.iter().position(|&index| index == class));

        Ok(Self {
            name: self.name.clone(),
            attributes: indices.iter().map(|&i| self.attributes[i].clone()).collect(),
            class_index,
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        })
    }

    pub fn same_schema(&self, other: &Self) -> bool {
        self.attributes == other.attributes && self.class_index == other.class_index
    }
}

/// Attributes for `metas` in iteration order with the class attribute last.
pub fn schema(metas: &FeatureMetas, class_meta: &ClassFeatureMeta) -> (Vec<Attribute>, usize) {
    let mut attributes: Vec<Attribute> = metas
        .iter()
        .filter(|(name, _)| **name != class_meta.key)
        .map(|(name, feature)| Attribute::new(name.clone(), AttributeKind::from(feature)))
        .collect();
    attributes.push(Attribute::new(
        class_meta.key.clone(),
        AttributeKind::Nominal(class_meta.values.clone()),
    ));
    let class_index = attributes.len() - 1;
    (attributes, class_index)
}

/// Build an instance set from feature maps.
///
/// Absent or null feature values become [`Cell::Missing`]. A missing class
/// value is only accepted when `missing_ok` is set.
pub fn build(
    name: &str,
    feature_maps: &[FeatureMap],
    metas: &FeatureMetas,
    class_meta: &ClassFeatureMeta,
    missing_ok: bool,
) -> Result<InstanceSet> {
    let (attributes, class_index) = schema(metas, class_meta);
    let mut set = InstanceSet::empty(name, attributes, Some(class_index))?;

    for features in feature_maps {
        let row = set
            .attributes
            .iter()
            .enumerate()
            .map(|(index, attribute)| match features.get(&attribute.name) {
                None | Some(Value::Null) if index == class_index && !missing_ok => {
                    Err(ModelError::MissingValue {
                        attribute: attribute.name.clone(),
                    })
                }
                None => Ok(Cell::Missing),
                Some(value) => coerce(attribute, value),
            })
            .collect::<Result<Vec<_>>>()?;
        set.rows.push(row);
    }

    Ok(set)
}

/// Convert a raw value to a cell of `attribute`'s kind.
pub fn coerce(attribute: &Attribute, value: &Value) -> Result<Cell> {
    let fail = |cause| ModelError::FeatureCoercion {
        attribute: attribute.name.clone(),
        value: value.clone(),
        cause,
    };

    if value.is_null() {
        return Ok(Cell::Missing);
    }
    if let Some(shape) = compound_shape(value) {
        return Err(fail(CoercionFailure::UnsupportedShape(shape)));
    }

    match &attribute.kind {
        AttributeKind::Numeric => numeric(value)
            .map(Cell::Number)
            .ok_or_else(|| fail(CoercionFailure::NotNumeric)),
        AttributeKind::Nominal(values) => {
            let label = render_scalar(value);
            if values.contains(&label) {
                Ok(Cell::Label(label))
            } else {
                Err(fail(CoercionFailure::NotInDomain {
                    value: label,
                    allowed: values.clone(),
                }))
            }
        }
        AttributeKind::Text => Ok(Cell::Label(render_scalar(value))),
    }
}

/// Concatenate two sets with identical schemas, rows of `a` first.
pub fn append(a: &InstanceSet, b: &InstanceSet) -> Result<InstanceSet> {
    if !a.same_schema(b) {
        return Err(ModelError::SchemaMismatch(format!(
            "cannot append '{}' to '{}': attributes differ",
            b.name, a.name
        )));
    }
    let mut joined = a.clone();
    joined.rows.extend(b.rows.iter().cloned());
    Ok(joined)
}

fn compound_shape(value: &Value) -> Option<&'static str> {
    match value {
        Value::Array(_) => Some("array"),
        Value::Object(_) => Some("object"),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|number| number.is_finite())
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
