//! Schema-driven tuple encoding
//!
//! The index only ever looks at two attributes of a tuple: the index value
//! and the timestamp. Everything else is carried as opaque bytes produced by
//! `DataSchema::serialize_tuple`.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::IndexKey;
use serde::{Deserialize, Serialize};

/// Type of a single schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int,
    Double,
    Text,
}

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i64),
    Double(f64),
    Text(String),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Text(_) => FieldType::Text,
        }
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Double(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A structured tuple, values in schema field order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTuple {
    pub values: Vec<FieldValue>,
}

impl DataTuple {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }
}

/// A named, typed field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

/// Tuple layout plus the names of the two distinguished attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSchema {
    fields: Vec<Field>,
    index_field: String,
    timestamp_field: String,
}

impl DataSchema {
    /// Create an empty schema whose index value and timestamp live in the named fields
    pub fn new(index_field: impl Into<String>, timestamp_field: impl Into<String>) -> Self {
        Self {
            fields: Vec::new(),
            index_field: index_field.into(),
            timestamp_field: timestamp_field.into(),
        }
    }

    /// Builder method: append a field
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
        });
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn index_field(&self) -> &str {
        &self.index_field
    }

    pub fn timestamp_field(&self) -> &str {
        &self.timestamp_field
    }

    /// Position of a field by name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Look up an attribute of a tuple by field name
    pub fn get_value<'a>(&self, name: &str, tuple: &'a DataTuple) -> Option<&'a FieldValue> {
        self.position(name).and_then(|idx| tuple.values.get(idx))
    }

    /// Encode a tuple to its opaque byte form
    pub fn serialize_tuple(&self, tuple: &DataTuple) -> StorageResult<Vec<u8>> {
        self.validate(tuple)?;
        Ok(bincode::serialize(&tuple.values)?)
    }

    /// Decode bytes produced by `serialize_tuple`
    pub fn deserialize_tuple(&self, bytes: &[u8]) -> StorageResult<DataTuple> {
        let values: Vec<FieldValue> = bincode::deserialize(bytes)?;
        let tuple = DataTuple { values };
        self.validate(&tuple)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(tuple)
    }

    /// Extract the index value; NaN and non-numeric values are rejected
    pub fn index_value(&self, tuple: &DataTuple) -> StorageResult<IndexKey> {
        let value = self
            .get_value(&self.index_field, tuple)
            .and_then(FieldValue::as_f64)
            .ok_or_else(|| {
                StorageError::MalformedTuple(format!(
                    "missing numeric index field '{}'",
                    self.index_field
                ))
            })?;

        if value.is_nan() {
            return Err(StorageError::MalformedTuple(format!(
                "index field '{}' is NaN",
                self.index_field
            )));
        }

        Ok(IndexKey(value))
    }

    /// Extract the timestamp (milliseconds)
    pub fn timestamp(&self, tuple: &DataTuple) -> StorageResult<i64> {
        self.get_value(&self.timestamp_field, tuple)
            .and_then(FieldValue::as_i64)
            .ok_or_else(|| {
                StorageError::MalformedTuple(format!(
                    "missing integer timestamp field '{}'",
                    self.timestamp_field
                ))
            })
    }

    fn validate(&self, tuple: &DataTuple) -> StorageResult<()> {
        if tuple.values.len() != self.fields.len() {
            return Err(StorageError::MalformedTuple(format!(
                "expected {} fields, got {}",
                self.fields.len(),
                tuple.values.len()
            )));
        }

        for (field, value) in self.fields.iter().zip(&tuple.values) {
            if field.field_type != value.field_type() {
                return Err(StorageError::MalformedTuple(format!(
                    "field '{}' expects {:?}, got {:?}",
                    field.name,
                    field.field_type,
                    value.field_type()
                )));
            }
        }

        Ok(())
    }
}
