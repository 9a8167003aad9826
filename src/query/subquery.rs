//! Range queries and their per-file decomposition
//!
//! A `RangeQuery` asks for every tuple with a key in `key_range`, a timestamp
//! in `timestamp_range` and, optionally, matching a `Predicate`. The catalog
//! splits it into one `SubQuery` per chunk file that may hold matches.

use crate::storage::tuple::{DataSchema, DataTuple, FieldValue};
use crate::storage::types::{KeyRange, TimestampRange};
use serde::{Deserialize, Serialize};

pub type QueryId = u64;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    /// Parse from string
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "=" | "==" => Some(Self::Eq),
            "!=" | "<>" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Gte),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Lte),
            _ => None,
        }
    }

    pub fn compare_f64(&self, a: f64, b: f64) -> bool {
        match self {
            Self::Eq => a == b,
            Self::Ne => a != b,
            Self::Gt => a > b,
            Self::Gte => a >= b,
            Self::Lt => a < b,
            Self::Lte => a <= b,
        }
    }

    /// Lexicographic comparison
    pub fn compare_str(&self, a: &str, b: &str) -> bool {
        match self {
            Self::Eq => a == b,
            Self::Ne => a != b,
            Self::Gt => a > b,
            Self::Gte => a >= b,
            Self::Lt => a < b,
            Self::Lte => a <= b,
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eq => write!(f, "="),
            Self::Ne => write!(f, "!="),
            Self::Gt => write!(f, ">"),
            Self::Gte => write!(f, ">="),
            Self::Lt => write!(f, "<"),
            Self::Lte => write!(f, "<="),
        }
    }
}

/// Right-hand side of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionValue {
    Number(f64),
    Text(String),
}

/// `field op value` against one tuple attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    pub value: ConditionValue,
}

impl Condition {
    /// Missing fields and type mismatches never match
    pub fn matches(&self, schema: &DataSchema, tuple: &DataTuple) -> bool {
        let Some(actual) = schema.get_value(&self.field, tuple) else {
            return false;
        };
        match (&self.value, actual) {
            (ConditionValue::Number(expected), FieldValue::Int(_) | FieldValue::Double(_)) => {
                actual
                    .as_f64()
                    .is_some_and(|v| self.op.compare_f64(v, *expected))
            }
            (ConditionValue::Text(expected), FieldValue::Text(v)) => {
                self.op.compare_str(v, expected)
            }
            _ => false,
        }
    }
}

/// Conjunction of conditions; an empty predicate matches everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub conditions: Vec<Condition>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: add a numeric condition
    pub fn number(mut self, field: impl Into<String>, op: Operator, value: f64) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: ConditionValue::Number(value),
        });
        self
    }

    /// Builder method: add a text condition
    pub fn text(mut self, field: impl Into<String>, op: Operator, value: impl Into<String>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: ConditionValue::Text(value.into()),
        });
        self
    }

    pub fn matches(&self, schema: &DataSchema, tuple: &DataTuple) -> bool {
        self.conditions.iter().all(|c| c.matches(schema, tuple))
    }
}

/// A query over every chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeQuery {
    pub query_id: QueryId,
    pub key_range: KeyRange,
    pub timestamp_range: TimestampRange,
    pub predicate: Option<Predicate>,
}

impl RangeQuery {
    pub fn new(query_id: QueryId, key_range: KeyRange) -> Self {
        Self {
            query_id,
            key_range,
            timestamp_range: TimestampRange::all(),
            predicate: None,
        }
    }

    pub fn with_timestamps(mut self, range: TimestampRange) -> Self {
        self.timestamp_range = range;
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// The sub-query for one chunk file
    pub fn for_file(&self, file_name: impl Into<String>) -> SubQuery {
        SubQuery {
            query_id: self.query_id,
            file_name: file_name.into(),
            key_range: self.key_range,
            timestamp_range: self.timestamp_range,
            predicate: self.predicate.clone(),
        }
    }
}

/// A range query restricted to one chunk file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    pub query_id: QueryId,
    pub file_name: String,
    pub key_range: KeyRange,
    pub timestamp_range: TimestampRange,
    pub predicate: Option<Predicate>,
}

impl SubQuery {
    pub fn new(query_id: QueryId, file_name: impl Into<String>, key_range: KeyRange) -> Self {
        RangeQuery::new(query_id, key_range).for_file(file_name)
    }

    pub fn with_timestamps(mut self, range: TimestampRange) -> Self {
        self.timestamp_range = range;
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Timestamp and predicate filter applied to each decoded tuple
    pub fn accepts(&self, schema: &DataSchema, timestamp: i64, tuple: &DataTuple) -> bool {
        self.timestamp_range.contains(timestamp)
            && self
                .predicate
                .as_ref()
                .map_or(true, |p| p.matches(schema, tuple))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tuple::FieldType;

    fn schema() -> DataSchema {
        DataSchema::new("key", "ts")
            .field("key", FieldType::Double)
            .field("ts", FieldType::Int)
            .field("city", FieldType::Text)
    }

    fn tuple(key: f64, ts: i64, city: &str) -> DataTuple {
        DataTuple::new(vec![
            FieldValue::Double(key),
            FieldValue::Int(ts),
            FieldValue::Text(city.into()),
        ])
    }

    #[test]
    fn test_predicate_conjunction() {
        let schema = schema();
        let p = Predicate::new()
            .number("key", Operator::Gte, 2.0)
            .text("city", Operator::Eq, "oslo");

        assert!(p.matches(&schema, &tuple(2.0, 0, "oslo")));
        assert!(!p.matches(&schema, &tuple(1.0, 0, "oslo")));
        assert!(!p.matches(&schema, &tuple(3.0, 0, "rome")));
        assert!(Predicate::new().matches(&schema, &tuple(0.0, 0, "x")));
    }

    #[test]
    fn test_condition_type_mismatch_never_matches() {
        let schema = schema();
        let t = tuple(1.0, 5, "oslo");
        assert!(!Predicate::new().text("key", Operator::Eq, "1").matches(&schema, &t));
        assert!(!Predicate::new().number("city", Operator::Ne, 0.0).matches(&schema, &t));
        assert!(!Predicate::new().number("missing", Operator::Ne, 0.0).matches(&schema, &t));
        // Int fields compare numerically
        assert!(Predicate::new().number("ts", Operator::Lt, 6.0).matches(&schema, &t));
    }

    #[test]
    fn test_accepts_is_inclusive() {
        let schema = schema();
        let sub = SubQuery::new(1, "c", KeyRange::full()).with_timestamps(TimestampRange::new(10, 20));
        assert!(sub.accepts(&schema, 10, &tuple(0.0, 10, "a")));
        assert!(sub.accepts(&schema, 20, &tuple(0.0, 20, "a")));
        assert!(!sub.accepts(&schema, 21, &tuple(0.0, 21, "a")));
    }

    #[test]
    fn test_operator_symbols() {
        assert_eq!(Operator::from_symbol("<="), Some(Operator::Lte));
        assert_eq!(Operator::from_symbol("<>"), Some(Operator::Ne));
        assert_eq!(Operator::from_symbol("~"), None);
        assert_eq!(Operator::Gte.to_string(), ">=");
    }

    #[test]
    fn test_for_file_copies_query() {
        let q = RangeQuery::new(3, KeyRange::new(1.0, 2.0))
            .with_predicate(Predicate::new().number("key", Operator::Gt, 1.5));
        let sub = q.for_file("chunk-9");
        assert_eq!(sub.query_id, 3);
        assert_eq!(sub.file_name, "chunk-9");
        assert_eq!(sub.predicate, q.predicate);
    }
}
