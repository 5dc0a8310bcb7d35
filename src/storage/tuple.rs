use std::collections::HashMap;
use std::sync::RwLock;

use crate::utils::datetime::{format_timestamp, DateTimeValue};

/// A single cell. Every row cell is a `Value`; absent columns read as null.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTimeValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text-format rendering used on the wire and by the CLI. Floats render
    /// the way they compare: `110.0` prints as `110`.
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Timestamp(v) => format_timestamp(v),
        }
    }

    /// Numeric coercion. Numeric strings coerce; everything else does not.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(v) => v.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// A row is a mapping from column name to value. Keys may be unqualified
/// (`id`) or qualified (`users.id`); the join operator adds qualified keys so
/// downstream expressions can disambiguate.
pub type Row = HashMap<String, Value>;

/// A named, ordered sequence of rows. Insertion order is the default
/// iteration order. Readers copy a snapshot; writers hold the lock for the
/// whole mutation.
#[derive(Debug)]
pub struct Relation {
    name: String,
    rows: RwLock<Vec<Row>>,
}

impl Relation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Vec<Row> {
        self.rows.read().expect("relation lock poisoned").clone()
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().expect("relation lock poisoned").len()
    }

    pub fn append_rows(&self, new_rows: Vec<Row>) {
        let mut rows = self.rows.write().expect("relation lock poisoned");
        rows.extend(new_rows);
    }

    pub fn replace_rows(&self, new_rows: Vec<Row>) {
        let mut rows = self.rows.write().expect("relation lock poisoned");
        *rows = new_rows;
    }
}
