//! The schema-less catalog: named relations plus per-column order and
//! inferred type. Tables come into existence on first write; columns are
//! discovered from the rows that mention them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::storage::{Relation, Value};

pub mod types;

pub use types::{infer_type, type_from_sql_name, ColumnType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogError {
    pub message: String,
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CatalogError {}

fn type_mismatch(table: &str, column: &str, expected: ColumnType, actual: ColumnType) -> CatalogError {
    CatalogError {
        message: format!(
            "type mismatch for column {}.{}: expected {}, got {}",
            table, column, expected, actual
        ),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnTypeInfo {
    pub current_type: ColumnType,
    pub is_confirmed: bool,
    pub is_declared: bool,
}

impl Default for ColumnTypeInfo {
    fn default() -> Self {
        Self {
            current_type: ColumnType::Unknown,
            is_confirmed: false,
            is_declared: false,
        }
    }
}

#[derive(Debug, Default)]
struct TableMeta {
    columns_ordered: Vec<String>,
    column_types: HashMap<String, ColumnTypeInfo>,
}

impl TableMeta {
    fn register_column(&mut self, column: &str) {
        if !self.columns_ordered.iter().any(|c| c == column) {
            self.columns_ordered.push(column.to_string());
        }
    }
}

/// Shared across every connection. The catalog map itself is behind one
/// reader/writer lock; each relation carries its own. Relation locks are only
/// taken after the catalog lock is released, and never two at once.
#[derive(Debug, Default)]
pub struct Catalog {
    relations: RwLock<HashMap<String, Arc<Relation>>>,
    meta: RwLock<HashMap<String, TableMeta>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: returns the existing relation or creates an empty one.
    pub fn get_or_create(&self, name: &str) -> Arc<Relation> {
        {
            let relations = self.relations.read().expect("catalog lock poisoned");
            if let Some(rel) = relations.get(name) {
                return Arc::clone(rel);
            }
        }
        let mut relations = self.relations.write().expect("catalog lock poisoned");
        Arc::clone(
            relations
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Relation::new(name))),
        )
    }

    /// Never creates; a missing relation is the caller's empty-result case.
    pub fn get(&self, name: &str) -> Option<Arc<Relation>> {
        let relations = self.relations.read().expect("catalog lock poisoned");
        relations.get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        let relations = self.relations.read().expect("catalog lock poisoned");
        relations.contains_key(name)
    }

    /// Removes the relation and its metadata. Silent when absent.
    pub fn drop_table(&self, name: &str) {
        let mut relations = self.relations.write().expect("catalog lock poisoned");
        let mut meta = self.meta.write().expect("catalog lock poisoned");
        relations.remove(name);
        meta.remove(name);
    }

    pub fn list(&self) -> Vec<String> {
        let relations = self.relations.read().expect("catalog lock poisoned");
        let mut names: Vec<String> = relations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Appends unseen columns in the order given; existing order is kept.
    pub fn register_columns(&self, table: &str, columns: &[String]) {
        let mut meta = self.meta.write().expect("catalog lock poisoned");
        let entry = meta.entry(table.to_string()).or_default();
        for column in columns {
            entry.register_column(column);
        }
    }

    /// Columns in first-seen order. Empty for unknown tables.
    pub fn table_columns(&self, table: &str) -> Vec<String> {
        let meta = self.meta.read().expect("catalog lock poisoned");
        meta.get(table)
            .map(|m| m.columns_ordered.clone())
            .unwrap_or_default()
    }

    pub fn column_type(&self, table: &str, column: &str) -> ColumnType {
        let meta = self.meta.read().expect("catalog lock poisoned");
        meta.get(table)
            .and_then(|m| m.column_types.get(column))
            .map(|info| info.current_type)
            .unwrap_or(ColumnType::Unknown)
    }

    /// Read-only compatibility check used before a write commits. Nulls are
    /// always valid and never touch inference.
    pub fn validate(&self, table: &str, column: &str, value: &Value) -> Result<(), CatalogError> {
        if value.is_null() {
            return Ok(());
        }
        let meta = self.meta.read().expect("catalog lock poisoned");
        if let Some(info) = meta.get(table).and_then(|m| m.column_types.get(column)) {
            if info.is_confirmed {
                let actual = infer_type(value);
                if !info.current_type.accepts(actual) {
                    return Err(type_mismatch(table, column, info.current_type, actual));
                }
            }
        }
        Ok(())
    }

    /// Updates the inferred type from a committed value, registering the
    /// column if it is new. Fails with a type mismatch when the value is
    /// incompatible with the confirmed type.
    pub fn observe_value(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<(), CatalogError> {
        let mut meta = self.meta.write().expect("catalog lock poisoned");
        let entry = meta.entry(table.to_string()).or_default();
        entry.register_column(column);

        if value.is_null() {
            entry.column_types.entry(column.to_string()).or_default();
            return Ok(());
        }

        let info = entry.column_types.entry(column.to_string()).or_default();
        let actual = infer_type(value);
        if !info.current_type.accepts(actual) {
            let expected = info.current_type;
            return Err(type_mismatch(table, column, expected, actual));
        }
        info.current_type = info.current_type.promote(actual);
        info.is_confirmed = true;
        Ok(())
    }

    /// CREATE TABLE declaration: confirms the type up front.
    pub fn declare_type(&self, table: &str, column: &str, column_type: ColumnType) {
        let mut meta = self.meta.write().expect("catalog lock poisoned");
        let entry = meta.entry(table.to_string()).or_default();
        entry.register_column(column);
        entry.column_types.insert(
            column.to_string(),
            ColumnTypeInfo {
                current_type: column_type,
                is_confirmed: true,
                is_declared: true,
            },
        );
    }

}
