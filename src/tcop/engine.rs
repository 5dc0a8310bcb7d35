//! Statement dispatch and result shaping between the wire gateway and the
//! executor.

use std::fmt;

use crate::catalog::{Catalog, CatalogError, ColumnType};
use crate::executor::exec_main::execute_statement;
use crate::parser::ast::{Expr, FromItem, ResTarget, SelectStmt, Statement};
use crate::parser::sql_parser::{parse_statement, ParseError};
use crate::storage::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub message: String,
    /// SQLSTATE reported in ErrorResponse frames.
    pub code: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "XX000".to_string(),
        }
    }

    pub fn with_code(message: impl Into<String>, code: &str) -> Self {
        Self {
            message: message.into(),
            code: code.to_string(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<CatalogError> for EngineError {
    fn from(value: CatalogError) -> Self {
        Self::with_code(value.message, "42804")
    }
}

impl From<ParseError> for EngineError {
    fn from(value: ParseError) -> Self {
        Self::with_code(value.to_string(), "42601")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Full CommandComplete tag, e.g. `SELECT 2` or `INSERT 0 1`.
    pub command_tag: String,
    pub rows_affected: u64,
    pub returns_data: bool,
}

impl QueryResult {
    /// The shape unsupported statements produce: no rows, tag `SELECT 0`.
    pub fn empty_select() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: "SELECT 0".to_string(),
            rows_affected: 0,
            returns_data: true,
        }
    }
}

/// Parses and executes the first statement in `sql`.
pub fn execute_sql(sql: &str, catalog: &Catalog) -> Result<QueryResult, EngineError> {
    let statement = parse_statement(sql)?;
    execute_statement(&statement, catalog)
}

/// Result-column metadata for RowDescription frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub type_oid: u32,
    pub type_size: i16,
}

impl ColumnDescription {
    fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_oid: ColumnType::String.type_oid(),
            type_size: ColumnType::String.type_size(),
        }
    }

    fn typed(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            type_oid: column_type.type_oid(),
            type_size: column_type.type_size(),
        }
    }
}

/// Derives the result shape of a statement for Describe. `None` means the
/// statement produces no row data.
pub fn describe_statement(
    statement: &Statement,
    catalog: &Catalog,
) -> Option<Vec<ColumnDescription>> {
    match statement {
        Statement::Select(select) => Some(describe_select(select, catalog)),
        Statement::Execute(_) => Some(vec![ColumnDescription::text("result")]),
        _ => None,
    }
}

fn describe_select(stmt: &SelectStmt, catalog: &Catalog) -> Vec<ColumnDescription> {
    if let Some(set_op) = &stmt.set_op {
        return describe_select(&set_op.left, catalog);
    }

    // alias -> relation name, in FROM order.
    let mut tables: Vec<(String, String)> = Vec::new();
    for item in &stmt.from {
        collect_from_tables(item, &mut tables);
    }

    let mut out = Vec::new();
    for target in &stmt.targets {
        describe_target(target, &tables, catalog, &mut out);
    }
    out
}

fn collect_from_tables(item: &FromItem, tables: &mut Vec<(String, String)>) {
    match item {
        FromItem::Table { name, alias } => {
            let alias_name = alias.clone().unwrap_or_else(|| name.clone());
            tables.push((alias_name, name.clone()));
        }
        FromItem::Subquery { alias, .. } => {
            if let Some(alias) = alias {
                tables.push((alias.clone(), alias.clone()));
            }
        }
        FromItem::Join(join) => {
            collect_from_tables(&join.left, tables);
            collect_from_tables(&join.right, tables);
        }
    }
}

fn describe_target(
    target: &ResTarget,
    tables: &[(String, String)],
    catalog: &Catalog,
    out: &mut Vec<ColumnDescription>,
) {
    match &target.val {
        Expr::Star => {
            let mut seen = std::collections::HashSet::new();
            for (_, real) in tables {
                for column in catalog.table_columns(real) {
                    if seen.insert(column.clone()) {
                        let column_type = catalog.column_type(real, &column);
                        out.push(ColumnDescription::typed(column, column_type));
                    }
                }
            }
            if seen.is_empty() {
                // Schema-less fallback: take sorted keys from the first row.
                if let Some((_, real)) = tables.first() {
                    if let Some(relation) = catalog.get(real) {
                        if let Some(first) = relation.snapshot().first() {
                            let mut keys: Vec<String> = first.keys().cloned().collect();
                            keys.sort();
                            for key in keys {
                                out.push(ColumnDescription::text(key));
                            }
                        }
                    }
                }
            }
        }
        Expr::QualifiedStar { table } => {
            let real = tables
                .iter()
                .find(|(alias, _)| alias == table)
                .map(|(_, real)| real.clone());
            if let Some(real) = real {
                for column in catalog.table_columns(&real) {
                    let column_type = catalog.column_type(&real, &column);
                    out.push(ColumnDescription::typed(column, column_type));
                }
            }
        }
        Expr::ColumnRef { fields } => {
            let name = target.name.clone().unwrap_or_else(|| fields.join("."));
            let column = fields.last().cloned().unwrap_or_default();
            let real = if fields.len() >= 2 {
                tables
                    .iter()
                    .find(|(alias, _)| *alias == fields[0])
                    .map(|(_, real)| real.clone())
            } else {
                tables.first().map(|(_, real)| real.clone())
            };
            let column_type = real
                .map(|real| catalog.column_type(&real, &column))
                .unwrap_or(ColumnType::Unknown);
            out.push(ColumnDescription::typed(name, column_type));
        }
        Expr::FuncCall { name, .. } => {
            let label = target.name.clone().unwrap_or_else(|| name.clone());
            out.push(ColumnDescription::text(label));
        }
        Expr::CoalesceExpr { .. } => {
            let label = target.name.clone().unwrap_or_else(|| "coalesce".to_string());
            out.push(ColumnDescription::text(label));
        }
        other => {
            let label = target.name.clone().unwrap_or_else(|| match other {
                Expr::CaseExpr { .. } => "case".to_string(),
                _ => "?column?".to_string(),
            });
            out.push(ColumnDescription::text(label));
        }
    }
}

/// Highest `$N` placeholder mentioned in the query text.
pub fn count_parameters(query: &str) -> usize {
    let bytes = query.as_bytes();
    let mut max_param = 0usize;
    let mut idx = 0usize;
    while idx < bytes.len() {
        if bytes[idx] == b'$' {
            let mut end = idx + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > idx + 1 {
                if let Ok(n) = query[idx + 1..end].parse::<usize>() {
                    max_param = max_param.max(n);
                }
            }
            idx = end;
        } else {
            idx += 1;
        }
    }
    max_param
}

/// Parameter-type inference when the client supplied no OIDs: everything
/// defaults to unknown, except that `OFFSET $N` queries bind as int8.
pub fn infer_parameter_types(query: &str) -> Vec<u32> {
    let count = count_parameters(query);
    if count == 0 {
        return Vec::new();
    }
    let upper = query.to_ascii_uppercase();
    let oid = if upper.contains("OFFSET") && query.contains('$') {
        20
    } else {
        0
    };
    vec![oid; count]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Value;

    #[test]
    fn execute_sql_runs_a_full_statement() {
        let catalog = Catalog::new();
        execute_sql("CREATE TABLE t (id int, name text)", &catalog).expect("create");
        let result =
            execute_sql("INSERT INTO t VALUES (1, 'a'), (2, 'b')", &catalog).expect("insert");
        assert_eq!(result.command_tag, "INSERT 0 2");

        let result = execute_sql("SELECT name FROM t WHERE id = 2", &catalog).expect("select");
        assert_eq!(result.columns, vec!["name"]);
        assert_eq!(result.rows, vec![vec![Value::Text("b".into())]]);
        assert_eq!(result.command_tag, "SELECT 1");
    }

    #[test]
    fn unsupported_statements_return_empty_select() {
        let catalog = Catalog::new();
        let result = execute_sql("BEGIN", &catalog).expect("unsupported is not an error");
        assert_eq!(result.command_tag, "SELECT 0");
        assert!(result.rows.is_empty());
    }

    #[test]
    fn parse_errors_carry_syntax_sqlstate() {
        let catalog = Catalog::new();
        let err = execute_sql("SELECT FROM WHERE", &catalog).expect_err("bad syntax");
        assert_eq!(err.code, "42601");
    }

    #[test]
    fn describe_derives_types_from_the_catalog() {
        let catalog = Catalog::new();
        execute_sql("CREATE TABLE t (id int, name text)", &catalog).expect("create");

        let statement = parse_statement("SELECT id, name, count(*) FROM t").expect("parse");
        let fields = describe_statement(&statement, &catalog).expect("select returns data");
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].type_oid, 23);
        assert_eq!(fields[1].type_oid, 25);
        assert_eq!(fields[2].name, "count");

        let statement = parse_statement("INSERT INTO t VALUES (1, 'x')").expect("parse");
        assert!(describe_statement(&statement, &catalog).is_none());
    }

    #[test]
    fn parameter_counting_and_offset_heuristic() {
        assert_eq!(count_parameters("SELECT * FROM t WHERE a = $1 AND b = $2"), 2);
        assert_eq!(count_parameters("SELECT 1"), 0);
        assert_eq!(count_parameters("SELECT '$9'"), 9); // textual scan, matching the source
        assert_eq!(
            infer_parameter_types("SELECT * FROM t LIMIT 5 OFFSET $1"),
            vec![20]
        );
        assert_eq!(infer_parameter_types("SELECT * FROM t WHERE a = $1"), vec![0]);
    }
}
