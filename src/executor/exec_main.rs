//! Statement execution over the catalog.
//!
//! SELECT runs the fixed pipeline FROM → WHERE → GROUP BY → aggregates →
//! projection → DISTINCT → HAVING → ORDER BY → LIMIT/OFFSET. Joins are
//! nested-loop with alias-aware row merging. Writes validate every cell
//! before anything is committed, so a failed statement leaves the relation
//! untouched.

use std::collections::{HashMap, HashSet};

use crate::catalog::{type_from_sql_name, Catalog};
use crate::executor::exec_expr::{
    canonical_key, compare_for_sort, eval_expr, eval_join_predicate, eval_predicate,
    is_aggregate_function,
};
use crate::parser::ast::{
    CreateStmt, DeleteStmt, DropStmt, Expr, FromItem, InsertStmt, JoinExpr, JoinType, ResTarget,
    SelectStmt, SetOpKind, SortBy, SortDirection, SortNulls, Statement, UpdateStmt,
};
use crate::storage::{Row, Value};
use crate::tcop::engine::{EngineError, QueryResult};

pub use crate::executor::exec_expr::{EvalCtx, JoinScope, Truth};

static NULL_VALUE: Value = Value::Null;

/// Outer context handed to nested SELECTs: the enclosing rows, most recent
/// scope first.
#[derive(Debug, Default, Clone)]
pub struct OuterEnv {
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

pub fn execute_statement(stmt: &Statement, catalog: &Catalog) -> Result<QueryResult, EngineError> {
    match stmt {
        Statement::Select(select) => {
            let output = execute_select(select, catalog, &OuterEnv::default())?;
            let count = output.rows.len() as u64;
            Ok(QueryResult {
                columns: output.columns,
                rows: output.rows,
                command_tag: format!("SELECT {}", count),
                rows_affected: count,
                returns_data: true,
            })
        }
        Statement::Insert(insert) => exec_insert(insert, catalog),
        Statement::Update(update) => exec_update(update, catalog),
        Statement::Delete(delete) => exec_delete(delete, catalog),
        Statement::CreateTable(create) => exec_create_table(create, catalog),
        Statement::DropTable(drop) => exec_drop_table(drop, catalog),
        Statement::Prepare(_) | Statement::Execute(_) | Statement::Deallocate(_) => {
            Err(EngineError::new(
                "prepared statements are managed by the client session",
            ))
        }
        Statement::Unsupported { keyword } => {
            tracing::warn!(statement = %keyword, "unsupported SQL statement, returning empty result");
            Ok(QueryResult::empty_select())
        }
    }
}

// ---- SELECT ----

pub fn execute_select(
    stmt: &SelectStmt,
    catalog: &Catalog,
    env: &OuterEnv,
) -> Result<SelectOutput, EngineError> {
    if let Some(set_op) = &stmt.set_op {
        let left = execute_select(&set_op.left, catalog, env)?;
        let right = execute_select(&set_op.right, catalog, env)?;
        if left.columns.len() != right.columns.len() {
            return Err(EngineError::with_code(
                "each UNION query must have the same number of columns",
                "42601",
            ));
        }

        let mut rows = Vec::new();
        match set_op.op {
            SetOpKind::Union => {
                if set_op.all {
                    rows.extend(left.rows);
                    rows.extend(right.rows);
                } else {
                    let mut seen = HashSet::new();
                    for row in left.rows.into_iter().chain(right.rows) {
                        if seen.insert(canonical_key(&row)) {
                            rows.push(row);
                        }
                    }
                }
            }
            SetOpKind::Intersect => {
                let left_keys: HashSet<String> =
                    left.rows.iter().map(|row| canonical_key(row)).collect();
                let mut seen = HashSet::new();
                for row in right.rows {
                    let key = canonical_key(&row);
                    if left_keys.contains(&key) && seen.insert(key) {
                        rows.push(row);
                    }
                }
            }
            SetOpKind::Except => {
                let right_keys: HashSet<String> =
                    right.rows.iter().map(|row| canonical_key(row)).collect();
                let mut seen = HashSet::new();
                for row in left.rows {
                    let key = canonical_key(&row);
                    if !right_keys.contains(&key) && seen.insert(key) {
                        rows.push(row);
                    }
                }
            }
        }

        let rows = apply_order_limit(stmt, &left.columns, rows, catalog, env)?;
        return Ok(SelectOutput {
            columns: left.columns,
            rows,
        });
    }

    // FROM: aliases are recorded in appearance order for SELECT * expansion
    // and outer-join null padding.
    let mut tables: Vec<(String, String)> = Vec::new();
    let from_rows = process_from_items(&stmt.from, catalog, env, &mut tables)?;
    let ectx = EvalCtx {
        catalog,
        outer_rows: &env.rows,
        group: None,
    };

    // WHERE keeps only True; Unknown drops the row.
    let mut rows = from_rows;
    if let Some(where_clause) = &stmt.where_clause {
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if eval_predicate(where_clause, &row, ectx)? == Truth::True {
                kept.push(row);
            }
        }
        rows = kept;
    }

    let has_aggregates = stmt.targets.iter().any(|t| contains_aggregate(&t.val));
    let grouping: Option<Vec<Vec<Row>>> = if !stmt.group_by.is_empty() {
        Some(group_rows(&rows, &stmt.group_by, ectx)?)
    } else if has_aggregates {
        // Aggregates without GROUP BY form one group, even when empty, so
        // COUNT over a missing table still yields a row with 0.
        Some(vec![rows.clone()])
    } else {
        None
    };

    let projection = build_projection(&stmt.targets, &tables, &rows, &grouping, catalog);
    let columns: Vec<String> = projection.iter().map(ProjItem::name).collect();

    let mut result_rows: Vec<Vec<Value>> = Vec::new();
    match &grouping {
        Some(groups) => {
            for group in groups {
                let sample = group.first().cloned().unwrap_or_default();
                let gctx = EvalCtx {
                    catalog,
                    outer_rows: &env.rows,
                    group: Some(group.as_slice()),
                };
                let mut values = Vec::with_capacity(projection.len());
                for item in &projection {
                    values.push(item.eval(&sample, gctx)?);
                }
                result_rows.push(values);
            }
        }
        None => {
            for row in &rows {
                let mut values = Vec::with_capacity(projection.len());
                for item in &projection {
                    values.push(item.eval(row, ectx)?);
                }
                result_rows.push(values);
            }
        }
    }

    if stmt.distinct {
        let mut seen = HashSet::new();
        result_rows.retain(|row| seen.insert(canonical_key(row)));
    }

    if let (Some(having), Some(groups)) = (&stmt.having, &grouping) {
        let mut filtered = Vec::with_capacity(result_rows.len());
        for (idx, values) in result_rows.iter().enumerate() {
            let group: &[Row] = groups.get(idx).map(Vec::as_slice).unwrap_or(&[]);
            let synthetic: Row = columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect();
            let hctx = EvalCtx {
                catalog,
                outer_rows: &env.rows,
                group: Some(group),
            };
            if eval_predicate(having, &synthetic, hctx)? == Truth::True {
                filtered.push(values.clone());
            }
        }
        result_rows = filtered;
    }

    let result_rows = apply_order_limit(stmt, &columns, result_rows, catalog, env)?;
    Ok(SelectOutput {
        columns,
        rows: result_rows,
    })
}

// ---- FROM ----

fn process_from_items(
    items: &[FromItem],
    catalog: &Catalog,
    env: &OuterEnv,
    tables: &mut Vec<(String, String)>,
) -> Result<Vec<Row>, EngineError> {
    if items.is_empty() {
        // SELECT without FROM evaluates over a single empty row.
        return Ok(vec![Row::new()]);
    }

    let mut result: Option<Vec<Row>> = None;
    for item in items {
        let (rows, alias) = process_from_item(item, catalog, env, tables)?;
        result = Some(match result {
            None => rows,
            Some(acc) => {
                // Comma-separated FROM items form a left-deep cross join.
                let mut crossed = Vec::with_capacity(acc.len() * rows.len().max(1));
                for left in &acc {
                    for right in &rows {
                        crossed.push(merge_rows_with_aliases(left, right, None, alias.as_deref()));
                    }
                }
                crossed
            }
        });
    }
    Ok(result.unwrap_or_default())
}

fn process_from_item(
    item: &FromItem,
    catalog: &Catalog,
    env: &OuterEnv,
    tables: &mut Vec<(String, String)>,
) -> Result<(Vec<Row>, Option<String>), EngineError> {
    match item {
        FromItem::Table { name, alias } => {
            let alias_name = alias.clone().unwrap_or_else(|| name.clone());
            tables.push((alias_name.clone(), name.clone()));

            // A missing relation scans as empty; schema-less reads never fail.
            let base_rows = match catalog.get(name) {
                Some(relation) => relation.snapshot(),
                None => Vec::new(),
            };

            let mut rows = Vec::with_capacity(base_rows.len());
            for base in base_rows {
                let mut row = Row::with_capacity(base.len() * 2);
                for (key, value) in base {
                    row.insert(format!("{}.{}", alias_name, key), value.clone());
                    row.insert(key, value);
                }
                rows.push(row);
            }
            Ok((rows, Some(alias_name)))
        }
        FromItem::Subquery { query, alias } => {
            let output = execute_select(query, catalog, env)?;
            let mut rows = Vec::with_capacity(output.rows.len());
            for values in output.rows {
                let mut row = Row::new();
                for (column, value) in output.columns.iter().zip(values) {
                    // Derived-table cells are reachable both by the output
                    // name and by its bare column part.
                    let bare = column.rsplit('.').next().unwrap_or(column);
                    if bare != column {
                        row.insert(bare.to_string(), value.clone());
                    }
                    if let Some(alias) = alias {
                        row.insert(format!("{}.{}", alias, bare), value.clone());
                    }
                    row.insert(column.clone(), value);
                }
                rows.push(row);
            }
            if let Some(alias) = alias {
                tables.push((alias.clone(), alias.clone()));
            }
            Ok((rows, alias.clone()))
        }
        FromItem::Join(join) => {
            let rows = process_join(join, catalog, env, tables)?;
            Ok((rows, None))
        }
    }
}

fn process_join(
    join: &JoinExpr,
    catalog: &Catalog,
    env: &OuterEnv,
    tables: &mut Vec<(String, String)>,
) -> Result<Vec<Row>, EngineError> {
    let (left_rows, left_alias) = process_from_item(&join.left, catalog, env, tables)?;
    let (right_rows, right_alias) = process_from_item(&join.right, catalog, env, tables)?;
    let scope = JoinScope {
        left_alias: left_alias.clone(),
        right_alias: right_alias.clone(),
    };
    let ectx = EvalCtx {
        catalog,
        outer_rows: &env.rows,
        group: None,
    };

    let matches = |left: &Row, right: &Row| -> Result<bool, EngineError> {
        match &join.on {
            None => Ok(true),
            Some(on) => Ok(eval_join_predicate(on, left, right, &scope, ectx)? == Truth::True),
        }
    };

    let mut result = Vec::new();
    match join.kind {
        JoinType::Inner => {
            for left in &left_rows {
                for right in &right_rows {
                    if matches(left, right)? {
                        result.push(merge_rows_with_aliases(
                            left,
                            right,
                            left_alias.as_deref(),
                            right_alias.as_deref(),
                        ));
                    }
                }
            }
        }
        JoinType::Left => {
            let pad = null_pad_row(&right_rows, right_alias.as_deref(), tables, catalog);
            for left in &left_rows {
                let mut matched = false;
                for right in &right_rows {
                    if matches(left, right)? {
                        result.push(merge_rows_with_aliases(
                            left,
                            right,
                            left_alias.as_deref(),
                            right_alias.as_deref(),
                        ));
                        matched = true;
                    }
                }
                if !matched {
                    result.push(merge_rows_with_aliases(
                        left,
                        &pad,
                        left_alias.as_deref(),
                        right_alias.as_deref(),
                    ));
                }
            }
        }
        JoinType::Right => {
            let pad = null_pad_row(&left_rows, left_alias.as_deref(), tables, catalog);
            for right in &right_rows {
                let mut matched = false;
                for left in &left_rows {
                    if matches(left, right)? {
                        result.push(merge_rows_with_aliases(
                            left,
                            right,
                            left_alias.as_deref(),
                            right_alias.as_deref(),
                        ));
                        matched = true;
                    }
                }
                if !matched {
                    result.push(merge_rows_with_aliases(
                        &pad,
                        right,
                        left_alias.as_deref(),
                        right_alias.as_deref(),
                    ));
                }
            }
        }
        JoinType::Full => {
            let right_pad = null_pad_row(&right_rows, right_alias.as_deref(), tables, catalog);
            let left_pad = null_pad_row(&left_rows, left_alias.as_deref(), tables, catalog);
            let mut right_matched = vec![false; right_rows.len()];
            for left in &left_rows {
                let mut matched = false;
                for (ridx, right) in right_rows.iter().enumerate() {
                    if matches(left, right)? {
                        result.push(merge_rows_with_aliases(
                            left,
                            right,
                            left_alias.as_deref(),
                            right_alias.as_deref(),
                        ));
                        matched = true;
                        right_matched[ridx] = true;
                    }
                }
                if !matched {
                    result.push(merge_rows_with_aliases(
                        left,
                        &right_pad,
                        left_alias.as_deref(),
                        right_alias.as_deref(),
                    ));
                }
            }
            for (ridx, right) in right_rows.iter().enumerate() {
                if !right_matched[ridx] {
                    result.push(merge_rows_with_aliases(
                        &left_pad,
                        right,
                        left_alias.as_deref(),
                        right_alias.as_deref(),
                    ));
                }
            }
        }
        JoinType::Cross => {
            for left in &left_rows {
                for right in &right_rows {
                    result.push(merge_rows_with_aliases(
                        left,
                        right,
                        left_alias.as_deref(),
                        right_alias.as_deref(),
                    ));
                }
            }
        }
    }
    Ok(result)
}

/// All-null row shaped like the given side, used to pad outer joins. Column
/// names come from the catalog when the side is a base table, otherwise from
/// the first row seen.
fn null_pad_row(
    rows: &[Row],
    alias: Option<&str>,
    tables: &[(String, String)],
    catalog: &Catalog,
) -> Row {
    if let Some(alias) = alias {
        if let Some((_, real)) = tables.iter().find(|(a, _)| a == alias) {
            let columns = catalog.table_columns(real);
            if !columns.is_empty() {
                return columns
                    .into_iter()
                    .map(|column| (column, Value::Null))
                    .collect();
            }
        }
    }
    match rows.first() {
        Some(first) => first.keys().map(|key| (key.clone(), Value::Null)).collect(),
        None => Row::new(),
    }
}

/// Merged join row: both qualified and unqualified keys are present. On an
/// unqualified name conflict the left side wins; the qualified forms keep
/// both sides addressable.
fn merge_rows_with_aliases(
    left: &Row,
    right: &Row,
    left_alias: Option<&str>,
    right_alias: Option<&str>,
) -> Row {
    let mut merged = Row::with_capacity(left.len() + right.len());
    for (key, value) in left {
        if key.contains('.') {
            merged.insert(key.clone(), value.clone());
            continue;
        }
        merged.insert(key.clone(), value.clone());
        if let Some(alias) = left_alias {
            merged.insert(format!("{}.{}", alias, key), value.clone());
        }
    }
    for (key, value) in right {
        if key.contains('.') {
            merged.insert(key.clone(), value.clone());
            continue;
        }
        if !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
        if let Some(alias) = right_alias {
            merged.insert(format!("{}.{}", alias, key), value.clone());
        }
    }
    merged
}

// ---- grouping ----

fn group_rows(
    rows: &[Row],
    group_by: &[Expr],
    ectx: EvalCtx<'_>,
) -> Result<Vec<Vec<Row>>, EngineError> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<Row>> = HashMap::new();
    for row in rows {
        let mut key_values = Vec::with_capacity(group_by.len());
        for expr in group_by {
            key_values.push(eval_expr(expr, row, ectx)?);
        }
        let key = canonical_key(&key_values);
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push(row.clone());
    }
    Ok(order
        .into_iter()
        .map(|key| buckets.remove(&key).unwrap_or_default())
        .collect())
}

fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::FuncCall { name, args, .. } => {
            is_aggregate_function(name) || args.iter().any(contains_aggregate)
        }
        Expr::AExpr {
            lexpr,
            rexpr,
            rlist,
            ..
        } => {
            lexpr.as_deref().is_some_and(contains_aggregate)
                || rexpr.as_deref().is_some_and(contains_aggregate)
                || rlist.iter().any(contains_aggregate)
        }
        Expr::BoolExpr { args, .. } => args.iter().any(contains_aggregate),
        Expr::NullTest { arg, .. } => contains_aggregate(arg),
        Expr::CoalesceExpr { args } => args.iter().any(contains_aggregate),
        Expr::CaseExpr {
            operand,
            whens,
            else_expr,
        } => {
            operand.as_deref().is_some_and(contains_aggregate)
                || whens
                    .iter()
                    .any(|(w, t)| contains_aggregate(w) || contains_aggregate(t))
                || else_expr.as_deref().is_some_and(contains_aggregate)
        }
        Expr::Cast { expr, .. } => contains_aggregate(expr),
        // Aggregates inside a subquery belong to that subquery.
        _ => false,
    }
}

// ---- projection ----

enum ProjItem {
    /// A star-expanded column read straight off the row.
    Direct { name: String, keys: Vec<String> },
    Computed { name: String, expr: Expr },
}

impl ProjItem {
    fn name(&self) -> String {
        match self {
            Self::Direct { name, .. } => name.clone(),
            Self::Computed { name, .. } => name.clone(),
        }
    }

    fn eval(&self, row: &Row, ctx: EvalCtx<'_>) -> Result<Value, EngineError> {
        match self {
            Self::Direct { keys, .. } => Ok(keys
                .iter()
                .find_map(|key| row.get(key))
                .cloned()
                .unwrap_or(Value::Null)),
            Self::Computed { expr, .. } => eval_expr(expr, row, ctx),
        }
    }
}

fn build_projection(
    targets: &[ResTarget],
    tables: &[(String, String)],
    rows: &[Row],
    grouping: &Option<Vec<Vec<Row>>>,
    catalog: &Catalog,
) -> Vec<ProjItem> {
    let mut items = Vec::new();
    for target in targets {
        match &target.val {
            Expr::Star => expand_star(tables, rows, grouping, catalog, &mut items),
            Expr::QualifiedStar { table } => {
                expand_qualified_star(table, tables, rows, catalog, &mut items);
            }
            expr => {
                let name = target
                    .name
                    .clone()
                    .unwrap_or_else(|| derive_target_name(expr));
                items.push(ProjItem::Computed {
                    name,
                    expr: expr.clone(),
                });
            }
        }
    }
    items
}

/// `SELECT *`: catalog columns of every FROM relation in declaration order,
/// then any additional unqualified keys discovered at runtime in sorted
/// order.
fn expand_star(
    tables: &[(String, String)],
    rows: &[Row],
    grouping: &Option<Vec<Vec<Row>>>,
    catalog: &Catalog,
    items: &mut Vec<ProjItem>,
) {
    let mut seen: HashSet<String> = HashSet::new();
    for (_, real) in tables {
        for column in catalog.table_columns(real) {
            if seen.insert(column.clone()) {
                items.push(ProjItem::Direct {
                    name: column.clone(),
                    keys: vec![column],
                });
            }
        }
    }

    let mut extras: Vec<String> = Vec::new();
    let mut collect = |row: &Row| {
        for key in row.keys() {
            if !key.contains('.') && !seen.contains(key) && !extras.iter().any(|e| e == key) {
                extras.push(key.clone());
            }
        }
    };
    match grouping {
        Some(groups) => {
            for group in groups {
                for row in group {
                    collect(row);
                }
            }
        }
        None => {
            for row in rows {
                collect(row);
            }
        }
    }
    extras.sort();
    for column in extras {
        items.push(ProjItem::Direct {
            name: column.clone(),
            keys: vec![column],
        });
    }
}

fn expand_qualified_star(
    table: &str,
    tables: &[(String, String)],
    rows: &[Row],
    catalog: &Catalog,
    items: &mut Vec<ProjItem>,
) {
    let real = tables
        .iter()
        .find(|(alias, _)| alias == table)
        .map(|(_, real)| real.clone());
    let columns = real
        .map(|real| catalog.table_columns(&real))
        .unwrap_or_default();
    if !columns.is_empty() {
        for column in columns {
            items.push(ProjItem::Direct {
                name: column.clone(),
                keys: vec![format!("{}.{}", table, column), column],
            });
        }
        return;
    }
    // No catalog entry (a derived table): fall back to the alias-qualified
    // keys the rows actually carry.
    let prefix = format!("{}.", table);
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if let Some(bare) = key.strip_prefix(&prefix) {
                if !bare.contains('.') && !columns.iter().any(|c| c == bare) {
                    columns.push(bare.to_string());
                }
            }
        }
    }
    columns.sort();
    for column in columns {
        items.push(ProjItem::Direct {
            name: column.clone(),
            keys: vec![format!("{}.{}", table, column), column],
        });
    }
}

/// Output column naming: explicit alias, else the dotted column name, else
/// the lowercased function name, else `?column?`.
fn derive_target_name(expr: &Expr) -> String {
    match expr {
        Expr::ColumnRef { fields } => fields.join("."),
        Expr::FuncCall { name, .. } => name.clone(),
        Expr::CoalesceExpr { .. } => "coalesce".to_string(),
        Expr::CaseExpr { .. } => "case".to_string(),
        Expr::Cast { expr, .. } => derive_target_name(expr),
        _ => "?column?".to_string(),
    }
}

// ---- ORDER BY / LIMIT / OFFSET ----

fn apply_order_limit(
    stmt: &SelectStmt,
    columns: &[String],
    mut rows: Vec<Vec<Value>>,
    catalog: &Catalog,
    env: &OuterEnv,
) -> Result<Vec<Vec<Value>>, EngineError> {
    if !stmt.order_by.is_empty() {
        let keys: Vec<(usize, bool, bool)> = stmt
            .order_by
            .iter()
            .filter_map(|sort| {
                let idx = sort_key_index(sort, columns)?;
                let ascending = sort.direction != SortDirection::Desc;
                let nulls_first = match sort.nulls {
                    SortNulls::First => true,
                    SortNulls::Last => false,
                    SortNulls::Default => !ascending,
                };
                Some((idx, ascending, nulls_first))
            })
            .collect();

        rows.sort_by(|a, b| {
            for &(idx, ascending, nulls_first) in &keys {
                let left = a.get(idx).unwrap_or(&NULL_VALUE);
                let right = b.get(idx).unwrap_or(&NULL_VALUE);
                let ordering = match (left.is_null(), right.is_null()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => {
                        if nulls_first {
                            std::cmp::Ordering::Less
                        } else {
                            std::cmp::Ordering::Greater
                        }
                    }
                    (false, true) => {
                        if nulls_first {
                            std::cmp::Ordering::Greater
                        } else {
                            std::cmp::Ordering::Less
                        }
                    }
                    (false, false) => {
                        let ordering = compare_for_sort(left, right);
                        if ascending {
                            ordering
                        } else {
                            ordering.reverse()
                        }
                    }
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    let ectx = EvalCtx {
        catalog,
        outer_rows: &env.rows,
        group: None,
    };
    let empty = Row::new();
    let offset = match &stmt.offset {
        Some(expr) => eval_usize(expr, &empty, ectx)?.unwrap_or(0),
        None => 0,
    };
    let limit = match &stmt.limit {
        Some(expr) => eval_usize(expr, &empty, ectx)?,
        None => None,
    };

    if offset >= rows.len() {
        return Ok(Vec::new());
    }
    let rows = rows.split_off(offset);
    let rows = match limit {
        Some(limit) if limit < rows.len() => rows.into_iter().take(limit).collect(),
        _ => rows,
    };
    Ok(rows)
}

fn eval_usize(expr: &Expr, row: &Row, ctx: EvalCtx<'_>) -> Result<Option<usize>, EngineError> {
    let value = eval_expr(expr, row, ctx)?;
    Ok(value.as_f64().filter(|v| *v >= 0.0).map(|v| v as usize))
}

/// Sort keys may name a projection column (plain, qualified, or an
/// aggregate's lowercased name) or give a 1-based ordinal.
fn sort_key_index(sort: &SortBy, columns: &[String]) -> Option<usize> {
    match &sort.expr {
        Expr::AConst(Value::Int(n)) => {
            let idx = *n - 1;
            if idx >= 0 && (idx as usize) < columns.len() {
                Some(idx as usize)
            } else {
                None
            }
        }
        Expr::ColumnRef { fields } => {
            let dotted = fields.join(".");
            if let Some(idx) = columns.iter().position(|c| *c == dotted) {
                return Some(idx);
            }
            let last = fields.last()?;
            columns.iter().position(|c| c == last)
        }
        Expr::FuncCall { name, .. } => columns.iter().position(|c| c == name),
        _ => None,
    }
}

// ---- DML / DDL ----

fn exec_insert(stmt: &InsertStmt, catalog: &Catalog) -> Result<QueryResult, EngineError> {
    let relation = catalog.get_or_create(&stmt.table);
    let columns = if stmt.columns.is_empty() {
        catalog.table_columns(&stmt.table)
    } else {
        stmt.columns.clone()
    };

    let ectx = EvalCtx::new(catalog);
    let empty = Row::new();
    let mut new_rows = Vec::with_capacity(stmt.values.len());
    let mut observations: Vec<(String, Value)> = Vec::new();
    for tuple in &stmt.values {
        let mut row = Row::new();
        for (idx, expr) in tuple.iter().enumerate() {
            // Values beyond the column list are discarded.
            let Some(column) = columns.get(idx) else {
                continue;
            };
            let value = eval_expr(expr, &empty, ectx)?;
            catalog
                .validate(&stmt.table, column, &value)
                .map_err(EngineError::from)?;
            observations.push((column.clone(), value.clone()));
            row.insert(column.clone(), value);
        }
        new_rows.push(row);
    }
    check_statement_types(catalog, &stmt.table, &observations)?;

    let inserted = new_rows.len() as u64;
    relation.append_rows(new_rows);
    commit_observations(catalog, &stmt.table, &observations)?;

    Ok(QueryResult {
        columns: Vec::new(),
        rows: Vec::new(),
        command_tag: format!("INSERT 0 {}", inserted),
        rows_affected: inserted,
        returns_data: false,
    })
}

fn exec_update(stmt: &UpdateStmt, catalog: &Catalog) -> Result<QueryResult, EngineError> {
    let Some(relation) = catalog.get(&stmt.table) else {
        // Schema-less forgiveness: updating a missing table touches nothing.
        return Ok(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: "UPDATE 0".to_string(),
            rows_affected: 0,
            returns_data: false,
        });
    };

    let ectx = EvalCtx::new(catalog);
    let rows = relation.snapshot();
    let mut new_rows = Vec::with_capacity(rows.len());
    let mut observations: Vec<(String, Value)> = Vec::new();
    let mut updated = 0u64;
    for mut row in rows {
        let hit = match &stmt.where_clause {
            Some(where_clause) => eval_predicate(where_clause, &row, ectx)? == Truth::True,
            None => true,
        };
        if hit {
            for (column, expr) in &stmt.assignments {
                let value = eval_expr(expr, &row, ectx)?;
                catalog
                    .validate(&stmt.table, column, &value)
                    .map_err(EngineError::from)?;
                observations.push((column.clone(), value.clone()));
                row.insert(column.clone(), value);
            }
            updated += 1;
        }
        new_rows.push(row);
    }
    check_statement_types(catalog, &stmt.table, &observations)?;

    relation.replace_rows(new_rows);
    commit_observations(catalog, &stmt.table, &observations)?;

    Ok(QueryResult {
        columns: Vec::new(),
        rows: Vec::new(),
        command_tag: format!("UPDATE {}", updated),
        rows_affected: updated,
        returns_data: false,
    })
}

fn exec_delete(stmt: &DeleteStmt, catalog: &Catalog) -> Result<QueryResult, EngineError> {
    let Some(relation) = catalog.get(&stmt.table) else {
        return Ok(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: "DELETE 0".to_string(),
            rows_affected: 0,
            returns_data: false,
        });
    };

    let ectx = EvalCtx::new(catalog);
    let rows = relation.snapshot();
    let mut kept = Vec::with_capacity(rows.len());
    let mut deleted = 0u64;
    for row in rows {
        let hit = match &stmt.where_clause {
            Some(where_clause) => eval_predicate(where_clause, &row, ectx)? == Truth::True,
            None => true,
        };
        if hit {
            deleted += 1;
        } else {
            kept.push(row);
        }
    }
    relation.replace_rows(kept);

    Ok(QueryResult {
        columns: Vec::new(),
        rows: Vec::new(),
        command_tag: format!("DELETE {}", deleted),
        rows_affected: deleted,
        returns_data: false,
    })
}

fn exec_create_table(stmt: &CreateStmt, catalog: &Catalog) -> Result<QueryResult, EngineError> {
    if catalog.exists(&stmt.table) {
        if stmt.if_not_exists {
            return Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                command_tag: "CREATE TABLE".to_string(),
                rows_affected: 0,
                returns_data: false,
            });
        }
        return Err(EngineError::new(format!(
            "relation \"{}\" already exists",
            stmt.table
        )));
    }

    catalog.get_or_create(&stmt.table);
    let names: Vec<String> = stmt.columns.iter().map(|c| c.name.clone()).collect();
    catalog.register_columns(&stmt.table, &names);
    for column in &stmt.columns {
        if let Some(type_name) = &column.type_name {
            catalog.declare_type(&stmt.table, &column.name, type_from_sql_name(type_name));
        }
    }

    Ok(QueryResult {
        columns: Vec::new(),
        rows: Vec::new(),
        command_tag: "CREATE TABLE".to_string(),
        rows_affected: 0,
        returns_data: false,
    })
}

fn exec_drop_table(stmt: &DropStmt, catalog: &Catalog) -> Result<QueryResult, EngineError> {
    for table in &stmt.tables {
        catalog.drop_table(table);
    }
    Ok(QueryResult {
        columns: Vec::new(),
        rows: Vec::new(),
        command_tag: "DROP TABLE".to_string(),
        rows_affected: 0,
        returns_data: false,
    })
}

/// Simulates the statement's observations against the lattice so a
/// mid-statement conflict (two incompatible values for one column) aborts
/// before anything commits.
fn check_statement_types(
    catalog: &Catalog,
    table: &str,
    observations: &[(String, Value)],
) -> Result<(), EngineError> {
    let mut simulated: HashMap<&str, crate::catalog::ColumnType> = HashMap::new();
    for (column, value) in observations {
        if value.is_null() {
            continue;
        }
        let actual = crate::catalog::infer_type(value);
        let current = simulated
            .get(column.as_str())
            .copied()
            .unwrap_or_else(|| catalog.column_type(table, column));
        if !current.accepts(actual) {
            return Err(EngineError::with_code(
                format!(
                    "type mismatch for column {}.{}: expected {}, got {}",
                    table, column, current, actual
                ),
                "42804",
            ));
        }
        simulated.insert(column.as_str(), current.promote(actual));
    }
    Ok(())
}

fn commit_observations(
    catalog: &Catalog,
    table: &str,
    observations: &[(String, Value)],
) -> Result<(), EngineError> {
    for (column, value) in observations {
        catalog
            .observe_value(table, column, value)
            .map_err(EngineError::from)?;
    }
    Ok(())
}
