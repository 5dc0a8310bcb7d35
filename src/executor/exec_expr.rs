//! Expression evaluation over rows.
//!
//! Predicates evaluate into the three-valued domain {True, False, Unknown};
//! WHERE, HAVING, and join filters retain only True. Collapsing Unknown to
//! False any earlier would break NOT IN with nulls, so the distinction is
//! kept through every connective.

use std::collections::HashMap;

use crate::catalog::Catalog;
use crate::executor::exec_main::{execute_select, OuterEnv, SelectOutput};
use crate::parser::ast::{AExprKind, BoolOp, Expr, SelectStmt, SubLinkKind};
use crate::storage::{Row, Value};
use crate::tcop::engine::EngineError;
use crate::utils::datetime::parse_timestamp_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    pub fn negate(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    pub fn from_bool(value: bool) -> Truth {
        if value {
            Truth::True
        } else {
            Truth::False
        }
    }

    /// SQL truth becomes a value: Unknown surfaces as null.
    pub fn into_value(self) -> Value {
        match self {
            Truth::True => Value::Bool(true),
            Truth::False => Value::Bool(false),
            Truth::Unknown => Value::Null,
        }
    }
}

/// Evaluation context threaded through every expression. Carries the shared
/// catalog, the outer-row stack for correlated subqueries (most recent
/// first), and the current group's rows when aggregates are in scope.
#[derive(Clone, Copy)]
pub struct EvalCtx<'a> {
    pub catalog: &'a Catalog,
    pub outer_rows: &'a [Row],
    pub group: Option<&'a [Row]>,
}

impl<'a> EvalCtx<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            outer_rows: &[],
            group: None,
        }
    }

    fn without_group(self) -> Self {
        Self {
            group: None,
            ..self
        }
    }
}

/// Aliases in play while a join condition is evaluated over a row pair.
pub struct JoinScope {
    pub left_alias: Option<String>,
    pub right_alias: Option<String>,
}

pub fn is_aggregate_function(name: &str) -> bool {
    matches!(name, "count" | "sum" | "avg" | "max" | "min")
}

// ---- value evaluation ----

pub fn eval_expr(expr: &Expr, row: &Row, ctx: EvalCtx<'_>) -> Result<Value, EngineError> {
    match expr {
        Expr::ColumnRef { fields } => Ok(resolve_column(fields, row, ctx)),
        Expr::Star | Expr::QualifiedStar { .. } => Ok(Value::Null),
        Expr::AConst(value) => Ok(value.clone()),
        // Parameters are substituted before execution; a survivor reads null.
        Expr::Param(_) => Ok(Value::Null),
        Expr::AExpr {
            kind: AExprKind::Op,
            op,
            lexpr,
            rexpr,
            ..
        } => eval_operator_value(op, lexpr.as_deref(), rexpr.as_deref(), row, ctx),
        Expr::AExpr { .. } | Expr::BoolExpr { .. } => {
            Ok(eval_predicate(expr, row, ctx)?.into_value())
        }
        Expr::NullTest { arg, negated } => {
            let value = eval_expr(arg, row, ctx)?;
            Ok(Value::Bool(value.is_null() != *negated))
        }
        Expr::FuncCall {
            name,
            args,
            distinct,
            star_arg,
        } => eval_func_call(name, args, *distinct, *star_arg, row, ctx),
        Expr::SubLink {
            kind: SubLinkKind::Scalar,
            query,
            ..
        } => eval_scalar_subquery(query, row, ctx),
        Expr::SubLink { .. } => Ok(eval_predicate(expr, row, ctx)?.into_value()),
        Expr::CoalesceExpr { args } => {
            for arg in args {
                let value = eval_expr(arg, row, ctx)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        }
        Expr::CaseExpr {
            operand,
            whens,
            else_expr,
        } => {
            for (condition, result) in whens {
                let hit = match operand {
                    Some(operand) => {
                        let left = eval_expr(operand, row, ctx)?;
                        let right = eval_expr(condition, row, ctx)?;
                        compare_values(&left, "=", &right) == Truth::True
                    }
                    None => eval_predicate(condition, row, ctx)? == Truth::True,
                };
                if hit {
                    return eval_expr(result, row, ctx);
                }
            }
            match else_expr {
                Some(expr) => eval_expr(expr, row, ctx),
                None => Ok(Value::Null),
            }
        }
        Expr::Cast { expr, type_name } => {
            let value = eval_expr(expr, row, ctx)?;
            Ok(apply_cast(value, type_name))
        }
    }
}

fn eval_operator_value(
    op: &str,
    lexpr: Option<&Expr>,
    rexpr: Option<&Expr>,
    row: &Row,
    ctx: EvalCtx<'_>,
) -> Result<Value, EngineError> {
    let left = match lexpr {
        Some(expr) => eval_expr(expr, row, ctx)?,
        None => Value::Null,
    };
    let right = match rexpr {
        Some(expr) => eval_expr(expr, row, ctx)?,
        None => Value::Null,
    };

    match op {
        "+" | "-" | "*" | "/" | "%" => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return Ok(Value::Null);
            };
            let result = match op {
                "+" => l + r,
                "-" => l - r,
                "*" => l * r,
                "/" => {
                    if r == 0.0 {
                        return Ok(Value::Null);
                    }
                    l / r
                }
                _ => {
                    if r == 0.0 {
                        return Ok(Value::Null);
                    }
                    l % r
                }
            };
            Ok(Value::Float(result))
        }
        "||" => {
            if left.is_null() || right.is_null() {
                Ok(Value::Null)
            } else {
                Ok(Value::Text(format!("{}{}", left.render(), right.render())))
            }
        }
        _ => Ok(compare_values(&left, op, &right).into_value()),
    }
}

fn eval_func_call(
    name: &str,
    args: &[Expr],
    distinct: bool,
    star_arg: bool,
    row: &Row,
    ctx: EvalCtx<'_>,
) -> Result<Value, EngineError> {
    if is_aggregate_function(name) {
        if let Some(group) = ctx.group {
            return eval_aggregate(name, args, distinct, star_arg, group, ctx.without_group());
        }
        // Outside a grouping context an aggregate resolves against the row,
        // which is how HAVING sees already-projected aggregate columns.
        if let Some(value) = row.get(name) {
            return Ok(value.clone());
        }
        return Ok(Value::Null);
    }

    match name {
        "upper" => {
            let value = first_arg(args, row, ctx)?;
            match value {
                Value::Text(text) => Ok(Value::Text(text.to_uppercase())),
                _ => Ok(Value::Null),
            }
        }
        "lower" => {
            let value = first_arg(args, row, ctx)?;
            match value {
                Value::Text(text) => Ok(Value::Text(text.to_lowercase())),
                _ => Ok(Value::Null),
            }
        }
        _ => Ok(Value::Null),
    }
}

fn first_arg(args: &[Expr], row: &Row, ctx: EvalCtx<'_>) -> Result<Value, EngineError> {
    match args.first() {
        Some(expr) => eval_expr(expr, row, ctx),
        None => Ok(Value::Null),
    }
}

/// Aggregates see the group's rows; the argument expression is evaluated per
/// row without a group so nested aggregates read as plain columns.
pub fn eval_aggregate(
    name: &str,
    args: &[Expr],
    distinct: bool,
    star_arg: bool,
    rows: &[Row],
    ctx: EvalCtx<'_>,
) -> Result<Value, EngineError> {
    match name {
        "count" => {
            if star_arg || args.is_empty() {
                return Ok(Value::Int(rows.len() as i64));
            }
            if distinct {
                let mut seen: HashMap<String, ()> = HashMap::new();
                for row in rows {
                    let value = eval_expr(&args[0], row, ctx)?;
                    if !value.is_null() {
                        seen.insert(canonical_key(std::slice::from_ref(&value)), ());
                    }
                }
                return Ok(Value::Int(seen.len() as i64));
            }
            let mut count = 0i64;
            for row in rows {
                if !eval_expr(&args[0], row, ctx)?.is_null() {
                    count += 1;
                }
            }
            Ok(Value::Int(count))
        }
        "sum" | "avg" => {
            let Some(arg) = args.first() else {
                return Ok(Value::Null);
            };
            let mut sum = 0.0f64;
            let mut count = 0i64;
            for row in rows {
                let value = eval_expr(arg, row, ctx)?;
                if let Some(number) = value.as_f64() {
                    sum += number;
                    count += 1;
                }
            }
            if count == 0 {
                return Ok(Value::Null);
            }
            if name == "sum" {
                Ok(Value::Float(sum))
            } else {
                Ok(Value::Float(sum / count as f64))
            }
        }
        "max" | "min" => {
            let Some(arg) = args.first() else {
                return Ok(Value::Null);
            };
            let mut best: Option<Value> = None;
            for row in rows {
                let value = eval_expr(arg, row, ctx)?;
                if value.is_null() {
                    continue;
                }
                best = Some(match best {
                    None => value,
                    Some(current) => {
                        let ordering = compare_for_sort(&value, &current);
                        let take = if name == "max" {
                            ordering == std::cmp::Ordering::Greater
                        } else {
                            ordering == std::cmp::Ordering::Less
                        };
                        if take {
                            value
                        } else {
                            current
                        }
                    }
                });
            }
            Ok(best.unwrap_or(Value::Null))
        }
        _ => Ok(Value::Null),
    }
}

// ---- predicate evaluation ----

pub fn eval_predicate(expr: &Expr, row: &Row, ctx: EvalCtx<'_>) -> Result<Truth, EngineError> {
    match expr {
        Expr::BoolExpr { op, args } => match op {
            BoolOp::And => {
                let mut result = Truth::True;
                for arg in args {
                    match eval_predicate(arg, row, ctx)? {
                        Truth::False => return Ok(Truth::False),
                        Truth::Unknown => result = Truth::Unknown,
                        Truth::True => {}
                    }
                }
                Ok(result)
            }
            BoolOp::Or => {
                let mut result = Truth::False;
                for arg in args {
                    match eval_predicate(arg, row, ctx)? {
                        Truth::True => return Ok(Truth::True),
                        Truth::Unknown => result = Truth::Unknown,
                        Truth::False => {}
                    }
                }
                Ok(result)
            }
            BoolOp::Not => match args.first() {
                Some(arg) => Ok(eval_predicate(arg, row, ctx)?.negate()),
                None => Ok(Truth::True),
            },
        },
        Expr::NullTest { arg, negated } => {
            let value = eval_expr(arg, row, ctx)?;
            Ok(Truth::from_bool(value.is_null() != *negated))
        }
        Expr::AExpr {
            kind: AExprKind::Op,
            op,
            lexpr,
            rexpr,
            ..
        } => {
            if is_comparison_op(op) {
                let left = match lexpr {
                    Some(expr) => eval_expr(expr, row, ctx)?,
                    None => Value::Null,
                };
                let right = match rexpr {
                    Some(expr) => eval_expr(expr, row, ctx)?,
                    None => Value::Null,
                };
                return Ok(compare_values(&left, op, &right));
            }
            let value = eval_operator_value(op, lexpr.as_deref(), rexpr.as_deref(), row, ctx)?;
            Ok(value_truthiness(&value))
        }
        Expr::AExpr {
            kind: AExprKind::Like,
            op,
            lexpr,
            rexpr,
            ..
        } => {
            let left = match lexpr {
                Some(expr) => eval_expr(expr, row, ctx)?,
                None => Value::Null,
            };
            let right = match rexpr {
                Some(expr) => eval_expr(expr, row, ctx)?,
                None => Value::Null,
            };
            Ok(compare_values(&left, op, &right))
        }
        Expr::AExpr {
            kind: kind @ (AExprKind::In | AExprKind::NotIn),
            lexpr,
            rlist,
            ..
        } => {
            let probe = match lexpr {
                Some(expr) => eval_expr(expr, row, ctx)?,
                None => Value::Null,
            };
            let truth = eval_in_list(&probe, rlist, row, ctx)?;
            if *kind == AExprKind::NotIn {
                Ok(truth.negate())
            } else {
                Ok(truth)
            }
        }
        Expr::AExpr {
            kind: kind @ (AExprKind::Between | AExprKind::NotBetween),
            lexpr,
            rlist,
            ..
        } => {
            let probe = match lexpr {
                Some(expr) => eval_expr(expr, row, ctx)?,
                None => Value::Null,
            };
            let low = match rlist.first() {
                Some(expr) => eval_expr(expr, row, ctx)?,
                None => Value::Null,
            };
            let high = match rlist.get(1) {
                Some(expr) => eval_expr(expr, row, ctx)?,
                None => Value::Null,
            };
            let truth = truth_and(
                compare_values(&probe, ">=", &low),
                compare_values(&probe, "<=", &high),
            );
            if *kind == AExprKind::NotBetween {
                Ok(truth.negate())
            } else {
                Ok(truth)
            }
        }
        Expr::SubLink {
            kind,
            test,
            op,
            query,
        } => eval_sublink(*kind, test.as_deref(), op.as_deref(), query, row, ctx),
        _ => {
            let value = eval_expr(expr, row, ctx)?;
            Ok(value_truthiness(&value))
        }
    }
}

fn value_truthiness(value: &Value) -> Truth {
    match value {
        Value::Null => Truth::Unknown,
        Value::Bool(b) => Truth::from_bool(*b),
        _ => Truth::True,
    }
}

fn truth_and(a: Truth, b: Truth) -> Truth {
    match (a, b) {
        (Truth::False, _) | (_, Truth::False) => Truth::False,
        (Truth::Unknown, _) | (_, Truth::Unknown) => Truth::Unknown,
        _ => Truth::True,
    }
}

fn eval_in_list(
    probe: &Value,
    list: &[Expr],
    row: &Row,
    ctx: EvalCtx<'_>,
) -> Result<Truth, EngineError> {
    if probe.is_null() {
        return Ok(Truth::Unknown);
    }
    let mut saw_null = false;
    for item in list {
        let value = eval_expr(item, row, ctx)?;
        if value.is_null() {
            saw_null = true;
            continue;
        }
        if compare_values(probe, "=", &value) == Truth::True {
            return Ok(Truth::True);
        }
    }
    if saw_null {
        Ok(Truth::Unknown)
    } else {
        Ok(Truth::False)
    }
}

fn eval_sublink(
    kind: SubLinkKind,
    test: Option<&Expr>,
    op: Option<&str>,
    query: &SelectStmt,
    row: &Row,
    ctx: EvalCtx<'_>,
) -> Result<Truth, EngineError> {
    match kind {
        SubLinkKind::Exists => {
            let output = run_subquery(query, row, ctx)?;
            Ok(Truth::from_bool(!output.rows.is_empty()))
        }
        SubLinkKind::Any => {
            let output = run_subquery(query, row, ctx)?;
            if output.rows.is_empty() {
                return Ok(Truth::False);
            }
            let probe = match test {
                Some(expr) => eval_expr(expr, row, ctx)?,
                None => Value::Null,
            };
            if probe.is_null() {
                return Ok(Truth::Unknown);
            }
            let operator = op.unwrap_or("=");
            let mut saw_null = false;
            for value in first_column_values(&output) {
                if value.is_null() {
                    saw_null = true;
                    continue;
                }
                if compare_values(&probe, operator, &value) == Truth::True {
                    return Ok(Truth::True);
                }
            }
            if saw_null {
                Ok(Truth::Unknown)
            } else {
                Ok(Truth::False)
            }
        }
        SubLinkKind::All => {
            let output = run_subquery(query, row, ctx)?;
            if output.rows.is_empty() {
                return Ok(Truth::True);
            }
            let probe = match test {
                Some(expr) => eval_expr(expr, row, ctx)?,
                None => Value::Null,
            };
            if probe.is_null() {
                return Ok(Truth::Unknown);
            }
            let operator = op.unwrap_or("=");
            let mut saw_null = false;
            for value in first_column_values(&output) {
                if value.is_null() {
                    saw_null = true;
                    continue;
                }
                if compare_values(&probe, operator, &value) == Truth::False {
                    return Ok(Truth::False);
                }
            }
            if saw_null {
                Ok(Truth::Unknown)
            } else {
                Ok(Truth::True)
            }
        }
        SubLinkKind::Scalar => {
            let value = eval_scalar_subquery(query, row, ctx)?;
            Ok(value_truthiness(&value))
        }
    }
}

fn eval_scalar_subquery(
    query: &SelectStmt,
    row: &Row,
    ctx: EvalCtx<'_>,
) -> Result<Value, EngineError> {
    let output = run_subquery(query, row, ctx)?;
    let Some(first_row) = output.rows.first() else {
        return Ok(Value::Null);
    };
    Ok(first_row.first().cloned().unwrap_or(Value::Null))
}

/// Executes a nested SELECT with the current row pushed onto the outer-row
/// stack, so unresolved identifiers inside resolve against the enclosing
/// query (most recent scope first).
fn run_subquery(
    query: &SelectStmt,
    row: &Row,
    ctx: EvalCtx<'_>,
) -> Result<SelectOutput, EngineError> {
    let mut rows = Vec::with_capacity(ctx.outer_rows.len() + 1);
    rows.push(row.clone());
    rows.extend(ctx.outer_rows.iter().cloned());
    let env = OuterEnv { rows };
    execute_select(query, ctx.catalog, &env)
}

fn first_column_values(output: &SelectOutput) -> impl Iterator<Item = Value> + '_ {
    output
        .rows
        .iter()
        .map(|row| row.first().cloned().unwrap_or(Value::Null))
}

// ---- column resolution ----

/// Resolution order: the full dotted name, then progressively shorter
/// suffixes, then the bare column name; the same sequence is retried against
/// the outer-row stack before giving up with null.
pub fn resolve_column(fields: &[String], row: &Row, ctx: EvalCtx<'_>) -> Value {
    if let Some(value) = resolve_in_row(fields, row) {
        return value;
    }
    for outer in ctx.outer_rows {
        if let Some(value) = resolve_in_row(fields, outer) {
            return value;
        }
    }
    Value::Null
}

fn resolve_in_row(fields: &[String], row: &Row) -> Option<Value> {
    if fields.len() > 1 {
        for start in 0..fields.len() - 1 {
            let qualified = fields[start..].join(".");
            if let Some(value) = row.get(&qualified) {
                return Some(value.clone());
            }
        }
    }
    let last = fields.last()?;
    row.get(last).cloned()
}

// ---- join-condition evaluation ----

/// Qualified-row variant used for ON clauses: `alias.col` picks the side the
/// alias names before any merged-row fallback.
pub fn eval_join_predicate(
    expr: &Expr,
    left: &Row,
    right: &Row,
    scope: &JoinScope,
    ctx: EvalCtx<'_>,
) -> Result<Truth, EngineError> {
    match expr {
        Expr::BoolExpr { op, args } => match op {
            BoolOp::And => {
                let mut result = Truth::True;
                for arg in args {
                    match eval_join_predicate(arg, left, right, scope, ctx)? {
                        Truth::False => return Ok(Truth::False),
                        Truth::Unknown => result = Truth::Unknown,
                        Truth::True => {}
                    }
                }
                Ok(result)
            }
            BoolOp::Or => {
                let mut result = Truth::False;
                for arg in args {
                    match eval_join_predicate(arg, left, right, scope, ctx)? {
                        Truth::True => return Ok(Truth::True),
                        Truth::Unknown => result = Truth::Unknown,
                        Truth::False => {}
                    }
                }
                Ok(result)
            }
            BoolOp::Not => match args.first() {
                Some(arg) => Ok(eval_join_predicate(arg, left, right, scope, ctx)?.negate()),
                None => Ok(Truth::True),
            },
        },
        Expr::AExpr {
            kind: AExprKind::Op,
            op,
            lexpr,
            rexpr,
            ..
        } if is_comparison_op(op) => {
            let lval = join_operand(lexpr.as_deref(), left, right, scope, ctx)?;
            let rval = join_operand(rexpr.as_deref(), left, right, scope, ctx)?;
            Ok(compare_values(&lval, op, &rval))
        }
        Expr::NullTest { arg, negated } => {
            let value = join_operand(Some(arg), left, right, scope, ctx)?;
            Ok(Truth::from_bool(value.is_null() != *negated))
        }
        _ => {
            // Anything more exotic evaluates against the merged pair.
            let merged = merge_pair(left, right);
            eval_predicate(expr, &merged, ctx)
        }
    }
}

fn join_operand(
    expr: Option<&Expr>,
    left: &Row,
    right: &Row,
    scope: &JoinScope,
    ctx: EvalCtx<'_>,
) -> Result<Value, EngineError> {
    let Some(expr) = expr else {
        return Ok(Value::Null);
    };
    match expr {
        Expr::ColumnRef { fields } if fields.len() >= 2 => {
            let table = &fields[0];
            let column = fields[fields.len() - 1].clone();
            if scope.left_alias.as_deref() == Some(table.as_str()) {
                if let Some(value) = left.get(&column) {
                    return Ok(value.clone());
                }
            } else if scope.right_alias.as_deref() == Some(table.as_str()) {
                if let Some(value) = right.get(&column) {
                    return Ok(value.clone());
                }
            } else {
                // A table buried in an earlier join of the left subtree.
                let qualified = fields.join(".");
                if let Some(value) = left.get(&qualified) {
                    return Ok(value.clone());
                }
                if let Some(value) = left.get(&column) {
                    return Ok(value.clone());
                }
                if let Some(value) = right.get(&qualified) {
                    return Ok(value.clone());
                }
                if let Some(value) = right.get(&column) {
                    return Ok(value.clone());
                }
            }
            Ok(Value::Null)
        }
        Expr::ColumnRef { fields } if fields.len() == 1 => {
            let column = &fields[0];
            if let Some(value) = left.get(column) {
                return Ok(value.clone());
            }
            if let Some(value) = right.get(column) {
                return Ok(value.clone());
            }
            Ok(Value::Null)
        }
        Expr::AConst(value) => Ok(value.clone()),
        _ => {
            let merged = merge_pair(left, right);
            eval_expr(expr, &merged, ctx)
        }
    }
}

fn merge_pair(left: &Row, right: &Row) -> Row {
    let mut merged = left.clone();
    for (key, value) in right {
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }
    merged
}

// ---- comparison ----

pub fn is_comparison_op(op: &str) -> bool {
    matches!(
        op,
        "=" | "<>" | "!=" | "<" | ">" | "<=" | ">=" | "~~" | "!~~" | "~~*" | "!~~*"
    )
}

/// Value comparison under three-valued logic. Nulls compare Unknown; two
/// booleans support only equality; numeric comparison applies whenever both
/// sides coerce to numbers; otherwise the rendered strings are compared.
pub fn compare_values(left: &Value, op: &str, right: &Value) -> Truth {
    if left.is_null() || right.is_null() {
        return Truth::Unknown;
    }

    if let (Some(l), Some(r)) = (left.as_bool(), right.as_bool()) {
        return match op {
            "=" => Truth::from_bool(l == r),
            "<>" | "!=" => Truth::from_bool(l != r),
            _ => Truth::False,
        };
    }

    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        let result = match op {
            "=" => l == r,
            "<>" | "!=" => l != r,
            "<" => l < r,
            ">" => l > r,
            "<=" => l <= r,
            ">=" => l >= r,
            _ => return compare_strings(&left.render(), op, &right.render()),
        };
        return Truth::from_bool(result);
    }

    compare_strings(&left.render(), op, &right.render())
}

fn compare_strings(left: &str, op: &str, right: &str) -> Truth {
    let result = match op {
        "=" => left == right,
        "<>" | "!=" => left != right,
        "<" => left < right,
        ">" => left > right,
        "<=" => left <= right,
        ">=" => left >= right,
        "~~" => like_match(left, right),
        "!~~" => !like_match(left, right),
        "~~*" => like_match(&left.to_lowercase(), &right.to_lowercase()),
        "!~~*" => !like_match(&left.to_lowercase(), &right.to_lowercase()),
        _ => false,
    };
    Truth::from_bool(result)
}

/// Ordering used by ORDER BY and MAX/MIN: numeric when both sides coerce,
/// lexicographic otherwise.
pub fn compare_for_sort(left: &Value, right: &Value) -> std::cmp::Ordering {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal);
    }
    left.render().cmp(&right.render())
}

// ---- LIKE ----

#[derive(Clone, Copy, PartialEq)]
enum PatToken {
    AnyRun,
    AnyOne,
    Lit(char),
}

/// SQL LIKE: `%` matches any run, `_` one character, `\` escapes the next
/// metacharacter; the pattern is anchored to the whole string.
pub fn like_match(text: &str, pattern: &str) -> bool {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(PatToken::Lit(escaped)),
                None => tokens.push(PatToken::Lit('\\')),
            },
            '%' => tokens.push(PatToken::AnyRun),
            '_' => tokens.push(PatToken::AnyOne),
            other => tokens.push(PatToken::Lit(other)),
        }
    }

    let text: Vec<char> = text.chars().collect();
    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < text.len() {
        if pi < tokens.len()
            && (tokens[pi] == PatToken::AnyOne || tokens[pi] == PatToken::Lit(text[ti]))
        {
            ti += 1;
            pi += 1;
        } else if pi < tokens.len() && tokens[pi] == PatToken::AnyRun {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(star_pos) = star {
            pi = star_pos + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < tokens.len() && tokens[pi] == PatToken::AnyRun {
        pi += 1;
    }
    pi == tokens.len()
}

// ---- canonical row identity ----

const NULL_SENTINEL: &str = "\u{0}NULL\u{0}";
const FIELD_SEPARATOR: char = '\u{1}';

/// Byte key for dedup and grouping. Null is a sentinel distinct from any
/// rendered value (including the empty string); non-null cells compare by
/// their rendered bytes.
pub fn canonical_key(values: &[Value]) -> String {
    let mut parts = Vec::with_capacity(values.len());
    for value in values {
        if value.is_null() {
            parts.push(NULL_SENTINEL.to_string());
        } else {
            parts.push(value.render());
        }
    }
    parts.join(&FIELD_SEPARATOR.to_string())
}

// ---- casts ----

fn apply_cast(value: Value, type_name: &str) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match type_name {
        "int" | "int2" | "int4" | "int8" | "integer" | "smallint" | "bigint" => match &value {
            Value::Int(_) => value,
            Value::Float(v) => Value::Int(*v as i64),
            Value::Bool(v) => Value::Int(i64::from(*v)),
            Value::Text(text) => match text.trim().parse::<i64>() {
                Ok(v) => Value::Int(v),
                Err(_) => match text.trim().parse::<f64>() {
                    Ok(v) => Value::Int(v as i64),
                    Err(_) => Value::Null,
                },
            },
            _ => Value::Null,
        },
        "float" | "float4" | "float8" | "real" | "double" | "double precision" | "numeric"
        | "decimal" => match value.as_f64() {
            Some(v) => Value::Float(v),
            None => Value::Null,
        },
        "bool" | "boolean" => match &value {
            Value::Bool(_) => value,
            Value::Int(v) => Value::Bool(*v != 0),
            Value::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "yes" | "on" => Value::Bool(true),
                "f" | "false" | "0" | "no" | "off" => Value::Bool(false),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        "text" | "varchar" | "char" | "bpchar" => Value::Text(value.render()),
        "timestamp" | "timestamptz" | "date" => match &value {
            Value::Timestamp(_) => value,
            Value::Text(text) => match parse_timestamp_text(text) {
                Some(dt) => Value::Timestamp(dt),
                None => Value::Null,
            },
            _ => Value::Null,
        },
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn comparisons_follow_three_valued_logic() {
        assert_eq!(
            compare_values(&Value::Null, "=", &Value::Null),
            Truth::Unknown
        );
        assert_eq!(
            compare_values(&Value::Int(1), "=", &Value::Null),
            Truth::Unknown
        );
        assert_eq!(
            compare_values(&Value::Int(1), "=", &Value::Float(1.0)),
            Truth::True
        );
        assert_eq!(
            compare_values(&Value::Text("2".into()), "<", &Value::Int(10)),
            Truth::True
        );
        assert_eq!(
            compare_values(&Value::Text("b".into()), ">", &Value::Text("a".into())),
            Truth::True
        );
        // Booleans only support equality.
        assert_eq!(
            compare_values(&Value::Bool(true), "<", &Value::Bool(false)),
            Truth::False
        );
    }

    #[test]
    fn kleene_connectives() {
        let catalog = Catalog::new();
        let ctx = EvalCtx::new(&catalog);
        let r = row(&[("a", Value::Null), ("b", Value::Int(1))]);

        // a = a is Unknown for null a, so NOT (a = a) is Unknown too.
        let eq = Expr::binary("=", Expr::column(&["a"]), Expr::column(&["a"]));
        assert_eq!(eval_predicate(&eq, &r, ctx).unwrap(), Truth::Unknown);
        let not = Expr::BoolExpr {
            op: BoolOp::Not,
            args: vec![eq.clone()],
        };
        assert_eq!(eval_predicate(&not, &r, ctx).unwrap(), Truth::Unknown);

        // Unknown OR True is True; Unknown AND True is Unknown.
        let b_eq = Expr::binary("=", Expr::column(&["b"]), Expr::AConst(Value::Int(1)));
        let or = Expr::BoolExpr {
            op: BoolOp::Or,
            args: vec![eq.clone(), b_eq.clone()],
        };
        assert_eq!(eval_predicate(&or, &r, ctx).unwrap(), Truth::True);
        let and = Expr::BoolExpr {
            op: BoolOp::And,
            args: vec![eq, b_eq],
        };
        assert_eq!(eval_predicate(&and, &r, ctx).unwrap(), Truth::Unknown);
    }

    #[test]
    fn in_list_null_semantics() {
        let catalog = Catalog::new();
        let ctx = EvalCtx::new(&catalog);
        let r = row(&[("x", Value::Int(3))]);

        let in_list = |items: Vec<Expr>, negated: bool| Expr::AExpr {
            kind: if negated { AExprKind::NotIn } else { AExprKind::In },
            op: "=".to_string(),
            lexpr: Some(Box::new(Expr::column(&["x"]))),
            rexpr: None,
            rlist: items,
        };

        // Match wins over a null in the list.
        let hit = in_list(
            vec![Expr::AConst(Value::Null), Expr::AConst(Value::Int(3))],
            false,
        );
        assert_eq!(eval_predicate(&hit, &r, ctx).unwrap(), Truth::True);

        // No match with a null present is Unknown; NOT IN flips to Unknown.
        let miss = in_list(
            vec![Expr::AConst(Value::Null), Expr::AConst(Value::Int(4))],
            false,
        );
        assert_eq!(eval_predicate(&miss, &r, ctx).unwrap(), Truth::Unknown);
        let not_in = in_list(
            vec![Expr::AConst(Value::Null), Expr::AConst(Value::Int(4))],
            true,
        );
        assert_eq!(eval_predicate(&not_in, &r, ctx).unwrap(), Truth::Unknown);

        // Plain miss without nulls is False.
        let plain = in_list(vec![Expr::AConst(Value::Int(4))], false);
        assert_eq!(eval_predicate(&plain, &r, ctx).unwrap(), Truth::False);
    }

    #[test]
    fn arithmetic_nulls_and_division_by_zero() {
        let catalog = Catalog::new();
        let ctx = EvalCtx::new(&catalog);
        let r = row(&[("a", Value::Int(10)), ("n", Value::Null)]);

        let div = Expr::binary("/", Expr::column(&["a"]), Expr::AConst(Value::Int(0)));
        assert_eq!(eval_expr(&div, &r, ctx).unwrap(), Value::Null);

        let plus = Expr::binary("+", Expr::column(&["a"]), Expr::column(&["n"]));
        assert_eq!(eval_expr(&plus, &r, ctx).unwrap(), Value::Null);

        let times = Expr::binary("*", Expr::column(&["a"]), Expr::AConst(Value::Int(3)));
        assert_eq!(eval_expr(&times, &r, ctx).unwrap(), Value::Float(30.0));
    }

    #[test]
    fn concatenation_is_null_propagating() {
        let catalog = Catalog::new();
        let ctx = EvalCtx::new(&catalog);
        let r = row(&[("a", Value::Text("x".into())), ("n", Value::Null)]);

        let concat = Expr::binary("||", Expr::column(&["a"]), Expr::AConst(Value::Int(1)));
        assert_eq!(
            eval_expr(&concat, &r, ctx).unwrap(),
            Value::Text("x1".into())
        );
        let with_null = Expr::binary("||", Expr::column(&["a"]), Expr::column(&["n"]));
        assert_eq!(eval_expr(&with_null, &r, ctx).unwrap(), Value::Null);
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("hello", "h%"));
        assert!(like_match("hello", "%llo"));
        assert!(like_match("hello", "h_llo"));
        assert!(like_match("hello", "hello"));
        assert!(!like_match("hello", "h_"));
        assert!(like_match("50%", "50\\%"));
        assert!(!like_match("50x", "50\\%"));
        assert!(like_match("a_b", "a\\_b"));
        assert!(!like_match("axb", "a\\_b"));
        assert!(like_match("", "%"));
        assert!(!like_match("", "_"));
    }

    #[test]
    fn case_and_coalesce() {
        let catalog = Catalog::new();
        let ctx = EvalCtx::new(&catalog);
        let r = row(&[("x", Value::Int(5)), ("n", Value::Null)]);

        let case = Expr::CaseExpr {
            operand: None,
            whens: vec![(
                Expr::binary("<", Expr::column(&["x"]), Expr::AConst(Value::Int(0))),
                Expr::AConst(Value::Text("neg".into())),
            )],
            else_expr: Some(Box::new(Expr::AConst(Value::Text("pos".into())))),
        };
        assert_eq!(
            eval_expr(&case, &r, ctx).unwrap(),
            Value::Text("pos".into())
        );

        let coalesce = Expr::CoalesceExpr {
            args: vec![
                Expr::column(&["n"]),
                Expr::column(&["x"]),
                Expr::AConst(Value::Int(0)),
            ],
        };
        assert_eq!(eval_expr(&coalesce, &r, ctx).unwrap(), Value::Int(5));
    }

    #[test]
    fn column_resolution_prefers_qualified_then_suffixes() {
        let catalog = Catalog::new();
        let ctx = EvalCtx::new(&catalog);
        let r = row(&[
            ("users.id", Value::Int(7)),
            ("id", Value::Int(9)),
        ]);

        assert_eq!(
            resolve_column(&["users".into(), "id".into()], &r, ctx),
            Value::Int(7)
        );
        assert_eq!(resolve_column(&["id".into()], &r, ctx), Value::Int(9));
        // Unknown qualifier falls back to the bare column.
        assert_eq!(
            resolve_column(&["other".into(), "id".into()], &r, ctx),
            Value::Int(9)
        );
        assert_eq!(resolve_column(&["missing".into()], &r, ctx), Value::Null);
    }

    #[test]
    fn outer_row_stack_resolves_correlated_references() {
        let catalog = Catalog::new();
        let outer = vec![row(&[("o", Value::Int(1))])];
        let ctx = EvalCtx {
            catalog: &catalog,
            outer_rows: &outer,
            group: None,
        };
        let inner = row(&[("i", Value::Int(2))]);
        assert_eq!(resolve_column(&["o".into()], &inner, ctx), Value::Int(1));
        assert_eq!(resolve_column(&["i".into()], &inner, ctx), Value::Int(2));
    }

    #[test]
    fn aggregates_over_groups() {
        let catalog = Catalog::new();
        let ctx = EvalCtx::new(&catalog);
        let rows = vec![
            row(&[("sal", Value::Int(60))]),
            row(&[("sal", Value::Int(50))]),
            row(&[("sal", Value::Null)]),
        ];
        let arg = vec![Expr::column(&["sal"])];

        assert_eq!(
            eval_aggregate("count", &[], false, true, &rows, ctx).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            eval_aggregate("count", &arg, false, false, &rows, ctx).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            eval_aggregate("sum", &arg, false, false, &rows, ctx).unwrap(),
            Value::Float(110.0)
        );
        assert_eq!(
            eval_aggregate("avg", &arg, false, false, &rows, ctx).unwrap(),
            Value::Float(55.0)
        );
        assert_eq!(
            eval_aggregate("max", &arg, false, false, &rows, ctx).unwrap(),
            Value::Int(60)
        );
        assert_eq!(
            eval_aggregate("min", &arg, false, false, &rows, ctx).unwrap(),
            Value::Int(50)
        );

        // SUM over all-null input is null, not zero.
        let nulls = vec![row(&[("sal", Value::Null)])];
        assert_eq!(
            eval_aggregate("sum", &arg, false, false, &nulls, ctx).unwrap(),
            Value::Null
        );
        // COUNT over an empty group still yields zero.
        assert_eq!(
            eval_aggregate("count", &[], false, true, &[], ctx).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn canonical_key_distinguishes_null_empty_and_zero() {
        let null_key = canonical_key(&[Value::Null]);
        let empty_key = canonical_key(&[Value::Text(String::new())]);
        let zero_key = canonical_key(&[Value::Int(0)]);
        assert_ne!(null_key, empty_key);
        assert_ne!(null_key, zero_key);
        assert_ne!(empty_key, zero_key);

        // Int and Float that render identically collapse, matching the
        // comparison rules used for dedup.
        assert_eq!(
            canonical_key(&[Value::Int(110)]),
            canonical_key(&[Value::Float(110.0)])
        );
    }

    proptest! {
        #[test]
        fn like_percent_prefix_matches_any_suffix(s in "[a-z]{0,8}", t in "[a-z]{0,8}") {
            let text = format!("{s}{t}");
            let pattern = format!("{s}%");
            prop_assert!(like_match(&text, &pattern));
        }

        #[test]
        fn like_literal_pattern_matches_only_itself(s in "[a-z]{1,8}", t in "[a-z]{1,8}") {
            prop_assert_eq!(like_match(&s, &t), s == t);
        }

        #[test]
        fn canonical_key_equality_matches_rendered_cells(
            a in prop::collection::vec(0i64..5, 0..4),
            b in prop::collection::vec(0i64..5, 0..4),
        ) {
            let left: Vec<Value> = a.iter().map(|v| Value::Int(*v)).collect();
            let right: Vec<Value> = b.iter().map(|v| Value::Int(*v)).collect();
            prop_assert_eq!(canonical_key(&left) == canonical_key(&right), a == b);
        }
    }
}
