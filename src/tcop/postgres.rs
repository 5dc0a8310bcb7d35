//! Sans-IO connection session: a stream of frontend messages in, a stream of
//! backend messages out. The TCP server owns the socket and the framing;
//! everything protocol-visible happens here, which keeps the whole state
//! machine testable without a network.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::catalog::Catalog;
use crate::executor::exec_expr::{eval_expr, EvalCtx};
use crate::executor::exec_main::execute_statement;
use crate::parser::ast::{
    DeallocateStmt, ExecuteStmt, Expr, FromItem, JoinExpr, PrepareStmt, ResTarget, SelectStmt,
    SetOperation, SortBy, Statement,
};
use crate::parser::sql_parser::parse_statement;
use crate::storage::{Row, Value};
use crate::tcop::engine::{
    describe_statement, infer_parameter_types, ColumnDescription, EngineError, QueryResult,
};

pub type PgType = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptionField {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: PgType,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Startup {
        user: String,
        database: Option<String>,
        parameters: Vec<(String, String)>,
    },
    Query {
        sql: String,
    },
    Parse {
        statement_name: String,
        query: String,
        parameter_types: Vec<PgType>,
    },
    Bind {
        portal_name: String,
        statement_name: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Execute {
        portal_name: String,
        max_rows: i64,
    },
    DescribeStatement {
        statement_name: String,
    },
    DescribePortal {
        portal_name: String,
    },
    CloseStatement {
        statement_name: String,
    },
    ClosePortal {
        portal_name: String,
    },
    Flush,
    Sync,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: u32,
        secret_key: u32,
    },
    ReadyForQuery,
    ParseComplete,
    BindComplete,
    CloseComplete,
    EmptyQueryResponse,
    RowDescription {
        fields: Vec<RowDescriptionField>,
    },
    /// Text-format tuple; `None` is a null transmitted with length -1.
    DataRow {
        values: Vec<Option<String>>,
    },
    CommandComplete {
        tag: String,
    },
    ParameterDescription {
        parameter_types: Vec<PgType>,
    },
    NoData,
    PortalSuspended,
    ErrorResponse {
        message: String,
        code: String,
    },
    /// Not encoded; tells the server loop to flush its write buffer.
    FlushComplete,
    Terminate,
}

#[derive(Debug, Clone)]
struct PreparedStatement {
    query: String,
    statement: Statement,
    parameter_types: Vec<PgType>,
}

#[derive(Debug, Clone)]
struct Portal {
    statement: PreparedStatement,
    params: Vec<Option<String>>,
    #[allow(dead_code)]
    result_formats: Vec<i16>,
    result: Option<QueryResult>,
    fields: Vec<ColumnDescription>,
    cursor: usize,
    row_description_sent: bool,
}

enum ControlFlow {
    Continue,
    Break,
}

/// One per connection. Prepared statements and portals are connection-local;
/// the catalog is the only shared state.
pub struct PostgresSession {
    catalog: Arc<Catalog>,
    prepared_statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
    startup_complete: bool,
    ignore_till_sync: bool,
    process_id: u32,
    secret_key: u32,
}

impl PostgresSession {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            prepared_statements: HashMap::new(),
            portals: HashMap::new(),
            startup_complete: true,
            ignore_till_sync: false,
            process_id: rand::random::<u32>() & 0x7FFF_FFFF,
            secret_key: rand::random::<u32>(),
        }
    }

    pub fn new_startup_required(catalog: Arc<Catalog>) -> Self {
        Self {
            startup_complete: false,
            ..Self::new(catalog)
        }
    }

    pub async fn run<I>(&mut self, messages: I) -> Vec<BackendMessage>
    where
        I: IntoIterator<Item = FrontendMessage>,
    {
        let mut out = Vec::new();
        for message in messages {
            if self.ignore_till_sync
                && !matches!(message, FrontendMessage::Sync | FrontendMessage::Terminate)
            {
                continue;
            }
            let extended = is_extended_query_message(&message);
            match self.dispatch(message, &mut out) {
                Ok(ControlFlow::Continue) => {}
                Ok(ControlFlow::Break) => {
                    out.push(BackendMessage::Terminate);
                    return out;
                }
                Err(err) => {
                    out.push(BackendMessage::ErrorResponse {
                        message: err.message,
                        code: err.code,
                    });
                    if extended {
                        // Skip the rest of the pipeline until Sync.
                        self.ignore_till_sync = true;
                    } else {
                        out.push(BackendMessage::ReadyForQuery);
                    }
                }
            }
        }
        out
    }

    pub fn run_sync<I>(&mut self, messages: I) -> Vec<BackendMessage>
    where
        I: IntoIterator<Item = FrontendMessage>,
    {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("tokio runtime should start")
            .block_on(self.run(messages))
    }

    fn dispatch(
        &mut self,
        message: FrontendMessage,
        out: &mut Vec<BackendMessage>,
    ) -> Result<ControlFlow, EngineError> {
        if !self.startup_complete
            && !matches!(
                message,
                FrontendMessage::Startup { .. } | FrontendMessage::Terminate
            )
        {
            return Err(EngineError::with_code(
                "startup packet has not been processed",
                "08P01",
            ));
        }

        match message {
            FrontendMessage::Startup { .. } => {
                self.exec_startup(out);
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::Query { sql } => {
                self.exec_simple_query(&sql, out)?;
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::Parse {
                statement_name,
                query,
                parameter_types,
            } => {
                self.exec_parse(&statement_name, &query, parameter_types)?;
                out.push(BackendMessage::ParseComplete);
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_formats,
                params,
                result_formats,
            } => {
                self.exec_bind(
                    &portal_name,
                    &statement_name,
                    &param_formats,
                    params,
                    result_formats,
                )?;
                out.push(BackendMessage::BindComplete);
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::Execute {
                portal_name,
                max_rows,
            } => {
                self.exec_execute(&portal_name, max_rows, out)?;
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::DescribeStatement { statement_name } => {
                self.exec_describe_statement(&statement_name, out)?;
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::DescribePortal { portal_name } => {
                self.exec_describe_portal(&portal_name, out)?;
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::CloseStatement { statement_name } => {
                self.prepared_statements.remove(&statement_name);
                out.push(BackendMessage::CloseComplete);
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::ClosePortal { portal_name } => {
                self.portals.remove(&portal_name);
                out.push(BackendMessage::CloseComplete);
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::Flush => {
                out.push(BackendMessage::FlushComplete);
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::Sync => {
                self.ignore_till_sync = false;
                out.push(BackendMessage::ReadyForQuery);
                Ok(ControlFlow::Continue)
            }
            FrontendMessage::Terminate => Ok(ControlFlow::Break),
        }
    }

    fn exec_startup(&mut self, out: &mut Vec<BackendMessage>) {
        self.startup_complete = true;
        out.push(BackendMessage::AuthenticationOk);
        for (name, value) in [
            ("server_version", "12.0"),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
        ] {
            out.push(BackendMessage::ParameterStatus {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        out.push(BackendMessage::BackendKeyData {
            process_id: self.process_id,
            secret_key: self.secret_key,
        });
        out.push(BackendMessage::ReadyForQuery);
    }

    fn exec_simple_query(
        &mut self,
        sql: &str,
        out: &mut Vec<BackendMessage>,
    ) -> Result<(), EngineError> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            out.push(BackendMessage::EmptyQueryResponse);
            out.push(BackendMessage::ReadyForQuery);
            return Ok(());
        }

        let (result, fields) = self.session_execute(trimmed)?;
        if result.returns_data {
            out.push(BackendMessage::RowDescription {
                fields: row_description_fields(&result.columns, &fields),
            });
            for row in &result.rows {
                out.push(data_row(row));
            }
        }
        out.push(BackendMessage::CommandComplete {
            tag: result.command_tag,
        });
        out.push(BackendMessage::ReadyForQuery);
        Ok(())
    }

    /// Parses and executes one statement, intercepting the SQL-level
    /// prepared-statement commands so they land in this connection's table
    /// rather than anywhere global.
    fn session_execute(
        &mut self,
        sql: &str,
    ) -> Result<(QueryResult, Vec<ColumnDescription>), EngineError> {
        let statement = parse_statement(sql)?;
        match statement {
            Statement::Prepare(prepare) => {
                self.exec_sql_prepare(prepare)?;
                Ok((command_only("PREPARE"), Vec::new()))
            }
            Statement::Execute(execute) => self.exec_sql_execute(&execute),
            Statement::Deallocate(deallocate) => {
                self.exec_sql_deallocate(&deallocate)?;
                Ok((command_only("DEALLOCATE"), Vec::new()))
            }
            other => {
                let fields = describe_statement(&other, &self.catalog).unwrap_or_default();
                let result = execute_statement(&other, &self.catalog)?;
                Ok((result, fields))
            }
        }
    }

    fn exec_sql_prepare(&mut self, prepare: PrepareStmt) -> Result<(), EngineError> {
        let count = count_statement_parameters(&prepare.statement);
        self.prepared_statements.insert(
            prepare.name.clone(),
            PreparedStatement {
                query: String::new(),
                statement: *prepare.statement,
                parameter_types: vec![0; count],
            },
        );
        Ok(())
    }

    fn exec_sql_execute(
        &mut self,
        execute: &ExecuteStmt,
    ) -> Result<(QueryResult, Vec<ColumnDescription>), EngineError> {
        let Some(prepared) = self.prepared_statements.get(&execute.name) else {
            return Err(EngineError::with_code(
                format!("prepared statement \"{}\" does not exist", execute.name),
                "26000",
            ));
        };

        let ectx = EvalCtx::new(&self.catalog);
        let empty = Row::new();
        let mut args = Vec::with_capacity(execute.params.len());
        for param in &execute.params {
            args.push(eval_expr(param, &empty, ectx)?);
        }

        let substituted = substitute_statement_params(&prepared.statement, &args);
        let fields = describe_statement(&substituted, &self.catalog).unwrap_or_default();
        let result = execute_statement(&substituted, &self.catalog)?;
        Ok((result, fields))
    }

    fn exec_sql_deallocate(&mut self, deallocate: &DeallocateStmt) -> Result<(), EngineError> {
        match &deallocate.name {
            Some(name) => {
                if self.prepared_statements.remove(name).is_none() {
                    return Err(EngineError::with_code(
                        format!("prepared statement \"{}\" does not exist", name),
                        "26000",
                    ));
                }
            }
            None => self.prepared_statements.clear(),
        }
        Ok(())
    }

    fn exec_parse(
        &mut self,
        statement_name: &str,
        query: &str,
        parameter_types: Vec<PgType>,
    ) -> Result<(), EngineError> {
        let statement = parse_statement(query)?;
        let parameter_types = if parameter_types.is_empty() {
            infer_parameter_types(query)
        } else {
            parameter_types
        };
        self.prepared_statements.insert(
            statement_name.to_string(),
            PreparedStatement {
                query: query.to_string(),
                statement,
                parameter_types,
            },
        );
        Ok(())
    }

    fn exec_bind(
        &mut self,
        portal_name: &str,
        statement_name: &str,
        param_formats: &[i16],
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    ) -> Result<(), EngineError> {
        let Some(statement) = self.prepared_statements.get(statement_name) else {
            return Err(EngineError::with_code(
                format!(
                    "prepared statement \"{}\" does not exist",
                    statement_name
                ),
                "26000",
            ));
        };

        let mut decoded = Vec::with_capacity(params.len());
        for (idx, param) in params.into_iter().enumerate() {
            match param {
                None => decoded.push(None),
                Some(bytes) => {
                    let format = match param_formats.len() {
                        0 => 0,
                        1 => param_formats[0],
                        _ => param_formats.get(idx).copied().unwrap_or(0),
                    };
                    decoded.push(Some(decode_parameter(&bytes, format)?));
                }
            }
        }

        self.portals.insert(
            portal_name.to_string(),
            Portal {
                statement: statement.clone(),
                params: decoded,
                result_formats,
                result: None,
                fields: Vec::new(),
                cursor: 0,
                row_description_sent: false,
            },
        );
        Ok(())
    }

    fn exec_execute(
        &mut self,
        portal_name: &str,
        max_rows: i64,
        out: &mut Vec<BackendMessage>,
    ) -> Result<(), EngineError> {
        let sql = {
            let Some(portal) = self.portals.get(portal_name) else {
                return Err(EngineError::with_code(
                    format!("portal \"{}\" does not exist", portal_name),
                    "34000",
                ));
            };
            if portal.result.is_some() {
                None
            } else {
                Some(substitute_query_text(
                    &portal.statement.query,
                    &portal.params,
                    &portal.statement.parameter_types,
                ))
            }
        };

        if let Some(sql) = sql {
            let (result, fields) = self.session_execute(&sql)?;
            let portal = self
                .portals
                .get_mut(portal_name)
                .expect("portal existed above");
            portal.result = Some(result);
            portal.fields = fields;
        }

        let portal = self
            .portals
            .get_mut(portal_name)
            .expect("portal existed above");
        let result = portal.result.as_ref().expect("portal was just executed");

        if result.returns_data && !portal.row_description_sent {
            out.push(BackendMessage::RowDescription {
                fields: row_description_fields(&result.columns, &portal.fields),
            });
            portal.row_description_sent = true;
        }

        let total = result.rows.len();
        let remaining = total.saturating_sub(portal.cursor);
        let take = if max_rows > 0 {
            remaining.min(max_rows as usize)
        } else {
            remaining
        };
        for row in &result.rows[portal.cursor..portal.cursor + take] {
            out.push(data_row(row));
        }
        portal.cursor += take;

        if portal.cursor < total {
            out.push(BackendMessage::PortalSuspended);
        } else {
            out.push(BackendMessage::CommandComplete {
                tag: result.command_tag.clone(),
            });
        }
        Ok(())
    }

    fn exec_describe_statement(
        &mut self,
        statement_name: &str,
        out: &mut Vec<BackendMessage>,
    ) -> Result<(), EngineError> {
        let Some(statement) = self.prepared_statements.get(statement_name) else {
            return Err(EngineError::with_code(
                format!(
                    "prepared statement \"{}\" does not exist",
                    statement_name
                ),
                "26000",
            ));
        };
        out.push(BackendMessage::ParameterDescription {
            parameter_types: statement.parameter_types.clone(),
        });
        match describe_statement(&statement.statement, &self.catalog) {
            Some(fields) => {
                let names: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
                out.push(BackendMessage::RowDescription {
                    fields: row_description_fields(&names, &fields),
                });
            }
            None => out.push(BackendMessage::NoData),
        }
        Ok(())
    }

    fn exec_describe_portal(
        &mut self,
        portal_name: &str,
        out: &mut Vec<BackendMessage>,
    ) -> Result<(), EngineError> {
        let Some(portal) = self.portals.get_mut(portal_name) else {
            return Err(EngineError::with_code(
                format!("portal \"{}\" does not exist", portal_name),
                "34000",
            ));
        };
        match describe_statement(&portal.statement.statement, &self.catalog) {
            Some(fields) => {
                let names: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
                out.push(BackendMessage::RowDescription {
                    fields: row_description_fields(&names, &fields),
                });
                portal.row_description_sent = true;
            }
            None => out.push(BackendMessage::NoData),
        }
        Ok(())
    }
}

fn is_extended_query_message(message: &FrontendMessage) -> bool {
    matches!(
        message,
        FrontendMessage::Parse { .. }
            | FrontendMessage::Bind { .. }
            | FrontendMessage::Execute { .. }
            | FrontendMessage::DescribeStatement { .. }
            | FrontendMessage::DescribePortal { .. }
            | FrontendMessage::CloseStatement { .. }
            | FrontendMessage::ClosePortal { .. }
            | FrontendMessage::Flush
    )
}

fn command_only(tag: &str) -> QueryResult {
    QueryResult {
        columns: Vec::new(),
        rows: Vec::new(),
        command_tag: tag.to_string(),
        rows_affected: 0,
        returns_data: false,
    }
}

fn data_row(row: &[Value]) -> BackendMessage {
    BackendMessage::DataRow {
        values: row
            .iter()
            .map(|value| {
                if value.is_null() {
                    None
                } else {
                    Some(value.render())
                }
            })
            .collect(),
    }
}

/// Builds the wire fields for a result's columns, pulling type OIDs from the
/// analyzer output by name and defaulting to text.
fn row_description_fields(
    columns: &[String],
    descriptions: &[ColumnDescription],
) -> Vec<RowDescriptionField> {
    columns
        .iter()
        .map(|column| {
            let description = descriptions.iter().find(|d| &d.name == column);
            RowDescriptionField {
                name: column.clone(),
                table_oid: 0,
                column_attr: 0,
                type_oid: description.map(|d| d.type_oid).unwrap_or(25),
                type_size: description.map(|d| d.type_size).unwrap_or(-1),
                type_modifier: -1,
                format_code: 0,
            }
        })
        .collect()
}

/// Binary-format integer parameters are decoded big-endian; everything else
/// passes through as text.
fn decode_parameter(bytes: &[u8], format: i16) -> Result<String, EngineError> {
    if format == 1 {
        let text = match bytes.len() {
            2 => BigEndian::read_i16(bytes).to_string(),
            4 => BigEndian::read_i32(bytes).to_string(),
            8 => BigEndian::read_i64(bytes).to_string(),
            _ => String::from_utf8_lossy(bytes).into_owned(),
        };
        return Ok(text);
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|_| EngineError::with_code("bind parameter is not valid utf8", "22021"))
}

/// Lexical `$N` substitution into the query text, longest placeholder first
/// so `$10` is never clobbered by `$1`. String parameters are quoted;
/// numeric and boolean parameters pass through bare so numeric columns keep
/// their inferred types.
fn substitute_query_text(
    query: &str,
    params: &[Option<String>],
    parameter_types: &[PgType],
) -> String {
    let mut sql = query.to_string();
    for idx in (0..params.len()).rev() {
        let placeholder = format!("${}", idx + 1);
        let replacement = match &params[idx] {
            None => "NULL".to_string(),
            Some(text) => {
                let oid = parameter_types.get(idx).copied().unwrap_or(0);
                match oid {
                    // bool, int2/4/8, float4/8: no quoting.
                    16 | 20 | 21 | 23 | 700 | 701 => text.clone(),
                    _ => format!("'{}'", text.replace('\'', "''")),
                }
            }
        };
        sql = sql.replace(&placeholder, &replacement);
    }
    sql
}

// ---- SQL-level EXECUTE: AST parameter substitution ----

fn count_statement_parameters(statement: &Statement) -> usize {
    let mut max_param = 0usize;
    walk_statement(statement, &mut |expr| {
        if let Expr::Param(n) = expr {
            max_param = max_param.max(*n as usize);
        }
    });
    max_param
}

fn walk_statement(statement: &Statement, visit: &mut dyn FnMut(&Expr)) {
    match statement {
        Statement::Select(select) => walk_select(select, visit),
        Statement::Insert(insert) => {
            for tuple in &insert.values {
                for expr in tuple {
                    walk_expr(expr, visit);
                }
            }
        }
        Statement::Update(update) => {
            for (_, expr) in &update.assignments {
                walk_expr(expr, visit);
            }
            if let Some(where_clause) = &update.where_clause {
                walk_expr(where_clause, visit);
            }
        }
        Statement::Delete(delete) => {
            if let Some(where_clause) = &delete.where_clause {
                walk_expr(where_clause, visit);
            }
        }
        _ => {}
    }
}

fn walk_select(select: &SelectStmt, visit: &mut dyn FnMut(&Expr)) {
    if let Some(set_op) = &select.set_op {
        walk_select(&set_op.left, visit);
        walk_select(&set_op.right, visit);
    }
    for target in &select.targets {
        walk_expr(&target.val, visit);
    }
    for item in &select.from {
        walk_from(item, visit);
    }
    if let Some(where_clause) = &select.where_clause {
        walk_expr(where_clause, visit);
    }
    for expr in &select.group_by {
        walk_expr(expr, visit);
    }
    if let Some(having) = &select.having {
        walk_expr(having, visit);
    }
    for sort in &select.order_by {
        walk_expr(&sort.expr, visit);
    }
    if let Some(limit) = &select.limit {
        walk_expr(limit, visit);
    }
    if let Some(offset) = &select.offset {
        walk_expr(offset, visit);
    }
}

fn walk_from(item: &FromItem, visit: &mut dyn FnMut(&Expr)) {
    match item {
        FromItem::Table { .. } => {}
        FromItem::Subquery { query, .. } => walk_select(query, visit),
        FromItem::Join(join) => {
            walk_from(&join.left, visit);
            walk_from(&join.right, visit);
            if let Some(on) = &join.on {
                walk_expr(on, visit);
            }
        }
    }
}

fn walk_expr(expr: &Expr, visit: &mut dyn FnMut(&Expr)) {
    visit(expr);
    match expr {
        Expr::AExpr {
            lexpr,
            rexpr,
            rlist,
            ..
        } => {
            if let Some(lexpr) = lexpr {
                walk_expr(lexpr, visit);
            }
            if let Some(rexpr) = rexpr {
                walk_expr(rexpr, visit);
            }
            for item in rlist {
                walk_expr(item, visit);
            }
        }
        Expr::BoolExpr { args, .. } => {
            for arg in args {
                walk_expr(arg, visit);
            }
        }
        Expr::NullTest { arg, .. } => walk_expr(arg, visit),
        Expr::FuncCall { args, .. } => {
            for arg in args {
                walk_expr(arg, visit);
            }
        }
        Expr::SubLink { test, query, .. } => {
            if let Some(test) = test {
                walk_expr(test, visit);
            }
            walk_select(query, visit);
        }
        Expr::CoalesceExpr { args } => {
            for arg in args {
                walk_expr(arg, visit);
            }
        }
        Expr::CaseExpr {
            operand,
            whens,
            else_expr,
        } => {
            if let Some(operand) = operand {
                walk_expr(operand, visit);
            }
            for (when, then) in whens {
                walk_expr(when, visit);
                walk_expr(then, visit);
            }
            if let Some(else_expr) = else_expr {
                walk_expr(else_expr, visit);
            }
        }
        Expr::Cast { expr, .. } => walk_expr(expr, visit),
        _ => {}
    }
}

fn substitute_statement_params(statement: &Statement, args: &[Value]) -> Statement {
    let mut out = statement.clone();
    map_statement_params(&mut out, args);
    out
}

fn map_statement_params(statement: &mut Statement, args: &[Value]) {
    match statement {
        Statement::Select(select) => map_select_params(select, args),
        Statement::Insert(insert) => {
            for tuple in &mut insert.values {
                for expr in tuple {
                    map_expr_params(expr, args);
                }
            }
        }
        Statement::Update(update) => {
            for (_, expr) in &mut update.assignments {
                map_expr_params(expr, args);
            }
            if let Some(where_clause) = &mut update.where_clause {
                map_expr_params(where_clause, args);
            }
        }
        Statement::Delete(delete) => {
            if let Some(where_clause) = &mut delete.where_clause {
                map_expr_params(where_clause, args);
            }
        }
        _ => {}
    }
}

fn map_select_params(select: &mut SelectStmt, args: &[Value]) {
    if let Some(SetOperation { left, right, .. }) = &mut select.set_op {
        map_select_params(left, args);
        map_select_params(right, args);
    }
    for ResTarget { val, .. } in &mut select.targets {
        map_expr_params(val, args);
    }
    for item in &mut select.from {
        map_from_params(item, args);
    }
    if let Some(where_clause) = &mut select.where_clause {
        map_expr_params(where_clause, args);
    }
    for expr in &mut select.group_by {
        map_expr_params(expr, args);
    }
    if let Some(having) = &mut select.having {
        map_expr_params(having, args);
    }
    for SortBy { expr, .. } in &mut select.order_by {
        map_expr_params(expr, args);
    }
    if let Some(limit) = &mut select.limit {
        map_expr_params(limit, args);
    }
    if let Some(offset) = &mut select.offset {
        map_expr_params(offset, args);
    }
}

fn map_from_params(item: &mut FromItem, args: &[Value]) {
    match item {
        FromItem::Table { .. } => {}
        FromItem::Subquery { query, .. } => map_select_params(query, args),
        FromItem::Join(join) => {
            let JoinExpr {
                left, right, on, ..
            } = join.as_mut();
            map_from_params(left, args);
            map_from_params(right, args);
            if let Some(on) = on {
                map_expr_params(on, args);
            }
        }
    }
}

fn map_expr_params(expr: &mut Expr, args: &[Value]) {
    if let Expr::Param(n) = expr {
        let value = args
            .get((*n as usize).saturating_sub(1))
            .cloned()
            .unwrap_or(Value::Null);
        *expr = Expr::AConst(value);
        return;
    }
    match expr {
        Expr::AExpr {
            lexpr,
            rexpr,
            rlist,
            ..
        } => {
            if let Some(lexpr) = lexpr {
                map_expr_params(lexpr, args);
            }
            if let Some(rexpr) = rexpr {
                map_expr_params(rexpr, args);
            }
            for item in rlist {
                map_expr_params(item, args);
            }
        }
        Expr::BoolExpr { args: bool_args, .. } => {
            for arg in bool_args {
                map_expr_params(arg, args);
            }
        }
        Expr::NullTest { arg, .. } => map_expr_params(arg, args),
        Expr::FuncCall { args: func_args, .. } => {
            for arg in func_args {
                map_expr_params(arg, args);
            }
        }
        Expr::SubLink { test, query, .. } => {
            if let Some(test) = test {
                map_expr_params(test, args);
            }
            map_select_params(query, args);
        }
        Expr::CoalesceExpr { args: coalesce_args } => {
            for arg in coalesce_args {
                map_expr_params(arg, args);
            }
        }
        Expr::CaseExpr {
            operand,
            whens,
            else_expr,
        } => {
            if let Some(operand) = operand {
                map_expr_params(operand, args);
            }
            for (when, then) in whens {
                map_expr_params(when, args);
                map_expr_params(then, args);
            }
            if let Some(else_expr) = else_expr {
                map_expr_params(else_expr, args);
            }
        }
        Expr::Cast { expr: inner, .. } => map_expr_params(inner, args),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PostgresSession {
        PostgresSession::new(Arc::new(Catalog::new()))
    }

    fn query(sql: &str) -> FrontendMessage {
        FrontendMessage::Query {
            sql: sql.to_string(),
        }
    }

    fn data_rows(messages: &[BackendMessage]) -> Vec<Vec<Option<String>>> {
        messages
            .iter()
            .filter_map(|m| match m {
                BackendMessage::DataRow { values } => Some(values.clone()),
                _ => None,
            })
            .collect()
    }

    fn command_tags(messages: &[BackendMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                BackendMessage::CommandComplete { tag } => Some(tag.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn simple_query_round_trip() {
        let mut session = session();
        let out = session.run_sync([
            query("CREATE TABLE t (id int, name text)"),
            query("INSERT INTO t VALUES (1, 'a'), (2, 'b')"),
            query("SELECT name FROM t WHERE id = 2"),
        ]);
        assert_eq!(
            command_tags(&out),
            vec!["CREATE TABLE", "INSERT 0 2", "SELECT 1"]
        );
        assert_eq!(data_rows(&out), vec![vec![Some("b".to_string())]]);
    }

    #[test]
    fn startup_produces_parameter_status_and_key_data() {
        let catalog = Arc::new(Catalog::new());
        let mut session = PostgresSession::new_startup_required(catalog);
        let out = session.run_sync([FrontendMessage::Startup {
            user: "postgres".to_string(),
            database: None,
            parameters: Vec::new(),
        }]);
        assert!(matches!(out[0], BackendMessage::AuthenticationOk));
        assert!(out
            .iter()
            .any(|m| matches!(m, BackendMessage::ParameterStatus { name, value }
                if name == "server_encoding" && value == "UTF8")));
        assert!(out
            .iter()
            .any(|m| matches!(m, BackendMessage::BackendKeyData { .. })));
        assert!(matches!(
            out.last(),
            Some(BackendMessage::ReadyForQuery)
        ));
    }

    #[test]
    fn extended_query_flow_matches_simple_query() {
        let mut session = session();
        session.run_sync([
            query("CREATE TABLE t (id int, name text)"),
            query("INSERT INTO t VALUES (1, 'a'), (2, 'b')"),
        ]);

        let out = session.run_sync([
            FrontendMessage::Parse {
                statement_name: "s1".to_string(),
                query: "SELECT name FROM t WHERE id = $1".to_string(),
                parameter_types: vec![23],
            },
            FrontendMessage::Bind {
                portal_name: "p1".to_string(),
                statement_name: "s1".to_string(),
                param_formats: vec![],
                params: vec![Some(b"2".to_vec())],
                result_formats: vec![],
            },
            FrontendMessage::DescribePortal {
                portal_name: "p1".to_string(),
            },
            FrontendMessage::Execute {
                portal_name: "p1".to_string(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ]);

        assert!(matches!(out[0], BackendMessage::ParseComplete));
        assert!(matches!(out[1], BackendMessage::BindComplete));
        assert!(matches!(out[2], BackendMessage::RowDescription { .. }));
        assert_eq!(data_rows(&out), vec![vec![Some("b".to_string())]]);
        assert_eq!(command_tags(&out), vec!["SELECT 1"]);
        assert!(matches!(
            out.last(),
            Some(BackendMessage::ReadyForQuery)
        ));
    }

    #[test]
    fn binary_int_parameters_are_decoded_big_endian() {
        let mut session = session();
        session.run_sync([
            query("CREATE TABLE t (id int)"),
            query("INSERT INTO t VALUES (1), (7)"),
        ]);

        let out = session.run_sync([
            FrontendMessage::Parse {
                statement_name: String::new(),
                query: "SELECT id FROM t WHERE id = $1".to_string(),
                parameter_types: vec![23],
            },
            FrontendMessage::Bind {
                portal_name: String::new(),
                statement_name: String::new(),
                param_formats: vec![1],
                params: vec![Some(7i32.to_be_bytes().to_vec())],
                result_formats: vec![],
            },
            FrontendMessage::Execute {
                portal_name: String::new(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ]);
        assert_eq!(data_rows(&out), vec![vec![Some("7".to_string())]]);
    }

    #[test]
    fn max_rows_suspends_and_resumes_the_portal() {
        let mut session = session();
        session.run_sync([
            query("CREATE TABLE t (id int)"),
            query("INSERT INTO t VALUES (1), (2), (3)"),
        ]);

        let out = session.run_sync([
            FrontendMessage::Parse {
                statement_name: String::new(),
                query: "SELECT id FROM t".to_string(),
                parameter_types: vec![],
            },
            FrontendMessage::Bind {
                portal_name: String::new(),
                statement_name: String::new(),
                param_formats: vec![],
                params: vec![],
                result_formats: vec![],
            },
            FrontendMessage::Execute {
                portal_name: String::new(),
                max_rows: 2,
            },
        ]);
        assert_eq!(data_rows(&out).len(), 2);
        assert!(out
            .iter()
            .any(|m| matches!(m, BackendMessage::PortalSuspended)));

        let out = session.run_sync([
            FrontendMessage::Execute {
                portal_name: String::new(),
                max_rows: 2,
            },
            FrontendMessage::Sync,
        ]);
        assert_eq!(data_rows(&out).len(), 1);
        assert_eq!(command_tags(&out), vec!["SELECT 3"]);
    }

    #[test]
    fn describe_statement_reports_parameters_and_row_shape() {
        let mut session = session();
        session.run_sync([query("CREATE TABLE t (id int, name text)")]);

        let out = session.run_sync([
            FrontendMessage::Parse {
                statement_name: "s1".to_string(),
                query: "SELECT id, name FROM t WHERE id = $1".to_string(),
                parameter_types: vec![],
            },
            FrontendMessage::DescribeStatement {
                statement_name: "s1".to_string(),
            },
            FrontendMessage::Sync,
        ]);
        let Some(BackendMessage::ParameterDescription { parameter_types }) = out
            .iter()
            .find(|m| matches!(m, BackendMessage::ParameterDescription { .. }))
        else {
            panic!("expected ParameterDescription");
        };
        assert_eq!(parameter_types.len(), 1);
        let Some(BackendMessage::RowDescription { fields }) = out
            .iter()
            .find(|m| matches!(m, BackendMessage::RowDescription { .. }))
        else {
            panic!("expected RowDescription");
        };
        assert_eq!(fields[0].type_oid, 23);
        assert_eq!(fields[1].type_oid, 25);
    }

    #[test]
    fn errors_in_extended_mode_skip_until_sync() {
        let mut session = session();
        let out = session.run_sync([
            FrontendMessage::Parse {
                statement_name: String::new(),
                query: "SELECT FROM WHERE".to_string(),
                parameter_types: vec![],
            },
            // Must be skipped: the pipeline is poisoned until Sync.
            FrontendMessage::Bind {
                portal_name: String::new(),
                statement_name: String::new(),
                param_formats: vec![],
                params: vec![],
                result_formats: vec![],
            },
            FrontendMessage::Sync,
        ]);
        assert!(matches!(out[0], BackendMessage::ErrorResponse { .. }));
        assert!(!out.iter().any(|m| matches!(m, BackendMessage::BindComplete)));
        assert!(matches!(
            out.last(),
            Some(BackendMessage::ReadyForQuery)
        ));
    }

    #[test]
    fn type_mismatch_aborts_statement_without_partial_write() {
        let mut session = session();
        let out = session.run_sync([
            query("INSERT INTO u (id) VALUES (1)"),
            query("INSERT INTO u (id) VALUES ('x')"),
            query("SELECT * FROM u"),
        ]);
        assert!(out.iter().any(|m| matches!(
            m,
            BackendMessage::ErrorResponse { message, .. } if message.contains("type mismatch")
        )));
        assert_eq!(data_rows(&out), vec![vec![Some("1".to_string())]]);
    }

    #[test]
    fn sql_level_prepare_execute_deallocate() {
        let mut session = session();
        let out = session.run_sync([
            query("CREATE TABLE t (id int, name text)"),
            query("INSERT INTO t VALUES (1, 'a'), (2, 'b')"),
            query("PREPARE getname AS SELECT name FROM t WHERE id = $1"),
            query("EXECUTE getname(2)"),
            query("DEALLOCATE getname"),
            query("EXECUTE getname(2)"),
        ]);
        assert!(command_tags(&out).contains(&"PREPARE".to_string()));
        assert_eq!(data_rows(&out), vec![vec![Some("b".to_string())]]);
        // The final EXECUTE fails: the statement was deallocated.
        assert!(out.iter().any(|m| matches!(
            m,
            BackendMessage::ErrorResponse { message, .. } if message.contains("does not exist")
        )));
    }

    #[test]
    fn empty_query_gets_empty_query_response() {
        let mut session = session();
        let out = session.run_sync([query("   ")]);
        assert!(matches!(out[0], BackendMessage::EmptyQueryResponse));
        assert!(matches!(out[1], BackendMessage::ReadyForQuery));
    }

    #[test]
    fn query_text_substitution_quotes_strings_only() {
        let substituted = substitute_query_text(
            "SELECT * FROM t WHERE name = $1 AND id = $2 OFFSET $10",
            &[
                Some("O'Brien".to_string()),
                Some("5".to_string()),
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                Some("3".to_string()),
            ],
            &[25, 23, 0, 0, 0, 0, 0, 0, 0, 20],
        );
        assert_eq!(
            substituted,
            "SELECT * FROM t WHERE name = 'O''Brien' AND id = 5 OFFSET 3"
        );
    }
}
