use std::fmt;

use crate::parser::ast::{
    AExprKind, BoolOp, ColumnDef, CreateStmt, DeallocateStmt, DeleteStmt, DropStmt, ExecuteStmt,
    Expr, FromItem, InsertStmt, JoinExpr, JoinType, PrepareStmt, ResTarget, SelectStmt,
    SetOpKind, SetOperation, SortBy, SortDirection, SortNulls, Statement, SubLinkKind,
    UpdateStmt,
};
use crate::parser::lexer::{lex_sql, Keyword, LexError, Token, TokenKind};
use crate::storage::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(value: LexError) -> Self {
        Self {
            message: value.message,
            position: value.position,
        }
    }
}

/// Parses the first statement in `sql`. Trailing statements after a
/// semicolon are ignored; the gateway executes one statement per call and
/// the CLI splits beforehand.
pub fn parse_statement(sql: &str) -> Result<Statement, ParseError> {
    let tokens = lex_sql(sql)?;
    let mut parser = Parser::new(tokens);
    if parser.at_eof() {
        return Ok(Statement::Unsupported {
            keyword: String::new(),
        });
    }
    let stmt = parser.parse_top_level_statement()?;
    Ok(stmt)
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, idx: 0 }
    }

    fn parse_top_level_statement(&mut self) -> Result<Statement, ParseError> {
        if self.peek_keyword(Keyword::Select) || matches!(self.current_kind(), TokenKind::LParen) {
            let query = self.parse_query()?;
            self.finish_statement()?;
            return Ok(Statement::Select(query));
        }
        if self.consume_keyword(Keyword::Insert) {
            let stmt = self.parse_insert_statement()?;
            self.finish_statement()?;
            return Ok(stmt);
        }
        if self.consume_keyword(Keyword::Update) {
            let stmt = self.parse_update_statement()?;
            self.finish_statement()?;
            return Ok(stmt);
        }
        if self.consume_keyword(Keyword::Delete) {
            let stmt = self.parse_delete_statement()?;
            self.finish_statement()?;
            return Ok(stmt);
        }
        if self.peek_keyword(Keyword::Create) && self.peek_nth_keyword(1, Keyword::Table) {
            self.advance();
            self.advance();
            let stmt = self.parse_create_table_statement()?;
            self.finish_statement()?;
            return Ok(stmt);
        }
        if self.peek_keyword(Keyword::Drop) && self.peek_nth_keyword(1, Keyword::Table) {
            self.advance();
            self.advance();
            let stmt = self.parse_drop_table_statement()?;
            self.finish_statement()?;
            return Ok(stmt);
        }
        if self.consume_keyword(Keyword::Prepare) {
            let stmt = self.parse_prepare_statement()?;
            self.finish_statement()?;
            return Ok(stmt);
        }
        if self.consume_keyword(Keyword::Execute) {
            let stmt = self.parse_execute_statement()?;
            self.finish_statement()?;
            return Ok(stmt);
        }
        if self.consume_keyword(Keyword::Deallocate) {
            let stmt = self.parse_deallocate_statement()?;
            self.finish_statement()?;
            return Ok(stmt);
        }

        // Anything else (BEGIN, SET, SHOW, ...) is accepted but not executed.
        let keyword = match self.current_kind() {
            TokenKind::Keyword(k) => format!("{:?}", k).to_ascii_uppercase(),
            TokenKind::Identifier(name) => name.to_ascii_uppercase(),
            other => format!("{:?}", other),
        };
        while !self.at_eof() {
            self.advance();
        }
        Ok(Statement::Unsupported { keyword })
    }

    /// Consumes trailing semicolons; anything after the first statement is
    /// ignored, matching the one-statement-per-call gateway contract.
    fn finish_statement(&mut self) -> Result<(), ParseError> {
        if self.consume_if(|k| matches!(k, TokenKind::Semicolon)) {
            while !self.at_eof() {
                self.advance();
            }
            return Ok(());
        }
        if self.at_eof() {
            return Ok(());
        }
        Err(self.error_at_current("unexpected input after statement"))
    }

    // ---- queries ----

    fn parse_query(&mut self) -> Result<SelectStmt, ParseError> {
        let mut query = self.parse_set_expr(0)?;

        if self.consume_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By, "expected BY after ORDER")?;
            query.order_by = self.parse_order_by_list()?;
        }
        if self.consume_keyword(Keyword::Limit) {
            if self.consume_keyword(Keyword::All) {
                query.limit = None;
            } else {
                query.limit = Some(self.parse_expr()?);
            }
        }
        if self.consume_keyword(Keyword::Offset) {
            query.offset = Some(self.parse_expr()?);
        }
        Ok(query)
    }

    fn parse_set_expr(&mut self, min_bp: u8) -> Result<SelectStmt, ParseError> {
        let mut lhs = self.parse_select_term()?;

        loop {
            let (op, l_bp, r_bp) = match self.current_kind() {
                TokenKind::Keyword(Keyword::Union) => (SetOpKind::Union, 1, 2),
                TokenKind::Keyword(Keyword::Except) => (SetOpKind::Except, 1, 2),
                TokenKind::Keyword(Keyword::Intersect) => (SetOpKind::Intersect, 3, 4),
                _ => break,
            };
            if l_bp < min_bp {
                break;
            }
            self.advance();
            let all = if self.consume_keyword(Keyword::All) {
                true
            } else {
                self.consume_keyword(Keyword::Distinct);
                false
            };
            let rhs = self.parse_set_expr(r_bp)?;

            let mut combined = SelectStmt::plain();
            combined.set_op = Some(SetOperation {
                op,
                all,
                left: Box::new(lhs),
                right: Box::new(rhs),
            });
            lhs = combined;
        }

        Ok(lhs)
    }

    fn parse_select_term(&mut self) -> Result<SelectStmt, ParseError> {
        if self.consume_keyword(Keyword::Select) {
            return self.parse_select_core();
        }
        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            let inner = self.parse_query()?;
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' to close subquery",
            )?;
            return Ok(inner);
        }
        Err(self.error_at_current("expected SELECT"))
    }

    fn parse_select_core(&mut self) -> Result<SelectStmt, ParseError> {
        let mut stmt = SelectStmt::plain();

        if self.consume_keyword(Keyword::Distinct) {
            stmt.distinct = true;
        } else {
            self.consume_keyword(Keyword::All);
        }

        stmt.targets.push(self.parse_target_item()?);
        while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
            stmt.targets.push(self.parse_target_item()?);
        }

        if self.consume_keyword(Keyword::From) {
            stmt.from.push(self.parse_table_expression()?);
            while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                stmt.from.push(self.parse_table_expression()?);
            }
        }

        if self.consume_keyword(Keyword::Where) {
            stmt.where_clause = Some(self.parse_expr()?);
        }

        if self.consume_keyword(Keyword::Group) {
            self.expect_keyword(Keyword::By, "expected BY after GROUP")?;
            stmt.group_by.push(self.parse_expr()?);
            while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                stmt.group_by.push(self.parse_expr()?);
            }
        }

        if self.consume_keyword(Keyword::Having) {
            stmt.having = Some(self.parse_expr()?);
        }

        Ok(stmt)
    }

    fn parse_target_item(&mut self) -> Result<ResTarget, ParseError> {
        if self.consume_if(|k| matches!(k, TokenKind::Star)) {
            return Ok(ResTarget {
                name: None,
                val: Expr::Star,
            });
        }

        let val = self.parse_expr()?;

        // `alias.*` arrives as a ColumnRef followed by `.*`.
        let val = if matches!(self.current_kind(), TokenKind::Dot)
            && self
                .peek_nth_kind(1)
                .is_some_and(|k| matches!(k, TokenKind::Star))
        {
            let Expr::ColumnRef { fields } = &val else {
                return Err(self.error_at_current("unexpected '.*'"));
            };
            let table = fields.join(".");
            self.advance();
            self.advance();
            Expr::QualifiedStar { table }
        } else {
            val
        };

        let name = self.parse_optional_alias()?;
        Ok(ResTarget { name, val })
    }

    fn parse_optional_alias(&mut self) -> Result<Option<String>, ParseError> {
        if self.consume_keyword(Keyword::As) {
            return Ok(Some(self.parse_identifier()?));
        }
        if matches!(self.current_kind(), TokenKind::Identifier(_)) {
            return Ok(Some(self.parse_identifier()?));
        }
        Ok(None)
    }

    // ---- FROM ----

    fn parse_table_expression(&mut self) -> Result<FromItem, ParseError> {
        let mut left = self.parse_table_factor()?;

        loop {
            if self.consume_keyword(Keyword::Cross) {
                self.expect_keyword(Keyword::Join, "expected JOIN after CROSS")?;
                let right = self.parse_table_factor()?;
                left = FromItem::Join(Box::new(JoinExpr {
                    kind: JoinType::Cross,
                    left,
                    right,
                    on: None,
                }));
                continue;
            }

            let kind = if self.consume_keyword(Keyword::Left) {
                self.consume_keyword(Keyword::Outer);
                Some(JoinType::Left)
            } else if self.consume_keyword(Keyword::Right) {
                self.consume_keyword(Keyword::Outer);
                Some(JoinType::Right)
            } else if self.consume_keyword(Keyword::Full) {
                self.consume_keyword(Keyword::Outer);
                Some(JoinType::Full)
            } else if self.consume_keyword(Keyword::Inner) || self.peek_keyword(Keyword::Join) {
                Some(JoinType::Inner)
            } else {
                None
            };

            let Some(kind) = kind else {
                break;
            };

            self.expect_keyword(Keyword::Join, "expected JOIN in join clause")?;
            let right = self.parse_table_factor()?;
            let on = if self.consume_keyword(Keyword::On) {
                Some(self.parse_expr()?)
            } else {
                None
            };

            left = FromItem::Join(Box::new(JoinExpr {
                kind,
                left,
                right,
                on,
            }));
        }

        Ok(left)
    }

    fn parse_table_factor(&mut self) -> Result<FromItem, ParseError> {
        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            if self.current_starts_query() {
                let query = self.parse_query()?;
                self.expect_token(
                    |k| matches!(k, TokenKind::RParen),
                    "expected ')' to close subquery in FROM",
                )?;
                let alias = self.parse_optional_alias()?;
                return Ok(FromItem::Subquery {
                    query: Box::new(query),
                    alias,
                });
            }
            let inner = self.parse_table_expression()?;
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' to close table expression",
            )?;
            return Ok(inner);
        }

        let name = self.parse_identifier()?;
        let alias = self.parse_optional_alias()?;
        Ok(FromItem::Table { name, alias })
    }

    // ---- ORDER BY ----

    fn parse_order_by_list(&mut self) -> Result<Vec<SortBy>, ParseError> {
        let mut out = Vec::new();
        loop {
            let expr = self.parse_expr()?;
            let direction = if self.consume_keyword(Keyword::Asc) {
                SortDirection::Asc
            } else if self.consume_keyword(Keyword::Desc) {
                SortDirection::Desc
            } else {
                SortDirection::Default
            };
            let nulls = if self.consume_keyword(Keyword::Nulls) {
                if self.consume_keyword(Keyword::First) {
                    SortNulls::First
                } else {
                    self.expect_keyword(Keyword::Last, "expected FIRST or LAST after NULLS")?;
                    SortNulls::Last
                }
            } else {
                SortNulls::Default
            };
            out.push(SortBy {
                expr,
                direction,
                nulls,
            });
            if !self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                break;
            }
        }
        Ok(out)
    }

    // ---- DML / DDL ----

    fn parse_insert_statement(&mut self) -> Result<Statement, ParseError> {
        self.expect_keyword(Keyword::Into, "expected INTO after INSERT")?;
        let table = self.parse_identifier()?;

        let mut columns = Vec::new();
        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            columns.push(self.parse_identifier()?);
            while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                columns.push(self.parse_identifier()?);
            }
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' after column list",
            )?;
        }

        self.expect_keyword(Keyword::Values, "expected VALUES in INSERT")?;
        let mut values = Vec::new();
        loop {
            self.expect_token(|k| matches!(k, TokenKind::LParen), "expected '(' in VALUES")?;
            let mut tuple = Vec::new();
            tuple.push(self.parse_expr()?);
            while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                tuple.push(self.parse_expr()?);
            }
            self.expect_token(|k| matches!(k, TokenKind::RParen), "expected ')' in VALUES")?;
            values.push(tuple);
            if !self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                break;
            }
        }

        Ok(Statement::Insert(InsertStmt {
            table,
            columns,
            values,
        }))
    }

    fn parse_update_statement(&mut self) -> Result<Statement, ParseError> {
        let table = self.parse_identifier()?;
        self.expect_keyword(Keyword::Set, "expected SET after UPDATE table")?;

        let mut assignments = Vec::new();
        loop {
            let column = self.parse_identifier()?;
            self.expect_token(
                |k| matches!(k, TokenKind::Equal),
                "expected '=' in SET assignment",
            )?;
            let value = self.parse_expr()?;
            assignments.push((column, value));
            if !self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                break;
            }
        }

        let where_clause = if self.consume_keyword(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(Statement::Update(UpdateStmt {
            table,
            assignments,
            where_clause,
        }))
    }

    fn parse_delete_statement(&mut self) -> Result<Statement, ParseError> {
        self.expect_keyword(Keyword::From, "expected FROM after DELETE")?;
        let table = self.parse_identifier()?;
        let where_clause = if self.consume_keyword(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::Delete(DeleteStmt {
            table,
            where_clause,
        }))
    }

    fn parse_create_table_statement(&mut self) -> Result<Statement, ParseError> {
        let if_not_exists = if self.consume_keyword(Keyword::If) {
            self.expect_keyword(Keyword::Not, "expected NOT after IF")?;
            self.expect_keyword(Keyword::Exists, "expected EXISTS after IF NOT")?;
            true
        } else {
            false
        };
        let table = self.parse_identifier()?;

        let mut columns = Vec::new();
        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            loop {
                let name = self.parse_identifier()?;
                let type_name = self.parse_optional_type_name()?;
                columns.push(ColumnDef { name, type_name });
                // Column constraints (NOT NULL, PRIMARY KEY, ...) are
                // tolerated and ignored.
                self.skip_to_column_boundary();
                if !self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                    break;
                }
            }
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' after column definitions",
            )?;
        }

        Ok(Statement::CreateTable(CreateStmt {
            table,
            columns,
            if_not_exists,
        }))
    }

    fn parse_optional_type_name(&mut self) -> Result<Option<String>, ParseError> {
        let TokenKind::Identifier(first) = self.current_kind() else {
            return Ok(None);
        };
        let mut name = first.clone();
        self.advance();
        if name == "double" {
            if let TokenKind::Identifier(second) = self.current_kind() {
                if second == "precision" {
                    name.push(' ');
                    name.push_str(second);
                    self.advance();
                }
            }
        }
        // Length arguments like varchar(10) or numeric(8,2) are discarded.
        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            let mut depth = 1;
            while depth > 0 && !self.at_eof() {
                match self.current_kind() {
                    TokenKind::LParen => depth += 1,
                    TokenKind::RParen => depth -= 1,
                    _ => {}
                }
                self.advance();
            }
        }
        Ok(Some(name))
    }

    fn skip_to_column_boundary(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.current_kind() {
                TokenKind::Eof => return,
                TokenKind::LParen => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RParen => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    self.advance();
                }
                TokenKind::Comma if depth == 0 => return,
                _ => self.advance(),
            }
        }
    }

    fn parse_drop_table_statement(&mut self) -> Result<Statement, ParseError> {
        let if_exists = if self.consume_keyword(Keyword::If) {
            self.expect_keyword(Keyword::Exists, "expected EXISTS after IF")?;
            true
        } else {
            false
        };
        let mut tables = vec![self.parse_identifier()?];
        while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
            tables.push(self.parse_identifier()?);
        }
        Ok(Statement::DropTable(DropStmt { tables, if_exists }))
    }

    fn parse_prepare_statement(&mut self) -> Result<Statement, ParseError> {
        let name = self.parse_identifier()?;
        // An optional parameter type list is accepted and discarded.
        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            let mut depth = 1;
            while depth > 0 && !self.at_eof() {
                match self.current_kind() {
                    TokenKind::LParen => depth += 1,
                    TokenKind::RParen => depth -= 1,
                    _ => {}
                }
                self.advance();
            }
        }
        self.expect_keyword(Keyword::As, "expected AS in PREPARE")?;
        let statement = self.parse_top_level_statement()?;
        Ok(Statement::Prepare(PrepareStmt {
            name,
            statement: Box::new(statement),
        }))
    }

    fn parse_execute_statement(&mut self) -> Result<Statement, ParseError> {
        let name = self.parse_identifier()?;
        let mut params = Vec::new();
        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            if !self.consume_if(|k| matches!(k, TokenKind::RParen)) {
                params.push(self.parse_expr()?);
                while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                    params.push(self.parse_expr()?);
                }
                self.expect_token(
                    |k| matches!(k, TokenKind::RParen),
                    "expected ')' after EXECUTE parameters",
                )?;
            }
        }
        Ok(Statement::Execute(ExecuteStmt { name, params }))
    }

    fn parse_deallocate_statement(&mut self) -> Result<Statement, ParseError> {
        if self.consume_keyword(Keyword::All) {
            return Ok(Statement::Deallocate(DeallocateStmt { name: None }));
        }
        let name = self.parse_identifier()?;
        Ok(Statement::Deallocate(DeallocateStmt { name: Some(name) }))
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_expr_bp(0)
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_prefix_expr()?;

        loop {
            if matches!(self.current_kind(), TokenKind::Typecast) {
                let l_bp = 16;
                if l_bp < min_bp {
                    break;
                }
                self.advance();
                let type_name = self.parse_cast_type_name()?;
                lhs = Expr::Cast {
                    expr: Box::new(lhs),
                    type_name,
                };
                continue;
            }

            if self.peek_keyword(Keyword::Is) {
                let l_bp = 7;
                if l_bp < min_bp {
                    break;
                }
                self.advance();
                let negated = self.consume_keyword(Keyword::Not);
                self.expect_keyword(Keyword::Null, "expected NULL after IS")?;
                lhs = Expr::NullTest {
                    arg: Box::new(lhs),
                    negated,
                };
                continue;
            }

            let negated_postfix = self.peek_keyword(Keyword::Not)
                && (self.peek_nth_keyword(1, Keyword::In)
                    || self.peek_nth_keyword(1, Keyword::Between)
                    || self.peek_nth_keyword(1, Keyword::Like)
                    || self.peek_nth_keyword(1, Keyword::ILike));

            if negated_postfix || self.peek_keyword(Keyword::In) {
                let l_bp = 7;
                if l_bp < min_bp {
                    break;
                }
                if negated_postfix && self.peek_nth_keyword(1, Keyword::In) {
                    self.advance();
                    self.advance();
                    lhs = self.parse_in_expr(lhs, true)?;
                    continue;
                }
                if !negated_postfix && self.peek_keyword(Keyword::In) {
                    self.advance();
                    lhs = self.parse_in_expr(lhs, false)?;
                    continue;
                }
            }

            if negated_postfix || self.peek_keyword(Keyword::Between) {
                let l_bp = 7;
                if l_bp < min_bp {
                    break;
                }
                if negated_postfix && self.peek_nth_keyword(1, Keyword::Between) {
                    self.advance();
                    self.advance();
                    lhs = self.parse_between_expr(lhs, true)?;
                    continue;
                }
                if !negated_postfix && self.peek_keyword(Keyword::Between) {
                    self.advance();
                    lhs = self.parse_between_expr(lhs, false)?;
                    continue;
                }
            }

            if negated_postfix
                || self.peek_keyword(Keyword::Like)
                || self.peek_keyword(Keyword::ILike)
            {
                let l_bp = 7;
                if l_bp < min_bp {
                    break;
                }
                let negated = negated_postfix;
                if negated {
                    self.advance();
                }
                let case_insensitive = if self.consume_keyword(Keyword::Like) {
                    false
                } else {
                    self.expect_keyword(Keyword::ILike, "expected LIKE or ILIKE")?;
                    true
                };
                let pattern = self.parse_expr_bp(8)?;
                let op = match (negated, case_insensitive) {
                    (false, false) => "~~",
                    (true, false) => "!~~",
                    (false, true) => "~~*",
                    (true, true) => "!~~*",
                };
                lhs = Expr::AExpr {
                    kind: AExprKind::Like,
                    op: op.to_string(),
                    lexpr: Some(Box::new(lhs)),
                    rexpr: Some(Box::new(pattern)),
                    rlist: Vec::new(),
                };
                continue;
            }

            let Some((op, kind, l_bp, r_bp)) = self.current_binary_op() else {
                break;
            };
            if l_bp < min_bp {
                break;
            }
            self.advance();

            // AND / OR fold into BoolExpr nodes.
            if kind == BinaryOpClass::Bool {
                let bool_op = if op == "and" { BoolOp::And } else { BoolOp::Or };
                let rhs = self.parse_expr_bp(r_bp)?;
                lhs = Expr::BoolExpr {
                    op: bool_op,
                    args: vec![lhs, rhs],
                };
                continue;
            }

            // Comparison followed by ANY/ALL takes a subquery.
            if kind == BinaryOpClass::Comparison
                && (self.peek_keyword(Keyword::Any) || self.peek_keyword(Keyword::All))
            {
                let link_kind = if self.consume_keyword(Keyword::Any) {
                    SubLinkKind::Any
                } else {
                    self.expect_keyword(Keyword::All, "expected ANY or ALL")?;
                    SubLinkKind::All
                };
                self.expect_token(
                    |k| matches!(k, TokenKind::LParen),
                    "expected '(' after ANY/ALL",
                )?;
                if !self.current_starts_query() {
                    return Err(self.error_at_current("expected subquery after ANY/ALL"));
                }
                let query = self.parse_query()?;
                self.expect_token(
                    |k| matches!(k, TokenKind::RParen),
                    "expected ')' after ANY/ALL subquery",
                )?;
                lhs = Expr::SubLink {
                    kind: link_kind,
                    test: Some(Box::new(lhs)),
                    op: Some(op),
                    query: Box::new(query),
                };
                continue;
            }

            let rhs = self.parse_expr_bp(r_bp)?;
            lhs = Expr::AExpr {
                kind: AExprKind::Op,
                op,
                lexpr: Some(Box::new(lhs)),
                rexpr: Some(Box::new(rhs)),
                rlist: Vec::new(),
            };
        }

        Ok(lhs)
    }

    fn parse_in_expr(&mut self, lhs: Expr, negated: bool) -> Result<Expr, ParseError> {
        self.expect_token(|k| matches!(k, TokenKind::LParen), "expected '(' after IN")?;

        if self.current_starts_query() {
            let query = self.parse_query()?;
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' after IN subquery",
            )?;
            let link = Expr::SubLink {
                kind: SubLinkKind::Any,
                test: Some(Box::new(lhs)),
                op: Some("=".to_string()),
                query: Box::new(query),
            };
            if negated {
                return Ok(Expr::BoolExpr {
                    op: BoolOp::Not,
                    args: vec![link],
                });
            }
            return Ok(link);
        }

        let mut list = Vec::new();
        list.push(self.parse_expr()?);
        while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
            list.push(self.parse_expr()?);
        }
        self.expect_token(
            |k| matches!(k, TokenKind::RParen),
            "expected ')' after IN list",
        )?;

        Ok(Expr::AExpr {
            kind: if negated { AExprKind::NotIn } else { AExprKind::In },
            op: if negated { "<>" } else { "=" }.to_string(),
            lexpr: Some(Box::new(lhs)),
            rexpr: None,
            rlist: list,
        })
    }

    fn parse_between_expr(&mut self, lhs: Expr, negated: bool) -> Result<Expr, ParseError> {
        let low = self.parse_expr_bp(9)?;
        self.expect_keyword(Keyword::And, "expected AND in BETWEEN")?;
        let high = self.parse_expr_bp(9)?;
        Ok(Expr::AExpr {
            kind: if negated {
                AExprKind::NotBetween
            } else {
                AExprKind::Between
            },
            op: "between".to_string(),
            lexpr: Some(Box::new(lhs)),
            rexpr: None,
            rlist: vec![low, high],
        })
    }

    fn parse_prefix_expr(&mut self) -> Result<Expr, ParseError> {
        if self.consume_keyword(Keyword::Not) {
            let expr = self.parse_expr_bp(5)?;
            return Ok(Expr::BoolExpr {
                op: BoolOp::Not,
                args: vec![expr],
            });
        }
        if self.consume_if(|k| matches!(k, TokenKind::Minus)) {
            let expr = self.parse_expr_bp(15)?;
            // Fold a negated literal so `-1` stays an integer constant.
            return Ok(match expr {
                Expr::AConst(Value::Int(v)) => Expr::AConst(Value::Int(-v)),
                Expr::AConst(Value::Float(v)) => Expr::AConst(Value::Float(-v)),
                other => Expr::AExpr {
                    kind: AExprKind::Op,
                    op: "-".to_string(),
                    lexpr: Some(Box::new(Expr::AConst(Value::Int(0)))),
                    rexpr: Some(Box::new(other)),
                    rlist: Vec::new(),
                },
            });
        }
        if self.consume_if(|k| matches!(k, TokenKind::Plus)) {
            return self.parse_expr_bp(15);
        }
        if self.consume_keyword(Keyword::Case) {
            return self.parse_case_expr();
        }
        if self.consume_keyword(Keyword::Cast) {
            self.expect_token(|k| matches!(k, TokenKind::LParen), "expected '(' after CAST")?;
            let expr = self.parse_expr()?;
            self.expect_keyword(Keyword::As, "expected AS in CAST")?;
            let type_name = self.parse_cast_type_name()?;
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' to close CAST",
            )?;
            return Ok(Expr::Cast {
                expr: Box::new(expr),
                type_name,
            });
        }
        if self.consume_keyword(Keyword::Exists) {
            self.expect_token(
                |k| matches!(k, TokenKind::LParen),
                "expected '(' after EXISTS",
            )?;
            let query = self.parse_query()?;
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' after EXISTS subquery",
            )?;
            return Ok(Expr::SubLink {
                kind: SubLinkKind::Exists,
                test: None,
                op: None,
                query: Box::new(query),
            });
        }
        if self.consume_keyword(Keyword::Coalesce) {
            self.expect_token(
                |k| matches!(k, TokenKind::LParen),
                "expected '(' after COALESCE",
            )?;
            let mut args = Vec::new();
            args.push(self.parse_expr()?);
            while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                args.push(self.parse_expr()?);
            }
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' after COALESCE arguments",
            )?;
            return Ok(Expr::CoalesceExpr { args });
        }

        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            if self.current_starts_query() {
                let query = self.parse_query()?;
                self.expect_token(
                    |k| matches!(k, TokenKind::RParen),
                    "expected ')' after scalar subquery",
                )?;
                return Ok(Expr::SubLink {
                    kind: SubLinkKind::Scalar,
                    test: None,
                    op: None,
                    query: Box::new(query),
                });
            }
            let expr = self.parse_expr()?;
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' to close expression",
            )?;
            return Ok(expr);
        }

        match self.current_kind().clone() {
            TokenKind::Integer(v) => {
                self.advance();
                Ok(Expr::AConst(Value::Int(v)))
            }
            TokenKind::Float(text) => {
                self.advance();
                let value: f64 = text
                    .parse()
                    .map_err(|_| self.error_at_current("invalid numeric literal"))?;
                Ok(Expr::AConst(Value::Float(value)))
            }
            TokenKind::String(text) => {
                self.advance();
                Ok(Expr::AConst(Value::Text(text)))
            }
            TokenKind::Parameter(n) => {
                self.advance();
                Ok(Expr::Param(n))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::AConst(Value::Bool(true)))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::AConst(Value::Bool(false)))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::AConst(Value::Null))
            }
            TokenKind::Identifier(first) => {
                self.advance();
                // Function call?
                if matches!(self.current_kind(), TokenKind::LParen) {
                    return self.parse_function_call(first);
                }
                // Dotted reference, stopping short of a trailing `.*`.
                let mut fields = vec![first];
                while matches!(self.current_kind(), TokenKind::Dot)
                    && self
                        .peek_nth_kind(1)
                        .is_some_and(|k| matches!(k, TokenKind::Identifier(_)))
                {
                    self.advance();
                    fields.push(self.parse_identifier()?);
                }
                Ok(Expr::ColumnRef { fields })
            }
            _ => Err(self.error_at_current("expected expression")),
        }
    }

    fn parse_function_call(&mut self, name: String) -> Result<Expr, ParseError> {
        self.expect_token(
            |k| matches!(k, TokenKind::LParen),
            "expected '(' in function call",
        )?;

        if self.consume_if(|k| matches!(k, TokenKind::Star)) {
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' after '*'",
            )?;
            return Ok(Expr::FuncCall {
                name,
                args: Vec::new(),
                distinct: false,
                star_arg: true,
            });
        }

        let distinct = self.consume_keyword(Keyword::Distinct);
        let mut args = Vec::new();
        if !self.consume_if(|k| matches!(k, TokenKind::RParen)) {
            args.push(self.parse_expr()?);
            while self.consume_if(|k| matches!(k, TokenKind::Comma)) {
                args.push(self.parse_expr()?);
            }
            self.expect_token(
                |k| matches!(k, TokenKind::RParen),
                "expected ')' after function arguments",
            )?;
        }

        if name == "coalesce" {
            return Ok(Expr::CoalesceExpr { args });
        }

        Ok(Expr::FuncCall {
            name,
            args,
            distinct,
            star_arg: false,
        })
    }

    fn parse_case_expr(&mut self) -> Result<Expr, ParseError> {
        let operand = if self.peek_keyword(Keyword::When) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };

        let mut whens = Vec::new();
        while self.consume_keyword(Keyword::When) {
            let condition = self.parse_expr()?;
            self.expect_keyword(Keyword::Then, "expected THEN in CASE")?;
            let result = self.parse_expr()?;
            whens.push((condition, result));
        }
        if whens.is_empty() {
            return Err(self.error_at_current("CASE requires at least one WHEN"));
        }

        let else_expr = if self.consume_keyword(Keyword::Else) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_keyword(Keyword::End, "expected END to close CASE")?;

        Ok(Expr::CaseExpr {
            operand,
            whens,
            else_expr,
        })
    }

    fn parse_cast_type_name(&mut self) -> Result<String, ParseError> {
        let TokenKind::Identifier(first) = self.current_kind() else {
            return Err(self.error_at_current("expected type name"));
        };
        let mut name = first.clone();
        self.advance();
        if name == "double" {
            if let TokenKind::Identifier(second) = self.current_kind() {
                if second == "precision" {
                    name.push(' ');
                    name.push_str(second);
                    self.advance();
                }
            }
        }
        if self.consume_if(|k| matches!(k, TokenKind::LParen)) {
            let mut depth = 1;
            while depth > 0 && !self.at_eof() {
                match self.current_kind() {
                    TokenKind::LParen => depth += 1,
                    TokenKind::RParen => depth -= 1,
                    _ => {}
                }
                self.advance();
            }
        }
        Ok(name)
    }

    fn current_binary_op(&self) -> Option<(String, BinaryOpClass, u8, u8)> {
        let entry = match self.current_kind() {
            TokenKind::Keyword(Keyword::Or) => ("or", BinaryOpClass::Bool, 1, 2),
            TokenKind::Keyword(Keyword::And) => ("and", BinaryOpClass::Bool, 3, 4),
            TokenKind::Equal => ("=", BinaryOpClass::Comparison, 9, 10),
            TokenKind::NotEquals => ("<>", BinaryOpClass::Comparison, 9, 10),
            TokenKind::Less => ("<", BinaryOpClass::Comparison, 9, 10),
            TokenKind::LessEquals => ("<=", BinaryOpClass::Comparison, 9, 10),
            TokenKind::Greater => (">", BinaryOpClass::Comparison, 9, 10),
            TokenKind::GreaterEquals => (">=", BinaryOpClass::Comparison, 9, 10),
            TokenKind::Plus => ("+", BinaryOpClass::Arithmetic, 11, 12),
            TokenKind::Minus => ("-", BinaryOpClass::Arithmetic, 11, 12),
            TokenKind::Star => ("*", BinaryOpClass::Arithmetic, 13, 14),
            TokenKind::Slash => ("/", BinaryOpClass::Arithmetic, 13, 14),
            TokenKind::Percent => ("%", BinaryOpClass::Arithmetic, 13, 14),
            TokenKind::Operator(op) if op == "||" => ("||", BinaryOpClass::Arithmetic, 11, 12),
            TokenKind::Operator(op) if op == "~~" => ("~~", BinaryOpClass::Comparison, 9, 10),
            TokenKind::Operator(op) if op == "!~~" => ("!~~", BinaryOpClass::Comparison, 9, 10),
            TokenKind::Operator(op) if op == "~~*" => ("~~*", BinaryOpClass::Comparison, 9, 10),
            TokenKind::Operator(op) if op == "!~~*" => {
                ("!~~*", BinaryOpClass::Comparison, 9, 10)
            }
            _ => return None,
        };
        Some((entry.0.to_string(), entry.1, entry.2, entry.3))
    }

    /// A parenthesized group starts a query only if SELECT is what the
    /// parens eventually open onto; `((1))` stays an expression.
    fn current_starts_query(&self) -> bool {
        let mut offset = 0usize;
        loop {
            match self.peek_nth_kind(offset) {
                Some(TokenKind::LParen) => offset += 1,
                Some(TokenKind::Keyword(Keyword::Select)) => return true,
                _ => return false,
            }
        }
    }

    // ---- token plumbing ----

    fn parse_identifier(&mut self) -> Result<String, ParseError> {
        match self.current_kind() {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_at_current("expected identifier")),
        }
    }

    fn current_kind(&self) -> &TokenKind {
        self.tokens
            .get(self.idx)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_nth_kind(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.idx + offset).map(|t| &t.kind)
    }

    fn peek_keyword(&self, keyword: Keyword) -> bool {
        matches!(self.current_kind(), TokenKind::Keyword(k) if *k == keyword)
    }

    fn peek_nth_keyword(&self, offset: usize, keyword: Keyword) -> bool {
        matches!(self.peek_nth_kind(offset), Some(TokenKind::Keyword(k)) if *k == keyword)
    }

    fn consume_keyword(&mut self, keyword: Keyword) -> bool {
        if self.peek_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword, message: &str) -> Result<(), ParseError> {
        if self.consume_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn consume_if(&mut self, pred: impl Fn(&TokenKind) -> bool) -> bool {
        if pred(self.current_kind()) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_token(
        &mut self,
        pred: impl Fn(&TokenKind) -> bool,
        message: &str,
    ) -> Result<(), ParseError> {
        if self.consume_if(pred) {
            Ok(())
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn advance(&mut self) {
        if self.idx < self.tokens.len().saturating_sub(1) {
            self.idx += 1;
        }
    }

    fn at_eof(&self) -> bool {
        matches!(self.current_kind(), TokenKind::Eof)
    }

    fn error_at_current(&self, message: &str) -> ParseError {
        let position = self.tokens.get(self.idx).map(|t| t.start).unwrap_or(0);
        ParseError {
            message: message.to_string(),
            position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOpClass {
    Bool,
    Comparison,
    Arithmetic,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str) -> Statement {
        parse_statement(sql).expect("statement should parse")
    }

    fn parse_select(sql: &str) -> SelectStmt {
        match parse(sql) {
            Statement::Select(stmt) => stmt,
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn parses_basic_select() {
        let stmt = parse_select("SELECT name FROM t WHERE id = 2");
        assert_eq!(stmt.targets.len(), 1);
        assert_eq!(
            stmt.targets[0].val,
            Expr::column(&["name"])
        );
        assert!(matches!(&stmt.from[0], FromItem::Table { name, .. } if name == "t"));
        assert!(stmt.where_clause.is_some());
    }

    #[test]
    fn parses_join_with_aliases() {
        let stmt = parse_select("SELECT a.id, b.name FROM a LEFT JOIN b ON a.id = b.id");
        let FromItem::Join(join) = &stmt.from[0] else {
            panic!("expected join");
        };
        assert_eq!(join.kind, JoinType::Left);
        assert!(join.on.is_some());
    }

    #[test]
    fn parses_group_by_having_order_limit() {
        let stmt = parse_select(
            "SELECT dept, SUM(sal) s FROM e GROUP BY dept HAVING SUM(sal) > 100 ORDER BY s DESC LIMIT 10 OFFSET 2",
        );
        assert_eq!(stmt.group_by.len(), 1);
        assert!(stmt.having.is_some());
        assert_eq!(stmt.order_by.len(), 1);
        assert_eq!(stmt.order_by[0].direction, SortDirection::Desc);
        assert_eq!(stmt.limit, Some(Expr::AConst(Value::Int(10))));
        assert_eq!(stmt.offset, Some(Expr::AConst(Value::Int(2))));
    }

    #[test]
    fn parses_set_operations_with_precedence() {
        // INTERSECT binds tighter than UNION.
        let stmt = parse_select("SELECT a FROM t UNION SELECT b FROM u INTERSECT SELECT c FROM v");
        let set_op = stmt.set_op.expect("outer set op");
        assert_eq!(set_op.op, SetOpKind::Union);
        let right = set_op.right.set_op.as_ref().expect("inner set op");
        assert_eq!(right.op, SetOpKind::Intersect);
    }

    #[test]
    fn parses_insert_multi_row() {
        let Statement::Insert(stmt) = parse("INSERT INTO t (id, name) VALUES (1, 'a'), (2, 'b')")
        else {
            panic!("expected INSERT");
        };
        assert_eq!(stmt.table, "t");
        assert_eq!(stmt.columns, vec!["id", "name"]);
        assert_eq!(stmt.values.len(), 2);
    }

    #[test]
    fn parses_create_table_with_types_and_constraints() {
        let Statement::CreateTable(stmt) =
            parse("CREATE TABLE t (id int PRIMARY KEY, name varchar(20) NOT NULL, note text)")
        else {
            panic!("expected CREATE TABLE");
        };
        assert_eq!(stmt.table, "t");
        assert_eq!(stmt.columns.len(), 3);
        assert_eq!(stmt.columns[0].type_name.as_deref(), Some("int"));
        assert_eq!(stmt.columns[1].type_name.as_deref(), Some("varchar"));
    }

    #[test]
    fn parses_update_delete_drop() {
        assert!(matches!(
            parse("UPDATE t SET a = 1, b = 'x' WHERE c IS NULL"),
            Statement::Update(_)
        ));
        assert!(matches!(
            parse("DELETE FROM t WHERE id > 5"),
            Statement::Delete(_)
        ));
        let Statement::DropTable(drop) = parse("DROP TABLE IF EXISTS t, u") else {
            panic!("expected DROP TABLE");
        };
        assert!(drop.if_exists);
        assert_eq!(drop.tables, vec!["t", "u"]);
    }

    #[test]
    fn not_binds_looser_than_comparison() {
        let stmt = parse_select("SELECT 1 FROM t WHERE NOT a = 1");
        let Some(Expr::BoolExpr { op: BoolOp::Not, args }) = stmt.where_clause else {
            panic!("expected NOT at the top");
        };
        assert!(matches!(args[0], Expr::AExpr { .. }));
    }

    #[test]
    fn parses_in_list_and_subquery() {
        let stmt = parse_select("SELECT 1 FROM t WHERE id IN (1, 2, 3)");
        assert!(matches!(
            stmt.where_clause,
            Some(Expr::AExpr {
                kind: AExprKind::In,
                ..
            })
        ));

        let stmt = parse_select("SELECT 1 FROM t WHERE id NOT IN (SELECT id FROM s)");
        assert!(matches!(
            stmt.where_clause,
            Some(Expr::BoolExpr {
                op: BoolOp::Not,
                ..
            })
        ));
    }

    #[test]
    fn parses_case_and_coalesce() {
        let stmt =
            parse_select("SELECT CASE WHEN x > 0 THEN 'pos' ELSE 'neg' END, COALESCE(a, b, 0)");
        assert!(matches!(stmt.targets[0].val, Expr::CaseExpr { .. }));
        assert!(matches!(stmt.targets[1].val, Expr::CoalesceExpr { .. }));
    }

    #[test]
    fn parses_exists_and_scalar_subquery() {
        let stmt = parse_select("SELECT (SELECT MAX(id) FROM t) WHERE EXISTS (SELECT 1 FROM t)");
        assert!(matches!(
            stmt.targets[0].val,
            Expr::SubLink {
                kind: SubLinkKind::Scalar,
                ..
            }
        ));
        assert!(matches!(
            stmt.where_clause,
            Some(Expr::SubLink {
                kind: SubLinkKind::Exists,
                ..
            })
        ));
    }

    #[test]
    fn parses_order_by_modifiers() {
        let stmt = parse_select("SELECT a FROM t ORDER BY a DESC NULLS LAST, 2 ASC");
        assert_eq!(stmt.order_by[0].nulls, SortNulls::Last);
        assert_eq!(stmt.order_by[1].direction, SortDirection::Asc);
        assert_eq!(stmt.order_by[1].expr, Expr::AConst(Value::Int(2)));
    }

    #[test]
    fn parses_prepare_execute_deallocate() {
        let Statement::Prepare(prepare) = parse("PREPARE p AS SELECT * FROM t WHERE id = $1")
        else {
            panic!("expected PREPARE");
        };
        assert_eq!(prepare.name, "p");
        assert!(matches!(*prepare.statement, Statement::Select(_)));

        let Statement::Execute(execute) = parse("EXECUTE p(42)") else {
            panic!("expected EXECUTE");
        };
        assert_eq!(execute.params.len(), 1);

        assert!(matches!(
            parse("DEALLOCATE p"),
            Statement::Deallocate(DeallocateStmt { name: Some(_) })
        ));
    }

    #[test]
    fn unknown_statements_are_flagged_not_failed() {
        assert!(matches!(
            parse("BEGIN"),
            Statement::Unsupported { .. }
        ));
        assert!(matches!(
            parse("SET client_min_messages TO warning"),
            Statement::Unsupported { .. }
        ));
    }

    #[test]
    fn malformed_select_is_a_parse_error() {
        assert!(parse_statement("SELECT FROM WHERE").is_err());
        assert!(parse_statement("INSERT INTO t VALUES (1,").is_err());
    }

    #[test]
    fn parses_qualified_star() {
        let stmt = parse_select("SELECT a.*, b.id FROM a JOIN b ON a.id = b.id");
        assert!(matches!(
            &stmt.targets[0].val,
            Expr::QualifiedStar { table } if table == "a"
        ));
    }

    #[test]
    fn parses_casts() {
        let stmt = parse_select("SELECT CAST(x AS int), y::double precision FROM t");
        assert!(matches!(&stmt.targets[0].val, Expr::Cast { type_name, .. } if type_name == "int"));
        assert!(matches!(
            &stmt.targets[1].val,
            Expr::Cast { type_name, .. } if type_name == "double precision"
        ));
    }
}
