//! Parse-tree node taxonomy. The executor consumes these nodes; it never
//! sees SQL text.

use crate::storage::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStmt),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    CreateTable(CreateStmt),
    DropTable(DropStmt),
    Prepare(PrepareStmt),
    Execute(ExecuteStmt),
    Deallocate(DeallocateStmt),
    /// A statement kind the engine does not execute (BEGIN, SET, SHOW, ...).
    /// Carries the leading word for the warning log.
    Unsupported { keyword: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub distinct: bool,
    pub targets: Vec<ResTarget>,
    pub from: Vec<FromItem>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    /// When present the select is a set operation and `targets`/`from` are
    /// empty; ORDER BY / LIMIT / OFFSET still apply to the combined result.
    pub set_op: Option<SetOperation>,
    pub order_by: Vec<SortBy>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

impl SelectStmt {
    pub fn plain() -> Self {
        Self {
            distinct: false,
            targets: Vec::new(),
            from: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            set_op: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetOperation {
    pub op: SetOpKind,
    pub all: bool,
    pub left: Box<SelectStmt>,
    pub right: Box<SelectStmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    Intersect,
    Except,
}

/// One entry of the target list: an expression plus an optional alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ResTarget {
    pub name: Option<String>,
    pub val: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table {
        name: String,
        alias: Option<String>,
    },
    Subquery {
        query: Box<SelectStmt>,
        alias: Option<String>,
    },
    Join(Box<JoinExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinExpr {
    pub kind: JoinType,
    pub left: FromItem,
    pub right: FromItem,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortBy {
    pub expr: Expr,
    pub direction: SortDirection,
    pub nulls: SortNulls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Default,
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortNulls {
    Default,
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateStmt {
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    /// Raw type name as written; mapping happens in the catalog.
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropStmt {
    pub tables: Vec<String>,
    pub if_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareStmt {
    pub name: String,
    pub statement: Box<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteStmt {
    pub name: String,
    pub params: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeallocateStmt {
    /// `None` means DEALLOCATE ALL.
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Dotted reference; fields hold each part, unquoted parts lowercased.
    ColumnRef { fields: Vec<String> },
    /// `*` in a target list.
    Star,
    /// `alias.*` in a target list.
    QualifiedStar { table: String },
    /// A literal constant, including NULL.
    AConst(Value),
    /// `$N` placeholder (1-based). Survives only inside prepared statements.
    Param(i32),
    AExpr {
        kind: AExprKind,
        /// Operator name for `Op`/`Like` kinds: `=`, `<>`, `+`, `||`, `~~`, ...
        op: String,
        lexpr: Option<Box<Expr>>,
        rexpr: Option<Box<Expr>>,
        /// IN lists and BETWEEN bounds.
        rlist: Vec<Expr>,
    },
    BoolExpr {
        op: BoolOp,
        args: Vec<Expr>,
    },
    NullTest {
        arg: Box<Expr>,
        negated: bool,
    },
    FuncCall {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
        star_arg: bool,
    },
    SubLink {
        kind: SubLinkKind,
        /// Probe expression for ANY/ALL links.
        test: Option<Box<Expr>>,
        /// Comparison operator for ANY/ALL links (defaults to `=`).
        op: Option<String>,
        query: Box<SelectStmt>,
    },
    CoalesceExpr {
        args: Vec<Expr>,
    },
    CaseExpr {
        operand: Option<Box<Expr>>,
        whens: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        type_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AExprKind {
    /// Plain binary operator, `op` names it.
    Op,
    /// LIKE family; `op` is one of `~~`, `!~~`, `~~*`, `!~~*`.
    Like,
    In,
    NotIn,
    Between,
    NotBetween,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubLinkKind {
    Exists,
    Any,
    All,
    Scalar,
}

impl Expr {
    pub fn column(parts: &[&str]) -> Self {
        Self::ColumnRef {
            fields: parts.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn binary(op: &str, left: Expr, right: Expr) -> Self {
        Self::AExpr {
            kind: AExprKind::Op,
            op: op.to_string(),
            lexpr: Some(Box::new(left)),
            rexpr: Some(Box::new(right)),
            rlist: Vec::new(),
        }
    }
}
