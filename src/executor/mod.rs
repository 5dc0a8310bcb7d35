pub mod exec_expr;
pub mod exec_main;
