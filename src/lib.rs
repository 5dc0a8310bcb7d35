#![allow(
    clippy::needless_pass_by_value,
    clippy::large_enum_variant,
    clippy::match_like_matches_macro,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]

pub mod catalog;
pub mod executor;
pub mod parser;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod tcop;
pub mod utils;
