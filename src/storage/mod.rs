pub mod tuple;

pub use tuple::{Relation, Row, Value};
