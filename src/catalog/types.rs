use std::fmt;

use crate::storage::Value;
use crate::utils::datetime::parse_timestamp_text;

/// Column types form a small lattice: `Unknown` sits at the bottom and is
/// replaced by the first confirmed type; `Integer` widens to `Float`; every
/// other transition is a mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Unknown,
    Boolean,
    Integer,
    Float,
    String,
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Timestamp => "timestamp",
        };
        write!(f, "{}", name)
    }
}

impl ColumnType {
    /// Whether a column currently typed `self` accepts a value of `new`.
    pub fn accepts(self, new: ColumnType) -> bool {
        if self == ColumnType::Unknown || self == new {
            return true;
        }
        self == ColumnType::Integer && new == ColumnType::Float
    }

    /// The type the column holds after accepting `new`.
    pub fn promote(self, new: ColumnType) -> ColumnType {
        if self == ColumnType::Unknown {
            return new;
        }
        if self == ColumnType::Integer && new == ColumnType::Float {
            return ColumnType::Float;
        }
        self
    }

    /// PostgreSQL type OID reported in RowDescription fields.
    pub fn type_oid(self) -> u32 {
        match self {
            Self::Boolean => 16,
            Self::Integer => 23,
            Self::Float => 701,
            Self::Timestamp => 1114,
            Self::String | Self::Unknown => 25,
        }
    }

    pub fn type_size(self) -> i16 {
        match self {
            Self::Boolean => 1,
            Self::Integer => 4,
            Self::Float => 8,
            Self::Timestamp => 8,
            Self::String | Self::Unknown => -1,
        }
    }
}

/// Runtime type inference. Strings that parse as timestamps infer
/// `Timestamp`; other strings stay strings (no numeric sniffing).
pub fn infer_type(value: &Value) -> ColumnType {
    match value {
        Value::Null => ColumnType::Unknown,
        Value::Bool(_) => ColumnType::Boolean,
        Value::Int(_) => ColumnType::Integer,
        Value::Float(_) => ColumnType::Float,
        Value::Timestamp(_) => ColumnType::Timestamp,
        Value::Text(text) => {
            if parse_timestamp_text(text).is_some() {
                ColumnType::Timestamp
            } else {
                ColumnType::String
            }
        }
    }
}

/// CREATE TABLE type-name mapping. Names outside the known set default to
/// `String`, which keeps unknown types usable in a schema-less world.
pub fn type_from_sql_name(name: &str) -> ColumnType {
    match name.to_ascii_lowercase().as_str() {
        "bool" | "boolean" => ColumnType::Boolean,
        "int" | "int2" | "int4" | "int8" | "integer" | "smallint" | "bigint" => {
            ColumnType::Integer
        }
        "float" | "float4" | "float8" | "real" | "double" | "double precision" | "numeric"
        | "decimal" => ColumnType::Float,
        "timestamp" | "timestamptz" | "date" | "time" | "timetz" => ColumnType::Timestamp,
        "text" | "varchar" | "char" | "bpchar" => ColumnType::String,
        _ => ColumnType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_accepts_everything() {
        for t in [
            ColumnType::Boolean,
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::String,
            ColumnType::Timestamp,
        ] {
            assert!(ColumnType::Unknown.accepts(t));
            assert_eq!(ColumnType::Unknown.promote(t), t);
        }
    }

    #[test]
    fn integer_widens_to_float_only() {
        assert!(ColumnType::Integer.accepts(ColumnType::Float));
        assert_eq!(
            ColumnType::Integer.promote(ColumnType::Float),
            ColumnType::Float
        );
        assert!(!ColumnType::Float.accepts(ColumnType::Integer));
        assert!(!ColumnType::Integer.accepts(ColumnType::String));
        assert!(!ColumnType::String.accepts(ColumnType::Integer));
    }

    #[test]
    fn timestamp_strings_infer_timestamp() {
        assert_eq!(
            infer_type(&Value::Text("2024-05-01 12:30:45".into())),
            ColumnType::Timestamp
        );
        assert_eq!(
            infer_type(&Value::Text("2024-05-01T12:30:45Z".into())),
            ColumnType::Timestamp
        );
        assert_eq!(infer_type(&Value::Text("42".into())), ColumnType::String);
        assert_eq!(infer_type(&Value::Null), ColumnType::Unknown);
    }

    #[test]
    fn create_table_names_map_to_lattice_types() {
        assert_eq!(type_from_sql_name("BIGINT"), ColumnType::Integer);
        assert_eq!(type_from_sql_name("numeric"), ColumnType::Float);
        assert_eq!(type_from_sql_name("bpchar"), ColumnType::String);
        assert_eq!(type_from_sql_name("timetz"), ColumnType::Timestamp);
        assert_eq!(type_from_sql_name("geometry"), ColumnType::String);
    }
}
