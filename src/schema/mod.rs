//! # Schema Module
//!
//! Table schemas, column definitions, and the dynamically-typed [`Value`]
//! that every row cell is made of.
//!
//! ## Design Invariants
//!
//! - A table has at most one primary-key column; primary-key columns are
//!   implicitly indexed.
//! - `auto_increment` applies only to integer columns.
//! - Columns marked `nullable = false` never hold [`Value::Null`] (enforced
//!   at the engine boundary, see `Engine::validate_row`).
//! - [`Value`] carries a total order so it can serve as a B-tree index key;
//!   cross-type query comparisons go through [`Value::loose_cmp`] instead,
//!   which attempts lossless numeric/string coercion before giving up.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by schema validation and value conversion.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A type tag read from disk does not map to any [`DataType`].
    #[error("Unknown data type tag: {0}")]
    UnknownTypeTag(u8),

    /// A JSON value could not be converted into the column's declared type.
    #[error("Cannot convert value to {expected:?}: {value}")]
    TypeMismatch {
        expected: DataType,
        value: String,
    },

    /// Schema-level constraint violation (duplicate primary key, bad column).
    #[error("Invalid schema: {0}")]
    Invalid(String),
}

// ------------------------------------------------------------------------------------------------
// DataType
// ------------------------------------------------------------------------------------------------

/// Closed set of column data types.
///
/// The discriminants are the on-disk type tags and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Int32 = 1,
    Int64 = 2,
    Float32 = 3,
    Float64 = 4,
    String = 5,
    Bytes = 6,
    Bool = 7,
    /// Milliseconds since the UNIX epoch.
    Timestamp = 8,
    /// Arbitrary nested JSON document.
    Json = 9,
    Null = 10,
    Array = 11,
}

impl DataType {
    /// The on-disk type tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Inverse of [`DataType::tag`].
    pub fn from_tag(tag: u8) -> Result<Self, SchemaError> {
        Ok(match tag {
            1 => Self::Int32,
            2 => Self::Int64,
            3 => Self::Float32,
            4 => Self::Float64,
            5 => Self::String,
            6 => Self::Bytes,
            7 => Self::Bool,
            8 => Self::Timestamp,
            9 => Self::Json,
            10 => Self::Null,
            11 => Self::Array,
            other => return Err(SchemaError::UnknownTypeTag(other)),
        })
    }

    /// Whether `auto_increment` may be declared on a column of this type.
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }
}

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// A dynamically-typed cell value.
///
/// Mirrors [`DataType`] variant-for-variant. Values are compared in two ways:
///
/// - [`Ord`] — a *total* order (type rank, then value; floats via
///   `total_cmp`) used by index structures that need strict ordering.
/// - [`Value::loose_cmp`] — query-level comparison that coerces between
///   numeric variants and numeric-looking strings, returning `None` when the
///   operands are incomparable.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    /// Milliseconds since the UNIX epoch.
    Timestamp(i64),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

/// A row is a named map of cell values.
pub type Row = BTreeMap<String, Value>;

impl Value {
    /// The [`DataType`] this value inhabits.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
            Value::Str(_) => DataType::String,
            Value::Bytes(_) => DataType::Bytes,
            Value::Bool(_) => DataType::Bool,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Json(_) => DataType::Json,
            Value::Array(_) => DataType::Array,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integral view of the value, if it has one without loss.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) | Value::Timestamp(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Floating view of the value, covering all numeric variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(f64::from(*v)),
            Value::Int64(v) | Value::Timestamp(v) => Some(*v as f64),
            Value::Float32(v) => Some(f64::from(*v)),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int32(_)
                | Value::Int64(_)
                | Value::Float32(_)
                | Value::Float64(_)
                | Value::Timestamp(_)
        )
    }

    /// Rank used by the total order; groups all numeric variants together so
    /// that `Int64(3) == Float64(3.0)` as an index key.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int32(_)
            | Value::Int64(_)
            | Value::Float32(_)
            | Value::Float64(_)
            | Value::Timestamp(_) => 2,
            Value::Str(_) => 3,
            Value::Bytes(_) => 4,
            Value::Json(_) => 5,
            Value::Array(_) => 6,
        }
    }

    /// Total-order comparison. Never fails; used for index keys and sorting.
    pub fn cmp_total(&self, other: &Value) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                    x.cmp(&y)
                } else {
                    let x = a.as_f64().unwrap_or(f64::NAN);
                    let y = b.as_f64().unwrap_or(f64::NAN);
                    x.total_cmp(&y)
                }
            }
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp_total(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }

    /// Query-level comparison with numeric/string coercion.
    ///
    /// Numeric comparisons against string values attempt lossless coercion
    /// both ways before giving up. Returns `None` for null operands or
    /// genuinely incomparable types; equality on null is always false except
    /// through the dedicated `IS NULL` operator.
    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        if self.is_numeric() && other.is_numeric() {
            return Some(self.cmp_total(other));
        }
        match (self, other) {
            (Value::Str(s), b) if b.is_numeric() => {
                parse_numeric(s).map(|v| v.cmp_total(b))
            }
            (a, Value::Str(s)) if a.is_numeric() => {
                parse_numeric(s).map(|v| a.cmp_total(&v))
            }
            (a, b) if a.type_rank() == b.type_rank() => Some(a.cmp_total(b)),
            _ => None,
        }
    }

    /// String rendering used by text operators (`LIKE`, `CONTAINS`, `REGEX`)
    /// and by the hash-index probe.
    pub fn display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) | Value::Timestamp(v) => v.to_string(),
            Value::Float32(v) => v.to_string(),
            Value::Float64(v) => v.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => {
                use base64::{Engine as _, engine::general_purpose::STANDARD};
                STANDARD.encode(b)
            }
            Value::Bool(b) => b.to_string(),
            Value::Json(j) => j.to_string(),
            Value::Array(a) => {
                let parts: Vec<String> = a.iter().map(Value::display_string).collect();
                format!("[{}]", parts.join(","))
            }
        }
    }

    /// Canonical byte string used to key hash buckets and dedupe sets.
    pub fn canonical_string(&self) -> String {
        format!("{}:{}", self.data_type().tag(), self.display_string())
    }

    /// Converts the value to its JSON wire representation.
    ///
    /// `Bytes` become standard base64 text since JSON has no binary type.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Int32(v) => J::from(*v),
            Value::Int64(v) | Value::Timestamp(v) => J::from(*v),
            Value::Float32(v) => J::from(f64::from(*v)),
            Value::Float64(v) => J::from(*v),
            Value::Str(s) => J::from(s.clone()),
            Value::Bytes(b) => {
                use base64::{Engine as _, engine::general_purpose::STANDARD};
                J::from(STANDARD.encode(b))
            }
            Value::Bool(b) => J::from(*b),
            Value::Json(j) => j.clone(),
            Value::Array(a) => J::Array(a.iter().map(Value::to_json).collect()),
        }
    }

    /// Converts a JSON value into this column type, coercing where lossless.
    pub fn from_json(json: &serde_json::Value, data_type: DataType) -> Result<Value, SchemaError> {
        use serde_json::Value as J;
        let mismatch = || SchemaError::TypeMismatch {
            expected: data_type,
            value: json.to_string(),
        };
        if json.is_null() {
            return Ok(Value::Null);
        }
        Ok(match data_type {
            DataType::Int32 => Value::Int32(
                json.as_i64()
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(mismatch)?,
            ),
            DataType::Int64 => Value::Int64(json.as_i64().ok_or_else(mismatch)?),
            DataType::Float32 => Value::Float32(json.as_f64().ok_or_else(mismatch)? as f32),
            DataType::Float64 => Value::Float64(json.as_f64().ok_or_else(mismatch)?),
            DataType::String => match json {
                J::String(s) => Value::Str(s.clone()),
                other => Value::Str(other.to_string()),
            },
            DataType::Bytes => {
                use base64::{Engine as _, engine::general_purpose::STANDARD};
                let s = json.as_str().ok_or_else(mismatch)?;
                Value::Bytes(STANDARD.decode(s).map_err(|_| mismatch())?)
            }
            DataType::Bool => Value::Bool(json.as_bool().ok_or_else(mismatch)?),
            DataType::Timestamp => Value::Timestamp(json.as_i64().ok_or_else(mismatch)?),
            DataType::Json => Value::Json(json.clone()),
            DataType::Null => Value::Null,
            DataType::Array => match json {
                J::Array(items) => {
                    Value::Array(items.iter().map(Value::from_json_untyped).collect())
                }
                _ => return Err(mismatch()),
            },
        })
    }

    /// Converts a JSON value without a declared column type, inferring the
    /// widest matching variant (`Int64`, `Float64`, `Str`, ...).
    pub fn from_json_untyped(json: &serde_json::Value) -> Value {
        use serde_json::Value as J;
        match json {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int64(i)
                } else {
                    Value::Float64(n.as_f64().unwrap_or(0.0))
                }
            }
            J::String(s) => Value::Str(s.clone()),
            J::Array(items) => Value::Array(items.iter().map(Value::from_json_untyped).collect()),
            J::Object(_) => Value::Json(json.clone()),
        }
    }
}

/// Lossless parse of a numeric-looking string, preferring integers.
fn parse_numeric(s: &str) -> Option<Value> {
    if s.contains('.') {
        s.parse::<f64>().ok().map(Value::Float64)
    } else {
        s.parse::<i64>().ok().map(Value::Int64)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_total(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp_total(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_total(other)
    }
}

// ------------------------------------------------------------------------------------------------
// Row helpers
// ------------------------------------------------------------------------------------------------

/// Serializes a row into a JSON object for wire transport and WAL payloads.
pub fn row_to_json(row: &Row) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = row
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    serde_json::Value::Object(map)
}

/// Inverse of [`row_to_json`] without schema knowledge.
pub fn row_from_json(json: &serde_json::Value) -> Row {
    match json {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json_untyped(v)))
            .collect(),
        _ => Row::new(),
    }
}

// ------------------------------------------------------------------------------------------------
// Column / TableSchema
// ------------------------------------------------------------------------------------------------

/// One column definition inside a [`TableSchema`].
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub default: Option<Value>,
    pub indexed: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub compressed: bool,
}

impl Column {
    /// A nullable, unindexed, compressed column — the common case.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
            indexed: false,
            unique: false,
            primary_key: false,
            auto_increment: false,
            compressed: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self.indexed = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Schema of one table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Option<String>,
    pub index_columns: Vec<String>,
    /// Column whose value is the tenant identifier used for cluster routing;
    /// `None` means the table is local-only.
    pub partition_key: Option<String>,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
}

impl TableSchema {
    /// Builds and validates a schema.
    ///
    /// Validation: at most one primary key, `auto_increment` only on integer
    /// columns, `partition_key` must name an existing column. Primary-key and
    /// `indexed` columns populate `index_columns`.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        partition_key: Option<String>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let pks: Vec<&Column> = columns.iter().filter(|c| c.primary_key).collect();
        if pks.len() > 1 {
            return Err(SchemaError::Invalid(format!(
                "table '{name}' declares {} primary keys",
                pks.len()
            )));
        }
        for col in &columns {
            if col.auto_increment && !col.data_type.is_integer() {
                return Err(SchemaError::Invalid(format!(
                    "auto_increment column '{}' must be an integer type",
                    col.name
                )));
            }
        }
        if let Some(pk) = &partition_key
            && !columns.iter().any(|c| &c.name == pk)
        {
            return Err(SchemaError::Invalid(format!(
                "partition key '{pk}' is not a column of table '{name}'"
            )));
        }
        let primary_key = pks.first().map(|c| c.name.clone());
        let index_columns = columns
            .iter()
            .filter(|c| c.indexed || c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        Ok(Self {
            name,
            columns,
            primary_key,
            index_columns,
            partition_key,
            created_at: now_millis(),
        })
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
