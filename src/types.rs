//! Core type definitions
//!
//! Includes statement argument values, field formats, charset and length
//! facts about columns, and decoded result rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DbError;

// ============================================================================
// Statement arguments
// ============================================================================

/// A value substituted into a statement template or written to a column
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    /// Table or column name
    ///
    /// Escaped as an identifier in `%i` slots. Any other slot treats it as
    /// plain text.
    Identifier(String),
}

impl Value {
    /// Create an identifier value
    pub fn ident(name: impl Into<String>) -> Self {
        Value::Identifier(name.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Identifier(s) => Some(s),
            _ => None,
        }
    }

    /// String form used when a value has to be rendered as text
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) | Value::Identifier(s) => s.clone(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Build a `Vec<Value>` from heterogeneous arguments
///
/// ```
/// use filmometre::{values, Value};
///
/// let args = values!["tt0133093", 8, 7.5];
/// assert_eq!(args[1], Value::Int(8));
/// ```
#[macro_export]
macro_rules! values {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($arg)),+]
    };
}

// ============================================================================
// Field formats
// ============================================================================

/// Placeholder used for a column value by the CRUD helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldFormat {
    /// `%d`
    Int,
    /// `%f`
    Float,
    /// `%s`
    Str,
}

impl FieldFormat {
    pub fn placeholder(&self) -> &'static str {
        match self {
            FieldFormat::Int => "%d",
            FieldFormat::Float => "%f",
            FieldFormat::Str => "%s",
        }
    }

    /// Numeric formats never carry an encoding, so they skip charset lookups
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldFormat::Int | FieldFormat::Float)
    }
}

impl FromStr for FieldFormat {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "%d" => Ok(FieldFormat::Int),
            "%f" | "%F" => Ok(FieldFormat::Float),
            "%s" => Ok(FieldFormat::Str),
            other => Err(DbError::validation(format!(
                "Unsupported field format '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for FieldFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.placeholder())
    }
}

// ============================================================================
// Column metadata
// ============================================================================

/// Character set of a table or column
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Charset {
    /// Opaque bytes: no character-level validation, byte truncation only
    Binary,
    /// Named charset, lower-cased (`utf8`, `utf8mb4`, `latin1`, `ascii`, ...)
    Named(String),
}

impl Charset {
    pub fn named(name: impl AsRef<str>) -> Self {
        let name = name.as_ref().to_lowercase();
        if name == "binary" {
            Charset::Binary
        } else {
            Charset::Named(name)
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Charset::Binary => "binary",
            Charset::Named(name) => name,
        }
    }

    pub fn is_utf8_family(&self) -> bool {
        matches!(self.name(), "utf8" | "utf8mb3" | "utf8mb4")
    }

    pub fn is_latin1(&self) -> bool {
        self.name() == "latin1"
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unit in which a column length is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    Byte,
    Char,
}

/// Maximum length of a string column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLength {
    pub unit: LengthUnit,
    pub length: u64,
}

impl ColumnLength {
    pub fn bytes(length: u64) -> Self {
        Self {
            unit: LengthUnit::Byte,
            length,
        }
    }

    pub fn chars(length: u64) -> Self {
        Self {
            unit: LengthUnit::Char,
            length,
        }
    }
}

/// One row of `SHOW FULL COLUMNS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Column name as reported by the server
    pub field: String,
    /// Declared type, e.g. `varchar(255)` or `int(11) unsigned`
    pub column_type: String,
    /// Collation, absent for non-string columns
    pub collation: Option<String>,
}

impl ColumnMeta {
    pub fn new(
        field: impl Into<String>,
        column_type: impl Into<String>,
        collation: Option<&str>,
    ) -> Self {
        Self {
            field: field.into(),
            column_type: column_type.into(),
            collation: collation.map(str::to_string),
        }
    }

    /// Charset prefix of the collation (`utf8mb4_unicode_ci` -> `utf8mb4`)
    pub fn charset(&self) -> Option<String> {
        self.collation
            .as_deref()
            .filter(|c| !c.is_empty())
            .and_then(|c| c.split('_').next())
            .map(str::to_lowercase)
    }

    /// Base type without parameters, lower-cased (`varchar(20)` -> `varchar`)
    pub fn base_type(&self) -> String {
        self.column_type
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase()
    }
}

/// A column value after the field pipeline resolved how to write it
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedField {
    pub field: String,
    pub value: Value,
    pub format: FieldFormat,
    /// `None` when the value needs no charset handling
    pub charset: Option<Charset>,
    pub length: Option<ColumnLength>,
    /// Set by `strip_invalid_text` when invalid content had to be removed
    pub invalid: bool,
}

impl ResolvedField {
    pub fn new(field: impl Into<String>, value: Value, format: FieldFormat) -> Self {
        Self {
            field: field.into(),
            value,
            format,
            charset: None,
            length: None,
            invalid: false,
        }
    }
}

// ============================================================================
// Query results
// ============================================================================

/// A single decoded result cell
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Decimal(rust_decimal::Decimal),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(chrono::NaiveDateTime),
    Date(chrono::NaiveDate),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            Cell::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        use rust_decimal::prelude::ToPrimitive;

        match self {
            Cell::Int(i) => Some(*i),
            Cell::Float(f) => Some(*f as i64),
            Cell::Decimal(d) => d.to_i64(),
            Cell::Text(_) | Cell::Bytes(_) => self.as_str().and_then(|s| s.trim().parse().ok()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        use rust_decimal::prelude::ToPrimitive;

        match self {
            Cell::Int(i) => Some(*i as f64),
            Cell::Float(f) => Some(*f),
            Cell::Decimal(d) => d.to_f64(),
            Cell::Text(_) | Cell::Bytes(_) => self.as_str().and_then(|s| s.trim().parse().ok()),
            _ => None,
        }
    }

    /// Textual form, `None` for NULL
    pub fn to_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Int(i) => Some(i.to_string()),
            Cell::Float(f) => Some(f.to_string()),
            Cell::Decimal(d) => Some(d.to_string()),
            Cell::Text(s) => Some(s.clone()),
            Cell::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Cell::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_string())
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

/// A result row: ordered, named cells
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    cells: Vec<Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column (builder style)
    pub fn with(mut self, column: impl Into<String>, cell: impl Into<Cell>) -> Self {
        self.push(column, cell);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, cell: impl Into<Cell>) {
        self.columns.push(column.into());
        self.cells.push(cell.into());
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Cell by column name (exact match first, then case-insensitive)
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.columns
            .iter()
            .position(|c| c == column)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(column))
            })
            .map(|i| &self.cells[i])
    }

    pub fn get_index(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Cell::as_str)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }
}

/// Outcome of executing one raw statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

impl QueryOutput {
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }
}
