//! Text codec for cached values.
//!
//! Values are persisted as compact JSON. Decoding never fails loudly: any
//! malformed, truncated or shape-mismatched text decodes to `None`, which the
//! cache layer treats exactly like a miss.
//!
//! Two shapes need help to survive a round trip:
//!
//! - Tabular data ([`Table`]) carries its column layout in-band, so a reader
//!   can rebuild it without knowing the shape up front.
//! - Graphs with back-references model the back-edge as a `Weak` pointer and
//!   mark it with [`back_edge`]; the edge is written as `null` instead of
//!   recursing forever.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{CacheError, CacheResult};

/// Encode a value to its cached text form.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization {
        reason: e.to_string(),
    })
}

/// Decode cached text, yielding `None` on any failure.
pub fn decode<T: DeserializeOwned>(text: &str) -> Option<T> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "Discarding undecodable cache entry");
            None
        }
    }
}

// ============================================================================
// TABULAR VALUES
// ============================================================================

/// Type of a table column, written by name into the encoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    Int64,
    Double,
    String,
    DateTime,
}

impl ColumnType {
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Boolean => "Boolean",
            Self::Int64 => "Int64",
            Self::Double => "Double",
            Self::String => "String",
            Self::DateTime => "DateTime",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "Boolean" => Some(Self::Boolean),
            "Int64" => Some(Self::Int64),
            "Double" => Some(Self::Double),
            "String" => Some(Self::String),
            "DateTime" => Some(Self::DateTime),
            _ => None,
        }
    }
}

/// A single table cell. Any column accepts `Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Boolean(bool),
    Int64(i64),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl Cell {
    fn fits(&self, kind: ColumnType) -> bool {
        matches!(
            (self, kind),
            (Self::Null, _)
                | (Self::Boolean(_), ColumnType::Boolean)
                | (Self::Int64(_), ColumnType::Int64)
                | (Self::Double(_), ColumnType::Double)
                | (Self::String(_), ColumnType::String)
                | (Self::DateTime(_), ColumnType::DateTime)
        )
    }

    fn from_json(kind: ColumnType, value: Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::Null);
        }
        Ok(match kind {
            ColumnType::Boolean => Self::Boolean(serde_json::from_value(value)?),
            ColumnType::Int64 => Self::Int64(serde_json::from_value(value)?),
            ColumnType::Double => Self::Double(serde_json::from_value(value)?),
            ColumnType::String => Self::String(serde_json::from_value(value)?),
            ColumnType::DateTime => Self::DateTime(serde_json::from_value(value)?),
        })
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Boolean(v) => serializer.serialize_bool(*v),
            Self::Int64(v) => serializer.serialize_i64(*v),
            Self::Double(v) => serializer.serialize_f64(*v),
            Self::String(v) => serializer.serialize_str(v),
            Self::DateTime(v) => v.serialize(serializer),
        }
    }
}

/// Named, typed table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// Tabular value whose layout travels with its rows.
///
/// Encoded as a JSON array: the first element maps each column name to its
/// type name (in column order), every following element maps column names
/// to cell values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    /// Empty table with the given columns. Column names must be unique,
    /// since rows are encoded as maps keyed by name.
    pub fn new<I, S>(columns: I) -> CacheResult<Self>
    where
        I: IntoIterator<Item = (S, ColumnType)>,
        S: Into<String>,
    {
        let columns: Vec<Column> = columns
            .into_iter()
            .map(|(name, kind)| Column {
                name: name.into(),
                kind,
            })
            .collect();
        if let Some(name) = duplicate_name(&columns) {
            return Err(CacheError::Serialization {
                reason: format!("duplicate column {name}"),
            });
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    /// Append a row; its cells must line up with the columns. Doubles must
    /// be finite, since the encoded form has no NaN or infinity.
    pub fn push_row(&mut self, cells: Vec<Cell>) -> CacheResult<()> {
        if cells.len() != self.columns.len() {
            return Err(CacheError::Serialization {
                reason: format!(
                    "row has {} cells, table has {} columns",
                    cells.len(),
                    self.columns.len()
                ),
            });
        }
        if let Some((cell, column)) = cells
            .iter()
            .zip(&self.columns)
            .find(|(cell, column)| !cell.fits(column.kind))
        {
            return Err(CacheError::Serialization {
                reason: format!(
                    "cell {:?} does not fit column {} of type {}",
                    cell,
                    column.name,
                    column.kind.type_name()
                ),
            });
        }
        if let Some((cell, column)) = cells
            .iter()
            .zip(&self.columns)
            .find(|(cell, _)| matches!(cell, Cell::Double(v) if !v.is_finite()))
        {
            return Err(CacheError::Serialization {
                reason: format!("cell {:?} in column {} is not finite", cell, column.name),
            });
        }
        self.rows.push(cells);
        Ok(())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a cell by row index and column name.
    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(row).and_then(|cells| cells.get(idx))
    }
}

fn duplicate_name(columns: &[Column]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(columns.len());
    columns
        .iter()
        .map(|column| column.name.as_str())
        .find(|name| !seen.insert(*name))
}

struct HeaderRef<'a>(&'a [Column]);

impl Serialize for HeaderRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for column in self.0 {
            map.serialize_entry(&column.name, column.kind.type_name())?;
        }
        map.end()
    }
}

struct RowRef<'a> {
    columns: &'a [Column],
    cells: &'a [Cell],
}

impl Serialize for RowRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, cell) in self.columns.iter().zip(self.cells) {
            map.serialize_entry(&column.name, cell)?;
        }
        map.end()
    }
}

impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len() + 1))?;
        seq.serialize_element(&HeaderRef(&self.columns))?;
        for cells in &self.rows {
            seq.serialize_element(&RowRef {
                columns: &self.columns,
                cells,
            })?;
        }
        seq.end()
    }
}

/// Column header read in document order.
struct Header(Vec<Column>);

impl<'de> Deserialize<'de> for Header {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderVisitor;

        impl<'de> Visitor<'de> for HeaderVisitor {
            type Value = Header;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of column names to type names")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Header, A::Error> {
                let mut columns = Vec::new();
                while let Some((name, type_name)) = map.next_entry::<String, String>()? {
                    let kind = ColumnType::from_type_name(&type_name).ok_or_else(|| {
                        de::Error::custom(format!("unknown column type {type_name}"))
                    })?;
                    columns.push(Column { name, kind });
                }
                if let Some(name) = duplicate_name(&columns) {
                    return Err(de::Error::custom(format!("duplicate column {name}")));
                }
                Ok(Header(columns))
            }
        }

        deserializer.deserialize_map(HeaderVisitor)
    }
}

impl<'de> Deserialize<'de> for Table {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = Table;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a column header followed by rows")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Table, A::Error> {
                let Header(columns) = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("missing column header"))?;

                let mut rows = Vec::new();
                while let Some(mut row) = seq.next_element::<BTreeMap<String, Value>>()? {
                    let cells = columns
                        .iter()
                        .map(|column| {
                            let value = row.remove(&column.name).unwrap_or(Value::Null);
                            Cell::from_json(column.kind, value).map_err(de::Error::custom)
                        })
                        .collect::<Result<Vec<_>, A::Error>>()?;
                    rows.push(cells);
                }
                Ok(Table { columns, rows })
            }
        }

        deserializer.deserialize_seq(TableVisitor)
    }
}

// ============================================================================
// GRAPH BACK-EDGES
// ============================================================================

/// Serde adapter for back-edges in graph-shaped values.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Node {
///     children: Vec<Rc<RefCell<Node>>>,
///     #[serde(with = "cachet_core::codec::back_edge", default)]
///     parent: Weak<RefCell<Node>>,
/// }
/// ```
pub mod back_edge {
    use serde::{de::IgnoredAny, Deserialize, Deserializer, Serializer};

    /// Weak pointers that can be created without a target.
    pub trait Dangling {
        fn dangling() -> Self;
    }

    impl<T> Dangling for std::rc::Weak<T> {
        fn dangling() -> Self {
            std::rc::Weak::new()
        }
    }

    impl<T> Dangling for std::sync::Weak<T> {
        fn dangling() -> Self {
            std::sync::Weak::new()
        }
    }

    pub fn serialize<W, S: Serializer>(_edge: &W, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_none()
    }

    pub fn deserialize<'de, W, D>(deserializer: D) -> Result<W, D::Error>
    where
        W: Dangling,
        D: Deserializer<'de>,
    {
        IgnoredAny::deserialize(deserializer)?;
        Ok(W::dangling())
    }
}
