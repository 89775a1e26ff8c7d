//! SQL Server type mapping: cell values and portable column types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tiberius::ColumnType;
use uuid::Uuid;

/// A SQL value that can be serialized to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Decimal(Decimal),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeUtc(DateTime<Utc>),
}

impl SqlValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Interpret the value as a non-negative count.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SqlValue::U8(v) => Some(u64::from(*v)),
            SqlValue::I16(v) => u64::try_from(*v).ok(),
            SqlValue::I32(v) => u64::try_from(*v).ok(),
            SqlValue::I64(v) => u64::try_from(*v).ok(),
            SqlValue::Decimal(v) => v.to_u64(),
            _ => None,
        }
    }
}

/// An ordered row tuple.
pub type Row = Vec<SqlValue>;

/// A batch of at most `batch_size` rows.
pub type Batch = Vec<Row>;

/// Column metadata as reported by the driver.
#[derive(Debug, Clone)]
pub struct NativeColumn {
    pub name: String,
    pub column_type: ColumnType,
}

impl NativeColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

impl From<&tiberius::Column> for NativeColumn {
    fn from(column: &tiberius::Column) -> Self {
        Self::new(column.name(), column.column_type())
    }
}

/// Host-facing column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortableType {
    Number,
    Date,
    String,
    Boolean,
}

/// Whether a portable type came from a direct mapping or a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Fidelity {
    Precise,
    Inferred,
}

/// Column name plus portable type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub portable_type: PortableType,
    pub fidelity: Fidelity,
}

/// Type mapper for converting SQL Server types to portable types and values.
pub struct TypeMapper;

impl TypeMapper {
    /// Map a native column type to its portable type.
    ///
    /// Returns `None` for types with no direct mapping.
    pub fn portable_type(column_type: ColumnType) -> Option<PortableType> {
        match column_type {
            ColumnType::Int1
            | ColumnType::Int2
            | ColumnType::Int4
            | ColumnType::Int8
            | ColumnType::Intn
            | ColumnType::Float4
            | ColumnType::Float8
            | ColumnType::Floatn
            | ColumnType::Money
            | ColumnType::Money4
            | ColumnType::Decimaln
            | ColumnType::Numericn => Some(PortableType::Number),

            ColumnType::Datetime
            | ColumnType::Datetime4
            | ColumnType::Datetimen
            | ColumnType::Daten
            | ColumnType::Timen
            | ColumnType::Datetime2
            | ColumnType::DatetimeOffsetn => Some(PortableType::Date),

            ColumnType::BigVarChar
            | ColumnType::BigChar
            | ColumnType::NVarchar
            | ColumnType::NChar
            | ColumnType::Text
            | ColumnType::NText
            | ColumnType::Xml => Some(PortableType::String),

            ColumnType::Bit | ColumnType::Bitn => Some(PortableType::Boolean),

            _ => None,
        }
    }

    /// Describe result columns, preserving order.
    pub fn describe_columns(columns: &[NativeColumn]) -> Vec<ColumnDescriptor> {
        columns
            .iter()
            .map(|column| {
                let (portable_type, fidelity) = match Self::portable_type(column.column_type) {
                    Some(portable_type) => (portable_type, Fidelity::Precise),
                    None => (PortableType::String, Fidelity::Inferred),
                };
                ColumnDescriptor {
                    name: column.name.clone(),
                    portable_type,
                    fidelity,
                }
            })
            .collect()
    }

    /// Extract every value of a driver row, in column order.
    pub fn row_values(row: &tiberius::Row) -> Row {
        let types: Vec<ColumnType> = row.columns().iter().map(|c| c.column_type()).collect();
        types
            .into_iter()
            .enumerate()
            .map(|(idx, column_type)| Self::extract_column(row, idx, column_type))
            .collect()
    }

    /// Extract a value from a Tiberius row column.
    ///
    /// Variable-width types (`Intn`, `Floatn`, ...) are tried at each width.
    /// Values that cannot be decoded become NULL.
    pub fn extract_column(row: &tiberius::Row, idx: usize, column_type: ColumnType) -> SqlValue {
        match column_type {
            ColumnType::Null => SqlValue::Null,
            ColumnType::Bit | ColumnType::Bitn => get(row, idx, SqlValue::Bool),
            ColumnType::Int1 => get(row, idx, SqlValue::U8),
            ColumnType::Int2 => get(row, idx, SqlValue::I16),
            ColumnType::Int4 => get(row, idx, SqlValue::I32),
            ColumnType::Int8 => get(row, idx, SqlValue::I64),
            ColumnType::Intn => try_get(row, idx, SqlValue::I32)
                .or_else(|| try_get(row, idx, SqlValue::I64))
                .or_else(|| try_get(row, idx, SqlValue::I16))
                .or_else(|| try_get(row, idx, SqlValue::U8))
                .unwrap_or(SqlValue::Null),
            ColumnType::Float4 => get(row, idx, SqlValue::F32),
            ColumnType::Float8 | ColumnType::Money | ColumnType::Money4 => {
                get(row, idx, SqlValue::F64)
            }
            ColumnType::Floatn => try_get(row, idx, SqlValue::F64)
                .or_else(|| try_get(row, idx, SqlValue::F32))
                .unwrap_or(SqlValue::Null),
            ColumnType::Decimaln | ColumnType::Numericn => get(row, idx, SqlValue::Decimal),
            ColumnType::Guid => get(row, idx, SqlValue::Uuid),
            ColumnType::Daten => get(row, idx, SqlValue::Date),
            ColumnType::Timen => get(row, idx, SqlValue::Time),
            ColumnType::Datetime
            | ColumnType::Datetime4
            | ColumnType::Datetimen
            | ColumnType::Datetime2 => get(row, idx, SqlValue::DateTime),
            ColumnType::DatetimeOffsetn => get(row, idx, SqlValue::DateTimeUtc),
            ColumnType::Xml => row
                .try_get::<&tiberius::xml::XmlData, _>(idx)
                .ok()
                .flatten()
                .map(|xml| SqlValue::String(xml.clone().into_string()))
                .unwrap_or(SqlValue::Null),
            ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => row
                .try_get::<&[u8], _>(idx)
                .ok()
                .flatten()
                .map(|bytes| SqlValue::Bytes(bytes.to_vec()))
                .unwrap_or(SqlValue::Null),
            _ => row
                .try_get::<&str, _>(idx)
                .ok()
                .flatten()
                .map(|s| SqlValue::String(s.to_string()))
                .unwrap_or(SqlValue::Null),
        }
    }
}

fn try_get<'a, T, F>(row: &'a tiberius::Row, idx: usize, wrap: F) -> Option<SqlValue>
where
    T: tiberius::FromSql<'a>,
    F: FnOnce(T) -> SqlValue,
{
    row.try_get::<T, _>(idx).ok().flatten().map(wrap)
}

fn get<'a, T, F>(row: &'a tiberius::Row, idx: usize, wrap: F) -> SqlValue
where
    T: tiberius::FromSql<'a>,
    F: FnOnce(T) -> SqlValue,
{
    try_get(row, idx, wrap).unwrap_or(SqlValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(column_type: ColumnType) -> ColumnDescriptor {
        TypeMapper::describe_columns(&[NativeColumn::new("c", column_type)]).remove(0)
    }

    #[test]
    fn test_precise_mappings() {
        let cases = [
            (ColumnType::Int4, PortableType::Number),
            (ColumnType::Intn, PortableType::Number),
            (ColumnType::Decimaln, PortableType::Number),
            (ColumnType::Money, PortableType::Number),
            (ColumnType::Floatn, PortableType::Number),
            (ColumnType::Datetime2, PortableType::Date),
            (ColumnType::DatetimeOffsetn, PortableType::Date),
            (ColumnType::Daten, PortableType::Date),
            (ColumnType::Timen, PortableType::Date),
            (ColumnType::NVarchar, PortableType::String),
            (ColumnType::BigChar, PortableType::String),
            (ColumnType::Xml, PortableType::String),
            (ColumnType::NText, PortableType::String),
            (ColumnType::Bitn, PortableType::Boolean),
        ];

        for (column_type, expected) in cases {
            let descriptor = describe(column_type);
            assert_eq!(descriptor.portable_type, expected, "{:?}", column_type);
            assert_eq!(descriptor.fidelity, Fidelity::Precise, "{:?}", column_type);
        }
    }

    #[test]
    fn test_unmapped_types_are_inferred_strings() {
        for column_type in [
            ColumnType::Guid,
            ColumnType::BigVarBin,
            ColumnType::Image,
            ColumnType::SSVariant,
            ColumnType::Udt,
            ColumnType::Null,
        ] {
            let descriptor = describe(column_type);
            assert_eq!(descriptor.portable_type, PortableType::String);
            assert_eq!(descriptor.fidelity, Fidelity::Inferred);
        }
    }

    #[test]
    fn test_describe_preserves_order() {
        let columns = vec![
            NativeColumn::new("id", ColumnType::Int4),
            NativeColumn::new("name", ColumnType::NVarchar),
            NativeColumn::new("active", ColumnType::Bit),
        ];
        let names: Vec<_> = TypeMapper::describe_columns(&columns)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["id", "name", "active"]);
    }

    #[test]
    fn test_descriptor_serialization() {
        let json = serde_json::to_value(describe(ColumnType::Bit)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "c", "type": "BOOLEAN", "fidelity": "PRECISE"})
        );
    }

    #[test]
    fn test_sql_value_as_u64() {
        assert_eq!(SqlValue::I32(42).as_u64(), Some(42));
        assert_eq!(SqlValue::I64(-1).as_u64(), None);
        assert_eq!(SqlValue::String("7".to_string()).as_u64(), None);
        assert!(SqlValue::Null.is_null());
    }

    #[test]
    fn test_sql_value_untagged_json() {
        let row: Row = vec![
            SqlValue::I32(1),
            SqlValue::String("a".to_string()),
            SqlValue::Null,
            SqlValue::Bool(true),
        ];
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"[1,"a",null,true]"#
        );
    }
}
