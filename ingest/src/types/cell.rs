use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tokio_postgres::types::{IsNull, ToSql, Type, WrongType, to_sql_checked};
use uuid::Uuid;

/// A single column value headed for Postgres.
///
/// Values are encoded with the type Postgres reports for the target column. Integer values
/// widen to larger integer columns; any other mismatch is rejected with a type error instead
/// of being coerced.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Uuid(Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl ToSql for Cell {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Cell::Null => Ok(IsNull::Yes),
            Cell::Bool(value) => checked::<bool>(value, ty, out),
            Cell::I16(value) => match *ty {
                Type::INT4 => i32::from(*value).to_sql(ty, out),
                Type::INT8 => i64::from(*value).to_sql(ty, out),
                _ => checked::<i16>(value, ty, out),
            },
            Cell::I32(value) => match *ty {
                Type::INT8 => i64::from(*value).to_sql(ty, out),
                _ => checked::<i32>(value, ty, out),
            },
            Cell::I64(value) => checked::<i64>(value, ty, out),
            Cell::F32(value) => match *ty {
                Type::FLOAT8 => f64::from(*value).to_sql(ty, out),
                _ => checked::<f32>(value, ty, out),
            },
            Cell::F64(value) => checked::<f64>(value, ty, out),
            Cell::String(value) => checked::<String>(value, ty, out),
            Cell::Bytes(value) => checked::<Vec<u8>>(value, ty, out),
            Cell::Json(value) => checked::<serde_json::Value>(value, ty, out),
            Cell::Uuid(value) => checked::<Uuid>(value, ty, out),
            Cell::Date(value) => checked::<NaiveDate>(value, ty, out),
            Cell::Timestamp(value) => checked::<NaiveDateTime>(value, ty, out),
            Cell::TimestampTz(value) => checked::<DateTime<Utc>>(value, ty, out),
        }
    }

    /// Every column type is accepted here; the variant is checked against it in `to_sql`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn checked<T>(
    value: &T,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn Error + Sync + Send>>
where
    T: ToSql,
{
    if !T::accepts(ty) {
        return Err(Box::new(WrongType::new::<T>(ty.clone())));
    }

    value.to_sql(ty, out)
}

macro_rules! impl_from_for_cell {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Cell {
                fn from(value: $source) -> Self {
                    Cell::$variant(value)
                }
            }
        )*
    };
}

impl_from_for_cell! {
    bool => Bool,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::String(value.to_string())
    }
}

impl<T> From<Option<T>> for Cell
where
    T: Into<Cell>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Cell::Null)
    }
}
