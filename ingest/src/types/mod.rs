//! Row, cell and schema types shared by the batch writer and the merge coordinator.

mod cell;
mod schema;
mod table_row;

pub use cell::Cell;
pub use schema::{ColumnSchema, TableName};
pub use table_row::TableRow;

pub(crate) use schema::quoted_column_list;

// Re-exports.
pub use tokio_postgres::types::{ToSql, Type};
