use tokio_postgres::GenericClient;
use tokio_postgres::types::ToSql;

use crate::error::IngestResult;
use crate::types::{ColumnSchema, TableName, TableRow, Type, quoted_column_list};

/// Bind parameter limit of the extended query protocol.
pub(crate) const MAX_BIND_PARAMETERS: usize = 65_535;

/// Largest number of rows whose parameters fit in one statement.
pub(crate) fn max_rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMETERS / column_count.max(1)).max(1)
}

/// Renders `insert into t (a, b) values ($1, $2), ($3, $4), ...` for `row_count` rows.
pub(crate) fn insert_statement(
    table: &TableName,
    columns: &[ColumnSchema],
    row_count: usize,
) -> String {
    let column_list = quoted_column_list(columns.iter().map(|column| column.name.as_str()));

    let mut sql = format!(
        "insert into {} ({column_list}) values ",
        table.as_quoted_identifier()
    );

    let mut parameter = 1;
    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for column in 0..columns.len() {
            if column > 0 {
                sql.push_str(", ");
            }
            sql.push('$');
            sql.push_str(&parameter.to_string());
            parameter += 1;
        }
        sql.push(')');
    }

    sql
}

/// Inserts `rows` with a single multi-row statement.
pub(crate) async fn insert_rows<C>(
    client: &C,
    table: &TableName,
    columns: &[ColumnSchema],
    rows: &[TableRow],
) -> IngestResult<u64>
where
    C: GenericClient + Sync,
{
    let sql = insert_statement(table, columns, rows.len());

    let types: Vec<Type> = rows
        .iter()
        .flat_map(|_| columns.iter().map(|column| column.typ.clone()))
        .collect();
    let statement = client.prepare_typed(&sql, &types).await?;

    let params: Vec<&(dyn ToSql + Sync)> = rows
        .iter()
        .flat_map(|row| row.values().iter().map(|cell| cell as &(dyn ToSql + Sync)))
        .collect();

    Ok(client.execute(&statement, &params).await?)
}
