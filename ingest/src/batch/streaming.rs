use std::pin::pin;

use tokio_postgres::GenericClient;
use tokio_postgres::binary_copy::BinaryCopyInWriter;

use crate::error::IngestResult;
use crate::failpoints::{BATCH_BEFORE_COPY_FINISH, ingest_fail_point};
use crate::types::{TableRow, Type, quoted_column_list};

/// Renders `copy <table> (<columns>) from stdin binary`.
pub(crate) fn copy_statement<'a>(
    quoted_table: &str,
    column_names: impl IntoIterator<Item = &'a str>,
) -> String {
    let column_list = quoted_column_list(column_names);
    format!("copy {quoted_table} ({column_list}) from stdin binary")
}

/// Loads `rows` with one binary `COPY`, encoding every value with the matching entry of `types`.
///
/// The copy is aborted if an error happens before it finishes, so either all rows land or none.
pub(crate) async fn copy_rows<'a, C>(
    client: &C,
    quoted_table: &str,
    column_names: impl IntoIterator<Item = &'a str>,
    types: &[Type],
    rows: &[TableRow],
) -> IngestResult<u64>
where
    C: GenericClient + Sync,
{
    let sql = copy_statement(quoted_table, column_names);
    let sink = client.client().copy_in(&sql).await?;

    let mut writer = pin!(BinaryCopyInWriter::new(sink, types));
    for row in rows {
        writer.as_mut().write(&row.as_params()).await?;
    }

    ingest_fail_point(BATCH_BEFORE_COPY_FINISH)?;

    Ok(writer.finish().await?)
}
