//! Staged conditional updates.
//!
//! A merge loads rows into a temporary table that lives only as long as its transaction, then
//! updates the target with one join. Values travel through binary `COPY`; only identifiers and
//! caller-provided assignment expressions are rendered into SQL.

use std::collections::HashSet;

use metrics::counter;
use pg_escape::quote_identifier;
use tokio_postgres::Transaction;
use tracing::{debug, info};
use uuid::Uuid;

use crate::batch::copy_rows;
use crate::bail;
use crate::error::{ErrorKind, IngestResult};
use crate::metrics::INGEST_MERGE_ROWS_UPDATED_TOTAL;
use crate::pool::PooledConnection;
use crate::transaction::ScopedTransaction;
use crate::types::{TableName, TableRow, quoted_column_list};

/// Alias of the target table in the generated `update`.
pub const TARGET_ALIAS: &str = "t";
/// Alias of the staging table in the generated `update`.
pub const STAGING_ALIAS: &str = "s";

/// Assignments applied to matched target rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeUpdate {
    /// Every staged column that is not part of the match key is copied over.
    NonKeyColumns,
    /// The listed columns are copied over: `col = s.col`.
    Columns(Vec<String>),
    /// A raw assignment list referencing the `t` and `s` aliases, e.g.
    /// `status = s.status, updated_at = now()`.
    Expression(String),
}

/// Rows to stage and the rules joining them to the target.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub target: TableName,
    /// Columns of the staged rows, in row order. They must exist in the target.
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
    /// Columns a staged row and a target row must agree on to match.
    pub match_key: Vec<String>,
    pub update: MergeUpdate,
}

impl MergeRequest {
    pub fn new(target: TableName, columns: Vec<String>, match_key: Vec<String>) -> Self {
        Self {
            target,
            columns,
            rows: Vec::new(),
            match_key,
            update: MergeUpdate::NonKeyColumns,
        }
    }

    pub fn with_rows(mut self, rows: Vec<TableRow>) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_update(mut self, update: MergeUpdate) -> Self {
        self.update = update;
        self
    }

    fn validate(&self) -> IngestResult<()> {
        if self.columns.is_empty() {
            bail!(ErrorKind::SchemaError, "Merge has no columns");
        }

        let mut columns = HashSet::with_capacity(self.columns.len());
        for column in &self.columns {
            if !columns.insert(column.as_str()) {
                bail!(
                    ErrorKind::SchemaError,
                    "Duplicate merge column",
                    format!("column '{column}' appears twice")
                );
            }
        }

        if self.match_key.is_empty() {
            bail!(ErrorKind::SchemaError, "Merge match key is empty");
        }
        for key in &self.match_key {
            if !columns.contains(key.as_str()) {
                bail!(
                    ErrorKind::SchemaError,
                    "Merge key column is not staged",
                    format!("key column '{key}' is missing from the merge columns")
                );
            }
        }

        if let MergeUpdate::Columns(updated) = &self.update {
            if updated.is_empty() {
                bail!(ErrorKind::SchemaError, "Merge updates no columns");
            }
            for column in updated {
                if !columns.contains(column.as_str()) {
                    bail!(
                        ErrorKind::SchemaError,
                        "Updated column is not staged",
                        format!("column '{column}' is missing from the merge columns")
                    );
                }
            }
        }

        for (index, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                bail!(
                    ErrorKind::InvalidData,
                    "Row arity does not match the merge columns",
                    format!(
                        "row {index} has {} values, expected {}",
                        row.len(),
                        self.columns.len()
                    )
                );
            }
        }

        Ok(())
    }

    fn set_clause(&self) -> IngestResult<String> {
        let clause = match &self.update {
            MergeUpdate::NonKeyColumns => {
                let keys: HashSet<&str> = self.match_key.iter().map(String::as_str).collect();
                copy_assignments(
                    self.columns
                        .iter()
                        .filter(|column| !keys.contains(column.as_str())),
                )
            }
            MergeUpdate::Columns(columns) => copy_assignments(columns.iter()),
            MergeUpdate::Expression(expression) => expression.trim().to_string(),
        };

        if clause.is_empty() {
            bail!(
                ErrorKind::SchemaError,
                "Merge has nothing to update",
                format!("every staged column of {} is part of the match key", self.target)
            );
        }

        Ok(clause)
    }

    fn update_statement(&self, staging_table: &str) -> IngestResult<String> {
        let set_clause = self.set_clause()?;
        let join_condition = self
            .match_key
            .iter()
            .map(|key| {
                let key = quote_identifier(key);
                format!("{TARGET_ALIAS}.{key} = {STAGING_ALIAS}.{key}")
            })
            .collect::<Vec<_>>()
            .join(" and ");

        Ok(format!(
            "update {} as {TARGET_ALIAS} set {set_clause} from {staging_table} as {STAGING_ALIAS} where {join_condition}",
            self.target.as_quoted_identifier()
        ))
    }
}

/// Renders `col = s.col` for every column.
fn copy_assignments<'a>(columns: impl Iterator<Item = &'a String>) -> String {
    columns
        .map(|column| {
            let column = quote_identifier(column);
            format!("{column} = {STAGING_ALIAS}.{column}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Applies [`MergeRequest`]s through a leased connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeCoordinator;

impl MergeCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Stages `request.rows` and updates every matching target row in one transaction.
    ///
    /// Returns the number of target rows updated. Rows without a match are ignored. The staging
    /// table is dropped when the transaction ends, whatever the outcome.
    pub async fn merge(
        &self,
        conn: &mut PooledConnection,
        request: &MergeRequest,
    ) -> IngestResult<u64> {
        request.validate()?;
        if request.rows.is_empty() {
            return Ok(0);
        }

        let staging_table = staging_table_name();
        let update_sql = request.update_statement(&staging_table)?;

        let updated = ScopedTransaction::run(conn, async |transaction| {
            stage_rows(transaction, request, &staging_table).await?;
            Ok(transaction.execute(update_sql.as_str(), &[]).await?)
        })
        .await?;

        counter!(INGEST_MERGE_ROWS_UPDATED_TOTAL).increment(updated);
        info!(
            table = %request.target,
            staged = request.rows.len(),
            updated,
            "merge applied"
        );

        Ok(updated)
    }
}

fn staging_table_name() -> String {
    let name = format!("ingest_staging_{}", Uuid::new_v4().simple());
    quote_identifier(&name).into_owned()
}

/// Creates the staging table shaped like the target columns and loads the rows into it.
async fn stage_rows(
    transaction: &Transaction<'_>,
    request: &MergeRequest,
    staging_table: &str,
) -> IngestResult<u64> {
    let column_list = quoted_column_list(request.columns.iter().map(String::as_str));

    transaction
        .batch_execute(&format!(
            "create temporary table {staging_table} on commit drop as select {column_list} from {} with no data",
            request.target.as_quoted_identifier()
        ))
        .await?;

    // The prepared select reports the column types the copy must encode with.
    let described = transaction
        .prepare(&format!("select {column_list} from {staging_table}"))
        .await?;
    let types: Vec<_> = described
        .columns()
        .iter()
        .map(|column| column.type_().clone())
        .collect();

    let staged = copy_rows(
        transaction,
        staging_table,
        request.columns.iter().map(String::as_str),
        &types,
        &request.rows,
    )
    .await?;

    debug!(staging_table, staged, "rows staged for merge");

    Ok(staged)
}
