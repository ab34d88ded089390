use std::collections::HashSet;

use crate::bail;
use crate::batch::WriteStrategy;
use crate::error::{ErrorKind, IngestResult};
use crate::types::{ColumnSchema, TableName, TableRow, Type};

/// Rows headed for one table, all shaped like the job's column list.
#[derive(Debug, Clone)]
pub struct BatchJob {
    table: TableName,
    columns: Vec<ColumnSchema>,
    rows: Vec<TableRow>,
    strategy: Option<WriteStrategy>,
}

impl BatchJob {
    /// Creates an empty job. Column names must be non-empty and distinct.
    pub fn new(table: TableName, columns: Vec<ColumnSchema>) -> IngestResult<Self> {
        if columns.is_empty() {
            bail!(
                ErrorKind::SchemaError,
                "Batch job has no columns",
                format!("table {table} needs at least one column to write")
            );
        }

        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                bail!(
                    ErrorKind::SchemaError,
                    "Duplicate column in batch job",
                    format!("column '{}' appears twice for table {table}", column.name)
                );
            }
        }

        Ok(Self {
            table,
            columns,
            rows: Vec::new(),
            strategy: None,
        })
    }

    /// Pins the strategy used when the caller does not pass one to the writer.
    pub fn with_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Appends a row, rejecting it if its arity differs from the column list.
    pub fn push_row(&mut self, row: TableRow) -> IngestResult<()> {
        if row.len() != self.columns.len() {
            bail!(
                ErrorKind::InvalidData,
                "Row arity does not match the batch columns",
                format!(
                    "row {} of {} has {} values, expected {}",
                    self.rows.len(),
                    self.table,
                    row.len(),
                    self.columns.len()
                )
            );
        }

        self.rows.push(row);
        Ok(())
    }

    pub fn extend_rows<I>(&mut self, rows: I) -> IngestResult<()>
    where
        I: IntoIterator<Item = TableRow>,
    {
        for row in rows {
            self.push_row(row)?;
        }
        Ok(())
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    pub fn column_types(&self) -> Vec<Type> {
        self.columns.iter().map(|column| column.typ.clone()).collect()
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn strategy(&self) -> Option<WriteStrategy> {
        self.strategy
    }
}
