use tokio_postgres::types::ToSql;

use crate::types::Cell;

/// One row of values, ordered like the column list of the job it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    values: Vec<Cell>,
}

impl TableRow {
    pub fn new(values: Vec<Cell>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Cell] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Cell> {
        self.values
    }

    /// Borrows the values as statement parameters.
    pub fn as_params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|cell| cell as &(dyn ToSql + Sync))
            .collect()
    }
}

impl From<Vec<Cell>> for TableRow {
    fn from(values: Vec<Cell>) -> Self {
        Self::new(values)
    }
}

/// Builds a [`TableRow`] from values convertible into [`Cell`]s.
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        $crate::types::TableRow::new(vec![$($crate::types::Cell::from($value)),*])
    };
}
