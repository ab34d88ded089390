use std::fmt;

use pg_escape::quote_identifier;
use tokio_postgres::types::Type;

/// Fully qualified name of a table.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Table in the `public` schema.
    pub fn public(name: impl Into<String>) -> TableName {
        Self::new("public", name)
    }

    /// Returns `"schema"."name"` with both parts escaped.
    pub fn as_quoted_identifier(&self) -> String {
        let quoted_schema = quote_identifier(&self.schema);
        let quoted_name = quote_identifier(&self.name);

        format!("{quoted_schema}.{quoted_name}")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Name and Postgres type of a column written by a batch job.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub typ: Type,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, typ: Type) -> ColumnSchema {
        Self {
            name: name.into(),
            typ,
        }
    }

    pub fn quoted_name(&self) -> String {
        quote_identifier(&self.name).into_owned()
    }
}

/// Renders a comma-separated list of quoted column names.
pub(crate) fn quoted_column_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(|name| quote_identifier(name).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}
