//! Typed statements and the table schemas they refer to.
//!
//! Statements are built from static schemas rather than strings, so every
//! backend can interpret them directly; `to_cql` renders the wire form used
//! for logging, prepared-statement caching and real clusters.

use std::fmt;

use crate::config::Replication;
use crate::error_handling::ClusterError;

use super::value::ColumnType;

/// Sort direction of a clustering column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusteringOrder {
    Asc,
    Desc,
}

impl ClusteringOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusteringOrder::Asc => "ASC",
            ClusteringOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnType,
}

/// Column layout and primary key of a table.
#[derive(Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: &'static [ColumnDef],
    pub partition_key: &'static [&'static str],
    pub clustering_key: &'static [(&'static str, ClusteringOrder)],
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    /// Partition key columns followed by clustering columns.
    pub fn primary_key(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.partition_key
            .iter()
            .copied()
            .chain(self.clustering_key.iter().map(|(name, _)| *name))
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key().any(|c| c == name)
    }

    /// `CLUSTERING ORDER BY (...)` for tables with clustering columns.
    pub fn clustering_order_property(&self) -> Option<String> {
        if self.clustering_key.is_empty() {
            return None;
        }
        let order = self
            .clustering_key
            .iter()
            .map(|(name, order)| format!("{name} {}", order.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("CLUSTERING ORDER BY ({order})"))
    }

    fn check_columns<'a>(
        &self,
        table: &TableRef,
        names: impl IntoIterator<Item = &'a &'static str>,
    ) -> Result<(), ClusterError> {
        for name in names {
            if self.column(name).is_none() {
                return Err(ClusterError::Validation(format!(
                    "undefined column name {name} in table {table}"
                )));
            }
        }
        Ok(())
    }
}

/// A table addressed by keyspace and name, with its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub keyspace: String,
    pub name: String,
    pub schema: &'static TableSchema,
}

impl TableRef {
    pub fn new(
        keyspace: impl Into<String>,
        name: impl Into<String>,
        schema: &'static TableSchema,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
            schema,
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.name)
    }
}

/// What a `SELECT` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Every column, in schema order.
    All,
    Columns(Vec<&'static str>),
    /// A single `count` column.
    Count,
}

/// A statement against the cluster. Filters are equality tests bound as `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateKeyspace {
        keyspace: String,
        replication: Replication,
        durable_writes: bool,
    },
    CreateTable {
        table: TableRef,
        properties: Vec<String>,
    },
    DropTable {
        table: TableRef,
        if_exists: bool,
    },
    Insert {
        table: TableRef,
        columns: Vec<&'static str>,
    },
    Select {
        table: TableRef,
        projection: Projection,
        filter: Vec<&'static str>,
        limit: Option<usize>,
    },
    Delete {
        table: TableRef,
        filter: Vec<&'static str>,
    },
}

impl Statement {
    /// Number of `?` markers the statement expects values for.
    pub fn bind_markers(&self) -> usize {
        match self {
            Statement::Insert { columns, .. } => columns.len(),
            Statement::Select { filter, .. } | Statement::Delete { filter, .. } => filter.len(),
            _ => 0,
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Statement::CreateKeyspace { .. }
                | Statement::CreateTable { .. }
                | Statement::DropTable { .. }
        )
    }

    pub fn table(&self) -> Option<&TableRef> {
        match self {
            Statement::CreateKeyspace { .. } => None,
            Statement::CreateTable { table, .. }
            | Statement::DropTable { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Select { table, .. }
            | Statement::Delete { table, .. } => Some(table),
        }
    }

    /// Checks the statement against its table schema.
    ///
    /// This is what a coordinator does when preparing: unknown columns,
    /// inserts missing a primary key column and unrestricted deletes are
    /// rejected as validation errors.
    pub fn validate(&self) -> Result<(), ClusterError> {
        match self {
            Statement::Insert { table, columns } => {
                table.schema.check_columns(table, columns)?;
                if let Some(missing) = table.schema.primary_key().find(|k| !columns.contains(k)) {
                    return Err(ClusterError::Validation(format!(
                        "missing primary key column {missing} in insert into {table}"
                    )));
                }
                Ok(())
            }
            Statement::Select {
                table,
                projection,
                filter,
                limit,
            } => {
                if let Projection::Columns(columns) = projection {
                    table.schema.check_columns(table, columns)?;
                }
                table.schema.check_columns(table, filter)?;
                if *limit == Some(0) {
                    return Err(ClusterError::Validation(
                        "LIMIT must be strictly positive".to_string(),
                    ));
                }
                Ok(())
            }
            Statement::Delete { table, filter } => {
                table.schema.check_columns(table, filter)?;
                if table.schema.partition_key.iter().any(|k| !filter.contains(k)) {
                    return Err(ClusterError::Validation(format!(
                        "delete from {table} must restrict every partition key column"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn to_cql(&self) -> String {
        match self {
            Statement::CreateKeyspace {
                keyspace,
                replication,
                durable_writes,
            } => format!(
                "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = {replication} AND durable_writes = {durable_writes};"
            ),
            Statement::CreateTable { table, properties } => {
                let schema = table.schema;
                let columns = schema
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.kind.cql_name()))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut key = format!("({})", schema.partition_key.join(", "));
                for (name, _) in schema.clustering_key {
                    key.push_str(", ");
                    key.push_str(name);
                }
                let definition =
                    format!("CREATE TABLE IF NOT EXISTS {table} ({columns}, PRIMARY KEY ({key}))");
                if properties.is_empty() {
                    format!("{definition};")
                } else {
                    format!("{definition} WITH {};", properties.join(" AND "))
                }
            }
            Statement::DropTable { table, if_exists } => {
                if *if_exists {
                    format!("DROP TABLE IF EXISTS {table};")
                } else {
                    format!("DROP TABLE {table};")
                }
            }
            Statement::Insert { table, columns } => {
                let markers = vec!["?"; columns.len()].join(",");
                format!(
                    "INSERT INTO {table} ({}) VALUES ({markers});",
                    columns.join(",")
                )
            }
            Statement::Select {
                table,
                projection,
                filter,
                limit,
            } => {
                let what = match projection {
                    Projection::All => "*".to_string(),
                    Projection::Columns(columns) => columns.join(", "),
                    Projection::Count => "COUNT(*)".to_string(),
                };
                let mut cql = format!("SELECT {what} FROM {table}");
                push_where(&mut cql, filter);
                if let Some(limit) = limit {
                    cql.push_str(&format!(" LIMIT {limit}"));
                }
                cql.push(';');
                cql
            }
            Statement::Delete { table, filter } => {
                let mut cql = format!("DELETE FROM {table}");
                push_where(&mut cql, filter);
                cql.push(';');
                cql
            }
        }
    }
}

fn push_where(cql: &mut String, filter: &[&'static str]) {
    if filter.is_empty() {
        return;
    }
    let clauses = filter
        .iter()
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ");
    cql.push_str(" WHERE ");
    cql.push_str(&clauses);
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cql())
    }
}
