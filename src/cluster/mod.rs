//! Cluster access.
//!
//! This module provides:
//! - The `Connection` trait every backend implements
//! - Typed statements, values and rows
//! - `Session`, which caches prepared statements and applies the statement retry policy
//! - Three backends: `ScyllaCluster` (Cassandra and ScyllaDB through the `scylla`
//!   driver), `SqliteCluster` (durable, single node) and `MemoryCluster` (in-process)

mod driver;
mod memory;
mod session;
mod sqlite;
mod statement;
mod timeuuid;
mod value;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error_handling::ClusterError;
use crate::retry::StatementRetryPolicy;

// Re-export public API
pub use driver::ScyllaCluster;
pub use memory::{Fault, MemoryCluster};
pub use session::Session;
pub use sqlite::SqliteCluster;
pub use statement::{
    ClusteringOrder, ColumnDef, Projection, Statement, TableRef, TableSchema,
};
pub use timeuuid::{TimeUuid, TimeUuidGenerator};
pub use value::{compare_values, ColumnType, Row, Value};

/// Replica agreement required for a statement to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Consistency {
    Any,
    #[default]
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
}

impl Consistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::LocalOne => "LOCAL_ONE",
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of write reported by a write timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    /// A write type this crate has no name for.
    Other,
}

impl WriteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other => "OTHER",
        }
    }
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statement accepted by a connection, ready to execute.
#[derive(Debug, Clone)]
pub struct Prepared {
    id: u64,
    statement: Arc<Statement>,
    cql: String,
}

impl Prepared {
    pub fn new(id: u64, statement: Statement) -> Self {
        let cql = statement.to_cql();
        Self {
            id,
            statement: Arc::new(statement),
            cql,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn shared_statement(&self) -> Arc<Statement> {
        Arc::clone(&self.statement)
    }

    pub fn cql(&self) -> &str {
        &self.cql
    }
}

/// Opaque position in a paged result, handed back to continue a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingState(Vec<u8>);

impl PagingState {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        PagingState(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_offset(offset: u64) -> Self {
        PagingState(offset.to_be_bytes().to_vec())
    }

    pub fn offset(&self) -> Result<u64, ClusterError> {
        let bytes: [u8; 8] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| ClusterError::Client("malformed paging state".to_string()))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub consistency: Consistency,
    /// Maximum rows in the returned page; `None` returns everything.
    pub page_size: Option<usize>,
    /// Where to resume a paged scan.
    pub paging_state: Option<PagingState>,
    /// Policy for connections that apply it through their driver.
    pub retry_policy: Option<Arc<dyn StatementRetryPolicy>>,
}

/// One page of results.
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub rows: Vec<Row>,
    /// Present when more rows follow.
    pub paging_state: Option<PagingState>,
}

impl ResultPage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// A connection to a partitioned key/value cluster.
///
/// Implementations classify their failures into [`ClusterError`]; the retry
/// layers above decide what to do with them.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Validates and registers a statement.
    async fn prepare(&self, statement: &Statement) -> Result<Prepared, ClusterError>;

    /// Executes a prepared statement with one value per bind marker.
    async fn execute(
        &self,
        prepared: &Prepared,
        values: &[Value],
        options: &ExecOptions,
    ) -> Result<ResultPage, ClusterError>;

    /// Whether the connection hands `ExecOptions::retry_policy` to its driver.
    /// When false, `Session` consults the policy itself between executions.
    fn applies_statement_policy(&self) -> bool {
        false
    }
}

/// Rejects a value list that does not match the statement's markers or
/// column types. Shared by the backends.
pub(crate) fn check_bindings(statement: &Statement, values: &[Value]) -> Result<(), ClusterError> {
    let expected = statement.bind_markers();
    if values.len() != expected {
        return Err(ClusterError::Client(format!(
            "expected {expected} bound values, got {}",
            values.len()
        )));
    }
    let columns: &[&'static str] = match statement {
        Statement::Insert { columns, .. } => columns,
        Statement::Select { filter, .. } | Statement::Delete { filter, .. } => filter,
        _ => &[],
    };
    if let Some(table) = statement.table() {
        for (name, value) in columns.iter().zip(values) {
            if let Some(column) = table.schema.column(name) {
                if !value.fits(column.kind) {
                    return Err(ClusterError::Encoding(format!(
                        "cannot bind {value:?} to {name} ({})",
                        column.kind.cql_name()
                    )));
                }
                if value.is_null() && table.schema.is_primary_key(name) {
                    return Err(ClusterError::Validation(format!(
                        "invalid null value for primary key column {name}"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_display() {
        assert_eq!(Consistency::One.to_string(), "ONE");
        assert_eq!(Consistency::LocalQuorum.to_string(), "LOCAL_QUORUM");
        assert_eq!(Consistency::default(), Consistency::One);
    }

    #[test]
    fn test_paging_state_offset_round_trip() {
        assert_eq!(PagingState::from_offset(42).offset().unwrap(), 42);
        assert!(PagingState(vec![1, 2]).offset().is_err());
        assert_eq!(PagingState::from_bytes(vec![1, 2]).as_bytes(), &[1, 2]);
    }
}
