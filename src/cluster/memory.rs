//! In-process cluster.
//!
//! Rows live in a sorted map keyed by `(token, partition key, clustering key)`,
//! so full scans come back in token order and rows within a partition in
//! clustering order, the same way a real cluster returns them. Inserts are
//! upserts that only touch the columns they name.
//!
//! Faults can be scripted per statement kind, which is how the test suite
//! exercises both retry layers.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error_handling::ClusterError;

use super::statement::{ClusteringOrder, Projection, Statement, TableRef, TableSchema};
use super::value::{compare_values, Row, Value};
use super::{check_bindings, Connection, ExecOptions, PagingState, Prepared, ResultPage};

/// Statement kinds a scripted fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Any,
    Ddl,
    Insert,
    Select,
    Delete,
}

impl Fault {
    fn matches(&self, statement: &Statement) -> bool {
        match self {
            Fault::Any => true,
            Fault::Ddl => statement.is_ddl(),
            Fault::Insert => matches!(statement, Statement::Insert { .. }),
            Fault::Select => matches!(statement, Statement::Select { .. }),
            Fault::Delete => matches!(statement, Statement::Delete { .. }),
        }
    }
}

#[derive(Debug)]
struct FaultRule {
    target: Fault,
    /// `None` fails until healed.
    remaining: Option<u32>,
    error: ClusterError,
}

/// Primary key position of a row.
#[derive(Debug, Clone)]
struct RowKey {
    token: u64,
    partition: Vec<Value>,
    clustering: Vec<(Value, ClusteringOrder)>,
}

impl RowKey {
    fn new(schema: &TableSchema, row: &[Value]) -> Self {
        let partition: Vec<Value> = schema
            .partition_key
            .iter()
            .map(|name| column_value(schema, row, name))
            .collect();
        let clustering = schema
            .clustering_key
            .iter()
            .map(|(name, order)| (column_value(schema, row, name), *order))
            .collect();
        let mut hasher = DefaultHasher::new();
        partition.hash(&mut hasher);
        Self {
            token: hasher.finish(),
            partition,
            clustering,
        }
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| {
                self.partition
                    .iter()
                    .zip(&other.partition)
                    .map(|(a, b)| compare_values(a, b))
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                self.clustering
                    .iter()
                    .zip(&other.clustering)
                    .map(|((a, order), (b, _))| match order {
                        ClusteringOrder::Asc => compare_values(a, b),
                        ClusteringOrder::Desc => compare_values(b, a),
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            })
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RowKey {}

#[derive(Debug)]
struct Table {
    schema: &'static TableSchema,
    /// Full rows in schema column order.
    rows: BTreeMap<RowKey, Vec<Value>>,
}

#[derive(Debug, Default)]
struct State {
    keyspaces: HashMap<String, HashMap<String, Table>>,
    faults: Vec<FaultRule>,
}

fn column_value(schema: &TableSchema, row: &[Value], name: &str) -> Value {
    schema
        .columns
        .iter()
        .position(|c| c.name == name)
        .and_then(|i| row.get(i).cloned())
        .unwrap_or(Value::Null)
}

fn unconfigured(table: &TableRef) -> ClusterError {
    ClusterError::Validation(format!("unconfigured table {table}"))
}

/// An in-process cluster for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    next_id: AtomicU64,
    executions: AtomicUsize,
    prepares: AtomicUsize,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `times` executions of `target` statements with `error`.
    pub fn fail_next(&self, target: Fault, times: u32, error: ClusterError) {
        self.state().faults.push(FaultRule {
            target,
            remaining: Some(times),
            error,
        });
    }

    /// Fails every execution of `target` statements until [`MemoryCluster::heal`].
    pub fn outage(&self, target: Fault, error: ClusterError) {
        self.state().faults.push(FaultRule {
            target,
            remaining: None,
            error,
        });
    }

    /// Drops every scripted fault.
    pub fn heal(&self) {
        self.state().faults.clear();
    }

    /// Executions attempted so far, failed ones included.
    pub fn executions(&self) -> usize {
        self.executions.load(AtomicOrdering::SeqCst)
    }

    /// Statements prepared so far.
    pub fn prepares(&self) -> usize {
        self.prepares.load(AtomicOrdering::SeqCst)
    }

    pub fn has_keyspace(&self, keyspace: &str) -> bool {
        self.state().keyspaces.contains_key(keyspace)
    }

    pub fn has_table(&self, keyspace: &str, table: &str) -> bool {
        self.state()
            .keyspaces
            .get(keyspace)
            .is_some_and(|tables| tables.contains_key(table))
    }

    /// Rows currently stored in a table, or `None` if it does not exist.
    pub fn row_count(&self, keyspace: &str, table: &str) -> Option<usize> {
        self.state()
            .keyspaces
            .get(keyspace)
            .and_then(|tables| tables.get(table))
            .map(|t| t.rows.len())
    }

    fn take_fault(state: &mut State, statement: &Statement) -> Option<ClusterError> {
        let index = state
            .faults
            .iter()
            .position(|rule| rule.target.matches(statement))?;
        let rule = &mut state.faults[index];
        let error = rule.error.clone();
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.faults.remove(index);
            }
        }
        Some(error)
    }

    fn table_mut<'a>(state: &'a mut State, table: &TableRef) -> Result<&'a mut Table, ClusterError> {
        state
            .keyspaces
            .get_mut(&table.keyspace)
            .and_then(|tables| tables.get_mut(&table.name))
            .ok_or_else(|| unconfigured(table))
    }

    fn run(
        state: &mut State,
        statement: &Statement,
        values: &[Value],
        options: &ExecOptions,
    ) -> Result<ResultPage, ClusterError> {
        match statement {
            Statement::CreateKeyspace { keyspace, .. } => {
                state.keyspaces.entry(keyspace.clone()).or_default();
                Ok(ResultPage::empty())
            }
            Statement::CreateTable { table, .. } => {
                let tables = state.keyspaces.get_mut(&table.keyspace).ok_or_else(|| {
                    ClusterError::Validation(format!(
                        "keyspace {} does not exist",
                        table.keyspace
                    ))
                })?;
                tables.entry(table.name.clone()).or_insert_with(|| Table {
                    schema: table.schema,
                    rows: BTreeMap::new(),
                });
                Ok(ResultPage::empty())
            }
            Statement::DropTable { table, if_exists } => {
                let removed = state
                    .keyspaces
                    .get_mut(&table.keyspace)
                    .and_then(|tables| tables.remove(&table.name));
                if removed.is_none() && !if_exists {
                    return Err(unconfigured(table));
                }
                Ok(ResultPage::empty())
            }
            Statement::Insert { table, columns } => {
                let stored = Self::table_mut(state, table)?;
                let schema = stored.schema;
                let mut row = vec![Value::Null; schema.columns.len()];
                for (name, value) in columns.iter().zip(values) {
                    if let Some(i) = schema.columns.iter().position(|c| c.name == *name) {
                        row[i] = value.clone();
                    }
                }
                let key = RowKey::new(schema, &row);
                match stored.rows.get_mut(&key) {
                    Some(existing) => {
                        for name in columns {
                            if let Some(i) = schema.columns.iter().position(|c| c.name == *name) {
                                existing[i] = row[i].clone();
                            }
                        }
                    }
                    None => {
                        stored.rows.insert(key, row);
                    }
                }
                Ok(ResultPage::empty())
            }
            Statement::Select {
                table,
                projection,
                filter,
                limit,
            } => {
                let stored = Self::table_mut(state, table)?;
                let schema = stored.schema;
                let matching = stored
                    .rows
                    .values()
                    .filter(|row| matches_filter(schema, row, filter, values));

                if *projection == Projection::Count {
                    let count = matching.count() as i64;
                    return Ok(ResultPage {
                        rows: vec![Row::new().with("count", Value::BigInt(count))],
                        paging_state: None,
                    });
                }

                let names: Vec<&'static str> = match projection {
                    Projection::Columns(columns) => columns.clone(),
                    _ => schema.column_names().collect(),
                };
                let limited: Vec<&Vec<Value>> = match limit {
                    Some(limit) => matching.take(*limit).collect(),
                    None => matching.collect(),
                };

                let offset = match &options.paging_state {
                    Some(state) => state.offset()? as usize,
                    None => 0,
                };
                let page_size = options.page_size.unwrap_or(usize::MAX);
                let rows: Vec<Row> = limited
                    .iter()
                    .skip(offset)
                    .take(page_size)
                    .map(|row| {
                        names.iter().fold(Row::new(), |out, name| {
                            out.with(*name, column_value(schema, row, name))
                        })
                    })
                    .collect();
                let next = offset.saturating_add(rows.len());
                let paging_state =
                    (next < limited.len()).then(|| PagingState::from_offset(next as u64));
                Ok(ResultPage { rows, paging_state })
            }
            Statement::Delete { table, filter } => {
                let stored = Self::table_mut(state, table)?;
                let schema = stored.schema;
                stored
                    .rows
                    .retain(|_, row| !matches_filter(schema, row, filter, values));
                Ok(ResultPage::empty())
            }
        }
    }
}

fn matches_filter(schema: &TableSchema, row: &[Value], filter: &[&'static str], values: &[Value]) -> bool {
    filter.iter().zip(values).all(|(name, expected)| {
        compare_values(&column_value(schema, row, name), expected) == Ordering::Equal
    })
}

#[async_trait]
impl Connection for MemoryCluster {
    async fn prepare(&self, statement: &Statement) -> Result<Prepared, ClusterError> {
        self.prepares.fetch_add(1, AtomicOrdering::SeqCst);
        statement.validate()?;
        if !statement.is_ddl() {
            if let Some(table) = statement.table() {
                let state = self.state();
                let exists = state
                    .keyspaces
                    .get(&table.keyspace)
                    .is_some_and(|tables| tables.contains_key(&table.name));
                if !exists {
                    return Err(unconfigured(table));
                }
            }
        }
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Prepared::new(id, statement.clone()))
    }

    async fn execute(
        &self,
        prepared: &Prepared,
        values: &[Value],
        options: &ExecOptions,
    ) -> Result<ResultPage, ClusterError> {
        self.executions.fetch_add(1, AtomicOrdering::SeqCst);
        let statement = prepared.statement();
        let mut state = self.state();
        if let Some(error) = Self::take_fault(&mut state, statement) {
            log::debug!("injected fault for `{}`: {error}", prepared.cql());
            return Err(error);
        }
        check_bindings(statement, values)?;
        Self::run(&mut state, statement, values, options)
    }
}
