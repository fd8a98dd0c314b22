//! Durable overflow queue on the cluster.
//!
//! Entries of one queue share a partition (`queue_name`) and are clustered by
//! a time UUID, so `SELECT ... LIMIT n` hands back the `n` oldest entries
//! without any sorting on our side.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cluster::{
    ClusteringOrder, ColumnDef, ColumnType, Projection, Row, Session, Statement, TableRef,
    TableSchema, TimeUuidGenerator, Value,
};
use crate::config::{QueueConfig, QueueLayout, Replication};
use crate::error_handling::{ClusterError, Error};
use crate::retry::RetryExecutor;
use crate::schema::{normalize_identifier, SchemaManager};

use super::{check_limit, encode_payload, Capabilities, Popped, QueueEntry, QueueOverflow, QueueToken};

/// `(queue_name, created_at, payload)`, oldest first within a queue name.
pub static QUEUE_TIME_ORDERED: TableSchema = TableSchema {
    columns: &[
        ColumnDef {
            name: "queue_name",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "created_at",
            kind: ColumnType::TimeUuid,
        },
        ColumnDef {
            name: "payload",
            kind: ColumnType::Text,
        },
    ],
    partition_key: &["queue_name"],
    clustering_key: &[("created_at", ClusteringOrder::Asc)],
};

/// `(id, created_at, payload)` with one partition per entry.
pub static QUEUE_KEYED: TableSchema = TableSchema {
    columns: &[
        ColumnDef {
            name: "id",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "created_at",
            kind: ColumnType::TimeUuid,
        },
        ColumnDef {
            name: "payload",
            kind: ColumnType::Text,
        },
    ],
    partition_key: &["id"],
    clustering_key: &[],
};

/// Overflow queue stored in a cluster table.
///
/// `pop` reads and deletes under one lock, so two callers sharing an instance
/// never receive the same entry. Delivery is still at-least-once: a delete
/// that is not confirmed or fails leaves the entry in place for a later pop,
/// and separate instances or processes may race on the same rows. A pop only
/// fails if nothing has been deleted yet; after that it returns every entry
/// it read.
#[derive(Debug)]
pub struct ClusterQueue {
    session: Arc<Session>,
    schema: SchemaManager,
    executor: RetryExecutor,
    table: TableRef,
    queue_name: String,
    layout: QueueLayout,
    replication: Replication,
    count_supported: bool,
    lock: Mutex<()>,
}

impl ClusterQueue {
    pub fn new(session: Arc<Session>, config: &QueueConfig) -> Result<Self, Error> {
        let keyspace = normalize_identifier(&config.keyspace)?;
        let table_name = normalize_identifier(&config.table)?;
        let schema = match config.layout {
            QueueLayout::TimeOrdered => &QUEUE_TIME_ORDERED,
            QueueLayout::Keyed => &QUEUE_KEYED,
        };
        let executor = RetryExecutor::new(&config.retry)?;
        let queue_name = config.queue_name.clone().unwrap_or_else(|| keyspace.clone());

        Ok(Self {
            schema: SchemaManager::new(Arc::clone(&session), executor.clone()),
            session,
            executor,
            table: TableRef::new(keyspace, table_name, schema),
            queue_name,
            layout: config.layout,
            replication: config.replication.clone(),
            count_supported: config.count_supported,
            lock: Mutex::new(()),
        })
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// `CREATE KEYSPACE IF NOT EXISTS`, with the configured replication unless
    /// one is given.
    pub async fn create_keyspace(
        &self,
        replication: Option<&Replication>,
        durable_writes: bool,
    ) -> Result<bool, Error> {
        let replication = replication.unwrap_or(&self.replication);
        self.schema
            .create_keyspace(&self.table.keyspace, replication, durable_writes)
            .await
    }

    /// `CREATE TABLE IF NOT EXISTS` with `properties` appended verbatim.
    pub async fn create_table(&self, properties: &[String]) -> Result<bool, Error> {
        self.schema.create_table(&self.table, properties).await
    }

    /// Partition filter for reads; the keyed layout scans the whole table.
    fn partition_filter(&self) -> (Vec<&'static str>, Vec<Value>) {
        match self.layout {
            QueueLayout::TimeOrdered => (
                vec!["queue_name"],
                vec![Value::Text(self.queue_name.clone())],
            ),
            QueueLayout::Keyed => (Vec::new(), Vec::new()),
        }
    }

    async fn execute(
        &self,
        label: &str,
        statement: &Statement,
        values: &[Value],
    ) -> Result<Option<Vec<Row>>, Error> {
        let session = &self.session;
        let page = self
            .executor
            .run(label, || async move { session.execute(statement, values).await })
            .await?;
        Ok(page.map(|p| p.rows))
    }

    fn decode_entry(&self, row: &Row) -> Result<QueueEntry, ClusterError> {
        let created_at = row
            .time_uuid("created_at")?
            .ok_or_else(|| ClusterError::Decoding("queue row without created_at".to_string()))?;
        let payload = row.text("payload")?;
        match self.layout {
            QueueLayout::TimeOrdered => {
                let queue_name = row.text("queue_name")?.unwrap_or_default();
                Ok(QueueEntry::new(queue_name, created_at, payload))
            }
            QueueLayout::Keyed => {
                let mut entry = QueueEntry::new(self.queue_name.clone(), created_at, payload);
                entry.id = row.text("id")?;
                Ok(entry)
            }
        }
    }

    fn delete_for(&self, entry: &QueueEntry) -> (Statement, Vec<Value>) {
        match self.layout {
            QueueLayout::TimeOrdered => (
                Statement::Delete {
                    table: self.table.clone(),
                    filter: vec!["queue_name", "created_at"],
                },
                vec![
                    Value::Text(entry.queue_name.clone()),
                    Value::TimeUuid(entry.created_at),
                ],
            ),
            QueueLayout::Keyed => (
                Statement::Delete {
                    table: self.table.clone(),
                    filter: vec!["id"],
                },
                vec![Value::Text(
                    entry
                        .id
                        .clone()
                        .unwrap_or_else(|| entry.created_at.to_string()),
                )],
            ),
        }
    }
}

#[async_trait]
impl QueueOverflow for ClusterQueue {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            count: self.count_supported,
            durable: true,
            ordered: self.layout == QueueLayout::TimeOrdered,
        }
    }

    async fn ensure_schema(&self) -> Result<bool, Error> {
        let keyspace = self.create_keyspace(None, true).await?;
        let table = self.create_table(&[]).await?;
        Ok(keyspace && table)
    }

    async fn length(&self) -> Result<Option<u64>, Error> {
        if !self.count_supported {
            return Err(Error::NotSupported("count"));
        }
        let (filter, values) = self.partition_filter();
        let statement = Statement::Select {
            table: self.table.clone(),
            projection: Projection::Count,
            filter,
            limit: None,
        };
        let Some(rows) = self.execute("queue length", &statement, &values).await? else {
            return Ok(None);
        };
        let count = match rows.first() {
            Some(row) => row.bigint("count")?.unwrap_or(0),
            None => 0,
        };
        Ok(Some(count.max(0) as u64))
    }

    async fn is_empty(&self) -> Result<bool, Error> {
        let (filter, values) = self.partition_filter();
        let statement = Statement::Select {
            table: self.table.clone(),
            projection: Projection::Columns(vec!["created_at"]),
            filter,
            limit: Some(1),
        };
        let rows = self.execute("queue is_empty", &statement, &values).await?;
        Ok(rows.map_or(true, |rows| rows.is_empty()))
    }

    async fn clear(&self) -> Result<bool, Error> {
        self.schema.drop_table(&self.table, true).await
    }

    async fn push(&self, envelope: Option<&str>) -> Result<Option<QueueToken>, Error> {
        let Some(envelope) = envelope else {
            return Ok(None);
        };
        let payload = encode_payload(envelope)?;
        let created_at = TimeUuidGenerator::shared().now();
        let (statement, values) = match self.layout {
            QueueLayout::TimeOrdered => (
                Statement::Insert {
                    table: self.table.clone(),
                    columns: vec!["queue_name", "created_at", "payload"],
                },
                vec![
                    Value::Text(self.queue_name.clone()),
                    Value::TimeUuid(created_at),
                    payload.into(),
                ],
            ),
            QueueLayout::Keyed => (
                Statement::Insert {
                    table: self.table.clone(),
                    columns: vec!["id", "created_at", "payload"],
                },
                vec![
                    Value::Text(created_at.to_string()),
                    Value::TimeUuid(created_at),
                    payload.into(),
                ],
            ),
        };

        let written = {
            let _guard = self.lock.lock().await;
            self.execute("queue push", &statement, &values).await?
        };
        if written.is_none() {
            return Ok(None);
        }

        let token = QueueToken {
            queue_name: self.queue_name.clone(),
            created_at,
        };
        log::debug!("Writing this entry {token}");
        Ok(Some(token))
    }

    async fn pop(&self, n: usize) -> Result<Popped, Error> {
        check_limit(n)?;
        let (filter, values) = self.partition_filter();
        let statement = Statement::Select {
            table: self.table.clone(),
            projection: Projection::All,
            filter,
            limit: Some(n),
        };

        let _guard = self.lock.lock().await;
        let Some(rows) = self.execute("queue pop", &statement, &values).await? else {
            return Ok(Popped::Many(Vec::new()));
        };
        let entries = rows
            .iter()
            .map(|row| self.decode_entry(row))
            .collect::<Result<Vec<_>, _>>()?;

        // Once a row is gone the caller must get it, so no error after the first delete.
        let mut deleted = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            let (delete, key) = self.delete_for(entry);
            match self.execute("queue pop delete", &delete, &key).await {
                Ok(Some(_)) => deleted += 1,
                Ok(None) => {
                    log::warn!(
                        "Delete of {} not confirmed; it may be delivered again",
                        entry.token()
                    );
                }
                Err(e) if deleted == 0 => return Err(e),
                Err(e) => {
                    log::warn!(
                        "Delete of {} failed ({e}); it and {} later entries may be delivered again",
                        entry.token(),
                        entries.len() - i - 1
                    );
                    break;
                }
            }
        }
        Ok(Popped::from_entries(entries))
    }
}
