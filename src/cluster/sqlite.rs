//! Durable single-node backend on SQLite.
//!
//! A keyspace is a name prefix: table `ks.pages` is stored as `"ks__pages"`,
//! and created keyspaces are recorded in `_keyspaces`. Time UUIDs are stored
//! in their sortable byte form so `ORDER BY` on a clustering column gives
//! timestamp order.

use std::fs::OpenOptions;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite, SqlitePool};

use crate::error_handling::{ClusterError, InitializationError};

use super::statement::{ClusteringOrder, Projection, Statement, TableRef, TableSchema};
use super::timeuuid::TimeUuid;
use super::value::{ColumnType, Row, Value};
use super::{check_bindings, Connection, ExecOptions, PagingState, Prepared, ResultPage};

const KEYSPACE_REGISTRY: &str = "_keyspaces";

/// A [`Connection`] backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteCluster {
    pool: SqlitePool,
    next_id: std::sync::Arc<AtomicU64>,
}

impl SqliteCluster {
    /// Opens (creating if needed) the database file at `path` in WAL mode.
    pub async fn open(path: &Path) -> Result<Self, InitializationError> {
        let path_str = path.to_string_lossy().to_string();
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path_str)
        {
            Ok(_) => info!("Database file created: {path_str}"),
            Err(ref e) if e.kind() == IoErrorKind::AlreadyExists => {
                info!("Using existing database file: {path_str}")
            }
            Err(e) => {
                error!("Failed to create database file: {e}");
                return Err(InitializationError::BackendError(e.to_string()));
            }
        }

        let pool = SqlitePool::connect(&format!("sqlite:{path_str}"))
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {e}");
                InitializationError::BackendError(e.to_string())
            })?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(|e| {
                error!("Failed to set WAL mode: {e}");
                InitializationError::BackendError(e.to_string())
            })?;

        Self::with_pool(pool).await
    }

    /// A private in-memory database, dropped with the last clone.
    pub async fn in_memory() -> Result<Self, InitializationError> {
        // Every connection to `:memory:` is its own database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| InitializationError::BackendError(e.to_string()))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, InitializationError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {KEYSPACE_REGISTRY} (name TEXT PRIMARY KEY, replication TEXT NOT NULL, durable_writes INTEGER NOT NULL)"
        ))
        .execute(&pool)
        .await
        .map_err(|e| InitializationError::BackendError(e.to_string()))?;
        Ok(Self {
            pool,
            next_id: std::sync::Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn has_keyspace(&self, keyspace: &str) -> Result<bool, ClusterError> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {KEYSPACE_REGISTRY} WHERE name = ?"
        ))
        .bind(keyspace)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }

    async fn create_table(&self, table: &TableRef) -> Result<(), ClusterError> {
        if !self.has_keyspace(&table.keyspace).await? {
            return Err(ClusterError::Validation(format!(
                "keyspace {} does not exist",
                table.keyspace
            )));
        }
        let schema = table.schema;
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, sql_type(c.kind)))
            .collect::<Vec<_>>()
            .join(", ");
        let key = schema.primary_key().collect::<Vec<_>>().join(", ");
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({columns}, PRIMARY KEY ({key}))",
            quoted(table)
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn select(
        &self,
        table: &TableRef,
        projection: &Projection,
        filter: &[&'static str],
        limit: Option<usize>,
        values: &[Value],
        options: &ExecOptions,
    ) -> Result<ResultPage, ClusterError> {
        let schema = table.schema;
        let where_clause = where_clause(filter);

        if *projection == Projection::Count {
            let sql = format!("SELECT COUNT(*) AS count FROM {}{where_clause}", quoted(table));
            let row = bind_all(sqlx::query(&sql), values)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            let count: i64 = row.try_get("count").map_err(map_sqlx_error)?;
            return Ok(ResultPage {
                rows: vec![Row::new().with("count", Value::BigInt(count))],
                paging_state: None,
            });
        }

        let names: Vec<&'static str> = match projection {
            Projection::Columns(columns) => columns.clone(),
            _ => schema.column_names().collect(),
        };
        let offset = match &options.paging_state {
            Some(state) => state.offset()?,
            None => 0,
        };
        let remaining = limit.map(|l| (l as u64).saturating_sub(offset));
        let wanted = match (remaining, options.page_size) {
            (Some(r), Some(p)) => Some(r.min(p as u64)),
            (Some(r), None) => Some(r),
            (None, Some(p)) => Some(p as u64),
            (None, None) => None,
        };
        if wanted == Some(0) {
            return Ok(ResultPage::empty());
        }

        let mut sql = format!(
            "SELECT {} FROM {}{where_clause}{}",
            names.join(", "),
            quoted(table),
            order_by(schema)
        );
        // One extra row tells us whether another page follows.
        match wanted {
            Some(n) => sql.push_str(&format!(" LIMIT {} OFFSET {offset}", n + 1)),
            None => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        }

        let fetched = bind_all(sqlx::query(&sql), values)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut rows = Vec::with_capacity(fetched.len());
        for raw in &fetched {
            rows.push(decode_row(schema, &names, raw)?);
        }

        let mut paging_state = None;
        if let Some(n) = wanted {
            if rows.len() as u64 > n {
                rows.truncate(n as usize);
                if remaining.map_or(true, |r| r > n) {
                    paging_state = Some(PagingState::from_offset(offset + n));
                }
            }
        }
        Ok(ResultPage { rows, paging_state })
    }
}

fn physical_name(table: &TableRef) -> String {
    format!("{}__{}", table.keyspace, table.name)
}

fn quoted(table: &TableRef) -> String {
    format!("\"{}\"", physical_name(table))
}

fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Text => "TEXT",
        ColumnType::TimeUuid | ColumnType::Blob => "BLOB",
        ColumnType::Int | ColumnType::BigInt | ColumnType::Boolean | ColumnType::Timestamp => {
            "INTEGER"
        }
    }
}

fn where_clause(filter: &[&'static str]) -> String {
    if filter.is_empty() {
        return String::new();
    }
    let clauses = filter
        .iter()
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(" WHERE {clauses}")
}

fn order_by(schema: &TableSchema) -> String {
    let mut keys: Vec<String> = schema.partition_key.iter().map(|k| k.to_string()).collect();
    keys.extend(schema.clustering_key.iter().map(|(name, order)| match order {
        ClusteringOrder::Asc => format!("{name} ASC"),
        ClusteringOrder::Desc => format!("{name} DESC"),
    }));
    format!(" ORDER BY {}", keys.join(", "))
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Text(s) => query.bind(s.clone()),
        Value::TimeUuid(u) => query.bind(u.to_sortable_bytes().to_vec()),
        Value::Int(i) => query.bind(*i),
        Value::BigInt(i) | Value::Timestamp(i) => query.bind(*i),
        Value::Boolean(b) => query.bind(*b),
        Value::Blob(b) => query.bind(b.clone()),
    }
}

fn bind_all<'q>(query: SqliteQuery<'q>, values: &[Value]) -> SqliteQuery<'q> {
    values.iter().fold(query, bind_value)
}

fn decode_row(
    schema: &TableSchema,
    names: &[&'static str],
    raw: &SqliteRow,
) -> Result<Row, ClusterError> {
    let mut row = Row::new();
    for name in names {
        let kind = schema
            .column(name)
            .map(|c| c.kind)
            .ok_or_else(|| ClusterError::Decoding(format!("unknown column {name}")))?;
        let value = match kind {
            ColumnType::Text => raw
                .try_get::<Option<String>, _>(*name)
                .map_err(map_sqlx_error)?
                .into(),
            ColumnType::TimeUuid => match raw
                .try_get::<Option<Vec<u8>>, _>(*name)
                .map_err(map_sqlx_error)?
            {
                Some(bytes) => TimeUuid::from_sortable_bytes(&bytes)
                    .map(Value::TimeUuid)
                    .ok_or_else(|| {
                        ClusterError::Decoding(format!("column {name}: malformed timeuuid"))
                    })?,
                None => Value::Null,
            },
            ColumnType::Int => raw
                .try_get::<Option<i32>, _>(*name)
                .map_err(map_sqlx_error)?
                .into(),
            ColumnType::BigInt => raw
                .try_get::<Option<i64>, _>(*name)
                .map_err(map_sqlx_error)?
                .into(),
            ColumnType::Boolean => raw
                .try_get::<Option<bool>, _>(*name)
                .map_err(map_sqlx_error)?
                .into(),
            ColumnType::Timestamp => raw
                .try_get::<Option<i64>, _>(*name)
                .map_err(map_sqlx_error)?
                .map_or(Value::Null, Value::Timestamp),
            ColumnType::Blob => raw
                .try_get::<Option<Vec<u8>>, _>(*name)
                .map_err(map_sqlx_error)?
                .into(),
        };
        row.push(*name, value);
    }
    Ok(row)
}

/// Classifies a SQLite failure the way a cluster driver would.
fn map_sqlx_error(e: sqlx::Error) -> ClusterError {
    match e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            let lower = message.to_lowercase();
            if lower.contains("locked") || lower.contains("busy") {
                ClusterError::Timeout(message)
            } else {
                ClusterError::Validation(message)
            }
        }
        sqlx::Error::Io(io) => ClusterError::Io(io.to_string()),
        sqlx::Error::PoolTimedOut => {
            ClusterError::NoHostsAvailable("connection pool timed out".to_string())
        }
        sqlx::Error::PoolClosed => {
            ClusterError::NoHostsAvailable("connection pool closed".to_string())
        }
        sqlx::Error::WorkerCrashed => ClusterError::Internal("sqlite worker crashed".to_string()),
        sqlx::Error::Encode(err) => ClusterError::Encoding(err.to_string()),
        sqlx::Error::Decode(err) => ClusterError::Decoding(err.to_string()),
        e @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::RowNotFound) => ClusterError::Decoding(e.to_string()),
        sqlx::Error::Protocol(message) => ClusterError::Server(message),
        other => ClusterError::Internal(other.to_string()),
    }
}

#[async_trait]
impl Connection for SqliteCluster {
    async fn prepare(&self, statement: &Statement) -> Result<Prepared, ClusterError> {
        statement.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Prepared::new(id, statement.clone()))
    }

    async fn execute(
        &self,
        prepared: &Prepared,
        values: &[Value],
        options: &ExecOptions,
    ) -> Result<ResultPage, ClusterError> {
        let statement = prepared.statement();
        check_bindings(statement, values)?;
        match statement {
            Statement::CreateKeyspace {
                keyspace,
                replication,
                durable_writes,
            } => {
                sqlx::query(&format!(
                    "INSERT OR IGNORE INTO {KEYSPACE_REGISTRY} (name, replication, durable_writes) VALUES (?, ?, ?)"
                ))
                .bind(keyspace.clone())
                .bind(replication.to_string())
                .bind(*durable_writes)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
                Ok(ResultPage::empty())
            }
            Statement::CreateTable { table, .. } => {
                self.create_table(table).await?;
                Ok(ResultPage::empty())
            }
            Statement::DropTable { table, if_exists } => {
                let sql = if *if_exists {
                    format!("DROP TABLE IF EXISTS {}", quoted(table))
                } else {
                    format!("DROP TABLE {}", quoted(table))
                };
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
                Ok(ResultPage::empty())
            }
            Statement::Insert { table, columns } => {
                let key: Vec<&str> = table.schema.primary_key().collect();
                let updates: Vec<String> = columns
                    .iter()
                    .filter(|c| !key.contains(c))
                    .map(|c| format!("{c} = excluded.{c}"))
                    .collect();
                let conflict = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    format!("DO UPDATE SET {}", updates.join(", "))
                };
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {conflict}",
                    quoted(table),
                    columns.join(", "),
                    vec!["?"; columns.len()].join(", "),
                    key.join(", ")
                );
                bind_all(sqlx::query(&sql), values)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
                Ok(ResultPage::empty())
            }
            Statement::Select {
                table,
                projection,
                filter,
                limit,
            } => {
                self.select(table, projection, filter, *limit, values, options)
                    .await
            }
            Statement::Delete { table, filter } => {
                let sql = format!("DELETE FROM {}{}", quoted(table), where_clause(filter));
                bind_all(sqlx::query(&sql), values)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
                Ok(ResultPage::empty())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::statement::ColumnDef;
    use crate::cluster::TimeUuidGenerator;
    use crate::config::Replication;

    static EVENTS: TableSchema = TableSchema {
        columns: &[
            ColumnDef {
                name: "stream",
                kind: ColumnType::Text,
            },
            ColumnDef {
                name: "at",
                kind: ColumnType::TimeUuid,
            },
            ColumnDef {
                name: "body",
                kind: ColumnType::Text,
            },
        ],
        partition_key: &["stream"],
        clustering_key: &[("at", ClusteringOrder::Asc)],
    };

    fn events() -> TableRef {
        TableRef::new("ks", "events", &EVENTS)
    }

    async fn exec(
        cluster: &SqliteCluster,
        statement: Statement,
        values: &[Value],
        options: &ExecOptions,
    ) -> Result<ResultPage, ClusterError> {
        let prepared = cluster.prepare(&statement).await?;
        cluster.execute(&prepared, values, options).await
    }

    async fn setup() -> SqliteCluster {
        let cluster = SqliteCluster::in_memory().await.unwrap();
        let options = ExecOptions::default();
        exec(
            &cluster,
            Statement::CreateKeyspace {
                keyspace: "ks".into(),
                replication: Replication::default(),
                durable_writes: true,
            },
            &[],
            &options,
        )
        .await
        .unwrap();
        exec(
            &cluster,
            Statement::CreateTable {
                table: events(),
                properties: vec![],
            },
            &[],
            &options,
        )
        .await
        .unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_create_table_requires_keyspace() {
        let cluster = SqliteCluster::in_memory().await.unwrap();
        let err = exec(
            &cluster,
            Statement::CreateTable {
                table: events(),
                properties: vec![],
            },
            &[],
            &ExecOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClusterError::Validation(_)));
    }

    #[tokio::test]
    async fn test_timeuuid_clustering_order_and_paging() {
        let cluster = setup().await;
        let generator = TimeUuidGenerator::new();
        let ids: Vec<TimeUuid> = (0..5).map(|_| generator.now()).collect();
        let insert = Statement::Insert {
            table: events(),
            columns: vec!["stream", "at", "body"],
        };
        // Insert newest first; reads must still come back oldest first.
        for (i, id) in ids.iter().enumerate().rev() {
            exec(
                &cluster,
                insert.clone(),
                &["s".into(), (*id).into(), format!("m{i}").into()],
                &ExecOptions::default(),
            )
            .await
            .unwrap();
        }

        let select = Statement::Select {
            table: events(),
            projection: Projection::Columns(vec!["at", "body"]),
            filter: vec!["stream"],
            limit: None,
        };
        let mut options = ExecOptions {
            page_size: Some(2),
            ..ExecOptions::default()
        };
        let mut seen = Vec::new();
        loop {
            let page = exec(&cluster, select.clone(), &["s".into()], &options)
                .await
                .unwrap();
            for row in &page.rows {
                seen.push(row.time_uuid("at").unwrap().unwrap());
            }
            match page.paging_state {
                Some(state) => options.paging_state = Some(state),
                None => break,
            }
        }
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn test_limit_and_count() {
        let cluster = setup().await;
        let generator = TimeUuidGenerator::new();
        let insert = Statement::Insert {
            table: events(),
            columns: vec!["stream", "at", "body"],
        };
        for _ in 0..3 {
            exec(
                &cluster,
                insert.clone(),
                &["s".into(), generator.now().into(), Value::Null],
                &ExecOptions::default(),
            )
            .await
            .unwrap();
        }

        let limited = Statement::Select {
            table: events(),
            projection: Projection::All,
            filter: vec![],
            limit: Some(2),
        };
        let page = exec(&cluster, limited, &[], &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 2);
        assert!(page.paging_state.is_none());
        assert_eq!(page.rows[0].text("body").unwrap(), None);

        let count = Statement::Select {
            table: events(),
            projection: Projection::Count,
            filter: vec![],
            limit: None,
        };
        let page = exec(&cluster, count, &[], &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(page.rows[0].bigint("count").unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_unknown_table_is_validation_error() {
        let cluster = SqliteCluster::in_memory().await.unwrap();
        let select = Statement::Select {
            table: events(),
            projection: Projection::All,
            filter: vec![],
            limit: None,
        };
        let err = exec(&cluster, select, &[], &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Validation(_)));
    }

    #[test]
    fn test_pool_errors_are_retriable() {
        use crate::error_handling::Retriable;
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_retriable());
        assert!(!map_sqlx_error(sqlx::Error::RowNotFound).is_retriable());
    }
}
