//! Schema management shared by the queue and the store.
//!
//! Keyspace and table creation are idempotent (`IF NOT EXISTS`) and run
//! through the Retry Executor like every other statement, so they report
//! `false` rather than failing when the cluster stays unreachable.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::cluster::{Session, Statement};
use crate::config::{Replication, MAX_IDENTIFIER_LENGTH};
use crate::error_handling::Error;
use crate::retry::RetryExecutor;

pub use crate::cluster::TableRef;

static ILLEGAL_IDENTIFIER_CHARS: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]"));

/// Makes `name` usable as a keyspace or table identifier.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`. The result must start
/// with a letter and fit in 48 characters.
pub fn normalize_identifier(name: &str) -> Result<String, Error> {
    let illegal = ILLEGAL_IDENTIFIER_CHARS
        .as_ref()
        .map_err(|e| Error::InvalidConfig(format!("identifier pattern: {e}")))?;
    let normalized = illegal.replace_all(name, "_").into_owned();
    if !normalized
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
    {
        return Err(Error::InvalidConfig(format!(
            "identifier `{name}` must start with a letter"
        )));
    }
    if normalized.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::InvalidConfig(format!(
            "identifier `{name}` is longer than {MAX_IDENTIFIER_LENGTH} characters"
        )));
    }
    Ok(normalized)
}

/// Issues DDL through the session under the Retry Executor.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    session: Arc<Session>,
    executor: RetryExecutor,
}

impl SchemaManager {
    pub fn new(session: Arc<Session>, executor: RetryExecutor) -> Self {
        Self { session, executor }
    }

    async fn run(&self, label: &str, statement: Statement) -> Result<bool, Error> {
        log::debug!("{label}: {}", statement.to_cql());
        let session = &self.session;
        let statement = &statement;
        let confirmed = self
            .executor
            .run(label, || async move { session.execute(statement, &[]).await })
            .await?;
        Ok(confirmed.is_some())
    }

    /// `CREATE KEYSPACE IF NOT EXISTS`. Returns whether the cluster confirmed it.
    pub async fn create_keyspace(
        &self,
        keyspace: &str,
        replication: &Replication,
        durable_writes: bool,
    ) -> Result<bool, Error> {
        let statement = Statement::CreateKeyspace {
            keyspace: keyspace.to_string(),
            replication: replication.clone(),
            durable_writes,
        };
        self.run("create_keyspace", statement).await
    }

    /// `CREATE TABLE IF NOT EXISTS` with `properties` appended verbatim.
    ///
    /// Tables with clustering columns get their clustering order unless one
    /// of `properties` already sets it.
    pub async fn create_table(&self, table: &TableRef, properties: &[String]) -> Result<bool, Error> {
        let mut properties = properties.to_vec();
        let has_order = properties
            .iter()
            .any(|p| p.trim_start().to_ascii_uppercase().starts_with("CLUSTERING ORDER"));
        if !has_order {
            if let Some(order) = table.schema.clustering_order_property() {
                properties.insert(0, order);
            }
        }
        let statement = Statement::CreateTable {
            table: table.clone(),
            properties,
        };
        self.run("create_table", statement).await
    }

    pub async fn drop_table(&self, table: &TableRef, if_exists: bool) -> Result<bool, Error> {
        let statement = Statement::DropTable {
            table: table.clone(),
            if_exists,
        };
        self.run("drop_table", statement).await
    }
}
