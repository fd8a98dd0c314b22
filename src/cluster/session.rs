//! Cluster session: prepared-statement cache plus the statement retry policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::ClusterConfig;
use crate::error_handling::ClusterError;
use crate::retry::{DefaultRetryPolicy, RetryDecision, StatementRetryPolicy};

use super::statement::Statement;
use super::value::Value;
use super::{Connection, Consistency, ExecOptions, PagingState, Prepared, ResultPage};

/// A handle on the cluster shared (via `Arc`) by queue and store instances.
///
/// Statements are prepared once per distinct CQL text. Replica-level failures
/// (read timeout, write timeout, unavailable) are handed to the statement
/// retry policy before anything reaches the caller; every other failure is
/// returned as is. Connections with a driver of their own receive the policy
/// with each execution and register it on the driver's statement; for the
/// rest the session runs the policy between executions.
pub struct Session {
    connection: Arc<dyn Connection>,
    policy: Arc<dyn StatementRetryPolicy>,
    consistency: Consistency,
    prepared: Mutex<HashMap<String, Prepared>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("consistency", &self.consistency)
            .field("prepared", &self.cache().len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A session with [`DefaultRetryPolicy`] at consistency `ONE`.
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            policy: Arc::new(DefaultRetryPolicy::default()),
            consistency: Consistency::default(),
            prepared: Mutex::new(HashMap::new()),
        }
    }

    /// A session at the configured consistency with a [`DefaultRetryPolicy`]
    /// built from the configured statement retry settings.
    pub fn with_config(connection: Arc<dyn Connection>, config: &ClusterConfig) -> Self {
        Self::new(connection)
            .with_consistency(config.consistency)
            .with_policy(Arc::new(DefaultRetryPolicy::new(
                config.statement_retry.clone(),
            )))
    }

    pub fn with_policy(mut self, policy: Arc<dyn StatementRetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Prepared>> {
        self.prepared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepares `statement`, reusing an earlier preparation of the same CQL.
    ///
    /// Schema statements are never cached.
    pub async fn prepare(&self, statement: &Statement) -> Result<Prepared, ClusterError> {
        let cql = statement.to_cql();
        let cached = self.cache().get(&cql).cloned();
        if let Some(prepared) = cached {
            return Ok(prepared);
        }
        let prepared = self.connection.prepare(statement).await?;
        if !statement.is_ddl() {
            log::trace!("prepared: {cql}");
            self.cache().insert(cql, prepared.clone());
        }
        Ok(prepared)
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        values: &[Value],
    ) -> Result<ResultPage, ClusterError> {
        self.execute_paged(statement, values, None, None).await
    }

    /// Executes one page of `statement`, resuming at `paging_state`.
    pub async fn execute_paged(
        &self,
        statement: &Statement,
        values: &[Value],
        page_size: Option<usize>,
        paging_state: Option<PagingState>,
    ) -> Result<ResultPage, ClusterError> {
        let prepared = self.prepare(statement).await?;
        let mut options = ExecOptions {
            consistency: self.consistency,
            page_size,
            paging_state,
            retry_policy: None,
        };

        if self.connection.applies_statement_policy() {
            options.retry_policy = Some(Arc::clone(&self.policy));
            let page = self.connection.execute(&prepared, values, &options).await?;
            self.after_success(statement);
            return Ok(page);
        }

        let mut retries = 0u32;
        loop {
            let err = match self.connection.execute(&prepared, values, &options).await {
                Ok(page) => {
                    self.after_success(statement);
                    return Ok(page);
                }
                Err(err) => err,
            };

            match self.decide(statement, &err, retries) {
                RetryDecision::Retry { consistency, delay } => {
                    retries += 1;
                    log::debug!(
                        "statement retry {retries} at {consistency} in {delay:?} after: {err}"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    options.consistency = consistency;
                }
                RetryDecision::Rethrow => return Err(err),
            }
        }
    }

    fn after_success(&self, statement: &Statement) {
        if statement.is_ddl() {
            // Table definitions may have changed under cached statements.
            self.cache().clear();
        }
    }

    fn decide(&self, statement: &Statement, err: &ClusterError, retries: u32) -> RetryDecision {
        match *err {
            ClusterError::ReadTimeout {
                consistency,
                required,
                received,
                data_retrieved,
            } => self.policy.read_timeout(
                statement,
                consistency,
                required,
                received,
                data_retrieved,
                retries,
            ),
            ClusterError::WriteTimeout {
                consistency,
                write_type,
                required,
                received,
            } => self.policy.write_timeout(
                statement,
                consistency,
                write_type,
                required,
                received,
                retries,
            ),
            ClusterError::Unavailable {
                consistency,
                required,
                alive,
            } => self
                .policy
                .unavailable(statement, consistency, required, alive, retries),
            _ => RetryDecision::Rethrow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cluster::{
        ColumnDef, ColumnType, Fault, MemoryCluster, Projection, TableRef, TableSchema, WriteType,
    };
    use crate::config::{Replication, StatementRetryConfig};
    use crate::retry::NeverRetryPolicy;

    static KV: TableSchema = TableSchema {
        columns: &[
            ColumnDef {
                name: "k",
                kind: ColumnType::Text,
            },
            ColumnDef {
                name: "v",
                kind: ColumnType::Text,
            },
        ],
        partition_key: &["k"],
        clustering_key: &[],
    };

    fn kv() -> TableRef {
        TableRef::new("ks", "kv", &KV)
    }

    fn fast_policy() -> Arc<dyn StatementRetryPolicy> {
        Arc::new(DefaultRetryPolicy::new(StatementRetryConfig {
            max_retries: 5,
            step: Duration::ZERO,
            jitter: Duration::ZERO,
        }))
    }

    async fn setup() -> (Arc<MemoryCluster>, Session) {
        let cluster = Arc::new(MemoryCluster::new());
        let session = Session::new(cluster.clone()).with_policy(fast_policy());
        session
            .execute(
                &Statement::CreateKeyspace {
                    keyspace: "ks".into(),
                    replication: Replication::default(),
                    durable_writes: true,
                },
                &[],
            )
            .await
            .unwrap();
        session
            .execute(
                &Statement::CreateTable {
                    table: kv(),
                    properties: vec![],
                },
                &[],
            )
            .await
            .unwrap();
        (cluster, session)
    }

    fn insert() -> Statement {
        Statement::Insert {
            table: kv(),
            columns: vec!["k", "v"],
        }
    }

    fn write_timeout() -> ClusterError {
        ClusterError::WriteTimeout {
            consistency: Consistency::One,
            write_type: WriteType::Simple,
            required: 1,
            received: 0,
        }
    }

    #[tokio::test]
    async fn test_prepared_statements_are_cached() {
        let (cluster, session) = setup().await;
        let before = cluster.prepares();
        for v in ["a", "b", "c"] {
            session
                .execute(&insert(), &["k".into(), v.into()])
                .await
                .unwrap();
        }
        assert_eq!(cluster.prepares(), before + 1);
    }

    #[tokio::test]
    async fn test_policy_absorbs_write_timeouts() {
        let (cluster, session) = setup().await;
        cluster.fail_next(Fault::Insert, 3, write_timeout());
        let before = cluster.executions();
        session
            .execute(&insert(), &["k".into(), "v".into()])
            .await
            .unwrap();
        assert_eq!(cluster.executions(), before + 4);
        assert_eq!(cluster.row_count("ks", "kv"), Some(1));
    }

    #[tokio::test]
    async fn test_policy_gives_up_after_five_retries() {
        let (cluster, session) = setup().await;
        cluster.outage(Fault::Insert, write_timeout());
        let before = cluster.executions();
        let err = session
            .execute(&insert(), &["k".into(), "v".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::WriteTimeout { .. }));
        assert_eq!(cluster.executions(), before + 6);
    }

    #[tokio::test]
    async fn test_other_errors_bypass_policy() {
        let (cluster, session) = setup().await;
        cluster.fail_next(Fault::Select, 1, ClusterError::Server("overloaded".into()));
        let before = cluster.executions();
        let select = Statement::Select {
            table: kv(),
            projection: Projection::All,
            filter: vec![],
            limit: None,
        };
        assert!(session.execute(&select, &[]).await.is_err());
        assert_eq!(cluster.executions(), before + 1);
    }

    #[tokio::test]
    async fn test_never_policy_rethrows_immediately() {
        let (cluster, session) = setup().await;
        let session = session.with_policy(Arc::new(NeverRetryPolicy));
        cluster.fail_next(Fault::Insert, 1, write_timeout());
        assert!(session
            .execute(&insert(), &["k".into(), "v".into()])
            .await
            .is_err());
        assert_eq!(cluster.row_count("ks", "kv"), Some(0));
    }

    /// Applies the statement policy "in the driver": records that it was handed over.
    struct DriverApplied {
        inner: Arc<MemoryCluster>,
        received_policy: AtomicBool,
    }

    #[async_trait]
    impl Connection for DriverApplied {
        async fn prepare(&self, statement: &Statement) -> Result<Prepared, ClusterError> {
            self.inner.prepare(statement).await
        }

        async fn execute(
            &self,
            prepared: &Prepared,
            values: &[Value],
            options: &ExecOptions,
        ) -> Result<ResultPage, ClusterError> {
            if options.retry_policy.is_some() {
                self.received_policy.store(true, Ordering::SeqCst);
            }
            self.inner.execute(prepared, values, options).await
        }

        fn applies_statement_policy(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_driver_connections_get_the_policy_instead_of_a_session_loop() {
        let (cluster, _) = setup().await;
        let connection = Arc::new(DriverApplied {
            inner: cluster.clone(),
            received_policy: AtomicBool::new(false),
        });
        let session = Session::new(connection.clone()).with_policy(fast_policy());

        cluster.fail_next(Fault::Insert, 1, write_timeout());
        let before = cluster.executions();
        let err = session
            .execute(&insert(), &["k".into(), "v".into()])
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::WriteTimeout { .. }));
        assert_eq!(cluster.executions(), before + 1);
        assert!(connection.received_policy.load(Ordering::SeqCst));
    }

    #[test]
    fn test_with_config_takes_consistency() {
        let config = ClusterConfig {
            consistency: Consistency::LocalQuorum,
            ..ClusterConfig::default()
        };
        let session = Session::with_config(Arc::new(MemoryCluster::new()), &config);
        assert_eq!(session.consistency(), Consistency::LocalQuorum);
    }
}
