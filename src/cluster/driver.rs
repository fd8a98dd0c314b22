//! Cassandra and ScyllaDB backend on the `scylla` driver.
//!
//! Statements are prepared on the cluster once per CQL text; schema
//! statements run unprepared. The statement retry policy handed over by
//! `Session` is registered on each driver statement, so the driver consults
//! it on read timeouts, write timeouts and unavailable replicas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use scylla::client::execution_profile::ExecutionProfile;
use scylla::client::session::Session as DriverSession;
use scylla::client::session_builder::SessionBuilder;
use scylla::errors::{
    DbError, ExecutionError, PrepareError, RequestAttemptError, WriteType as DriverWriteType,
};
use scylla::policies::retry::{
    RequestInfo, RetryDecision as DriverDecision, RetryPolicy, RetrySession,
};
use scylla::response::query_result::QueryResult;
use scylla::response::{PagingState as DriverPagingState, PagingStateResponse};
use scylla::statement::prepared::PreparedStatement;
use scylla::statement::unprepared::Statement as UnpreparedStatement;
use scylla::statement::Consistency as DriverConsistency;
use scylla::value::{CqlTimestamp, CqlTimeuuid, CqlValue, Row as DriverRow};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::error_handling::{ClusterError, InitializationError};
use crate::retry::{RetryDecision, StatementRetryPolicy};

use super::statement::Statement;
use super::timeuuid::TimeUuid;
use super::value::{Row, Value};
use super::{Connection, Consistency, ExecOptions, PagingState, Prepared, ResultPage, WriteType};

/// A [`Connection`] to a Cassandra or ScyllaDB cluster.
pub struct ScyllaCluster {
    session: DriverSession,
    statements: Mutex<HashMap<String, PreparedStatement>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ScyllaCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScyllaCluster")
            .field("prepared", &self.statements().len())
            .finish_non_exhaustive()
    }
}

impl ScyllaCluster {
    /// Connects to the contact points in `config`.
    ///
    /// The default execution profile carries the configured consistency and
    /// request timeout.
    pub async fn connect(config: &ClusterConfig) -> Result<Self, InitializationError> {
        config
            .validate()
            .map_err(|e| InitializationError::BackendError(e.to_string()))?;

        let profile = ExecutionProfile::builder()
            .consistency(driver_consistency(config.consistency))
            .request_timeout(config.request_timeout)
            .build();

        let session = SessionBuilder::new()
            .known_nodes(&config.hosts)
            .default_execution_profile_handle(profile.into_handle())
            .build()
            .await
            .map_err(|e| {
                error!("Failed to connect to {}: {e}", config.hosts.join(", "));
                InitializationError::BackendError(e.to_string())
            })?;
        info!("Connected to cluster via {}", config.hosts.join(", "));

        Ok(Self {
            session,
            statements: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn statements(&self) -> MutexGuard<'_, HashMap<String, PreparedStatement>> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn driver_statement(&self, prepared: &Prepared) -> Result<PreparedStatement, ClusterError> {
        self.statements()
            .get(prepared.cql())
            .cloned()
            .ok_or_else(|| ClusterError::Client(format!("not prepared: {}", prepared.cql())))
    }

    async fn execute_ddl(
        &self,
        prepared: &Prepared,
        options: &ExecOptions,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) -> Result<ResultPage, ClusterError> {
        let mut statement = UnpreparedStatement::new(prepared.cql());
        statement.set_consistency(driver_consistency(options.consistency));
        statement.set_retry_policy(retry_policy);
        self.session
            .query_unpaged(statement, ())
            .await
            .map_err(map_execution_error)?;
        Ok(ResultPage::empty())
    }
}

#[async_trait]
impl Connection for ScyllaCluster {
    async fn prepare(&self, statement: &Statement) -> Result<Prepared, ClusterError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let prepared = Prepared::new(id, statement.clone());
        if !statement.is_ddl() {
            let driver = self
                .session
                .prepare(prepared.cql())
                .await
                .map_err(map_prepare_error)?;
            self.statements().insert(prepared.cql().to_string(), driver);
        }
        Ok(prepared)
    }

    async fn execute(
        &self,
        prepared: &Prepared,
        values: &[Value],
        options: &ExecOptions,
    ) -> Result<ResultPage, ClusterError> {
        let retry_policy = options.retry_policy.as_ref().map(|policy| {
            Arc::new(DriverRetryPolicy {
                policy: Arc::clone(policy),
                statement: prepared.shared_statement(),
            }) as Arc<dyn RetryPolicy>
        });

        if prepared.statement().is_ddl() {
            return self.execute_ddl(prepared, options, retry_policy).await;
        }

        let mut statement = self.driver_statement(prepared)?;
        statement.set_consistency(driver_consistency(options.consistency));
        statement.set_retry_policy(retry_policy);
        let bound: Vec<Option<CqlValue>> = values.iter().map(to_cql_value).collect();

        let Some(page_size) = options.page_size else {
            let result = self
                .session
                .execute_unpaged(&statement, bound)
                .await
                .map_err(map_execution_error)?;
            return Ok(ResultPage {
                rows: decode_rows(result)?,
                paging_state: None,
            });
        };

        statement.set_page_size(i32::try_from(page_size).unwrap_or(i32::MAX));
        let resume = match &options.paging_state {
            Some(state) => DriverPagingState::new_from_raw_bytes(state.as_bytes().to_vec()),
            None => DriverPagingState::start(),
        };
        let (result, response) = self
            .session
            .execute_single_page(&statement, bound, resume)
            .await
            .map_err(map_execution_error)?;
        let paging_state = match response {
            PagingStateResponse::HasMorePages { state } => state
                .as_bytes_slice()
                .map(|bytes| PagingState::from_bytes(bytes.to_vec())),
            _ => None,
        };
        Ok(ResultPage {
            rows: decode_rows(result)?,
            paging_state,
        })
    }

    fn applies_statement_policy(&self) -> bool {
        true
    }
}

/// Registers a [`StatementRetryPolicy`] with the driver for one statement.
#[derive(Debug)]
struct DriverRetryPolicy {
    policy: Arc<dyn StatementRetryPolicy>,
    statement: Arc<Statement>,
}

impl RetryPolicy for DriverRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DriverRetrySession {
            policy: Arc::clone(&self.policy),
            statement: Arc::clone(&self.statement),
            retries: 0,
        })
    }
}

/// Retry state for one execution of a statement.
struct DriverRetrySession {
    policy: Arc<dyn StatementRetryPolicy>,
    statement: Arc<Statement>,
    retries: u32,
}

impl RetrySession for DriverRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> DriverDecision {
        self.decide(request_info.error)
    }

    fn reset(&mut self) {
        self.retries = 0;
    }
}

impl DriverRetrySession {
    fn decide(&mut self, error: &RequestAttemptError) -> DriverDecision {
        let RequestAttemptError::DbError(db_error, _) = error else {
            return DriverDecision::DontRetry;
        };
        let decision = match db_error {
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => self.policy.read_timeout(
                &self.statement,
                our_consistency(*consistency),
                count(*required),
                count(*received),
                *data_present,
                self.retries,
            ),
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => self.policy.write_timeout(
                &self.statement,
                our_consistency(*consistency),
                our_write_type(write_type),
                count(*required),
                count(*received),
                self.retries,
            ),
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => self.policy.unavailable(
                &self.statement,
                our_consistency(*consistency),
                count(*required),
                count(*alive),
                self.retries,
            ),
            _ => return DriverDecision::DontRetry,
        };

        match decision {
            RetryDecision::Retry { consistency, delay } => {
                self.retries += 1;
                debug!(
                    "statement retry {} at {consistency} in {delay:?} after: {error}",
                    self.retries
                );
                pause(delay);
                DriverDecision::RetrySameTarget(Some(driver_consistency(consistency)))
            }
            RetryDecision::Rethrow => DriverDecision::DontRetry,
        }
    }
}

/// Waits out a policy delay inside the driver's synchronous retry hook.
fn pause(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    match tokio::runtime::Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(tokio::runtime::RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(|| std::thread::sleep(delay))
        }
        _ => std::thread::sleep(delay),
    }
}

fn count(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

fn driver_consistency(consistency: Consistency) -> DriverConsistency {
    match consistency {
        Consistency::Any => DriverConsistency::Any,
        Consistency::One => DriverConsistency::One,
        Consistency::Two => DriverConsistency::Two,
        Consistency::Three => DriverConsistency::Three,
        Consistency::Quorum => DriverConsistency::Quorum,
        Consistency::All => DriverConsistency::All,
        Consistency::LocalQuorum => DriverConsistency::LocalQuorum,
        Consistency::EachQuorum => DriverConsistency::EachQuorum,
        Consistency::LocalOne => DriverConsistency::LocalOne,
    }
}

fn our_consistency(consistency: DriverConsistency) -> Consistency {
    match consistency {
        DriverConsistency::Any => Consistency::Any,
        DriverConsistency::One => Consistency::One,
        DriverConsistency::Two => Consistency::Two,
        DriverConsistency::Three => Consistency::Three,
        DriverConsistency::Quorum | DriverConsistency::Serial => Consistency::Quorum,
        DriverConsistency::All => Consistency::All,
        DriverConsistency::LocalQuorum => Consistency::LocalQuorum,
        DriverConsistency::EachQuorum => Consistency::EachQuorum,
        DriverConsistency::LocalOne => Consistency::LocalOne,
        // LOCAL_SERIAL
        _ => Consistency::LocalQuorum,
    }
}

fn our_write_type(write_type: &DriverWriteType) -> WriteType {
    match write_type {
        DriverWriteType::Simple => WriteType::Simple,
        DriverWriteType::Batch => WriteType::Batch,
        DriverWriteType::UnloggedBatch => WriteType::UnloggedBatch,
        DriverWriteType::Counter => WriteType::Counter,
        DriverWriteType::BatchLog => WriteType::BatchLog,
        DriverWriteType::Cas => WriteType::Cas,
        DriverWriteType::View => WriteType::View,
        DriverWriteType::Cdc => WriteType::Cdc,
        _ => WriteType::Other,
    }
}

fn to_cql_value(value: &Value) -> Option<CqlValue> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(CqlValue::Text(s.clone())),
        Value::TimeUuid(id) => Some(CqlValue::Timeuuid(CqlTimeuuid::from(*id.as_uuid()))),
        Value::Int(i) => Some(CqlValue::Int(*i)),
        Value::BigInt(i) => Some(CqlValue::BigInt(*i)),
        Value::Boolean(b) => Some(CqlValue::Boolean(*b)),
        Value::Timestamp(ms) => Some(CqlValue::Timestamp(CqlTimestamp(*ms))),
        Value::Blob(bytes) => Some(CqlValue::Blob(bytes.clone())),
    }
}

fn from_cql_value(name: &str, value: Option<CqlValue>) -> Result<Value, ClusterError> {
    let value = match value {
        None | Some(CqlValue::Empty) => Value::Null,
        Some(CqlValue::Text(s)) | Some(CqlValue::Ascii(s)) => Value::Text(s),
        Some(CqlValue::Timeuuid(id)) => TimeUuid::from_uuid(Uuid::from(id))
            .map(Value::TimeUuid)
            .ok_or_else(|| ClusterError::Decoding(format!("column {name}: not a version-1 UUID")))?,
        Some(CqlValue::Int(i)) => Value::Int(i),
        Some(CqlValue::BigInt(i)) => Value::BigInt(i),
        Some(CqlValue::Boolean(b)) => Value::Boolean(b),
        Some(CqlValue::Timestamp(CqlTimestamp(ms))) => Value::Timestamp(ms),
        Some(CqlValue::Blob(bytes)) => Value::Blob(bytes),
        Some(other) => {
            return Err(ClusterError::Decoding(format!(
                "column {name}: unsupported value {other:?}"
            )))
        }
    };
    Ok(value)
}

fn decode_rows(result: QueryResult) -> Result<Vec<Row>, ClusterError> {
    if !result.is_rows() {
        return Ok(Vec::new());
    }
    let rows_result = result
        .into_rows_result()
        .map_err(|e| ClusterError::Decoding(e.to_string()))?;
    let names: Vec<String> = rows_result
        .column_specs()
        .iter()
        .map(|spec| spec.name().to_string())
        .collect();

    let mut rows = Vec::new();
    for raw in rows_result
        .rows::<DriverRow>()
        .map_err(|e| ClusterError::Decoding(e.to_string()))?
    {
        let raw = raw.map_err(|e| ClusterError::Decoding(e.to_string()))?;
        let mut row = Row::new();
        for (name, value) in names.iter().zip(raw.columns) {
            row.push(name.clone(), from_cql_value(name, value)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Classifies a driver failure into the kinds the retry layers understand.
fn map_execution_error(err: ExecutionError) -> ClusterError {
    match err {
        ExecutionError::LastAttemptError(attempt) => map_attempt_error(attempt),
        ExecutionError::EmptyPlan => {
            ClusterError::NoHostsAvailable("load balancing plan is empty".to_string())
        }
        ExecutionError::ConnectionPoolError(e) => ClusterError::NoHostsAvailable(e.to_string()),
        ExecutionError::RequestTimeout(after) => {
            ClusterError::Timeout(format!("no response within {after:?}"))
        }
        ExecutionError::BadQuery(e) => ClusterError::Client(e.to_string()),
        ExecutionError::PrepareError(e) => map_prepare_error(e),
        other => ClusterError::Execution(other.to_string()),
    }
}

fn map_prepare_error(err: PrepareError) -> ClusterError {
    match err {
        PrepareError::ConnectionPoolError(e) => ClusterError::NoHostsAvailable(e.to_string()),
        PrepareError::AllAttemptsFailed { first_attempt } => map_attempt_error(first_attempt),
        other => ClusterError::Execution(other.to_string()),
    }
}

fn map_attempt_error(err: RequestAttemptError) -> ClusterError {
    match err {
        RequestAttemptError::DbError(db_error, message) => map_db_error(db_error, message),
        RequestAttemptError::BrokenConnectionError(e) => ClusterError::Io(e.to_string()),
        RequestAttemptError::SerializationError(e) => ClusterError::Encoding(e.to_string()),
        other => ClusterError::Execution(other.to_string()),
    }
}

fn map_db_error(db_error: DbError, message: String) -> ClusterError {
    match db_error {
        DbError::ReadTimeout {
            consistency,
            received,
            required,
            data_present,
        } => ClusterError::ReadTimeout {
            consistency: our_consistency(consistency),
            required: count(required),
            received: count(received),
            data_retrieved: data_present,
        },
        DbError::WriteTimeout {
            consistency,
            received,
            required,
            write_type,
        } => ClusterError::WriteTimeout {
            consistency: our_consistency(consistency),
            write_type: our_write_type(&write_type),
            required: count(required),
            received: count(received),
        },
        DbError::Unavailable {
            consistency,
            required,
            alive,
        } => ClusterError::Unavailable {
            consistency: our_consistency(consistency),
            required: count(required),
            alive: count(alive),
        },
        DbError::Overloaded | DbError::IsBootstrapping | DbError::ServerError => {
            ClusterError::Server(message)
        }
        DbError::SyntaxError
        | DbError::Invalid
        | DbError::Unauthorized
        | DbError::ConfigError
        | DbError::AlreadyExists { .. } => ClusterError::Validation(message),
        DbError::ProtocolError | DbError::AuthenticationError => ClusterError::Client(message),
        _ => ClusterError::Execution(message),
    }
}
