//! Compressed document store.
//!
//! Crawled pages are keyed by a digest of their locator, serialized to JSON,
//! zlib-compressed and upserted into a single table. The rich layout also
//! writes a handful of flattened columns so metadata can be read without
//! inflating the page.
//!
//! This module provides:
//! - `Document`, the stored page shape
//! - `DocumentStore` with add/get/exists/remove, paged iteration and count
//! - `document_id`, the locator digest

mod codec;
mod document;
mod id;

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde_json::{Map, Value as Json};
use tokio::sync::Mutex;

use crate::cluster::{
    ColumnDef, ColumnType, PagingState, Projection, ResultPage, Row, Session, Statement, TableRef,
    TableSchema, Value,
};
use crate::config::{IdOptions, Replication, StoreConfig, StoreLayout};
use crate::error_handling::Error;
use crate::retry::RetryExecutor;
use crate::schema::{normalize_identifier, SchemaManager};

// Re-export public API
pub use codec::{decode_page, encode_page};
pub use document::{Document, DOCUMENT_FIELDS};
pub use id::{canonical_locator, document_id};

/// `(id, page)`.
pub static STORE_COMPACT: TableSchema = TableSchema {
    columns: &[
        ColumnDef {
            name: "id",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "page",
            kind: ColumnType::Blob,
        },
    ],
    partition_key: &["id"],
    clustering_key: &[],
};

/// `(id, page)` plus the flattened metadata columns.
pub static STORE_RICH: TableSchema = TableSchema {
    columns: &[
        ColumnDef {
            name: "id",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "url",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "code",
            kind: ColumnType::Int,
        },
        ColumnDef {
            name: "depth",
            kind: ColumnType::Int,
        },
        ColumnDef {
            name: "referer",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "redirect_to",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "response_time",
            kind: ColumnType::BigInt,
        },
        ColumnDef {
            name: "fetched",
            kind: ColumnType::Boolean,
        },
        ColumnDef {
            name: "user_data",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "fetched_at",
            kind: ColumnType::Timestamp,
        },
        ColumnDef {
            name: "error",
            kind: ColumnType::Text,
        },
        ColumnDef {
            name: "page",
            kind: ColumnType::Blob,
        },
    ],
    partition_key: &["id"],
    clustering_key: &[],
};

const METADATA_COLUMNS: &[&str] = &[
    "id",
    "url",
    "code",
    "depth",
    "referer",
    "redirect_to",
    "response_time",
    "fetched",
    "user_data",
    "fetched_at",
    "error",
];

/// Flattened columns of a rich-layout row.
///
/// Fields left out by the store's exclusion list read back as `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentMetadata {
    pub id: String,
    pub url: Option<String>,
    pub code: Option<i32>,
    pub depth: Option<i32>,
    pub referer: Option<String>,
    pub redirect_to: Option<String>,
    pub response_time: Option<i64>,
    pub fetched: Option<bool>,
    pub user_data: Option<Json>,
    /// Unix seconds.
    pub fetched_at: Option<i64>,
    pub error: Option<String>,
}

impl DocumentMetadata {
    fn from_row(row: &Row) -> Result<Self, Error> {
        let user_data = match row.text("user_data")? {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(Self {
            id: row.text("id")?.unwrap_or_default(),
            url: row.text("url")?,
            code: row.int("code")?,
            depth: row.int("depth")?,
            referer: row.text("referer")?,
            redirect_to: row.text("redirect_to")?,
            response_time: row.bigint("response_time")?,
            fetched: row.boolean("fetched")?,
            user_data,
            fetched_at: row.timestamp("fetched_at")?.map(|ms| ms.div_euclid(1000)),
            error: row.text("error")?,
        })
    }
}

/// Page store on a cluster table.
#[derive(Debug)]
pub struct DocumentStore {
    session: Arc<Session>,
    schema: SchemaManager,
    executor: RetryExecutor,
    table: TableRef,
    layout: StoreLayout,
    except: Vec<String>,
    replication: Replication,
    count_supported: bool,
    page_size: usize,
    id_options: IdOptions,
    lock: Mutex<()>,
}

impl DocumentStore {
    /// Builds a store from `config`.
    ///
    /// Fails with `Error::InvalidConfig` for an unusable keyspace or table
    /// name, an exclusion naming `url` or an unknown field, a zero page size,
    /// or retry settings the executor cannot honor.
    pub fn new(session: Arc<Session>, config: &StoreConfig) -> Result<Self, Error> {
        let keyspace = normalize_identifier(&config.keyspace)?;
        let table_name = normalize_identifier(&config.table)?;
        document::validate_exclusions(&config.except)?;
        if config.page_size == 0 {
            return Err(Error::InvalidConfig(
                "page_size must be at least 1".to_string(),
            ));
        }
        let schema = match config.layout {
            StoreLayout::Compact => &STORE_COMPACT,
            StoreLayout::Rich => &STORE_RICH,
        };
        let executor = RetryExecutor::new(&config.retry)?;

        Ok(Self {
            schema: SchemaManager::new(Arc::clone(&session), executor.clone()),
            session,
            executor,
            table: TableRef::new(keyspace, table_name, schema),
            layout: config.layout,
            except: config.except.clone(),
            replication: config.replication.clone(),
            count_supported: config.count_supported,
            page_size: config.page_size,
            id_options: config.id,
            lock: Mutex::new(()),
        })
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// The row identifier `doc` is stored under.
    pub fn id_of(&self, doc: &Document) -> Result<String, Error> {
        if doc.url.trim().is_empty() {
            return Err(Error::MissingField("url"));
        }
        document_id(&doc.url, self.id_options)
    }

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

    pub async fn create_table(&self, properties: &[String]) -> Result<bool, Error> {
        self.schema.create_table(&self.table, properties).await
    }

    /// Creates the keyspace and table if missing.
    pub async fn ensure_schema(&self) -> Result<bool, Error> {
        let keyspace = self.create_keyspace(None, true).await?;
        let table = self.create_table(&[]).await?;
        Ok(keyspace && table)
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

    fn select_by_id(&self, columns: Vec<&'static str>) -> Statement {
        Statement::Select {
            table: self.table.clone(),
            projection: Projection::Columns(columns),
            filter: vec!["id"],
            limit: Some(1),
        }
    }

    /// Stores `doc`, replacing any earlier version of the same locator.
    ///
    /// Returns the identifier, or `None` when the write was not confirmed.
    pub async fn add(&self, doc: &Document) -> Result<Option<String>, Error> {
        let id = self.id_of(doc)?;
        let record = doc.to_record(&self.except)?;
        let page = encode_page(&record)?;

        let (columns, values) = match self.layout {
            StoreLayout::Compact => (
                vec!["id", "page"],
                vec![Value::Text(id.clone()), Value::Blob(page)],
            ),
            StoreLayout::Rich => rich_columns(&id, &record, page),
        };
        let statement = Statement::Insert {
            table: self.table.clone(),
            columns,
        };

        let written = {
            let _guard = self.lock.lock().await;
            self.execute("store add", &statement, &values).await?
        };
        if written.is_none() {
            return Ok(None);
        }
        log::debug!("Stored {} as {id}", doc.url);
        Ok(Some(id))
    }

    /// Parses a JSON envelope and stores the resulting document.
    pub async fn add_envelope(&self, envelope: &str) -> Result<Option<String>, Error> {
        let doc = Document::from_envelope(envelope)?;
        self.add(&doc).await
    }

    /// Reads back the stored version of `doc`.
    ///
    /// A stored page without `fetched_at` comes back with `Some(0)`. Returns
    /// `None` when nothing is stored or the read was not confirmed.
    pub async fn get(&self, doc: &Document) -> Result<Option<Document>, Error> {
        let id = self.id_of(doc)?;
        let statement = self.select_by_id(vec!["id", "page"]);
        let rows = {
            let _guard = self.lock.lock().await;
            self.execute("store get", &statement, &[Value::Text(id)])
                .await?
        };
        match rows.as_deref().and_then(<[Row]>::first) {
            Some(row) => Ok(Some(load_document(row)?.1)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, doc: &Document) -> Result<bool, Error> {
        let id = self.id_of(doc)?;
        let statement = self.select_by_id(vec!["id"]);
        let rows = {
            let _guard = self.lock.lock().await;
            self.execute("store exists", &statement, &[Value::Text(id)])
                .await?
        };
        Ok(rows.is_some_and(|rows| !rows.is_empty()))
    }

    /// Reads the flattened columns of `doc` without inflating the page.
    ///
    /// Only the rich layout has them; the compact layout reports
    /// `Error::NotSupported("metadata")`.
    pub async fn metadata(&self, doc: &Document) -> Result<Option<DocumentMetadata>, Error> {
        if self.layout != StoreLayout::Rich {
            return Err(Error::NotSupported("metadata"));
        }
        let id = self.id_of(doc)?;
        let statement = self.select_by_id(METADATA_COLUMNS.to_vec());
        let rows = self
            .execute("store metadata", &statement, &[Value::Text(id)])
            .await?;
        match rows.as_deref().and_then(<[Row]>::first) {
            Some(row) => Ok(Some(DocumentMetadata::from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Deletes `doc`. Returns whether the cluster confirmed it.
    pub async fn remove(&self, doc: &Document) -> Result<bool, Error> {
        let id = self.id_of(doc)?;
        let statement = Statement::Delete {
            table: self.table.clone(),
            filter: vec!["id"],
        };
        let removed = {
            let _guard = self.lock.lock().await;
            self.execute("store remove", &statement, &[Value::Text(id)])
                .await?
        };
        Ok(removed.is_some())
    }

    /// Number of stored documents, `None` when the count was not confirmed.
    pub async fn count(&self) -> Result<Option<u64>, Error> {
        if !self.count_supported {
            return Err(Error::NotSupported("count"));
        }
        let statement = Statement::Select {
            table: self.table.clone(),
            projection: Projection::Count,
            filter: Vec::new(),
            limit: None,
        };
        let Some(rows) = self.execute("store count", &statement, &[]).await? else {
            return Ok(None);
        };
        let count = match rows.first() {
            Some(row) => row.bigint("count")?.unwrap_or(0),
            None => 0,
        };
        Ok(Some(count.max(0) as u64))
    }

    /// Drops the table.
    pub async fn clear(&self) -> Result<bool, Error> {
        self.schema.drop_table(&self.table, true).await
    }

    async fn fetch_page(&self, paging_state: Option<PagingState>) -> Result<Option<ResultPage>, Error> {
        let statement = Statement::Select {
            table: self.table.clone(),
            projection: Projection::Columns(vec!["id", "page"]),
            filter: Vec::new(),
            limit: None,
        };
        let session = &self.session;
        let statement = &statement;
        let page_size = Some(self.page_size);
        let page = self
            .executor
            .run("store each", || {
                let paging_state = paging_state.clone();
                async move {
                    session
                        .execute_paged(statement, &[], page_size, paging_state)
                        .await
                }
            })
            .await?;
        Ok(page)
    }

    /// Streams every stored `(id, document)` pair, one page at a time.
    ///
    /// Order is unspecified. A page that cannot be read after every retry
    /// ends the stream; call `each` again to restart the scan.
    pub fn each(&self) -> impl Stream<Item = Result<(String, Document), Error>> + '_ {
        let scan = Scan {
            buffered: VecDeque::new(),
            paging_state: None,
            done: false,
        };
        stream::unfold(scan, move |mut scan| async move {
            loop {
                if let Some(row) = scan.buffered.pop_front() {
                    return Some((load_document(&row), scan));
                }
                if scan.done {
                    return None;
                }
                match self.fetch_page(scan.paging_state.take()).await {
                    Ok(Some(page)) => {
                        scan.done = page.paging_state.is_none();
                        scan.paging_state = page.paging_state;
                        scan.buffered.extend(page.rows);
                    }
                    Ok(None) => {
                        log::warn!("Scan of {} stopped: page not confirmed", self.table);
                        return None;
                    }
                    Err(e) => {
                        scan.done = true;
                        return Some((Err(e), scan));
                    }
                }
            }
        })
    }
}

struct Scan {
    buffered: VecDeque<Row>,
    paging_state: Option<PagingState>,
    done: bool,
}

fn load_document(row: &Row) -> Result<(String, Document), Error> {
    let id = row.text("id")?.unwrap_or_default();
    let page = row.blob("page")?.unwrap_or_default();
    let mut doc: Document = serde_json::from_value(decode_page(&page)?)?;
    if doc.fetched_at.is_none() {
        doc.fetched_at = Some(0);
    }
    Ok((id, doc))
}

fn text_field(record: &Map<String, Json>, key: &str) -> Value {
    match record.get(key) {
        Some(Json::String(s)) => Value::Text(s.clone()),
        _ => Value::Null,
    }
}

fn int_field(record: &Map<String, Json>, key: &str) -> Value {
    record
        .get(key)
        .and_then(Json::as_i64)
        .and_then(|n| i32::try_from(n).ok())
        .map_or(Value::Null, Value::Int)
}

fn rich_columns(
    id: &str,
    record: &Map<String, Json>,
    page: Vec<u8>,
) -> (Vec<&'static str>, Vec<Value>) {
    let user_data = match record.get("user_data") {
        None | Some(Json::Null) => Value::Null,
        Some(Json::Object(o)) if o.is_empty() => Value::Null,
        Some(other) => Value::Text(other.to_string()),
    };
    let fetched_at = record
        .get("fetched_at")
        .and_then(Json::as_i64)
        .and_then(|secs| secs.checked_mul(1000))
        .map_or(Value::Null, Value::Timestamp);

    let values = vec![
        Value::Text(id.to_string()),
        text_field(record, "url"),
        int_field(record, "code"),
        int_field(record, "depth"),
        text_field(record, "referer"),
        text_field(record, "redirect_to"),
        record
            .get("response_time")
            .and_then(Json::as_i64)
            .map_or(Value::Null, Value::BigInt),
        record
            .get("fetched")
            .and_then(Json::as_bool)
            .map_or(Value::Null, Value::Boolean),
        user_data,
        fetched_at,
        text_field(record, "error"),
        Value::Blob(page),
    ];
    (STORE_RICH.column_names().collect(), values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Fault, MemoryCluster};
    use crate::config::RetryConfig;
    use crate::error_handling::ClusterError;
    use futures::TryStreamExt;
    use serde_json::json;

    async fn store_with(config: StoreConfig) -> (Arc<MemoryCluster>, DocumentStore) {
        let cluster = Arc::new(MemoryCluster::new());
        let session = Arc::new(Session::new(cluster.clone()));
        let config = StoreConfig {
            retry: RetryConfig::without_backoff(3),
            ..config
        };
        let store = DocumentStore::new(session, &config).unwrap();
        assert!(store.ensure_schema().await.unwrap());
        (cluster, store)
    }

    fn page(url: &str) -> Document {
        let mut doc = Document::new(url);
        doc.code = 200;
        doc.body = Some("<html></html>".into());
        doc
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let (_, store) = store_with(StoreConfig::default()).await;
        let doc = page("http://www.google.com");
        let id = store.add(&doc).await.unwrap().unwrap();
        assert_eq!(id, document_id("http://www.google.com", IdOptions::default()).unwrap());

        let stored = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(stored.url, "http://www.google.com");
        assert_eq!(stored.body.as_deref(), Some("<html></html>"));
        assert_eq!(stored.fetched_at, Some(0));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let (cluster, store) = store_with(StoreConfig::default()).await;
        let mut doc = page("http://www.google.com");
        let first = store.add(&doc).await.unwrap();
        doc.code = 301;
        let second = store.add(&doc).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cluster.row_count("crawl_pages", "pages"), Some(1));
        assert_eq!(store.get(&doc).await.unwrap().unwrap().code, 301);
        assert_eq!(store.count().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_exclusions_read_back_as_defaults() {
        let config = StoreConfig {
            except: vec!["code".into(), "body".into()],
            ..StoreConfig::default()
        };
        let (_, store) = store_with(config).await;
        let doc = page("http://www.user-doo.com");
        store.add(&doc).await.unwrap().unwrap();
        let stored = store.get(&doc).await.unwrap().unwrap();
        assert_eq!(stored.code, 0);
        assert_eq!(stored.body, None);

        let meta = store.metadata(&doc).await.unwrap().unwrap();
        assert_eq!(meta.code, None);
        assert_eq!(meta.url.as_deref(), Some("http://www.user-doo.com"));
    }

    #[tokio::test]
    async fn test_rich_metadata() {
        let (_, store) = store_with(StoreConfig::default()).await;
        let mut doc = page("http://www.duckduckgo.com");
        doc.fetched_at = Some(1434977757);
        doc.referer = Some("http://www.actually.nowhere.com".into());
        doc.user_data = json!({"name": "Test User Data"});
        store.add(&doc).await.unwrap().unwrap();

        let meta = store.metadata(&doc).await.unwrap().unwrap();
        assert_eq!(meta.code, Some(200));
        assert_eq!(meta.fetched_at, Some(1434977757));
        assert_eq!(meta.referer.as_deref(), Some("http://www.actually.nowhere.com"));
        assert_eq!(meta.user_data, Some(json!({"name": "Test User Data"})));
        assert_eq!(meta.fetched, Some(false));
    }

    #[tokio::test]
    async fn test_compact_layout_has_no_metadata() {
        let config = StoreConfig {
            layout: StoreLayout::Compact,
            ..StoreConfig::default()
        };
        let (_, store) = store_with(config).await;
        let doc = page("http://a.com/");
        store.add(&doc).await.unwrap().unwrap();
        assert!(store.exists(&doc).await.unwrap());
        assert!(store.metadata(&doc).await.unwrap_err().is_not_supported());
    }

    #[tokio::test]
    async fn test_remove_and_exists() {
        let (_, store) = store_with(StoreConfig::default()).await;
        let doc = page("http://www.asdrrrr.com");
        assert!(!store.exists(&doc).await.unwrap());
        store.add(&doc).await.unwrap();
        assert!(store.exists(&doc).await.unwrap());
        assert!(store.remove(&doc).await.unwrap());
        assert!(!store.exists(&doc).await.unwrap());
        assert_eq!(store.get(&doc).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_url_is_not_sent() {
        let (cluster, store) = store_with(StoreConfig::default()).await;
        let before = cluster.executions();
        let err = store.add(&Document::default()).await.unwrap_err();
        assert!(matches!(err, Error::MissingField("url")));
        assert_eq!(cluster.executions(), before);
    }

    #[tokio::test]
    async fn test_unconfirmed_write_and_read() {
        let (cluster, store) = store_with(StoreConfig::default()).await;
        cluster.outage(Fault::Any, ClusterError::Io("connection reset".into()));
        let doc = page("http://a.com/");
        assert_eq!(store.add(&doc).await.unwrap(), None);
        assert_eq!(store.get(&doc).await.unwrap(), None);
        assert!(!store.exists(&doc).await.unwrap());
        assert!(!store.remove(&doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_each_walks_every_page() {
        let config = StoreConfig {
            page_size: 2,
            ..StoreConfig::default()
        };
        let (_, store) = store_with(config).await;
        for i in 0..5 {
            store.add(&page(&format!("http://site{i}.com/"))).await.unwrap();
        }
        let mut urls: Vec<String> = store
            .each()
            .map_ok(|(_, doc)| doc.url)
            .try_collect()
            .await
            .unwrap();
        urls.sort();
        assert_eq!(urls.len(), 5);
        assert_eq!(urls[0], "http://site0.com/");
    }

    #[tokio::test]
    async fn test_count_capability_gap() {
        let config = StoreConfig {
            count_supported: false,
            ..StoreConfig::default()
        };
        let (_, store) = store_with(config).await;
        assert!(matches!(store.count().await, Err(Error::NotSupported("count"))));
    }

    #[test]
    fn test_invalid_config() {
        let session = Arc::new(Session::new(Arc::new(MemoryCluster::new())));
        let bad_except = StoreConfig {
            except: vec!["url".into()],
            ..StoreConfig::default()
        };
        assert!(matches!(
            DocumentStore::new(session.clone(), &bad_except),
            Err(Error::InvalidConfig(_))
        ));
        let bad_page = StoreConfig {
            page_size: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            DocumentStore::new(session, &bad_page),
            Err(Error::InvalidConfig(_))
        ));
    }
}
