//! Main application entry point (CLI binary).
//!
//! A thin admin tool over the `crawl_durability` library, backed by a
//! Cassandra/ScyllaDB cluster or a local SQLite file. It handles:
//! - Command-line argument parsing
//! - Logger initialization
//! - User-facing output formatting
//!
//! All core functionality is implemented in the library crate.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;

use crawl_durability::cluster::{Connection, ScyllaCluster, Session, SqliteCluster};
use crawl_durability::config::{DB_PATH, DEFAULT_CONTACT_POINT};
use crawl_durability::initialization::init_logger_with;
use crawl_durability::{
    build_queue, ClusterConfig, Document, DocumentStore, LogFormat, LogLevel, Popped,
    QueueConfig, QueueLayout, RetryConfig, StoreConfig, StoreLayout,
};

/// Where the queue and store live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// A Cassandra or ScyllaDB cluster
    Cluster,
    /// A local SQLite file
    Sqlite,
}

/// Command-line options.
///
/// # Examples
///
/// ```bash
/// crawl_durability --hosts 10.0.0.1:9042,10.0.0.2:9042 init
/// crawl_durability push '{"payload":{"url":"http://example.com/"}}'
/// crawl_durability pop 10
/// crawl_durability --backend sqlite --db ./crawl.db add '{"url":"http://example.com/","code":200}'
/// ```
#[derive(Debug, Parser)]
#[command(
    name = "crawl_durability",
    about = "Inspects and drives the crawl overflow queue and page store."
)]
struct Opt {
    /// Log level: error, warn, info, debug, or trace
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Log format: plain or json
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    /// Storage backend
    #[arg(long, value_enum, default_value_t = Backend::Cluster)]
    backend: Backend,

    /// Cluster contact points (host:port), comma separated
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_CONTACT_POINT)]
    hosts: Vec<String>,

    /// SQLite database file (sqlite backend)
    #[arg(long, value_parser, default_value = DB_PATH)]
    db: PathBuf,

    /// Keyspace holding the overflow queue
    #[arg(long)]
    queue_keyspace: Option<String>,

    /// Overflow queue table
    #[arg(long)]
    queue_table: Option<String>,

    /// Keyspace holding the page store
    #[arg(long)]
    store_keyspace: Option<String>,

    /// Page store table
    #[arg(long)]
    store_table: Option<String>,

    /// Attempts per operation before giving up
    #[arg(long, default_value_t = crawl_durability::config::RETRY_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Queue table layout
    #[arg(long, value_enum, default_value_t = QueueLayout::TimeOrdered)]
    queue_layout: QueueLayout,

    /// Store table layout
    #[arg(long, value_enum, default_value_t = StoreLayout::Rich)]
    store_layout: StoreLayout,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create queue and store keyspaces and tables
    Init,
    /// Push a JSON envelope `{"payload": ...}` onto the queue
    Push { envelope: String },
    /// Pop up to N entries, oldest first
    Pop {
        #[arg(default_value_t = 1)]
        n: usize,
    },
    /// Print the queue length
    Len,
    /// Store a page given as a JSON envelope with at least `url`
    Add { envelope: String },
    /// Print the stored page for URL
    Get { url: String },
    /// Delete the stored page for URL
    Remove { url: String },
    /// Print the number of stored pages
    Count,
    /// Print every stored page id and URL
    Dump,
}

impl Opt {
    fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            ..RetryConfig::default()
        }
    }

    fn queue_config(&self) -> QueueConfig {
        let defaults = QueueConfig::default();
        QueueConfig {
            keyspace: self.queue_keyspace.clone().unwrap_or(defaults.keyspace),
            table: self.queue_table.clone().unwrap_or(defaults.table),
            layout: self.queue_layout,
            retry: self.retry(),
            ..QueueConfig::default()
        }
    }

    fn store_config(&self) -> StoreConfig {
        let defaults = StoreConfig::default();
        StoreConfig {
            keyspace: self.store_keyspace.clone().unwrap_or(defaults.keyspace),
            table: self.store_table.clone().unwrap_or(defaults.table),
            layout: self.store_layout,
            retry: self.retry(),
            ..StoreConfig::default()
        }
    }
}

fn print_popped(popped: Popped) {
    for payload in popped.into_payloads() {
        println!("{}", payload.as_deref().unwrap_or("null"));
    }
}

async fn open_session(opt: &Opt) -> Result<Arc<Session>> {
    let config = ClusterConfig {
        hosts: opt.hosts.clone(),
        ..ClusterConfig::default()
    };
    let connection: Arc<dyn Connection> = match opt.backend {
        Backend::Cluster => Arc::new(
            ScyllaCluster::connect(&config)
                .await
                .with_context(|| format!("Failed to connect to {}", opt.hosts.join(", ")))?,
        ),
        Backend::Sqlite => Arc::new(
            SqliteCluster::open(&opt.db)
                .await
                .with_context(|| format!("Failed to open {}", opt.db.display()))?,
        ),
    };
    Ok(Arc::new(Session::with_config(connection, &config)))
}

async fn run(opt: Opt) -> Result<()> {
    let session = open_session(&opt).await?;

    match &opt.command {
        Command::Init => {
            let queue = build_queue(&opt.queue_config(), Arc::clone(&session))?;
            let store = DocumentStore::new(session, &opt.store_config())?;
            let queue_ok = queue.ensure_schema().await?;
            let store_ok = store.ensure_schema().await?;
            if !(queue_ok && store_ok) {
                anyhow::bail!("schema creation was not confirmed");
            }
            println!("Schema ready");
        }
        Command::Push { envelope } => {
            let queue = build_queue(&opt.queue_config(), session)?;
            match queue.push(Some(envelope)).await? {
                Some(token) => println!("{token}"),
                None => anyhow::bail!("push was not confirmed"),
            }
        }
        Command::Pop { n } => {
            let queue = build_queue(&opt.queue_config(), session)?;
            print_popped(queue.pop(*n).await?);
        }
        Command::Len => {
            let queue = build_queue(&opt.queue_config(), session)?;
            match queue.length().await {
                Ok(Some(n)) => println!("{n}"),
                Ok(None) => anyhow::bail!("length was not confirmed"),
                Err(e) if e.is_not_supported() => println!("{e}"),
                Err(e) => return Err(e).context("Failed to read queue length"),
            }
        }
        Command::Add { envelope } => {
            let store = DocumentStore::new(session, &opt.store_config())?;
            match store.add_envelope(envelope).await? {
                Some(id) => println!("{id}"),
                None => anyhow::bail!("add was not confirmed"),
            }
        }
        Command::Get { url } => {
            let store = DocumentStore::new(session, &opt.store_config())?;
            match store.get(&Document::new(url.as_str())).await? {
                Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                None => println!("not found"),
            }
        }
        Command::Remove { url } => {
            let store = DocumentStore::new(session, &opt.store_config())?;
            if !store.remove(&Document::new(url.as_str())).await? {
                anyhow::bail!("remove was not confirmed");
            }
        }
        Command::Count => {
            let store = DocumentStore::new(session, &opt.store_config())?;
            match store.count().await {
                Ok(Some(n)) => println!("{n}"),
                Ok(None) => anyhow::bail!("count was not confirmed"),
                Err(e) if e.is_not_supported() => println!("{e}"),
                Err(e) => return Err(e).context("Failed to count pages"),
            }
        }
        Command::Dump => {
            let store = DocumentStore::new(session, &opt.store_config())?;
            let mut pages = std::pin::pin!(store.each());
            while let Some(item) = pages.next().await {
                let (id, doc) = item.context("Failed to read a stored page")?;
                println!("{id}\t{}", doc.url);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    init_logger_with(opt.log_level.clone().into(), opt.log_format.clone())
        .context("Failed to initialize logger")?;

    if let Err(e) = run(opt).await {
        eprintln!("crawl_durability error: {:#}", e);
        process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_and_store_tables_are_addressed_separately() {
        let opt = Opt::try_parse_from([
            "crawl_durability",
            "--queue-table",
            "frontier",
            "--store-keyspace",
            "archive",
            "init",
        ])
        .unwrap();

        let queue = opt.queue_config();
        let store = opt.store_config();
        assert_eq!(queue.table, "frontier");
        assert_eq!(queue.keyspace, QueueConfig::default().keyspace);
        assert_eq!(store.table, StoreConfig::default().table);
        assert_eq!(store.keyspace, "archive");
    }

    #[test]
    fn test_hosts_are_comma_separated() {
        let opt = Opt::try_parse_from([
            "crawl_durability",
            "--hosts",
            "10.0.0.1:9042,10.0.0.2:9042",
            "count",
        ])
        .unwrap();
        assert_eq!(opt.backend, Backend::Cluster);
        assert_eq!(opt.hosts, vec!["10.0.0.1:9042", "10.0.0.2:9042"]);
    }
}
