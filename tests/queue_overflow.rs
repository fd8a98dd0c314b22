//! Overflow queue behavior against both cluster backends.

mod helpers;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crawl_durability::cluster::{
    Connection, ExecOptions, Fault, MemoryCluster, Prepared, ResultPage, Session, Statement,
    Value,
};
use crawl_durability::queue::ClusterQueue;
use crawl_durability::{
    build_queue, ClusterError, Error, Popped, QueueBackend, QueueConfig, QueueLayout,
    QueueOverflow,
};
use helpers::{envelope, memory_session, queue_config, sqlite_session};

/// Passes everything to an in-process cluster except the `nth` DELETE, which
/// the coordinator rejects.
struct RejectNthDelete {
    inner: Arc<MemoryCluster>,
    nth: usize,
    deletes: AtomicUsize,
}

impl RejectNthDelete {
    fn session(inner: Arc<MemoryCluster>, nth: usize) -> Arc<Session> {
        Arc::new(Session::new(Arc::new(Self {
            inner,
            nth,
            deletes: AtomicUsize::new(0),
        })))
    }
}

#[async_trait]
impl Connection for RejectNthDelete {
    async fn prepare(&self, statement: &Statement) -> Result<Prepared, ClusterError> {
        self.inner.prepare(statement).await
    }

    async fn execute(
        &self,
        prepared: &Prepared,
        values: &[Value],
        options: &ExecOptions,
    ) -> Result<ResultPage, ClusterError> {
        if matches!(prepared.statement(), Statement::Delete { .. })
            && self.deletes.fetch_add(1, Ordering::SeqCst) + 1 == self.nth
        {
            return Err(ClusterError::Validation("rejected".into()));
        }
        self.inner.execute(prepared, values, options).await
    }
}

async fn end_to_end(session: Arc<Session>) {
    let queue = build_queue(&queue_config("crawl_queue_overflow_test"), session).unwrap();

    assert!(queue.ensure_schema().await.unwrap());
    assert!(queue.is_empty().await.unwrap());

    queue.push(Some(&envelope(json!("1")))).await.unwrap().unwrap();
    queue.push(Some(&envelope(json!("2")))).await.unwrap().unwrap();
    assert_eq!(queue.length().await.unwrap(), Some(2));

    let popped = queue.pop(2).await.unwrap();
    assert_eq!(popped.payload_values().unwrap(), vec![json!("1"), json!("2")]);
    assert!(queue.is_empty().await.unwrap());

    assert!(queue.clear().await.unwrap());
    assert!(queue.ensure_schema().await.unwrap());
    assert!(queue.is_empty().await.unwrap());
    assert_eq!(queue.length().await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_end_to_end_on_memory_cluster() {
    let (_, session) = memory_session();
    end_to_end(session).await;
}

#[tokio::test]
async fn test_end_to_end_on_sqlite() {
    end_to_end(sqlite_session().await).await;
}

#[tokio::test]
async fn test_pop_preserves_push_order() {
    let session = sqlite_session().await;
    let queue = build_queue(&queue_config("ordering"), session).unwrap();
    queue.ensure_schema().await.unwrap();

    for p in ["P1", "P2", "P3"] {
        queue.push(Some(&envelope(json!(p)))).await.unwrap().unwrap();
    }
    let popped = queue.pop(3).await.unwrap();
    assert_eq!(
        popped.payload_values().unwrap(),
        vec![json!("P1"), json!("P2"), json!("P3")]
    );
}

#[tokio::test]
async fn test_partial_pops_interleaved_with_pushes() {
    let (_, session) = memory_session();
    let queue = build_queue(&queue_config("interleaved"), session).unwrap();
    queue.ensure_schema().await.unwrap();

    for p in ["P1", "P2", "P3"] {
        queue.push(Some(&envelope(json!(p)))).await.unwrap();
    }
    assert_eq!(
        queue.pop(2).await.unwrap().payload_values().unwrap(),
        vec![json!("P1"), json!("P2")]
    );
    queue.push(Some(&envelope(json!("P4")))).await.unwrap();
    assert_eq!(
        queue.pop(5).await.unwrap().payload_values().unwrap(),
        vec![json!("P3"), json!("P4")]
    );
    assert_eq!(queue.pop(1).await.unwrap(), Popped::Many(vec![]));
}

#[tokio::test]
async fn test_queue_names_share_a_table() {
    let (_, session) = memory_session();
    let first = build_queue(
        &QueueConfig {
            queue_name: Some("first".into()),
            ..queue_config("shared")
        },
        session.clone(),
    )
    .unwrap();
    let second = build_queue(
        &QueueConfig {
            queue_name: Some("second".into()),
            ..queue_config("shared")
        },
        session,
    )
    .unwrap();
    first.ensure_schema().await.unwrap();

    first.push(Some(&envelope(json!("a")))).await.unwrap();
    assert!(second.is_empty().await.unwrap());
    assert_eq!(first.pop(1).await.unwrap(), Popped::One(Some("\"a\"".into())));
}

#[tokio::test]
async fn test_object_payloads_round_trip() {
    let (_, session) = memory_session();
    let queue = build_queue(&queue_config("objects"), session).unwrap();
    queue.ensure_schema().await.unwrap();

    let item = json!({"url": "http://www.example.com/", "depth": 2, "referer": null});
    queue.push(Some(&envelope(item.clone()))).await.unwrap();
    queue.push(Some(r#"{"payload":""}"#)).await.unwrap();

    let popped = queue.pop(2).await.unwrap();
    assert_eq!(popped.payload_values().unwrap(), vec![item, json!(null)]);
}

#[tokio::test]
async fn test_caller_errors_make_no_cluster_calls() {
    let (cluster, session) = memory_session();
    let queue = build_queue(&queue_config("caller_errors"), session).unwrap();
    queue.ensure_schema().await.unwrap();
    let before = cluster.executions();

    assert_eq!(queue.push(None).await.unwrap(), None);
    assert!(matches!(
        queue.push(Some("[\"payload\"]")).await,
        Err(Error::InvalidEnvelope(_))
    ));
    assert!(matches!(queue.pop(0).await, Err(Error::InvalidLimit(0))));
    assert_eq!(cluster.executions(), before);
}

#[tokio::test]
async fn test_outage_is_reported_as_unconfirmed() {
    let (cluster, session) = memory_session();
    let queue = build_queue(&queue_config("outage"), session).unwrap();
    queue.ensure_schema().await.unwrap();
    queue.push(Some(&envelope(json!("kept")))).await.unwrap().unwrap();

    cluster.outage(Fault::Any, ClusterError::NoHostsAvailable("all hosts down".into()));
    assert_eq!(queue.push(Some(&envelope(json!("lost")))).await.unwrap(), None);
    assert_eq!(queue.pop(1).await.unwrap(), Popped::Many(vec![]));
    assert_eq!(queue.length().await.unwrap(), None);

    cluster.heal();
    assert_eq!(queue.pop(5).await.unwrap(), Popped::One(Some("\"kept\"".into())));
}

#[tokio::test]
async fn test_count_capability_gap() {
    let (_, session) = memory_session();
    let queue = build_queue(
        &QueueConfig {
            count_supported: false,
            ..queue_config("no_count")
        },
        session,
    )
    .unwrap();
    queue.ensure_schema().await.unwrap();
    queue.push(Some(&envelope(json!("x")))).await.unwrap();

    assert!(!queue.capabilities().count);
    let err = queue.length().await.unwrap_err();
    assert!(matches!(err, Error::NotSupported("count")));
    assert!(!queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_keyed_layout_on_sqlite() {
    let session = sqlite_session().await;
    let queue = build_queue(
        &QueueConfig {
            layout: QueueLayout::Keyed,
            ..queue_config("legacy")
        },
        session,
    )
    .unwrap();
    queue.ensure_schema().await.unwrap();
    assert!(!queue.capabilities().ordered);

    for p in ["a", "b", "c"] {
        queue.push(Some(&envelope(json!(p)))).await.unwrap().unwrap();
    }
    assert_eq!(queue.length().await.unwrap(), Some(3));
    let mut values: Vec<String> = queue
        .pop(3)
        .await
        .unwrap()
        .payload_values()
        .unwrap()
        .into_iter()
        .map(|v| v.to_string())
        .collect();
    values.sort();
    assert_eq!(values, vec!["\"a\"", "\"b\"", "\"c\""]);
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_backends_share_the_contract() {
    let (_, session) = memory_session();
    for backend in [QueueBackend::Memory, QueueBackend::Cluster] {
        let queue = build_queue(
            &QueueConfig {
                backend,
                ..queue_config("contract")
            },
            session.clone(),
        )
        .unwrap();
        queue.ensure_schema().await.unwrap();
        queue.push(Some(&envelope(json!(1)))).await.unwrap().unwrap();
        queue.push(Some(&envelope(json!(2)))).await.unwrap().unwrap();
        assert_eq!(queue.length().await.unwrap(), Some(2), "{backend:?}");
        assert_eq!(
            queue.pop(2).await.unwrap().payload_values().unwrap(),
            vec![json!(1), json!(2)],
            "{backend:?}"
        );
        assert!(queue.is_empty().await.unwrap(), "{backend:?}");
    }

    let dev_null = build_queue(
        &QueueConfig {
            backend: QueueBackend::DevNull,
            ..QueueConfig::default()
        },
        session,
    )
    .unwrap();
    assert_eq!(dev_null.push(Some(&envelope(json!(1)))).await.unwrap(), None);
    assert!(dev_null.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_failed_delete_mid_pop_loses_nothing() {
    let cluster = Arc::new(MemoryCluster::new());
    let queue = build_queue(
        &queue_config("delete_failure"),
        RejectNthDelete::session(cluster.clone(), 2),
    )
    .unwrap();
    queue.ensure_schema().await.unwrap();
    for p in ["1", "2", "3"] {
        queue.push(Some(&envelope(json!(p)))).await.unwrap().unwrap();
    }

    // Entry 1 is deleted before the rejection, so it has to come back now.
    let popped = queue.pop(3).await.unwrap();
    assert_eq!(
        popped.payload_values().unwrap(),
        vec![json!("1"), json!("2"), json!("3")]
    );

    // The entries whose delete never ran are delivered again.
    let again = queue.pop(5).await.unwrap();
    assert_eq!(again.payload_values().unwrap(), vec![json!("2"), json!("3")]);
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_rejected_first_delete_surfaces_and_keeps_every_entry() {
    let cluster = Arc::new(MemoryCluster::new());
    let queue = build_queue(
        &queue_config("first_delete_failure"),
        RejectNthDelete::session(cluster.clone(), 1),
    )
    .unwrap();
    queue.ensure_schema().await.unwrap();
    for p in ["1", "2"] {
        queue.push(Some(&envelope(json!(p)))).await.unwrap().unwrap();
    }

    assert!(matches!(
        queue.pop(2).await,
        Err(Error::Cluster(ClusterError::Validation(_)))
    ));
    assert_eq!(
        queue.pop(2).await.unwrap().payload_values().unwrap(),
        vec![json!("1"), json!("2")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pops_on_one_instance_never_share_an_entry() {
    let (_, session) = memory_session();
    let queue = Arc::new(ClusterQueue::new(session, &queue_config("concurrent")).unwrap());
    queue.ensure_schema().await.unwrap();

    let pushed: Vec<String> = (0..40).map(|i| format!("item-{i}")).collect();
    for p in &pushed {
        queue.push(Some(&envelope(json!(p)))).await.unwrap().unwrap();
    }

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let popped = queue.pop(3).await.unwrap();
                    if popped.is_empty() {
                        return seen;
                    }
                    seen.extend(popped.payload_values().unwrap());
                }
            })
        })
        .collect();

    let mut delivered = Vec::new();
    for worker in futures::future::join_all(workers).await {
        delivered.extend(worker.unwrap());
    }

    let unique: HashSet<String> = delivered
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(delivered.len(), pushed.len(), "an entry was delivered twice");
    assert_eq!(unique, pushed.into_iter().collect::<HashSet<_>>());
    assert!(queue.is_empty().await.unwrap());
}
