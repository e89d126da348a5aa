//! Stats event bus: producer/consumer contracts, an in-process channel bus,
//! and the consumer loop that feeds the stats processor.

use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch, Mutex,
};

use crate::{
    error::{AppError, AppResult},
    models::RawStatsEvent,
    stats::StatsProcessor,
};

/// Pause before fetching again after a transport-level fetch failure.
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// One delivered message. `id` is whatever the transport needs to commit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub id: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn send_event(&self, event: &RawStatsEvent) -> AppResult<()>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// `Ok(None)` when nothing arrived within the source's poll window.
    async fn fetch_message(&self) -> AppResult<Option<BusMessage>>;

    /// Mark `msg` as processed so it is not delivered again.
    async fn commit_message(&self, msg: &BusMessage) -> AppResult<()>;

    async fn close(&self) -> AppResult<()>;
}

// ── In-process bus ─────────────────────────────────────────────────────────

/// Create a connected publisher/source pair backed by a channel holding at
/// most `capacity` unconsumed events.
///
/// Publishing to a full channel fails immediately instead of waiting, so a
/// stalled consumer costs dropped clicks, never slow redirects. Nothing
/// survives a restart, so delivery is at-most-once across crashes; use the
/// Redis Streams bus when that matters.
pub fn memory_bus(poll_window: Duration, capacity: usize) -> (MemoryPublisher, MemorySource) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        MemoryPublisher { tx },
        MemorySource {
            rx: Mutex::new(rx),
            poll_window,
            next_offset: AtomicU64::new(0),
            committed: AtomicU64::new(0),
        },
    )
}

#[derive(Clone, Debug)]
pub struct MemoryPublisher {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn send_event(&self, event: &RawStatsEvent) -> AppResult<()> {
        let payload = serde_json::to_vec(event)?;
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => AppError::Unavailable("stats bus is full".into()),
            TrySendError::Closed(_) => AppError::Unavailable("stats bus is closed".into()),
        })
    }
}

#[derive(Debug)]
pub struct MemorySource {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    poll_window: Duration,
    next_offset: AtomicU64,
    committed: AtomicU64,
}

impl MemorySource {
    /// Number of messages committed so far.
    #[cfg(test)]
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn fetch_message(&self) -> AppResult<Option<BusMessage>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(self.poll_window, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(payload)) => {
                let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);
                Ok(Some(BusMessage {
                    id: offset.to_string(),
                    payload,
                }))
            }
            Ok(None) => Err(AppError::Unavailable("stats bus is closed".into())),
        }
    }

    async fn commit_message(&self, _msg: &BusMessage) -> AppResult<()> {
        self.committed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        self.rx.lock().await.close();
        Ok(())
    }
}

// ── Consumer loop ──────────────────────────────────────────────────────────

/// Fetch → process → commit, one message at a time, until `shutdown` flips
/// to `true` (or its sender is dropped).
///
/// A message is committed only after it was processed, so anything in flight
/// during a crash is delivered again. Errors at any step are logged and the
/// loop moves on. Cancellation is only observed while waiting for a message;
/// a fetched message is always processed and committed before returning.
pub async fn run_consumer(
    source: Arc<dyn EventSource>,
    processor: Arc<StatsProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Stats consumer started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let fetched = tokio::select! {
            _ = shutdown.changed() => break,
            fetched = source.fetch_message() => fetched,
        };

        let msg = match fetched {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!("Failed to fetch stats message: {}", e);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(FETCH_RETRY_DELAY) => continue,
                }
            }
        };

        if let Err(e) = processor.process_event(&msg.payload).await {
            tracing::error!("Failed to process stats message {}: {}", msg.id, e);
            continue;
        }

        if let Err(e) = source.commit_message(&msg).await {
            tracing::error!("Failed to commit stats message {}: {}", msg.id, e);
        }
    }

    if let Err(e) = source.close().await {
        tracing::error!("Failed to close stats source: {}", e);
    }
    tracing::info!("Stats consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{memory_pool, SqliteStore},
        enrich::{tests::StaticLocator, EventEnricher},
        stats::StatsAggregator,
        store::StatsStore,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    const DESKTOP: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    async fn wait_for_commits(source: &MemorySource, n: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.committed() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("consumer did not commit in time");
    }

    fn processor(store: Arc<SqliteStore>) -> Arc<StatsProcessor> {
        let enricher = EventEnricher::new(Arc::new(StaticLocator {
            hits: vec![("8.8.8.8", "USA", "Mountain View"), ("81.2.69.142", "Germany", "Berlin")],
        }));
        Arc::new(StatsProcessor::new(enricher, store))
    }

    #[tokio::test]
    async fn consumes_until_shutdown() {
        let store = Arc::new(SqliteStore::new(memory_pool().await));
        let (publisher, source) = memory_bus(Duration::from_millis(20), 64);
        let source = Arc::new(source);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_consumer(
            source.clone(),
            processor(store.clone()),
            stop_rx,
        ));

        for ip in ["8.8.8.8", "8.8.8.8", "81.2.69.142"] {
            publisher
                .send_event(&RawStatsEvent::new("T", ip, DESKTOP, ""))
                .await
                .unwrap();
        }
        wait_for_commits(&source, 3).await;

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let stats = StatsAggregator::new(store).calculate_statistics("T").await.unwrap();
        assert_eq!(stats.total_clicks, 3);
        assert_eq!(stats.count_by_country.get("USA"), Some(&2));
        assert_eq!(stats.count_by_country.get("Germany"), Some(&1));

        // Source was closed on the way out
        assert!(publisher
            .send_event(&RawStatsEvent::new("T", "8.8.8.8", DESKTOP, ""))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn bad_payload_is_skipped_without_commit() {
        let store = Arc::new(SqliteStore::new(memory_pool().await));
        let (publisher, source) = memory_bus(Duration::from_millis(20), 64);
        let source = Arc::new(source);
        let (stop_tx, stop_rx) = watch::channel(false);

        publisher.tx.try_send(b"{not json".to_vec()).unwrap();
        publisher
            .send_event(&RawStatsEvent::new("T", "8.8.8.8", DESKTOP, ""))
            .await
            .unwrap();

        let handle = tokio::spawn(run_consumer(
            source.clone(),
            processor(store.clone()),
            stop_rx,
        ));
        wait_for_commits(&source, 1).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(source.committed(), 1);
        assert_eq!(store.count_events("T").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn redelivered_event_is_counted_once() {
        let store = Arc::new(SqliteStore::new(memory_pool().await));
        let (publisher, source) = memory_bus(Duration::from_millis(20), 64);
        let source = Arc::new(source);
        let (stop_tx, stop_rx) = watch::channel(false);

        let event = RawStatsEvent::new("T", "8.8.8.8", DESKTOP, "");
        publisher.send_event(&event).await.unwrap();
        publisher.send_event(&event).await.unwrap();

        let handle = tokio::spawn(run_consumer(
            source.clone(),
            processor(store.clone()),
            stop_rx,
        ));
        wait_for_commits(&source, 2).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.count_events("T").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stops_when_shutdown_sender_is_dropped() {
        let store = Arc::new(SqliteStore::new(memory_pool().await));
        let (_publisher, source) = memory_bus(Duration::from_millis(20), 64);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_consumer(Arc::new(source), processor(store), stop_rx));
        drop(stop_tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("consumer kept running")
            .unwrap();
    }

    /// Replays canned fetch and commit outcomes. Once the fetch script runs
    /// out it either reports an idle bus or fails every fetch.
    #[derive(Default)]
    struct ScriptedSource {
        fetches: std::sync::Mutex<VecDeque<AppResult<Option<BusMessage>>>>,
        commits: std::sync::Mutex<VecDeque<AppResult<()>>>,
        fail_when_drained: bool,
        fetch_calls: AtomicUsize,
        commit_calls: AtomicUsize,
        committed: std::sync::Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn fetch_message(&self) -> AppResult<Option<BusMessage>> {
            self.fetch_calls.fetch_add(1, Ordering::AcqRel);
            let next = self.fetches.lock().unwrap().pop_front();
            match next {
                Some(step) => step,
                None if self.fail_when_drained => Err(AppError::Unavailable("bus down".into())),
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(None)
                }
            }
        }

        async fn commit_message(&self, msg: &BusMessage) -> AppResult<()> {
            self.commit_calls.fetch_add(1, Ordering::AcqRel);
            let next = self.commits.lock().unwrap().pop_front();
            let result = next.unwrap_or(Ok(()));
            if result.is_ok() {
                self.committed.lock().unwrap().push(msg.id.clone());
            }
            result
        }

        async fn close(&self) -> AppResult<()> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    fn message(id: &str, event: &RawStatsEvent) -> BusMessage {
        BusMessage {
            id: id.to_owned(),
            payload: serde_json::to_vec(event).unwrap(),
        }
    }

    #[tokio::test]
    async fn fetch_and_commit_failures_do_not_stop_the_loop() {
        let store = Arc::new(SqliteStore::new(memory_pool().await));
        let source = Arc::new(ScriptedSource {
            fetches: std::sync::Mutex::new(VecDeque::from([
                Err(AppError::Unavailable("connection reset".into())),
                Ok(Some(message("1", &RawStatsEvent::new("T", "8.8.8.8", DESKTOP, "")))),
                Ok(Some(message("2", &RawStatsEvent::new("T", "81.2.69.142", DESKTOP, "")))),
            ])),
            commits: std::sync::Mutex::new(VecDeque::from([Err(AppError::Unavailable(
                "ack lost".into(),
            ))])),
            ..Default::default()
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_consumer(
            source.clone(),
            processor(store.clone()),
            stop_rx,
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while source.commit_calls.load(Ordering::Acquire) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("consumer stopped after a failure");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.count_events("T").await.unwrap(), 2);
        assert_eq!(*source.committed.lock().unwrap(), vec!["2".to_owned()]);
        assert!(source.fetch_calls.load(Ordering::Acquire) >= 3);
        assert!(source.closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_fetch_retry_delay() {
        let store = Arc::new(SqliteStore::new(memory_pool().await));
        let source = Arc::new(ScriptedSource {
            fail_when_drained: true,
            ..Default::default()
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_consumer(source.clone(), processor(store), stop_rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while source.fetch_calls.load(Ordering::Acquire) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer never fetched");

        // Now inside the retry sleep
        stop_tx.send(true).unwrap();
        tokio::time::timeout(FETCH_RETRY_DELAY / 2, handle)
            .await
            .expect("shutdown waited out the retry delay")
            .unwrap();

        assert_eq!(source.fetch_calls.load(Ordering::Acquire), 1);
        assert!(source.closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn full_bus_rejects_instead_of_waiting() {
        let (publisher, source) = memory_bus(Duration::from_millis(20), 1);
        let event = RawStatsEvent::new("T", "8.8.8.8", DESKTOP, "");

        publisher.send_event(&event).await.unwrap();
        match publisher.send_event(&event).await {
            Err(AppError::Unavailable(msg)) => assert!(msg.contains("full"), "{msg}"),
            other => panic!("expected a full bus, got {other:?}"),
        }

        assert!(source.fetch_message().await.unwrap().is_some());
        publisher.send_event(&event).await.unwrap();
    }
}
