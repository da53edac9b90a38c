use super::*;
use crate::LifelogError;
use crate::database::lancedb::SearchHit;
use crate::database::sqlite::models::LogRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory log source
struct MemorySource(Mutex<Vec<LogRecord>>);

impl MemorySource {
    fn with_records(count: i64) -> Self {
        Self(Mutex::new((1..=count).map(record).collect()))
    }

    fn append(&self, count: i64) {
        let mut records = self.0.lock().expect("source lock");
        let next = records.last().map_or(1, |r| r.id + 1);
        records.extend((next..next + count).map(record));
    }
}

#[async_trait]
impl LogSource for MemorySource {
    async fn fetch_after(&self, watermark: Option<i64>) -> anyhow::Result<Vec<LogRecord>> {
        let records = self.0.lock().expect("source lock");
        Ok(records
            .iter()
            .filter(|r| watermark.is_none_or(|w| r.id > w))
            .cloned()
            .collect())
    }
}

struct UnavailableSource;

#[async_trait]
impl LogSource for UnavailableSource {
    async fn fetch_after(&self, _watermark: Option<i64>) -> anyhow::Result<Vec<LogRecord>> {
        Err(anyhow!("database is locked"))
    }
}

/// Deterministic embedder that records the size of every call and can be
/// told to fail on a given call number
#[derive(Default)]
struct FakeEmbedder {
    calls: Mutex<Vec<usize>>,
    fail_on_call: Option<usize>,
}

impl FakeEmbedder {
    fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Embedder for FakeEmbedder {
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut calls = self.calls.lock().expect("calls lock");
        calls.push(texts.len());
        if self.fail_on_call == Some(calls.len()) {
            return Err(anyhow!("model unavailable"));
        }
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0, 0.0])
            .collect())
    }
}

/// Returns one vector fewer than requested
struct ShortEmbedder;

impl Embedder for ShortEmbedder {
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().skip(1).map(|_| vec![0.0; 3]).collect())
    }
}

/// Id-keyed in-memory index counting writes
#[derive(Default)]
struct MemoryIndex {
    documents: BTreeMap<String, IndexedDocument>,
    upserts: usize,
    optimizations: Arc<AtomicUsize>,
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&mut self, documents: Vec<IndexedDocument>) -> crate::Result<()> {
        self.upserts += 1;
        for document in documents {
            if document.vector.is_empty() {
                return Err(LifelogError::Embedding("unembedded document".to_string()));
            }
            self.documents.insert(document.id.clone(), document);
        }
        Ok(())
    }

    async fn list_ids(&self) -> crate::Result<Vec<String>> {
        Ok(self.documents.keys().cloned().collect())
    }

    async fn nearest(&self, _vector: &[f32], _limit: usize) -> crate::Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    async fn count(&self) -> crate::Result<u64> {
        Ok(self.documents.len() as u64)
    }

    async fn optimize(&mut self) -> crate::Result<()> {
        self.optimizations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn record(id: i64) -> LogRecord {
    LogRecord {
        id,
        timestamp: Some("2024-03-14 09:00:00".to_string()),
        app_name: Some("Terminal".to_string()),
        window_title: Some(format!("session {}", id)),
        ocr_text: Some(format!("output line {}", id)),
        url: None,
        audio_level: Some(10.0),
    }
}

fn engine_with(
    source: MemorySource,
    embedder: FakeEmbedder,
) -> SyncEngine<MemorySource, FakeEmbedder, MemoryIndex> {
    SyncEngine::new(source, Arc::new(embedder), MemoryIndex::default(), 100)
}

#[tokio::test]
async fn single_record_is_committed() {
    let mut engine = engine_with(MemorySource::with_records(1), FakeEmbedder::default());

    let stats = engine.sync_once().await.expect("sync should succeed");

    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.watermark_before, None);
    assert_eq!(stats.watermark_after, Some(1));
    assert_eq!(engine.embedder().batch_sizes(), vec![1]);

    let document = &engine.index().documents["1"];
    assert!(document.text.contains("Content: output line 1"));
    assert_eq!(document.metadata.app_name, "Terminal");
    assert_eq!(document.vector.len(), 3);
    assert_eq!(
        engine.current_watermark().await.expect("watermark"),
        Some(1)
    );
}

#[tokio::test]
async fn records_are_committed_in_fixed_size_batches() {
    let mut engine = engine_with(MemorySource::with_records(250), FakeEmbedder::default());

    let stats = engine.sync_once().await.expect("sync should succeed");

    assert_eq!(engine.embedder().batch_sizes(), vec![100, 100, 50]);
    assert_eq!(engine.index().upserts, 3);
    assert_eq!(stats.committed, 250);
    assert_eq!(stats.batches, 3);
    assert_eq!(stats.aborted, None);
    assert_eq!(engine.index().count().await.expect("count"), 250);
    assert_eq!(
        engine.current_watermark().await.expect("watermark"),
        Some(250)
    );
}

#[tokio::test]
async fn empty_delta_makes_no_calls() {
    let mut engine = engine_with(MemorySource::with_records(5), FakeEmbedder::default());
    engine.sync_once().await.expect("first sync");
    let calls_after_first = engine.embedder().batch_sizes().len();
    let upserts_after_first = engine.index().upserts;

    let stats = engine.sync_once().await.expect("second sync");

    assert_eq!(stats, SyncStats {
        watermark_before: Some(5),
        watermark_after: Some(5),
        ..SyncStats::default()
    });
    assert_eq!(engine.embedder().batch_sizes().len(), calls_after_first);
    assert_eq!(engine.index().upserts, upserts_after_first);
}

#[tokio::test]
async fn empty_source_on_empty_index_is_noop() {
    let mut engine = engine_with(MemorySource::with_records(0), FakeEmbedder::default());

    let stats = engine.sync_once().await.expect("sync should succeed");

    assert_eq!(stats, SyncStats::default());
    assert!(engine.embedder().batch_sizes().is_empty());
    assert_eq!(engine.index().upserts, 0);
}

#[tokio::test]
async fn recommitting_same_records_is_idempotent() {
    let source = MemorySource::with_records(3);
    let records = source.fetch_after(None).await.expect("records");
    let mut engine = engine_with(source, FakeEmbedder::default());
    engine.sync_once().await.expect("sync");

    let before: Vec<IndexedDocument> = engine.index().documents.values().cloned().collect();
    let again: Vec<IndexedDocument> = records
        .iter()
        .map(build_document)
        .map(|d| {
            let len = d.text.len() as f32;
            d.with_vector(vec![len, 1.0, 0.0])
        })
        .collect();
    engine.index.upsert(again).await.expect("re-upsert");

    let after: Vec<IndexedDocument> = engine.index().documents.values().cloned().collect();
    assert_eq!(before, after);
    assert_eq!(engine.index().count().await.expect("count"), 3);
}

#[tokio::test]
async fn watermark_is_monotonic_across_cycles() {
    let mut engine = engine_with(MemorySource::with_records(3), FakeEmbedder::default());
    let mut previous = engine.current_watermark().await.expect("watermark");

    for appended in [0, 4, 0, 120] {
        engine.source().append(appended);
        let stats = engine.sync_once().await.expect("sync");
        assert!(stats.watermark_after >= stats.watermark_before);
        assert!(stats.watermark_before >= previous);
        previous = stats.watermark_after;
    }

    assert_eq!(previous, Some(127));
}

#[tokio::test]
async fn failed_batch_aborts_cycle_and_next_cycle_resumes() {
    let mut engine = engine_with(MemorySource::with_records(250), FakeEmbedder::failing_on(2));

    let stats = engine.sync_once().await.expect("cycle reports failure in stats");

    assert_eq!(stats.committed, 100);
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.pending(), 150);
    assert_eq!(stats.watermark_after, Some(100));
    assert!(stats.aborted.as_deref().is_some_and(|r| r.contains("id 101")));
    // third batch was never attempted
    assert_eq!(engine.embedder().batch_sizes(), vec![100, 100]);
    assert_eq!(engine.index().count().await.expect("count"), 100);

    let stats = engine.sync_once().await.expect("resume");

    assert_eq!(stats.watermark_before, Some(100));
    assert_eq!(stats.fetched, 150);
    assert_eq!(stats.committed, 150);
    assert_eq!(
        engine.embedder().batch_sizes(),
        vec![100, 100, 100, 50]
    );
    assert_eq!(engine.index().count().await.expect("count"), 250);
}

#[tokio::test]
async fn short_embedding_response_fails_batch() {
    let mut engine = SyncEngine::new(
        MemorySource::with_records(4),
        Arc::new(ShortEmbedder),
        MemoryIndex::default(),
        2,
    );

    let stats = engine.sync_once().await.expect("cycle reports failure in stats");

    assert_eq!(stats.committed, 0);
    assert!(stats.aborted.is_some());
    assert_eq!(engine.index().upserts, 0);
}

#[tokio::test]
async fn unavailable_source_is_zero_records() {
    let mut engine = SyncEngine::new(
        UnavailableSource,
        Arc::new(FakeEmbedder::default()),
        MemoryIndex::default(),
        100,
    );

    let stats = engine.sync_once().await.expect("source errors are not fatal");

    assert_eq!(stats, SyncStats::default());
    assert!(engine.embedder().batch_sizes().is_empty());
}

#[tokio::test]
async fn batch_size_is_at_least_one() {
    let engine = SyncEngine::new(
        MemorySource::with_records(0),
        Arc::new(FakeEmbedder::default()),
        MemoryIndex::default(),
        0,
    );
    assert_eq!(engine.batch_size(), 1);
}

#[tokio::test]
async fn run_stops_on_cancellation_and_optimizes_after_commits() {
    let source = MemorySource::with_records(3);
    let index = MemoryIndex::default();
    let optimizations = Arc::clone(&index.optimizations);
    let mut engine = SyncEngine::new(source, Arc::new(FakeEmbedder::default()), index, 100);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        canceller.cancel();
    });

    engine
        .run(Duration::from_millis(20), cancel, None)
        .await
        .expect("loop should exit cleanly");

    assert_eq!(engine.index().count().await.expect("count"), 3);
    // only the first cycle committed anything
    assert_eq!(optimizations.load(Ordering::SeqCst), 1);
    assert_eq!(engine.embedder().batch_sizes(), vec![3]);
}

#[tokio::test]
async fn run_keeps_owned_lock_fresh() {
    let temp_dir = tempfile::TempDir::new().expect("should create temp dir");
    let lock = SyncLock::acquire(temp_dir.path().join(".sync.lock"), Duration::from_secs(60))
        .await
        .expect("should acquire lock");
    let token = lock.token().to_string();
    std::fs::write(lock.path(), format!("0 {}\n", token)).expect("should reset heartbeat");

    let mut engine = engine_with(MemorySource::with_records(1), FakeEmbedder::default());
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    engine
        .run(Duration::from_secs(3600), cancel, Some(&lock))
        .await
        .expect("loop should exit cleanly");

    let content = std::fs::read_to_string(lock.path()).expect("should read lock");
    let mut fields = content.split_whitespace();
    let heartbeat: u64 = fields
        .next()
        .and_then(|field| field.parse().ok())
        .expect("lock holds a heartbeat");
    assert!(heartbeat > 0);
    assert_eq!(fields.next(), Some(token.as_str()));
    assert_eq!(engine.embedder().batch_sizes(), vec![1]);
}

#[tokio::test]
async fn run_stops_when_lock_is_taken_over() {
    let temp_dir = tempfile::TempDir::new().expect("should create temp dir");
    let lock = SyncLock::acquire(temp_dir.path().join(".sync.lock"), Duration::from_secs(60))
        .await
        .expect("should acquire lock");
    std::fs::write(lock.path(), "0 other-holder\n").expect("should replace lock");

    let mut engine = engine_with(MemorySource::with_records(3), FakeEmbedder::default());
    let result = engine
        .run(Duration::from_secs(3600), CancellationToken::new(), Some(&lock))
        .await;

    assert!(result.is_err());
    assert!(engine.embedder().batch_sizes().is_empty());
    assert_eq!(engine.index().upserts, 0);
}

/// Blocks every call, like a model that is still loading
struct SlowEmbedder(Duration);

impl Embedder for SlowEmbedder {
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        std::thread::sleep(self.0);
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn lock_stays_held_through_cycle_slower_than_staleness() {
    let temp_dir = tempfile::TempDir::new().expect("should create temp dir");
    let path = temp_dir.path().join(".sync.lock");
    let stale_after = Duration::from_millis(300);

    let lock = SyncLock::acquire(&path, stale_after)
        .await
        .expect("should acquire lock");
    let mut engine = SyncEngine::new(
        MemorySource::with_records(2),
        Arc::new(SlowEmbedder(stale_after * 3)),
        MemoryIndex::default(),
        100,
    );

    let cycle = tokio::spawn(async move { engine.sync_once().await.map(|stats| stats.committed) });

    tokio::time::sleep(stale_after * 2).await;
    assert!(!cycle.is_finished(), "embedding should still be in progress");
    assert!(
        SyncLock::acquire(&path, stale_after).await.is_err(),
        "a second sync must not take over a lock whose holder is mid-cycle"
    );

    let committed = cycle
        .await
        .expect("cycle task should not panic")
        .expect("sync should succeed");
    assert_eq!(committed, 2);
    assert!(lock.is_owned().await.expect("can read lock"));

    drop(lock);
    assert!(!path.exists());
}

#[tokio::test]
async fn already_cancelled_runs_no_cycle() {
    let mut engine = engine_with(MemorySource::with_records(2), FakeEmbedder::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    engine
        .run(Duration::from_secs(60), cancel, None)
        .await
        .expect("loop should exit cleanly");

    assert!(engine.embedder().batch_sizes().is_empty());
    assert_eq!(engine.index().upserts, 0);
}

#[tokio::test]
async fn chrome_docs_scenario() {
    let record = LogRecord {
        id: 1,
        timestamp: Some("2024-01-01 10:00:00".to_string()),
        app_name: Some("Chrome".to_string()),
        window_title: Some("Docs".to_string()),
        ocr_text: Some("hello world".to_string()),
        url: Some("https://x.com".to_string()),
        audio_level: Some(0.0),
    };
    let mut engine = engine_with(
        MemorySource(Mutex::new(vec![record])),
        FakeEmbedder::default(),
    );

    engine.sync_once().await.expect("first sync");

    let ids = engine.index().list_ids().await.expect("ids");
    assert_eq!(ids, vec!["1".to_string()]);
    assert_eq!(
        engine.index().documents["1"].text,
        "Time: 2024-01-01 10:00:00, App: Chrome, Title: Docs\nContent: hello world\nURL: https://x.com"
    );
    assert_eq!(engine.current_watermark().await.expect("watermark"), Some(1));

    let upserts = engine.index().upserts;
    let stats = engine.sync_once().await.expect("second sync");
    assert_eq!(stats.committed, 0);
    assert_eq!(engine.index().upserts, upserts);
    assert_eq!(engine.embedder().batch_sizes(), vec![1]);
}
