use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tunedrop::services::{
    ArtifactDraft, ArtifactStore, ConversionService, ExtractionConfig, RetentionSweeper,
    ServiceError,
};
use tunedrop::testing::{FakeBehavior, FakeExtractor};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

async fn setup(extractor: Arc<FakeExtractor>) -> (TempDir, ConversionService) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ArtifactStore::open(dir.path(), "mp3").await.unwrap());
    let service = ConversionService::new(store, extractor, ExtractionConfig::default());
    (dir, service)
}

async fn read_artifact(store: &ArtifactStore, id: &str) -> Vec<u8> {
    let (_, mut file) = store.open_file(id).await.unwrap();
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await.unwrap();
    bytes
}

// -- Tests --

#[tokio::test]
async fn simultaneous_requests_trigger_single_extraction() {
    let extractor = Arc::new(FakeExtractor::new().with_delay(Duration::from_millis(150)));
    let (_dir, service) = setup(extractor.clone()).await;

    let results = join_all((0..16).map(|_| service.convert("https://media.test/popular"))).await;

    assert_eq!(extractor.calls(), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert_eq!(result.as_ref().unwrap(), first);
    }
}

#[tokio::test]
async fn simultaneous_failures_are_shared_and_retryable() {
    let extractor = Arc::new(
        FakeExtractor::with_behavior(FakeBehavior::Unavailable)
            .with_delay(Duration::from_millis(100)),
    );
    let (_dir, service) = setup(extractor.clone()).await;

    let results = join_all((0..5).map(|_| service.convert("https://media.test/private"))).await;

    assert_eq!(extractor.calls(), 1);
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(ServiceError::SourceUnavailable(_)))));

    let _ = service.convert("https://media.test/private").await;
    assert_eq!(extractor.calls(), 2);
}

#[tokio::test]
async fn stored_bytes_match_extractor_output() {
    let extractor = Arc::new(FakeExtractor::new());
    let (_dir, service) = setup(extractor).await;

    let record = service.convert("https://media.test/track-9").await.unwrap();

    assert_eq!(
        read_artifact(service.store(), &record.id).await,
        FakeExtractor::content_for("track-9")
    );
}

#[tokio::test]
async fn reconverting_ready_artifact_skips_extractor() {
    let extractor = Arc::new(FakeExtractor::new());
    let (_dir, service) = setup(extractor.clone()).await;

    let first = service.convert("https://media.test/again").await.unwrap();
    for _ in 0..3 {
        let again = service.convert("https://media.test/again").await.unwrap();
        assert_eq!(again.title, first.title);
        assert_eq!(again.thumbnail_url, first.thumbnail_url);
    }
    assert_eq!(extractor.calls(), 1);
}

#[tokio::test]
async fn eviction_forces_reextraction() {
    let extractor = Arc::new(FakeExtractor::new());
    let (_dir, service) = setup(extractor.clone()).await;

    service.convert("https://media.test/short-lived").await.unwrap();
    service.store().remove("short-lived").await.unwrap();
    service.convert("https://media.test/short-lived").await.unwrap();

    assert_eq!(extractor.calls(), 2);
}

#[tokio::test]
async fn restart_keeps_ready_artifacts() {
    let dir = TempDir::new().unwrap();
    let stored = {
        let store = Arc::new(ArtifactStore::open(dir.path(), "mp3").await.unwrap());
        let service = ConversionService::new(
            store,
            Arc::new(FakeExtractor::new()),
            ExtractionConfig::default(),
        );
        service.convert("https://media.test/durable").await.unwrap()
    };

    let extractor = Arc::new(FakeExtractor::new().deriving_ids());
    let store = Arc::new(ArtifactStore::open(dir.path(), "mp3").await.unwrap());
    let service = ConversionService::new(store, extractor.clone(), ExtractionConfig::default());

    let record = service.convert("https://media.test/durable").await.unwrap();
    assert_eq!(record.id, "durable");
    assert_eq!(extractor.calls(), 0);
    let drift = (record.created_at - stored.created_at).num_milliseconds().abs();
    assert!(drift < 1000, "created_at drifted by {}ms", drift);
}

#[tokio::test]
async fn retention_ages_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = Arc::new(ArtifactStore::open(dir.path(), "mp3").await.unwrap());
        let service = ConversionService::new(
            store.clone(),
            Arc::new(FakeExtractor::new()),
            ExtractionConfig::default(),
        );
        service.convert("https://media.test/recent").await.unwrap();

        let area = store.stage().unwrap();
        let staged_path = area.path().join("old.mp3");
        std::fs::write(&staged_path, b"stale").unwrap();
        let draft = ArtifactDraft {
            id: "expired".to_string(),
            title: None,
            thumbnail_url: None,
            staged_path,
        };
        store
            .put_with_created_at(draft, chrono::Utc::now() - chrono::Duration::days(2))
            .await
            .unwrap();
    }

    let store = Arc::new(ArtifactStore::open(dir.path(), "mp3").await.unwrap());
    let report = RetentionSweeper::new(store.clone(), DAY, Duration::from_secs(60))
        .sweep()
        .await;

    assert_eq!(report.scanned, 2);
    assert_eq!(report.evicted, 1);
    assert!(store.get("recent").await.is_ok());
    assert!(store.get("expired").await.is_err());
}

#[tokio::test]
async fn sweeping_during_concurrent_conversions_is_safe() {
    let extractor = Arc::new(FakeExtractor::new().with_delay(Duration::from_millis(5)));
    let (_dir, service) = setup(extractor.clone()).await;
    let store = service.store().clone();

    let long_ago = chrono::Utc::now() - chrono::Duration::days(2);
    for i in 0..20 {
        let area = store.stage().unwrap();
        let staged_path = area.path().join("old.mp3");
        std::fs::write(&staged_path, b"stale").unwrap();
        let draft = ArtifactDraft {
            id: format!("stale-{}", i),
            title: None,
            thumbnail_url: None,
            staged_path,
        };
        store.put_with_created_at(draft, long_ago).await.unwrap();
    }

    let handle = RetentionSweeper::new(store.clone(), DAY, Duration::from_millis(2)).start();

    let workers = (0..50).map(|i| {
        let service = service.clone();
        tokio::spawn(async move {
            let url = format!("https://media.test/fresh-{}", i);
            let record = service.convert(&url).await.unwrap();
            for _ in 0..5 {
                let (found, mut file) = service.store().open_file(&record.id).await.unwrap();
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes).await.unwrap();
                assert_eq!(bytes, FakeExtractor::content_for(&found.id));
                tokio::task::yield_now().await;
            }
            record.id
        })
    });
    let ids: Vec<String> = join_all(workers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.shutdown().await;

    assert_eq!(extractor.calls(), 50);
    let remaining = store.list_all().await;
    assert_eq!(remaining.len(), 50);
    for id in &ids {
        let record = store.get(id).await.unwrap();
        assert!(record.path.is_file());
    }
    assert!(remaining.iter().all(|r| !r.id.starts_with("stale-")));
}
