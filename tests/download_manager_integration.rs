//! Integration tests for DownloadManager
//!
//! Exercises complete download flows against a local mock server:
//! happy path, storage shortfall, retries, healing after a crash, shared
//! tracks, cancellation (also while finalizing), deletion mid-transfer and
//! duplicate requests.

use audiobook_offline::download::{DownloadStage, ProgressEvent};
use audiobook_offline::file::FixedSpaceProbe;
use audiobook_offline::{
    Book, Chapter, DownloadManager, DownloadOutcome, DownloadRequest, OfflineConfig,
    OfflineError, OfflineStatus, ServerCredentials,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MB: u64 = 1024 * 1024;
const TOKEN: &str = "test-token";

fn chapter(book_id: &str, index: usize, content_url: Option<String>) -> Chapter {
    Chapter {
        id: index as u32,
        title: format!("Chapter {}", index + 1),
        start: index as f64 * 300.0,
        end: (index + 1) as f64 * 300.0,
        library_item_id: book_id.to_string(),
        episode_id: None,
        content_url,
    }
}

/// Book whose chapters point at `/audio/{id}/{n}.mp3`
fn book(id: &str, chapters: usize) -> Book {
    Book {
        id: id.to_string(),
        title: format!("Book {}", id),
        author: Some("Test Author".to_string()),
        chapters: (0..chapters)
            .map(|i| chapter(id, i, Some(audio_route(id, i))))
            .collect(),
        cover_path: Some(format!("/covers/{}.jpg", id)),
        collapsed_series: None,
    }
}

fn audio_route(id: &str, index: usize) -> String {
    format!("/audio/{}/{}.mp3", id, index)
}

fn config(temp_dir: &TempDir) -> audiobook_offline::config::OfflineConfigBuilder {
    OfflineConfig::builder()
        .downloads_directory(temp_dir.path().join("downloads"))
        .terminal_state_grace(Duration::from_secs(5))
        .progress_interval(Duration::from_millis(10))
}

async fn manager_with(
    server: &MockServer,
    config: audiobook_offline::config::OfflineConfigBuilder,
    free_bytes: u64,
) -> DownloadManager {
    let manager = DownloadManager::with_space_probe(
        config.build().unwrap(),
        Arc::new(FixedSpaceProbe(free_bytes)),
    )
    .unwrap();
    manager
        .set_credentials(Some(ServerCredentials::new(&server.uri(), TOKEN).unwrap()))
        .await
        .unwrap();
    manager
}

async fn mount_audio(server: &MockServer, id: &str, index: usize, bytes: u64, expect: u64) {
    Mock::given(method("GET"))
        .and(path(audio_route(id, index)))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![index as u8; bytes as usize]))
        .expect(expect)
        .mount(server)
        .await;
}

async fn mount_cover(server: &MockServer, id: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/covers/{}.jpg", id)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFFu8; 2048]))
        .mount(server)
        .await;
}

fn drain(events: &mut broadcast::Receiver<ProgressEvent>, book_id: &str) -> Vec<ProgressEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.book_id == book_id {
            collected.push(event);
        }
    }
    collected
}

fn stage_rank(stage: DownloadStage) -> u8 {
    match stage {
        DownloadStage::Preparing => 0,
        DownloadStage::DownloadingAudio => 1,
        DownloadStage::DownloadingCover => 2,
        DownloadStage::Finalizing => 3,
        DownloadStage::Complete | DownloadStage::Failed => 4,
    }
}

fn started(request: DownloadRequest) -> audiobook_offline::DownloadHandle {
    match request {
        DownloadRequest::Started(handle) => handle,
        other => panic!("expected a started download, got {:?}", other),
    }
}

#[tokio::test]
async fn test_happy_path_downloads_every_chapter_and_cover() {
    let server = MockServer::start().await;
    for i in 0..3 {
        mount_audio(&server, "li_a", i, MB, 1).await;
    }
    mount_cover(&server, "li_a").await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;
    let book = book("li_a", 3);
    let mut events = manager.subscribe();

    let mut handle = started(manager.download_book(book.clone()).await.unwrap());
    assert_eq!(handle.wait().await, DownloadOutcome::Completed);

    assert_eq!(manager.get_offline_status("li_a").await, OfflineStatus::Available);
    assert!(manager.is_book_downloaded("li_a").await);
    assert!(!manager.is_downloading_book("li_a").await);

    let manifest = manager.storage().read_manifest("li_a").await.unwrap();
    assert_eq!(manifest, book);
    assert_eq!(manifest.chapters.len(), 3);

    for i in 0..3 {
        let audio = manager.get_local_audio_path("li_a", i).await.unwrap();
        assert_eq!(tokio::fs::metadata(&audio).await.unwrap().len(), MB);
    }
    assert!(manager.get_local_cover_path("li_a").await.is_some());
    assert!(manager.get_book_storage_size("li_a").await >= 3 * MB);

    let record = manager.get_download_record("li_a").await.unwrap();
    assert_eq!(record.stage, DownloadStage::Complete);
    assert_eq!(record.progress, 1.0);
    assert_eq!(record.status_message, "Download complete");
    assert!(!record.is_downloading);

    let events = drain(&mut events, "li_a");
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        assert!(pair[1].progress >= pair[0].progress, "progress went backwards: {:?}", pair);
        assert!(stage_rank(pair[1].stage) >= stage_rank(pair[0].stage), "stage went backwards: {:?}", pair);
    }
    let last = events.last().unwrap();
    assert_eq!(last.stage, DownloadStage::Complete);
    assert_eq!(last.progress, 1.0);
    assert!(events.iter().any(|e| e.stage == DownloadStage::DownloadingAudio));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_insufficient_storage_fails_before_any_request() {
    let server = MockServer::start().await;
    for i in 0..2 {
        mount_audio(&server, "li_b", i, MB, 0).await;
    }

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 100 * MB).await;

    let err = manager.download_book(book("li_b", 2)).await.unwrap_err();
    assert!(matches!(err, OfflineError::InsufficientStorage { .. }));

    let dir = manager.storage().paths().book_dir("li_b").unwrap();
    assert!(!dir.exists());
    assert_eq!(manager.get_offline_status("li_b").await, OfflineStatus::NotDownloaded);

    let record = manager.get_download_record("li_b").await.unwrap();
    assert_eq!(record.stage, DownloadStage::Failed);
    assert!(record.status_message.contains("Not enough storage space"));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_chapter_retries_then_fails_and_cleans_up() {
    let server = MockServer::start().await;
    mount_audio(&server, "li_c", 0, 256 * 1024, 1).await;

    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut book = book("li_c", 2);
    book.chapters[1].content_url = Some(format!("http://127.0.0.1:{}/gone.mp3", closed_port));

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(
        &server,
        config(&temp_dir)
            .retry_attempts(2)
            .initial_backoff(Duration::from_millis(500)),
        600 * MB,
    )
    .await;

    let started_at = Instant::now();
    let mut handle = started(manager.download_book(book).await.unwrap());
    let outcome = handle.wait().await;

    match outcome {
        DownloadOutcome::Failed(message) => assert!(message.starts_with("Download failed:")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(started_at.elapsed() >= Duration::from_millis(500));

    let dir = manager.storage().paths().book_dir("li_c").unwrap();
    assert!(!dir.exists());
    assert_eq!(manager.get_offline_status("li_c").await, OfflineStatus::NotDownloaded);

    let record = manager.get_download_record("li_c").await.unwrap();
    assert_eq!(record.stage, DownloadStage::Failed);
    assert!(!record.is_downloading);
}

#[tokio::test]
async fn test_healing_repairs_or_purges_book_without_manifest() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    for (id, with_catalog) in [("li_d1", true), ("li_d2", false)] {
        let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;
        let book = book(id, 3);

        // Crash after audio and cover were written, before the manifest
        let paths = manager.storage().paths().clone();
        tokio::fs::create_dir_all(paths.book_dir(id).unwrap()).await.unwrap();
        for i in 0..3 {
            tokio::fs::write(paths.audio_path(id, i).unwrap(), vec![1u8; 1024]).await.unwrap();
        }
        tokio::fs::write(paths.cover_path(id).unwrap(), vec![2u8; 64]).await.unwrap();

        manager.reload_downloaded_books().await;
        assert_eq!(manager.get_offline_status(id).await, OfflineStatus::NotDownloaded);

        if with_catalog {
            manager.catalog().insert(book.clone());
        }
        let report = manager.heal_now().await;

        if with_catalog {
            assert_eq!(report.repaired, 1);
            assert_eq!(manager.get_offline_status(id).await, OfflineStatus::Available);
            assert!(manager.is_book_downloaded(id).await);
            assert_eq!(manager.storage().read_manifest(id).await.unwrap(), book);
        } else {
            assert_eq!(report.purged, 1);
            assert!(!paths.book_dir(id).unwrap().exists());
            assert_eq!(manager.get_offline_status(id).await, OfflineStatus::NotDownloaded);
        }

        manager.shutdown().await;
    }
}

#[tokio::test]
async fn test_cancel_stops_transfer_and_removes_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(audio_route("li_e", 0)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 64 * 1024])
                .set_delay(Duration::from_secs(3)),
        )
        .expect(1)
        .mount(&server)
        .await;
    for i in 1..3 {
        mount_audio(&server, "li_e", i, MB, 0).await;
    }
    Mock::given(method("GET"))
        .and(path("/covers/li_e.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 16]))
        .expect(0)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;
    let mut events = manager.subscribe();

    let mut handle = started(manager.download_book(book("li_e", 3)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.is_downloading_book("li_e").await);

    assert!(manager.cancel_download("li_e").await);
    assert!(!manager.is_downloading_book("li_e").await);
    assert!(manager.get_download_record("li_e").await.is_none());
    let before_cancel = drain(&mut events, "li_e").len();

    let started_at = Instant::now();
    assert_eq!(handle.wait().await, DownloadOutcome::Cancelled);
    assert!(started_at.elapsed() < Duration::from_secs(2));

    assert!(drain(&mut events, "li_e").is_empty(), "events after cancel ({} before)", before_cancel);
    assert!(!manager.storage().paths().book_dir("li_e").unwrap().exists());
    assert_eq!(manager.get_offline_status("li_e").await, OfflineStatus::NotDownloaded);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_requests_start_one_transfer() {
    let server = MockServer::start().await;
    for i in 0..2 {
        mount_audio(&server, "li_f", i, 128 * 1024, 1).await;
    }
    mount_cover(&server, "li_f").await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;
    let book = book("li_f", 2);

    let (first, second) = tokio::join!(
        manager.download_book(book.clone()),
        manager.download_book(book.clone())
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let mut handle = match (first, second) {
        (DownloadRequest::Started(handle), DownloadRequest::AlreadyDownloading)
        | (DownloadRequest::AlreadyDownloading, DownloadRequest::Started(handle)) => handle,
        other => panic!("unexpected pair: {:?}", other),
    };
    assert_eq!(handle.wait().await, DownloadOutcome::Completed);

    let again = manager.download_book(book).await.unwrap();
    assert!(matches!(again, DownloadRequest::AlreadyDownloaded));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_limit_queues_second_book() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(audio_route("slow", 0)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_millis(1000)),
        )
        .mount(&server)
        .await;
    mount_audio(&server, "fast", 0, 1024, 1).await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir).max_concurrent_downloads(1), 600 * MB).await;

    let mut slow = started(manager.download_book(book("slow", 1)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut fast = started(manager.download_book(book("fast", 1)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let queued = manager.get_download_record("fast").await.unwrap();
    assert!(queued.is_downloading);
    assert_eq!(queued.stage, DownloadStage::Preparing);
    let fast_requests = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path().starts_with("/audio/fast/"))
        .count();
    assert_eq!(fast_requests, 0);

    assert_eq!(slow.wait().await, DownloadOutcome::Completed);
    assert_eq!(fast.wait().await, DownloadOutcome::Completed);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_download_by_id_through_playback_session() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/items/li_g"))
        .and(query_param("expanded", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "li_g",
            "media": {
                "metadata": { "title": "Session Book", "authorName": "Someone" },
                "chapters": [
                    { "id": 0, "start": 0.0, "end": 60.0, "title": "One" },
                    { "id": 1, "start": 60.0, "end": 120.0, "title": "Two" }
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/items/li_g/play"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "sess-1",
            "audioTracks": [
                { "index": 1, "startOffset": 0.0, "duration": 60.0, "contentUrl": "/s/li_g/1.mp3" },
                { "index": 2, "startOffset": 60.0, "duration": 60.0, "contentUrl": "/s/li_g/2.mp3" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    for n in 1..=2 {
        Mock::given(method("GET"))
            .and(path(format!("/s/li_g/{}.mp3", n)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![n as u8; 4096]))
            .expect(1)
            .mount(&server)
            .await;
    }

    Mock::given(method("POST"))
        .and(path("/api/session/sess-1/close"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;

    let mut handle = started(manager.download_book_by_id("li_g").await.unwrap());
    assert_eq!(handle.wait().await, DownloadOutcome::Completed);

    let books = manager.downloaded_books().await;
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].title, "Session Book");
    assert_eq!(books[0].chapters.len(), 2);

    let second = manager.get_local_audio_path("li_g", 1).await.unwrap();
    assert_eq!(tokio::fs::read(second).await.unwrap(), vec![2u8; 4096]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_unknown_book_is_noop_and_delete_removes_download() {
    let server = MockServer::start().await;
    mount_audio(&server, "li_h", 0, 2048, 1).await;
    mount_cover(&server, "li_h").await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;

    manager.delete_book("does-not-exist").await.unwrap();

    let mut handle = started(manager.download_book(book("li_h", 1)).await.unwrap());
    assert_eq!(handle.wait().await, DownloadOutcome::Completed);
    assert!(manager.get_total_download_size().await > 0);

    manager.delete_book("li_h").await.unwrap();
    assert!(!manager.is_book_downloaded("li_h").await);
    assert_eq!(manager.get_offline_status("li_h").await, OfflineStatus::NotDownloaded);
    assert!(manager.get_local_audio_path("li_h", 0).await.is_none());
    assert_eq!(manager.get_total_download_size().await, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_retries_then_succeeds() {
    let server = MockServer::start().await;
    // First response stalls past the read timeout
    Mock::given(method("GET"))
        .and(path(audio_route("li_r", 0)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_secs(3)),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_audio(&server, "li_r", 0, 4096, 1).await;
    mount_cover(&server, "li_r").await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(
        &server,
        config(&temp_dir)
            .request_timeout(Duration::from_secs(1))
            .retry_attempts(3)
            .initial_backoff(Duration::from_millis(500)),
        600 * MB,
    )
    .await;

    let started_at = Instant::now();
    let mut handle = started(manager.download_book(book("li_r", 1)).await.unwrap());
    assert_eq!(handle.wait().await, DownloadOutcome::Completed);
    assert!(started_at.elapsed() >= Duration::from_millis(1500));

    let audio_requests = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == audio_route("li_r", 0))
        .count();
    assert_eq!(audio_requests, 2);

    let audio = manager.get_local_audio_path("li_r", 0).await.unwrap();
    assert_eq!(tokio::fs::read(audio).await.unwrap(), vec![0u8; 4096]);
    assert_eq!(manager.get_offline_status("li_r").await, OfflineStatus::Available);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_chapters_sharing_one_track_fetch_it_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/audio/li_s/whole.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; 8192]))
        .expect(1)
        .mount(&server)
        .await;
    mount_cover(&server, "li_s").await;

    let mut book = book("li_s", 3);
    for chapter in &mut book.chapters {
        chapter.content_url = Some("/audio/li_s/whole.mp3".to_string());
    }

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;

    let mut handle = started(manager.download_book(book).await.unwrap());
    assert_eq!(handle.wait().await, DownloadOutcome::Completed);

    for i in 0..3 {
        let audio = manager.get_local_audio_path("li_s", i).await.unwrap();
        assert_eq!(tokio::fs::read(audio).await.unwrap(), vec![5u8; 8192]);
    }
    assert_eq!(manager.get_offline_status("li_s").await, OfflineStatus::Available);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_cancel_while_finalizing_never_leaves_book_available() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;

    for round in 0..10 {
        let id = format!("li_fin{}", round);
        mount_audio(&server, &id, 0, 4096, 1).await;
        mount_cover(&server, &id).await;

        let mut events = manager.subscribe();
        let mut handle = started(manager.download_book(book(&id, 1)).await.unwrap());

        loop {
            let event = events.recv().await.unwrap();
            if event.book_id != id {
                continue;
            }
            assert!(!event.stage.is_terminal(), "finished before finalizing: {:?}", event);
            if event.stage == DownloadStage::Finalizing {
                break;
            }
        }

        let cancelled = manager.cancel_download(&id).await;
        let outcome = handle.wait().await;
        let dir = manager.storage().paths().book_dir(&id).unwrap();

        if cancelled {
            assert_eq!(outcome, DownloadOutcome::Cancelled);
            assert!(!dir.exists());
            assert!(!manager.is_book_downloaded(&id).await);
            assert_eq!(manager.get_offline_status(&id).await, OfflineStatus::NotDownloaded);
        } else {
            assert_eq!(outcome, DownloadOutcome::Completed);
            assert!(manager.is_book_downloaded(&id).await);
            assert_eq!(manager.get_offline_status(&id).await, OfflineStatus::Available);
        }
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_healing_leaves_queued_download_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(audio_route("slow", 0)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&server)
        .await;
    mount_audio(&server, "queued", 0, 1024, 0).await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir).max_concurrent_downloads(1), 600 * MB).await;

    let mut slow = started(manager.download_book(book("slow", 1)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Audio left behind by an interrupted attempt, no manifest
    let paths = manager.storage().paths().clone();
    tokio::fs::create_dir_all(paths.book_dir("queued").unwrap()).await.unwrap();
    tokio::fs::write(paths.audio_path("queued", 0).unwrap(), vec![1u8; 1024]).await.unwrap();

    let mut queued = started(manager.download_book(book("queued", 1)).await.unwrap());
    assert_eq!(manager.get_offline_status("queued").await, OfflineStatus::Downloading);

    let report = manager.heal_now().await;
    assert_eq!(report.repaired, 0);
    assert_eq!(report.purged, 0);
    assert_eq!(report.skipped, 2);
    assert!(!paths.manifest_path("queued").unwrap().exists());
    assert_eq!(manager.get_offline_status("queued").await, OfflineStatus::Downloading);

    assert!(manager.cancel_download("queued").await);
    assert_eq!(queued.wait().await, DownloadOutcome::Cancelled);
    assert_eq!(manager.get_offline_status("queued").await, OfflineStatus::NotDownloaded);

    assert_eq!(slow.wait().await, DownloadOutcome::Completed);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_during_download_leaves_nothing_behind() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(audio_route("li_x", 0)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    mount_audio(&server, "li_x", 1, 1024, 0).await;

    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(&server, config(&temp_dir), 600 * MB).await;

    let mut handle = started(manager.download_book(book("li_x", 2)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.is_downloading_book("li_x").await);

    let started_at = Instant::now();
    manager.delete_book("li_x").await.unwrap();
    assert!(started_at.elapsed() < Duration::from_secs(2));

    assert!(!manager.storage().paths().book_dir("li_x").unwrap().exists());
    assert!(manager.get_download_record("li_x").await.is_none());
    assert!(!manager.is_book_downloaded("li_x").await);
    assert_eq!(manager.get_offline_status("li_x").await, OfflineStatus::NotDownloaded);
    assert_eq!(handle.wait().await, DownloadOutcome::Cancelled);

    manager.shutdown().await;
}
