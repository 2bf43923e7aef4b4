mod common;

use common::{fast_config, get, head, payload, Resource, TestServer};
use rpatch::config::TransferConfig;
use rpatch::state::TransferState;
use rpatch::{Fetcher, TransferCoordinator, TransferHandle, TransferStatus, TransferTarget};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn chunked_config() -> TransferConfig {
    TransferConfig {
        parallel_threshold: 20,
        chunk_size: 10,
        max_chunk_workers: 3,
        ..fast_config()
    }
}

async fn finish(handle: &TransferHandle) -> TransferStatus {
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("transfer did not finish")
}

async fn wait_for_bytes(path: &Path) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no bytes arrived");
}

#[tokio::test]
async fn small_file_streams_in_one_request() {
    let server = TestServer::start().await;
    let body = payload(1000);
    server.put("/small.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("small.bin");

    let coordinator = TransferCoordinator::new(fast_config());
    let handle = coordinator.start_download(&server.url("/small.bin"), &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 1000 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!handle.target().temp_path().exists());
    assert_eq!(server.log_for("/small.bin"), vec![head(), get(None)]);

    let progress = handle.progress().borrow().clone();
    assert_eq!(progress.downloaded_bytes, 1000);
    assert_eq!(progress.total_bytes, Some(1000));
}

#[tokio::test]
async fn single_stream_resumes_from_partial_file() {
    let server = TestServer::start().await;
    let body = payload(1000);
    server.put("/game.zip", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("game.zip");
    let target = TransferTarget::new(server.url("/game.zip"), &dest);
    std::fs::write(target.temp_path(), &body[..400]).unwrap();

    let coordinator = TransferCoordinator::new(fast_config());
    let handle = coordinator.start_download(&target.url, &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 1000 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(server.log_for("/game.zip"), vec![head(), get(Some("bytes=400-"))]);
}

#[tokio::test]
async fn ignored_range_restarts_from_zero() {
    let server = TestServer::start().await;
    let body = payload(1000);
    server.put("/game.zip", Resource::new(body.clone()).without_ranges());
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("game.zip");
    let target = TransferTarget::new(server.url("/game.zip"), &dest);
    std::fs::write(target.temp_path(), vec![0xAA; 400]).unwrap();

    let coordinator = TransferCoordinator::new(fast_config());
    let handle = coordinator.start_download(&target.url, &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 1000 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn complete_destination_is_not_fetched_again() {
    let server = TestServer::start().await;
    let body = payload(1000);
    server.put("/done.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("done.bin");
    std::fs::write(&dest, &body).unwrap();

    let coordinator = TransferCoordinator::new(fast_config());
    let handle = coordinator.start_download(&server.url("/done.bin"), &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 1000 });
    assert_eq!(server.log_for("/done.bin"), vec![head()]);
}

#[tokio::test]
async fn complete_large_destination_skips_range_check() {
    let server = TestServer::start().await;
    let body = payload(25);
    server.put("/big.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.bin");
    std::fs::write(&dest, &body).unwrap();

    let coordinator = TransferCoordinator::new(chunked_config());
    let handle = coordinator.start_download(&server.url("/big.bin"), &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 25 });
    assert_eq!(server.log_for("/big.bin"), vec![head()]);
}

#[tokio::test]
async fn leftover_state_next_to_finished_file_needs_no_requests() {
    let server = TestServer::start().await;
    let body = payload(25);
    server.put("/big.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.bin");
    let target = TransferTarget::new(server.url("/big.bin"), &dest);

    std::fs::write(&dest, &body).unwrap();
    let mut state = TransferState::new(&target.url, 25, 10);
    for offset in [0, 10, 20] {
        state.mark_complete(offset);
    }
    state.save(&target.meta_path()).await.unwrap();

    let coordinator = TransferCoordinator::new(chunked_config());
    let handle = coordinator.start_download(&target.url, &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 25 });
    assert!(server.requests().is_empty());
    assert!(!target.meta_path().exists());
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn large_file_is_fetched_in_chunks() {
    let server = TestServer::start().await;
    let body = payload(95);
    server.put("/big.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.bin");

    let coordinator = TransferCoordinator::new(chunked_config());
    let handle = coordinator.start_download(&server.url("/big.bin"), &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 95 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!handle.target().meta_path().exists());
    assert!(!handle.target().temp_path().exists());

    let log = server.log_for("/big.bin");
    assert_eq!(&log[..2], &[head(), get(Some("bytes=0-0"))]);
    let mut ranges: Vec<String> = log[2..].iter().filter_map(|(_, range)| range.clone()).collect();
    ranges.sort();
    let mut expected: Vec<String> = (0..10)
        .map(|i| format!("bytes={}-{}", i * 10, (i * 10 + 9).min(94)))
        .collect();
    expected.sort();
    assert_eq!(ranges, expected);
}

#[tokio::test]
async fn parallel_transfer_resumes_from_saved_state() {
    let server = TestServer::start().await;
    let body = payload(25);
    server.put("/big.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.bin");
    let target = TransferTarget::new(server.url("/big.bin"), &dest);

    let mut partial = body[..20].to_vec();
    partial.resize(25, 0);
    std::fs::write(target.temp_path(), &partial).unwrap();
    let mut state = TransferState::new(&target.url, 25, 10);
    state.mark_complete(0);
    state.mark_complete(10);
    state.save(&target.meta_path()).await.unwrap();

    let coordinator = TransferCoordinator::new(chunked_config());
    let handle = coordinator.start_download(&target.url, &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 25 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(
        server.log_for("/big.bin"),
        vec![get(Some("bytes=0-0")), get(Some("bytes=20-24"))]
    );
    assert!(!target.meta_path().exists());
}

#[tokio::test]
async fn stale_state_for_another_chunk_size_is_discarded() {
    let server = TestServer::start().await;
    let body = payload(25);
    server.put("/big.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.bin");
    let target = TransferTarget::new(server.url("/big.bin"), &dest);

    std::fs::write(target.temp_path(), vec![0xFF; 25]).unwrap();
    let mut state = TransferState::new(&target.url, 25, 5);
    state.mark_complete(0);
    state.mark_complete(5);
    state.save(&target.meta_path()).await.unwrap();

    let coordinator = TransferCoordinator::new(chunked_config());
    let handle = coordinator.start_download(&target.url, &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 25 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn failed_chunk_is_retried_on_next_attempt() {
    let server = TestServer::start().await;
    let body = payload(40);
    server.put("/big.bin", Resource::new(body.clone()));
    server.fail_once("/big.bin", "bytes=10-19");
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.bin");

    let coordinator = TransferCoordinator::new(chunked_config());
    let handle = coordinator.start_download(&server.url("/big.bin"), &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 40 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let retried = server
        .log_for("/big.bin")
        .into_iter()
        .filter(|entry| entry == &get(Some("bytes=10-19")))
        .count();
    assert_eq!(retried, 2);
}

#[tokio::test]
async fn range_ignoring_server_gets_single_stream() {
    let server = TestServer::start().await;
    let body = payload(25);
    server.put("/big.bin", Resource::new(body.clone()).without_ranges());
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.bin");

    let coordinator = TransferCoordinator::new(chunked_config());
    let handle = coordinator.start_download(&server.url("/big.bin"), &dest);

    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 25 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(
        server.log_for("/big.bin"),
        vec![head(), get(Some("bytes=0-0")), get(None)]
    );
}

#[tokio::test]
async fn missing_remote_fails_after_one_retry() {
    let server = TestServer::start().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("gone.bin");

    let coordinator = TransferCoordinator::new(fast_config());
    let handle = coordinator.start_download(&server.url("/gone.bin"), &dest);

    match finish(&handle).await {
        TransferStatus::Failed { message } => assert!(message.contains("not found"), "{}", message),
        other => panic!("unexpected status {:?}", other),
    }
    let gets = server
        .log_for("/gone.bin")
        .into_iter()
        .filter(|(method, _)| method == "GET")
        .count();
    assert_eq!(gets, 2);
}

#[tokio::test]
async fn pause_keeps_partial_and_resume_continues() {
    let server = TestServer::start().await;
    let body = payload(4096);
    server.put("/slow.bin", Resource::new(body.clone()).paced(Duration::from_millis(10)));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("slow.bin");

    let coordinator = TransferCoordinator::new(fast_config());
    let handle = coordinator.start_download(&server.url("/slow.bin"), &dest);
    wait_for_bytes(&handle.target().temp_path()).await;

    assert!(coordinator.pause());
    handle.settle().await;
    assert_eq!(handle.current_status(), TransferStatus::Paused);
    assert!(!handle.pause());
    let partial = std::fs::metadata(handle.target().temp_path()).unwrap().len();
    assert!(partial > 0 && partial < 4096, "partial = {}", partial);
    assert!(!dest.exists());

    assert!(coordinator.resume());
    assert_eq!(finish(&handle).await, TransferStatus::Completed { bytes: 4096 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);

    let (method, range) = server.log_for("/slow.bin").pop().unwrap();
    assert_eq!(method, "GET");
    let range = range.expect("resumed request should carry a range");
    assert!(range.starts_with("bytes=") && range != "bytes=0-", "{}", range);
}

#[tokio::test]
async fn starting_the_same_target_twice_shares_one_transfer() {
    let server = TestServer::start().await;
    let body = payload(1024);
    server.put("/slow.bin", Resource::new(body.clone()).paced(Duration::from_millis(5)));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("slow.bin");
    let url = server.url("/slow.bin");

    let coordinator = TransferCoordinator::new(fast_config());
    let first = coordinator.start_download(&url, &dest);
    let second = coordinator.start_download(&url, &dest);

    assert_eq!(finish(&second).await, TransferStatus::Completed { bytes: 1024 });
    assert_eq!(first.current_status(), TransferStatus::Completed { bytes: 1024 });
    assert_eq!(server.log_for("/slow.bin"), vec![head(), get(None)]);
}

#[tokio::test]
async fn starting_a_paused_target_resumes_it() {
    let server = TestServer::start().await;
    let body = payload(2048);
    server.put("/slow.bin", Resource::new(body.clone()).paced(Duration::from_millis(10)));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("slow.bin");
    let url = server.url("/slow.bin");

    let coordinator = TransferCoordinator::new(fast_config());
    let handle = coordinator.start_download(&url, &dest);
    wait_for_bytes(&handle.target().temp_path()).await;
    assert!(handle.pause());
    handle.settle().await;

    let again = coordinator.start_download(&url, &dest);
    assert_eq!(again.current_status(), TransferStatus::Running);
    assert_eq!(finish(&again).await, TransferStatus::Completed { bytes: 2048 });
    assert_eq!(handle.current_status(), TransferStatus::Completed { bytes: 2048 });
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn new_target_supersedes_active_transfer() {
    let server = TestServer::start().await;
    server.put("/slow.bin", Resource::new(payload(4096)).paced(Duration::from_millis(10)));
    let fast = payload(300);
    server.put("/fast.bin", Resource::new(fast.clone()));
    let dir = TempDir::new().unwrap();

    let coordinator = TransferCoordinator::new(fast_config());
    let old = coordinator.start_download(&server.url("/slow.bin"), dir.path().join("slow.bin"));
    let new = coordinator.start_download(&server.url("/fast.bin"), dir.path().join("fast.bin"));

    assert_eq!(old.current_status(), TransferStatus::Superseded);
    assert_eq!(finish(&new).await, TransferStatus::Completed { bytes: 300 });
    old.settle().await;
    assert_eq!(old.current_status(), TransferStatus::Superseded);
    assert!(!dir.path().join("slow.bin").exists());
    assert_eq!(std::fs::read(dir.path().join("fast.bin")).unwrap(), fast);
    assert_eq!(coordinator.active().unwrap().target(), new.target());
}

#[tokio::test]
async fn new_source_for_same_destination_waits_for_old_run() {
    let server = TestServer::start().await;
    server.put("/mirror-a/client.bin", Resource::new(payload(4096)).paced(Duration::from_millis(10)));
    let body = payload(2000);
    server.put("/mirror-b/client.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("client.bin");

    let coordinator = TransferCoordinator::new(fast_config());
    let old = coordinator.start_download(&server.url("/mirror-a/client.bin"), &dest);
    wait_for_bytes(&old.target().temp_path()).await;
    let new = coordinator.start_download(&server.url("/mirror-b/client.bin"), &dest);

    assert_eq!(old.current_status(), TransferStatus::Superseded);
    assert_eq!(finish(&new).await, TransferStatus::Completed { bytes: 2000 });
    assert_eq!(old.current_status(), TransferStatus::Superseded);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!new.target().temp_path().exists());
    assert!(!new.target().meta_path().exists());

    // Nothing from the old run lands afterwards.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!new.target().temp_path().exists());
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn rejected_resume_offset_restarts_fetch() {
    let server = TestServer::start().await;
    let body = payload(1000);
    server.put("/file.bin", Resource::new(body.clone()));
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("file.bin");
    std::fs::write(&path, vec![7u8; 1200]).unwrap();

    let fetcher = Fetcher::new(&fast_config());
    let written = fetcher
        .fetch_to_file(&server.url("/file.bin"), &path, None, &CancellationToken::new(), &|_: u64| {})
        .await
        .unwrap();

    assert_eq!(written, 1000);
    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert_eq!(
        server.log_for("/file.bin"),
        vec![get(Some("bytes=1200-")), get(None)]
    );
}

#[tokio::test]
async fn range_fetch_requires_partial_content() {
    let server = TestServer::start().await;
    server.put("/file.bin", Resource::new(payload(100)).without_ranges());
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("file.bin");
    std::fs::write(&path, vec![0u8; 100]).unwrap();

    let fetcher = Fetcher::new(&fast_config());
    let err = fetcher
        .fetch_range(&server.url("/file.bin"), &path, 10, 10, &CancellationToken::new(), &|_: u64| {})
        .await
        .unwrap_err();
    assert!(err.is_protocol(), "{}", err);
}

#[tokio::test]
async fn probe_reports_range_support_and_size() {
    let server = TestServer::start().await;
    server.put("/ranged.bin", Resource::new(payload(77)));
    server.put("/plain.bin", Resource::new(payload(77)).without_ranges());
    let fetcher = Fetcher::new(&fast_config());
    let cancel = CancellationToken::new();

    let ranged = fetcher.probe_range(&server.url("/ranged.bin"), &cancel).await.unwrap();
    assert!(ranged.supported);
    assert_eq!(ranged.total_bytes, Some(77));

    let plain = fetcher.probe_range(&server.url("/plain.bin"), &cancel).await.unwrap();
    assert!(!plain.supported);
    assert_eq!(plain.total_bytes, Some(77));

    assert_eq!(
        fetcher.content_length(&server.url("/ranged.bin"), &cancel).await.unwrap(),
        Some(77)
    );
    assert_eq!(
        fetcher.content_length(&server.url("/missing.bin"), &cancel).await.unwrap(),
        None
    );
}
