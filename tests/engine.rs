use std::collections::HashMap;
use std::path::PathBuf;

use stream_fetch::{Engine, EngineConfig, Job};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(state_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        max_concurrent_files: 2,
        max_chunks_per_file: 4,
        max_speed_limit_bytes_per_second: None,
        enable_resume: true,
        enable_chunked: true,
        retry_count: 2,
        state_dir: state_dir.to_path_buf(),
    }
}

#[tokio::test]
async fn single_small_file_with_no_range_support() {
    let server = MockServer::start().await;
    let body = vec![7u8; 500];

    Mock::given(method("HEAD")).and(path("/a.ts")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
    Mock::given(method("GET"))
        .and(path("/a.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let work = tempfile::tempdir().unwrap();
    let engine = Engine::new(config(&work.path().join("state"))).unwrap();
    let destination = work.path().join("a.ts");
    let outcomes = engine.run(vec![Job::new(format!("{}/a.ts", server.uri()), destination.clone())], None).await;

    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result.as_ref().err());
    let on_disk = tokio::fs::read(&destination).await.unwrap();
    assert_eq!(on_disk, body);
    assert!(engine.resumable_jobs().is_empty());
}

#[tokio::test]
async fn four_chunk_parallel_fetch_merges_in_order() {
    let server = MockServer::start().await;
    // 10 MiB is the smallest size landing in the "<100 MiB -> 4 chunks" tier;
    // below it plan_chunks would only ever produce 1 or 2 chunks.
    let total = 10 * 1024 * 1024usize;
    let body: Vec<u8> = (0..total).map(|i| (i % 256) as u8).collect();
    let quarter = total / 4;

    Mock::given(method("HEAD"))
        .and(path("/movie.ts"))
        .respond_with(ResponseTemplate::new(200).insert_header("accept-ranges", "bytes").insert_header(
            "content-length",
            total.to_string().as_str(),
        ))
        .mount(&server)
        .await;

    for i in 0..4 {
        let start = i * quarter;
        let end = if i == 3 { total - 1 } else { start + quarter - 1 };
        let range_header = format!("bytes={start}-{end}");
        Mock::given(method("GET"))
            .and(path("/movie.ts"))
            .and(header("Range", range_header.as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body[start..=end].to_vec()))
            .mount(&server)
            .await;
    }

    let work = tempfile::tempdir().unwrap();
    let engine = Engine::new(config(&work.path().join("state"))).unwrap();
    let destination = work.path().join("movie.ts");
    let outcomes = engine.run(vec![Job::new(format!("{}/movie.ts", server.uri()), destination.clone())], None).await;

    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result.as_ref().err());
    let on_disk = tokio::fs::read(&destination).await.unwrap();
    assert_eq!(on_disk, body);
}

#[tokio::test]
async fn token_refresh_on_458_then_succeeds() {
    let server = MockServer::start().await;
    let body = vec![9u8; 128];

    Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(458))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .and(wiremock::matchers::query_param("play_token", "fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/player_api.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "fresh-token"})))
        .mount(&server)
        .await;

    let work = tempfile::tempdir().unwrap();
    let engine = Engine::new(config(&work.path().join("state"))).unwrap();
    let destination = work.path().join("stream.ts");
    let url = format!("{}/stream?mac=00:1A:2B&stream=7&type=live", server.uri());
    let outcomes = engine.run(vec![Job::new(url, destination.clone())], None).await;

    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result.as_ref().err());
    let on_disk = tokio::fs::read(&destination).await.unwrap();
    assert_eq!(on_disk, body);
}

#[tokio::test]
async fn resume_picks_up_from_saved_chunk_progress() {
    let server = MockServer::start().await;
    let total = 400usize;
    let body: Vec<u8> = (0..total).map(|i| (i % 200) as u8).collect();

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).insert_header("accept-ranges", "bytes").insert_header(
            "content-length",
            total.to_string().as_str(),
        ))
        .mount(&server)
        .await;
    // file_size 400 < 1 MiB, so plan_chunks collapses to a single full-range chunk.
    Mock::given(method("GET"))
        .and(path("/partial.ts"))
        .and(header("Range", "bytes=100-399"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(body[100..].to_vec()))
        .mount(&server)
        .await;

    let work = tempfile::tempdir().unwrap();
    let state_dir = work.path().join("state");
    let destination = work.path().join("partial.ts");
    let url = format!("{}/partial.ts", server.uri());

    let part0 = {
        let mut os = destination.as_os_str().to_owned();
        os.push(".part0");
        PathBuf::from(os)
    };
    tokio::fs::write(&part0, &body[..100]).await.unwrap();

    let store = stream_fetch::state_store::StateStore::new(&state_dir);
    let mut downloaded = HashMap::new();
    downloaded.insert(0, 100u64);
    let record = stream_fetch::StateRecord::new(&destination, &url, total as u64, vec![(0, Some(399))], downloaded);
    store.save(&record).unwrap();

    let engine = Engine::new(config(&state_dir)).unwrap();
    let outcomes = engine.run(vec![Job::new(url, destination.clone())], None).await;

    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result.as_ref().err());
    let on_disk = tokio::fs::read(&destination).await.unwrap();
    assert_eq!(on_disk, body);
}

#[tokio::test]
async fn rate_limit_stretches_wall_clock_time() {
    let server = MockServer::start().await;
    let body = vec![1u8; 64 * 1024];

    Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone())).mount(&server).await;

    let work = tempfile::tempdir().unwrap();
    let mut cfg = config(&work.path().join("state"));
    cfg.max_speed_limit_bytes_per_second = Some(16 * 1024);
    let engine = Engine::new(cfg).unwrap();
    let destination = work.path().join("throttled.ts");

    let start = std::time::Instant::now();
    let outcomes = engine.run(vec![Job::new(format!("{}/t.ts", server.uri()), destination.clone())], None).await;
    let elapsed = start.elapsed();

    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result.as_ref().err());
    assert!(elapsed >= std::time::Duration::from_secs(2), "expected throttling to slow the transfer, took {elapsed:?}");
}
