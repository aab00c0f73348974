use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, head},
};
use chunkread::config::{CacheConfig, NavigatorConfig, RacerConfig};
use chunkread::{CachedFetcher, HttpTransport, Navigator, OriginRacer, SparseCache};
use tempfile::TempDir;

const BOOK_PATH: &str = "1/3/4/1342/1342-0.txt";
const ETAG: &str = "\"book-v1\"";

#[derive(Clone)]
struct AppState {
    book: Arc<Vec<u8>>,
    mirror_list: Arc<String>,
    gets: Arc<AtomicUsize>,
    heads: Arc<AtomicUsize>,
}

async fn handle_head(Path(path): Path<String>, State(state): State<AppState>) -> Response {
    if path != BOOK_PATH {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.heads.fetch_add(1, Ordering::SeqCst);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&state.book.len().to_string()).unwrap(),
    );
    headers.insert(header::ETAG, HeaderValue::from_static(ETAG));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    (StatusCode::OK, headers).into_response()
}

async fn handle_get(
    Path(path): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if path != BOOK_PATH {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.gets.fetch_add(1, Ordering::SeqCst);

    let total = state.book.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range(value, total));
    let Some((start, end)) = range else {
        return (StatusCode::OK, Bytes::copy_from_slice(&state.book)).into_response();
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total)).unwrap(),
    );
    response_headers.insert(header::ETAG, HeaderValue::from_static(ETAG));
    (
        StatusCode::PARTIAL_CONTENT,
        response_headers,
        Bytes::copy_from_slice(&state.book[start..=end]),
    )
        .into_response()
}

async fn handle_mirror_list(State(state): State<AppState>) -> String {
    state.mirror_list.as_str().to_string()
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let value = value.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    let end = end.min(total.checked_sub(1)?);
    (start <= end).then_some((start, end))
}

fn book_text(words: usize) -> String {
    let mut text = String::new();
    for i in 0..words {
        text.push_str(&format!("word{}", i));
        text.push(if i % 12 == 11 { '\n' } else { ' ' });
    }
    text
}

struct TestMirror {
    base_url: String,
    state: AppState,
}

/// Serve the book and a mirror list naming an unreachable mirror plus this one
async fn start_mirror(book: &str) -> TestMirror {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}/", listener.local_addr().unwrap());
    let mirror_list = format!(
        "| continent | nation | location | provider | url | note |\n\
         |-----------|--------|----------|----------|-----|------|\n\
         | Nowhere | Void | Gone | dead | http://127.0.0.1:9/ | |\n\
         | Europe | Local | Loopback | test | {} | |\n",
        base_url
    );
    let state = AppState {
        book: Arc::new(book.as_bytes().to_vec()),
        mirror_list: Arc::new(mirror_list),
        gets: Arc::new(AtomicUsize::new(0)),
        heads: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/MIRRORS.ALL", get(handle_mirror_list))
        .route("/{*path}", head(handle_head).get(handle_get))
        .with_state(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestMirror { base_url, state }
}

fn racer_config(mirror: &TestMirror, dir: &TempDir) -> RacerConfig {
    RacerConfig {
        mirror_list_url: format!("{}MIRRORS.ALL", mirror.base_url),
        default_origin: mirror.base_url.clone(),
        mirror_list_cache: Some(dir.path().join("mirrors.txt")),
        race_timeout_ms: 2000,
        sticky_timeout_ms: 2000,
        ..Default::default()
    }
}

fn cache_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        dir: PathBuf::from(dir.path()),
        block_size: 256,
        max_coalesce_gap: 512,
        ..Default::default()
    }
}

fn navigator_config() -> NavigatorConfig {
    NavigatorConfig {
        chunk_size: 20,
        prefetch: false,
        ..Default::default()
    }
}

async fn open_book(
    mirror: &TestMirror,
    dir: &TempDir,
) -> (Arc<OriginRacer>, Arc<SparseCache>, Navigator<CachedFetcher>) {
    let transport = Arc::new(HttpTransport::new().unwrap());
    let racer = Arc::new(OriginRacer::new(transport, racer_config(mirror, dir)));
    let cache = Arc::new(SparseCache::new(racer.clone(), cache_config(dir)));
    let fetcher = Arc::new(CachedFetcher::new("1342", cache.clone(), Default::default()));
    let navigator = Navigator::for_source(fetcher, "1342", navigator_config())
        .await
        .unwrap();
    (racer, cache, navigator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_book_through_mirrors_and_cache() {
    let book = book_text(3000);
    let mirror = start_mirror(&book).await;
    let dir = tempfile::tempdir().unwrap();
    let (racer, cache, mut navigator) = open_book(&mirror, &dir).await;

    let first = navigator.go_to_percent(0.0).await.unwrap();
    assert_eq!(first.words[0], "word0");
    assert_eq!(first.actual_count, 20);

    let mut walked = vec![first.clone()];
    for _ in 0..5 {
        walked.push(navigator.move_forward().await.unwrap().unwrap());
    }
    let expected: Vec<String> = (0..120).map(|i| format!("word{}", i)).collect();
    let read: Vec<String> = walked.iter().flat_map(|p| p.words.clone()).collect();
    assert_eq!(read, expected);

    walked.pop();
    while let Some(previous) = walked.pop() {
        let back = navigator.move_backward().await.unwrap().unwrap();
        assert_eq!(back.byte_start, previous.byte_start);
        assert_eq!(back.words, previous.words);
    }

    let status = racer.status();
    assert!(status.initialized);
    assert_eq!(status.mirror_count, 2);
    assert_eq!(status.sticky_count, 1);
    assert_eq!(
        racer.sticky_mirror("1342").map(|m| m.base_url),
        Some(mirror.base_url.clone())
    );

    let coverage = cache.book_stats("1342").await.unwrap().unwrap();
    assert!(coverage.cached_blocks > 0);
    assert!(coverage.cached_blocks < coverage.total_blocks);

    // The downloaded list was kept for offline fallback
    let saved = std::fs::read_to_string(dir.path().join("mirrors.txt")).unwrap();
    assert!(saved.contains(&mirror.base_url));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reopened_cache_serves_without_network() {
    let book = book_text(2000);
    let mirror = start_mirror(&book).await;
    let dir = tempfile::tempdir().unwrap();

    {
        let (_, _, mut navigator) = open_book(&mirror, &dir).await;
        navigator.go_to_percent(40.0).await.unwrap();
        navigator.move_forward().await.unwrap().unwrap();
    }
    let gets = mirror.state.gets.load(Ordering::SeqCst);
    let heads = mirror.state.heads.load(Ordering::SeqCst);

    let (_, cache, mut navigator) = open_book(&mirror, &dir).await;
    let position = navigator.go_to_percent(40.0).await.unwrap();
    navigator.move_forward().await.unwrap().unwrap();
    assert_eq!(position.actual_count, 20);
    assert_eq!(mirror.state.gets.load(Ordering::SeqCst), gets);
    assert_eq!(mirror.state.heads.load(Ordering::SeqCst), heads);

    let stats = cache.stats();
    assert_eq!(stats.bytes_from_network, 0);
    assert!(stats.bytes_from_disk > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validation_against_live_origin() {
    let book = book_text(500);
    let mirror = start_mirror(&book).await;
    let dir = tempfile::tempdir().unwrap();
    let (_, cache, mut navigator) = open_book(&mirror, &dir).await;
    navigator.go_to_percent(0.0).await.unwrap();

    assert!(cache.force_validation("1342").await.unwrap());
    let file_size = cache.get_file_size("1342").await.unwrap();
    assert_eq!(file_size, book.len() as u64);

    cache.invalidate("1342").await.unwrap();
    assert!(cache.book_stats("1342").await.unwrap().is_none());
    assert!(!dir.path().join("1342.txt").exists());
}
