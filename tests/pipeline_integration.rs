//! End-to-end pipeline runs against a local mock of every upstream: an RSS
//! feed, HTML pages (one missing, one flaky), a rate-limited search API and
//! a classifier endpoint that rejects credentials.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use regwatch::analyzer::Analyzer;
use regwatch::backfill::backfill_risk_and_jurisdiction;
use regwatch::config::Config;
use regwatch::crawl::{HttpCrawler, SourceCrawler};
use regwatch::laws::sync_laws_from_events;
use regwatch::pipeline::Pipeline;
use regwatch::{db, migrate};

struct Mock {
    base: String,
    classify: AtomicUsize,
    missing: AtomicUsize,
    flaky: AtomicUsize,
    search: AtomicUsize,
}

async fn feed(State(mock): State<Arc<Mock>>) -> Response {
    let body = format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Senate news</title>
<item>
  <title>Kids Online Safety Act advances in Senate committee</title>
  <link>{base}/news/KOSA-Update</link>
  <description>The bill would require social media platforms to protect minors under 17.</description>
  <pubDate>Tue, 01 Oct 2024 10:00:00 GMT</pubDate>
</item>
<item>
  <title>Kids Online Safety Act advances in Senate committee</title>
  <link>{base}/news/kosa-update</link>
  <description>Duplicate entry with a differently cased link.</description>
</item>
</channel></rss>"#,
        base = mock.base
    );
    ([(header::CONTENT_TYPE, "application/rss+xml")], body).into_response()
}

async fn missing(State(mock): State<Arc<Mock>>) -> Response {
    mock.missing.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, "not here").into_response()
}

async fn flaky(State(mock): State<Arc<Mock>>) -> Response {
    if mock.flaky.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response();
    }
    let para = "Ofcom has published codes requiring social media services to use highly effective age checks to protect children from harmful content. ".repeat(3);
    let body = format!(
        "<html><head><title>Ofcom sets out age checks for social media</title></head>\
         <body><main><h1>Age checks</h1><p>{}</p></main></body></html>",
        para
    );
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
}

async fn search(State(mock): State<Arc<Mock>>) -> Response {
    if mock.search.fetch_add(1, Ordering::SeqCst) == 0 {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
            "slow down",
        )
            .into_response();
    }
    let body = serde_json::json!({
        "data": [{
            "id": "1001",
            "text": "Utah passes social media age verification law for teens",
            "author_id": "7",
            "created_at": "2024-10-02T12:00:00Z"
        }],
        "includes": {"users": [{"id": "7", "name": "Policy Desk", "username": "policydesk"}]}
    });
    axum::Json(body).into_response()
}

async fn classify(State(mock): State<Arc<Mock>>) -> Response {
    mock.classify.fetch_add(1, Ordering::SeqCst);
    (StatusCode::UNAUTHORIZED, "invalid api key").into_response()
}

async fn start_mock() -> Arc<Mock> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mock = Arc::new(Mock {
        base: format!("http://{}", addr),
        classify: AtomicUsize::new(0),
        missing: AtomicUsize::new(0),
        flaky: AtomicUsize::new(0),
        search: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/feed.xml", get(feed))
        .route("/missing", get(missing))
        .route("/flaky", get(flaky))
        .route("/search", get(search))
        .route("/classify", post(classify))
        .with_state(Arc::clone(&mock));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    mock
}

fn test_config(tmp: &TempDir, base: &str) -> Config {
    let content = format!(
        r#"
[db]
path = "{db}"

[crawl]
timeout_secs = 5
max_attempts = 3
backoff_step_ms = 10

[analysis]
provider = "openai"
model = "test-model"
endpoint = "{base}/classify"
concurrency = 1
max_attempts = 3
backoff_step_ms = 10

[search_api]
base_url = "{base}/search"
base_backoff_ms = 10
max_backoff_ms = 100
max_server_wait_secs = 2
inter_query_delay_ms = 0

[[sources]]
id = "senate-feed"
name = "Senate news"
url = "{base}/feed.xml"
type = "rss"
jurisdiction_country = "United States"
reliability_tier = 4

[[sources]]
id = "gone-page"
name = "Gone page"
url = "{base}/missing"
type = "html"
jurisdiction_country = "United Kingdom"

[[sources]]
id = "ofcom-page"
name = "Ofcom"
url = "{base}/flaky"
type = "html"
jurisdiction_country = "United Kingdom"
reliability_tier = 5

[[sources]]
id = "x-age-checks"
name = "Age check chatter"
url = "https://x.com/search"
type = "search_api"
jurisdiction_country = "United States"
reliability_tier = 2
search_query = "social media age verification"
"#,
        db = tmp.path().join("regwatch.sqlite").display(),
        base = base
    );
    let mut config: Config = toml::from_str(&content).unwrap();
    regwatch::config::validate(&config).unwrap();
    config.analysis.api_key = Some("bad-key".into());
    config.search_api.token = Some("token".into());
    config
}

async fn build_pipeline(config: &Config) -> Pipeline {
    let pool = db::connect(config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let crawler: Arc<dyn SourceCrawler> = Arc::new(HttpCrawler::new(config).unwrap());
    let analyzer = Arc::new(Analyzer::new(&config.analysis).unwrap());
    Pipeline::new(config.clone(), pool, crawler, analyzer)
}

async fn event_count(config: &Config) -> i64 {
    let pool = db::connect(config).await.unwrap();
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM regulation_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    pool.close().await;
    count
}

#[tokio::test]
async fn test_full_run_against_mock_upstreams() {
    let mock = start_mock().await;
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, &mock.base);
    let pipeline = build_pipeline(&config).await;

    let result = pipeline.run(None).await.unwrap();

    assert_eq!(result.sources_processed, 4);
    // Feed links differing only in case collapse to one item.
    assert_eq!(result.items_crawled, 3);
    assert_eq!(result.items_analyzed, 3);
    assert_eq!(result.items_saved, 3);
    assert_eq!(result.errors.len(), 1, "{:?}", result.errors);
    assert!(result.errors[0].contains("gone-page"));
    assert!(result.completed_at >= result.started_at);

    // 404 is not retried, 503 is.
    assert_eq!(mock.missing.load(Ordering::SeqCst), 1);
    assert_eq!(mock.flaky.load(Ordering::SeqCst), 2);
    // 429 with Retry-After is retried.
    assert_eq!(mock.search.load(Ordering::SeqCst), 2);
    // The 401 latched the classifier after one call.
    assert_eq!(mock.classify.load(Ordering::SeqCst), 1);
    assert!(pipeline.analyzer().auth_latched());

    assert_eq!(event_count(&config).await, 3);
}

#[tokio::test]
async fn test_rerun_updates_in_place() {
    let mock = start_mock().await;
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, &mock.base);

    let first = build_pipeline(&config).await;
    first.run(None).await.unwrap();
    let second = build_pipeline(&config).await;
    let ids = vec!["senate-feed".to_string()];
    let result = second.run(Some(&ids)).await.unwrap();

    assert_eq!(result.sources_processed, 1);
    assert_eq!(result.items_saved, 1);
    assert_eq!(event_count(&config).await, 3);

    let pool = db::connect(&config).await.unwrap();
    let status: String = sqlx::query_scalar(
        "SELECT status FROM regulation_events WHERE source_id = 'senate-feed'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "unchanged");
}

#[tokio::test]
async fn test_batch_jobs_after_run() {
    let mock = start_mock().await;
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, &mock.base);
    build_pipeline(&config).await.run(None).await.unwrap();

    let pool = db::connect(&config).await.unwrap();

    // Every saved event was linked inline, so a sync creates nothing new.
    let laws_before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM laws")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(laws_before >= 1);
    let sync = sync_laws_from_events(&pool).await.unwrap();
    assert_eq!(sync.scanned, 3);
    assert_eq!(sync.linked_events, 3);
    assert_eq!(sync.inserted_laws, 0);

    let backfill = backfill_risk_and_jurisdiction(&pool, &config.sources)
        .await
        .unwrap();
    assert_eq!(backfill.scanned, 3);
    assert_eq!(backfill.unknown_after, 0);
    let again = backfill_risk_and_jurisdiction(&pool, &config.sources)
        .await
        .unwrap();
    assert_eq!(again.updated, 0);
}
