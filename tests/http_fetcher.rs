use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use almanac::domain::{AuthConfig, SourceConfig, SourceKind, Validators};
use almanac::fetcher::{FetchConfig, FetchError, FetchErrorKind, Fetcher, HttpFetcher};

const CALENDAR: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:1\r\nDTSTART:20240101T090000Z\r\nSUMMARY:Standup\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

#[derive(Clone, Default)]
struct Hits(Arc<AtomicUsize>);

async fn calendar(State(hits): State<Hits>, headers: HeaderMap) -> Response {
    hits.0.fetch_add(1, Ordering::SeqCst);
    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        == Some("\"v1\"");
    if matches {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    (
        [
            (header::ETAG, "\"v1\""),
            (header::LAST_MODIFIED, "Mon, 01 Jan 2024 00:00:00 GMT"),
        ],
        CALENDAR,
    )
        .into_response()
}

async fn oversized() -> Response {
    vec![b'x'; 4096].into_response()
}

async fn oversized_stream() -> Response {
    let chunks = (0..8).map(|_| Ok::<_, std::io::Error>(vec![b'x'; 512]));
    Body::from_stream(futures::stream::iter(chunks)).into_response()
}

async fn private(headers: HeaderMap) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer secret");
    if authorized {
        CALENDAR.into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn slow() -> Response {
    tokio::time::sleep(Duration::from_secs(5)).await;
    CALENDAR.into_response()
}

async fn unavailable() -> Response {
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

async fn serve(hits: Hits) -> String {
    let app = Router::new()
        .route("/cal.ics", get(calendar))
        .route("/big.ics", get(oversized))
        .route("/stream.ics", get(oversized_stream))
        .route("/private.ics", get(private))
        .route("/slow.ics", get(slow))
        .route("/down.ics", get(unavailable))
        .with_state(hits);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(FetchConfig {
        max_body_bytes: 1024,
        ..FetchConfig::default()
    })
    .unwrap()
}

fn source(base: &str, path: &str) -> SourceConfig {
    SourceConfig::new(
        "test",
        SourceKind::Ics {
            url: format!("{base}{path}"),
        },
    )
}

#[tokio::test]
async fn test_conditional_fetch_returns_unchanged() {
    let hits = Hits::default();
    let base = serve(hits.clone()).await;
    let fetcher = fetcher();
    let src = source(&base, "/cal.ics");

    let first = fetcher.fetch(&src, &Validators::default()).await.unwrap();
    assert!(!first.is_unchanged());
    assert_eq!(first.bytes(), Some(CALENDAR.as_bytes()));
    assert_eq!(first.etag.as_deref(), Some("\"v1\""));

    let second = fetcher.fetch(&src, &first.validators()).await.unwrap();
    assert!(second.is_unchanged());
    assert_eq!(second.content_hash, first.content_hash);
    assert_eq!(hits.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_validators_without_committed_hash_are_not_sent() {
    let base = serve(Hits::default()).await;
    let previous = Validators {
        etag: Some("\"v1\"".into()),
        last_modified: None,
        content_hash: None,
    };
    let payload = fetcher()
        .fetch(&source(&base, "/cal.ics"), &previous)
        .await
        .unwrap();
    assert!(!payload.is_unchanged());
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let base = serve(Hits::default()).await;
    let fetcher = fetcher();

    let err = fetcher
        .fetch(&source(&base, "/big.ics"), &Validators::default())
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::TooLarge { limit: 1024 });

    let err = fetcher
        .fetch(&source(&base, "/stream.ics"), &Validators::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::TooLarge);
}

#[tokio::test]
async fn test_auth_failure_and_bearer_token() {
    let base = serve(Hits::default()).await;
    let fetcher = fetcher();
    let mut src = source(&base, "/private.ics");

    let err = fetcher.fetch(&src, &Validators::default()).await.unwrap_err();
    assert_eq!(err, FetchError::AuthFailure { status: 401 });
    assert!(!err.is_retryable());

    src.auth = AuthConfig::Bearer {
        token: "secret".into(),
    };
    let payload = fetcher.fetch(&src, &Validators::default()).await.unwrap();
    assert_eq!(payload.bytes(), Some(CALENDAR.as_bytes()));
}

#[tokio::test]
async fn test_deadline_reports_timeout() {
    let base = serve(Hits::default()).await;
    let mut src = source(&base, "/slow.ics");
    src.fetch_timeout = Some(Duration::from_millis(200));

    let err = fetcher().fetch(&src, &Validators::default()).await.unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::Timeout);
    assert_eq!(err.to_string(), "timeout");
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let base = serve(Hits::default()).await;
    let err = fetcher()
        .fetch(&source(&base, "/down.ics"), &Validators::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FetchErrorKind::Transient);
    assert!(err.is_retryable());
}
