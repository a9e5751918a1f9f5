//! Integration tests for the submission pipeline over real HTTP.
//!
//! A throwaway server on 127.0.0.1 records the raw request and replies with
//! a canned response, so the multipart encoding and the reply classification
//! are exercised end to end.
//!
//! ```bash
//! cargo test --test submission_integration
//! ```

use std::sync::Arc;
use std::time::Duration;

use kalakriti_kit::auth::Authorization;
use kalakriti_kit::error::{ErrorKind, SubmissionError};
use kalakriti_kit::media::{MediaAsset, MediaKind, Provenance};
use kalakriti_kit::submission::{HttpBackend, Platform, SubmissionPipeline};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// What the stub server saw.
struct CapturedRequest {
    head: String,
    body: String,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            line.to_ascii_lowercase()
                .starts_with(&prefix)
                .then(|| line[prefix.len()..].trim().to_string())
        })
    }
}

/// Serve exactly one request and answer it with `status` and `body`.
async fn serve_once(status: u16, body: &'static str) -> (String, oneshot::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let _ = seen_tx.send(request);

        let response = format!(
            "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
    });

    (url, seen_rx)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> CapturedRequest {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);

        let Some(split) = find(&raw, b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&raw[..split]).to_string();
        let body_len = raw.len() - split - 4;
        let request = CapturedRequest {
            head: head.clone(),
            body: String::new(),
        };

        let done = match request.header("content-length") {
            Some(len) => body_len >= len.parse::<usize>().unwrap(),
            // Chunked: the zero-length chunk ends the body
            None => raw.ends_with(b"0\r\n\r\n"),
        };
        if done {
            return CapturedRequest {
                head,
                body: String::from_utf8_lossy(&raw[split + 4..]).to_string(),
            };
        }
    }

    panic!("connection closed before the request was complete");
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn image() -> MediaAsset {
    MediaAsset::new(
        MediaKind::Image,
        vec![0xFF, 0xD8, 0xFF, 0xE0],
        "image/jpeg",
        Some("craft.jpg".to_string()),
        Provenance::Uploaded,
    )
}

fn audio() -> MediaAsset {
    MediaAsset::new(
        MediaKind::Audio,
        b"RIFF....WAVE".to_vec(),
        "audio/wav",
        None,
        Provenance::Recorded,
    )
}

fn pipeline(url: &str, timeout: Duration) -> SubmissionPipeline {
    let backend = HttpBackend::new(url, timeout).unwrap();
    SubmissionPipeline::new(Arc::new(backend), CancellationToken::new())
}

fn token() -> Authorization {
    Authorization::bearer("tok-123").unwrap()
}

const KIT_BODY: &str = r##"{
    "productTitle": "T",
    "productDescription": "D",
    "productHighlights": "H",
    "post": "P",
    "hashtags": "#x"
}"##;

#[tokio::test]
async fn successful_submission_sends_multipart_and_parses_kit() {
    let (url, seen) = serve_once(200, KIT_BODY).await;
    let pipeline = pipeline(&url, Duration::from_secs(5));

    let kit = pipeline
        .submit(
            Some(&image()),
            Some(&audio()),
            Some(Platform::Linkedin),
            Some(&token()),
        )
        .await
        .unwrap();

    assert_eq!(kit.title, "T");
    assert_eq!(kit.description, "D");
    assert_eq!(kit.highlights, "H");
    assert_eq!(kit.post, "P");
    assert_eq!(kit.hashtags, "#x");
    assert!(kit.generated_image.is_none());

    let request = seen.await.unwrap();
    assert!(request.head.starts_with("POST /api/generate-kit HTTP/1.1"));
    assert_eq!(request.header("authorization").as_deref(), Some("Bearer tok-123"));
    assert!(request
        .header("content-type")
        .unwrap()
        .starts_with("multipart/form-data; boundary="));

    assert!(request
        .body
        .contains("name=\"image\"; filename=\"craft.jpg\""));
    assert!(request.body.contains("Content-Type: image/jpeg"));
    assert!(request
        .body
        .contains("name=\"audio\"; filename=\"story.wav\""));
    assert!(request.body.contains("Content-Type: audio/wav"));
    assert!(request.body.contains("name=\"platform\"\r\n\r\nlinkedin"));
}

#[tokio::test]
async fn trailing_slash_in_base_url_is_ignored() {
    let (url, seen) = serve_once(200, KIT_BODY).await;
    let pipeline = pipeline(&format!("{}/", url), Duration::from_secs(5));

    pipeline
        .submit(Some(&image()), Some(&audio()), None, Some(&token()))
        .await
        .unwrap();

    let request = seen.await.unwrap();
    assert!(request.head.starts_with("POST /api/generate-kit "));
    assert!(request.body.contains("name=\"platform\"\r\n\r\ninstagram"));
}

#[tokio::test]
async fn server_error_body_becomes_the_message() {
    let (url, _seen) = serve_once(500, r#"{"error":"boom"}"#).await;
    let pipeline = pipeline(&url, Duration::from_secs(5));

    let err = pipeline
        .submit(Some(&image()), Some(&audio()), None, Some(&token()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerError);
    assert_eq!(err.message(), "boom");
    assert_eq!(
        err,
        SubmissionError::Server {
            status: Some(500),
            message: "boom".to_string()
        }
    );
}

#[tokio::test]
async fn unauthorized_status_without_body_reports_status() {
    let (url, _seen) = serve_once(401, "").await;
    let pipeline = pipeline(&url, Duration::from_secs(5));

    let err = pipeline
        .submit(Some(&image()), Some(&audio()), None, Some(&token()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerError);
    assert_eq!(err.message(), "HTTP error! status: 401");
}

#[tokio::test]
async fn non_json_success_body_is_a_server_error() {
    let (url, _seen) = serve_once(200, "<html>proxy page</html>").await;
    let pipeline = pipeline(&url, Duration::from_secs(5));

    let err = pipeline
        .submit(Some(&image()), Some(&audio()), None, Some(&token()))
        .await
        .unwrap_err();

    assert!(matches!(err, SubmissionError::Server { status: None, .. }));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    // Grab a free port, then close it again
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = pipeline(&url, Duration::from_secs(5))
        .submit(Some(&image()), Some(&audio()), None, Some(&token()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NetworkError);
}

#[tokio::test]
async fn silent_server_times_out_as_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Read forever, never answer
        let mut buf = [0u8; 4096];
        while socket.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
    });

    let err = pipeline(&url, Duration::from_millis(300))
        .submit(Some(&image()), Some(&audio()), None, Some(&token()))
        .await
        .unwrap_err();

    assert_eq!(err, SubmissionError::Network("Request timed out".to_string()));
    server.abort();
}

#[tokio::test]
async fn missing_token_never_touches_the_network() {
    // No server at all: an attempted request would fail with NetworkError
    let pipeline = pipeline("http://127.0.0.1:9", Duration::from_secs(5));

    let err = pipeline
        .submit(Some(&image()), Some(&audio()), None, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}
