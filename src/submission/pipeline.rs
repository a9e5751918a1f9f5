//! Artifact submission pipeline
//!
//! ```text
//! validate assets → check authorization → send → classify reply
//!        ↓                   ↓              ↓
//!   ValidationError     Unauthorized   Network / Server / Aborted
//! ```
//!
//! At most one submission is in flight. A new `send` supersedes the previous
//! one: the older call resolves to `Aborted` and its request future is
//! dropped. Cancelling the pipeline's context aborts whatever is in flight.
//! Callers that run the send on another task register it with `begin` first,
//! so an abort issued in between is never lost.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::http::{BackendReply, GenerationBackend};
use super::types::{ErrorResponse, KitResponse, Platform, SubmissionRequest, SubmissionResult};
use crate::auth::Authorization;
use crate::error::SubmissionError;
use crate::media::{MediaAsset, MediaKind};

/// Check that both assets are present and of the right kind, and build the
/// request. Performs no I/O.
pub fn validate(
    image: Option<&MediaAsset>,
    audio: Option<&MediaAsset>,
    platform: Option<Platform>,
) -> Result<SubmissionRequest, SubmissionError> {
    let image = require(image, MediaKind::Image, "Please provide an image")?;
    let audio = require(audio, MediaKind::Audio, "Please provide an audio story")?;

    Ok(SubmissionRequest {
        image: image.clone(),
        audio: audio.clone(),
        platform: platform.unwrap_or_default(),
    })
}

fn require<'a>(
    asset: Option<&'a MediaAsset>,
    kind: MediaKind,
    missing: &str,
) -> Result<&'a MediaAsset, SubmissionError> {
    let asset = asset.ok_or_else(|| SubmissionError::Validation(missing.to_string()))?;
    if asset.kind() != kind {
        return Err(SubmissionError::Validation(format!(
            "Expected an {} asset, got {}",
            kind,
            asset.kind()
        )));
    }
    if asset.is_empty() {
        return Err(SubmissionError::Validation(format!("The {} is empty", kind)));
    }
    Ok(asset)
}

pub fn authorize(auth: Option<&Authorization>) -> Result<&Authorization, SubmissionError> {
    auth.ok_or_else(|| {
        SubmissionError::Unauthorized("Sign in to generate a marketing kit".to_string())
    })
}

/// Map a backend reply onto the error taxonomy.
pub fn classify_reply(reply: BackendReply) -> SubmissionResult {
    if (200..300).contains(&reply.status) {
        return serde_json::from_str::<KitResponse>(&reply.body)
            .map_err(|e| SubmissionError::Server {
                status: None,
                message: format!("Unexpected response from server: {}", e),
            })?
            .into_kit();
    }

    let message = match serde_json::from_str::<ErrorResponse>(&reply.body) {
        Ok(parsed) => parsed.error,
        Err(_) if !reply.body.trim().is_empty() => reply.body.trim().to_string(),
        Err(_) => format!("HTTP error! status: {}", reply.status),
    };

    log::error!("Backend error ({}): {}", reply.status, message);

    Err(SubmissionError::Server {
        status: Some(reply.status),
        message,
    })
}

struct InFlight {
    id: Uuid,
    token: CancellationToken,
}

pub struct SubmissionPipeline {
    backend: Arc<dyn GenerationBackend>,
    context: CancellationToken,
    in_flight: Mutex<Option<InFlight>>,
}

impl SubmissionPipeline {
    pub fn new(backend: Arc<dyn GenerationBackend>, context: CancellationToken) -> Self {
        Self {
            backend,
            context,
            in_flight: Mutex::new(None),
        }
    }

    /// Validate, authorize and send in one call.
    pub async fn submit(
        &self,
        image: Option<&MediaAsset>,
        audio: Option<&MediaAsset>,
        platform: Option<Platform>,
        auth: Option<&Authorization>,
    ) -> SubmissionResult {
        let request = validate(image, audio, platform)?;
        let auth = authorize(auth)?;
        self.send(Uuid::new_v4(), request, auth).await
    }

    /// Send an already validated request under the given submission id.
    pub async fn send(
        &self,
        id: Uuid,
        request: SubmissionRequest,
        auth: &Authorization,
    ) -> SubmissionResult {
        let token = self.begin(id);
        self.run(id, token, request, auth).await
    }

    /// Claim the in-flight slot for `id` and cancel whoever held it.
    ///
    /// Registration is synchronous so that an `abort(id)` issued right after
    /// it always finds the submission, even before `run` is polled.
    pub fn begin(&self, id: Uuid) -> CancellationToken {
        let token = self.context.child_token();
        let prior = self.slot().replace(InFlight {
            id,
            token: token.clone(),
        });
        if let Some(prior) = prior {
            log::info!("Submission {} superseded by {}", prior.id, id);
            prior.token.cancel();
        }
        token
    }

    /// Perform a submission registered with `begin`. The backend is never
    /// called when `token` is already cancelled.
    pub async fn run(
        &self,
        id: Uuid,
        token: CancellationToken,
        request: SubmissionRequest,
        auth: &Authorization,
    ) -> SubmissionResult {
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let reason = if self.context.is_cancelled() {
                    "context closed"
                } else {
                    "cancelled"
                };
                Err(SubmissionError::Aborted(reason.to_string()))
            }
            reply = self.backend.generate(&request, auth) => reply.and_then(classify_reply),
        };

        {
            let mut slot = self.slot();
            if slot.as_ref().is_some_and(|f| f.id == id) {
                *slot = None;
            }
        }

        match &outcome {
            Ok(kit) => log::info!(
                "Submission {} succeeded in {:?}: {}",
                id,
                started.elapsed(),
                kit.title
            ),
            Err(e) if e.is_aborted() => log::info!("Submission {} aborted: {}", id, e.message()),
            Err(e) => log::warn!("Submission {} failed ({}): {}", id, e.kind(), e.message()),
        }

        outcome
    }

    /// Abort the submission with this id, if it is the one in flight.
    pub fn abort(&self, id: Uuid) -> bool {
        let slot = self.slot();
        match slot.as_ref() {
            Some(f) if f.id == id => {
                f.token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }

    // Never held across an await, so a poisoned lock still holds a valid slot
    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Abort anything in flight and refuse further sends.
    pub fn close(&self) {
        self.context.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::media::Provenance;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedBackend {
        calls: AtomicUsize,
        reply: BackendReply,
        delay: Option<Duration>,
    }

    impl ScriptedBackend {
        fn replying(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: BackendReply {
                    status,
                    body: body.to_string(),
                },
                delay: None,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: BackendReply {
                    status: 200,
                    body: String::new(),
                },
                delay: Some(Duration::from_secs(3600)),
            })
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(
            &self,
            _request: &SubmissionRequest,
            _auth: &Authorization,
        ) -> Result<BackendReply, SubmissionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.reply.clone())
        }
    }

    fn image() -> MediaAsset {
        MediaAsset::new(
            MediaKind::Image,
            vec![0xFF, 0xD8, 0xFF],
            "image/jpeg",
            Some("pot.jpg".to_string()),
            Provenance::Uploaded,
        )
    }

    fn audio() -> MediaAsset {
        MediaAsset::new(
            MediaKind::Audio,
            vec![b'R', b'I', b'F', b'F'],
            "audio/wav",
            None,
            Provenance::Recorded,
        )
    }

    fn auth() -> Authorization {
        Authorization::bearer("token").unwrap()
    }

    const KIT: &str = r##"{"productTitle":"T","productDescription":"D","productHighlights":"H","post":"P","hashtags":"#x"}"##;

    #[tokio::test]
    async fn missing_assets_fail_validation_without_io() {
        let backend = ScriptedBackend::replying(200, KIT);
        let pipeline = SubmissionPipeline::new(backend.clone(), CancellationToken::new());
        let auth = auth();

        let err = pipeline
            .submit(None, Some(&audio()), Some(Platform::Instagram), Some(&auth))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let err = pipeline
            .submit(Some(&image()), None, Some(Platform::Instagram), Some(&auth))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn swapped_kinds_fail_validation() {
        let err = validate(Some(&audio()), Some(&image()), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn missing_authorization_blocks_before_io() {
        let backend = ScriptedBackend::replying(200, KIT);
        let pipeline = SubmissionPipeline::new(backend.clone(), CancellationToken::new());

        let err = pipeline
            .submit(Some(&image()), Some(&audio()), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn platform_defaults_to_instagram() {
        let request = validate(Some(&image()), Some(&audio()), None).unwrap();
        assert_eq!(request.platform(), Platform::Instagram);
    }

    #[tokio::test]
    async fn success_reproduces_fields() {
        let backend = ScriptedBackend::replying(200, KIT);
        let pipeline = SubmissionPipeline::new(backend.clone(), CancellationToken::new());

        let kit = pipeline
            .submit(
                Some(&image()),
                Some(&audio()),
                Some(Platform::Instagram),
                Some(&auth()),
            )
            .await
            .unwrap();

        assert_eq!(kit.title, "T");
        assert_eq!(kit.description, "D");
        assert_eq!(kit.highlights, "H");
        assert_eq!(kit.post, "P");
        assert_eq!(kit.hashtags, "#x");
        assert!(kit.generated_image.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(!pipeline.is_busy());
    }

    #[test]
    fn server_error_uses_error_field() {
        let err = classify_reply(BackendReply {
            status: 500,
            body: r#"{"error":"boom"}"#.to_string(),
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn error_without_json_body_falls_back() {
        let err = classify_reply(BackendReply {
            status: 502,
            body: "Bad Gateway".to_string(),
        })
        .unwrap_err();
        assert_eq!(err.message(), "Bad Gateway");

        let err = classify_reply(BackendReply {
            status: 503,
            body: String::new(),
        })
        .unwrap_err();
        assert_eq!(err.message(), "HTTP error! status: 503");
    }

    #[test]
    fn malformed_success_body_is_server_error() {
        let err = classify_reply(BackendReply {
            status: 200,
            body: r#"{"productTitle":"T"}"#.to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, SubmissionError::Server { status: None, .. }));
    }

    #[tokio::test]
    async fn closing_context_aborts_in_flight_request() {
        let backend = ScriptedBackend::hanging();
        let pipeline = Arc::new(SubmissionPipeline::new(
            backend.clone(),
            CancellationToken::new(),
        ));

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .submit(Some(&image()), Some(&audio()), None, Some(&auth()))
                    .await
            })
        };

        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        pipeline.close();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(err.kind(), ErrorKind::NetworkError);

        // Closed pipelines do not start new requests
        let err = pipeline
            .submit(Some(&image()), Some(&audio()), None, Some(&auth()))
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_send_supersedes_prior() {
        let backend = ScriptedBackend::hanging();
        let pipeline = Arc::new(SubmissionPipeline::new(
            backend.clone(),
            CancellationToken::new(),
        ));
        let request = validate(Some(&image()), Some(&audio()), None).unwrap();

        let first_id = Uuid::new_v4();
        let first = {
            let pipeline = pipeline.clone();
            let request = request.clone();
            tokio::spawn(async move { pipeline.send(first_id, request, &auth()).await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second_id = Uuid::new_v4();
        let second = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.send(second_id, request, &auth()).await })
        };

        let err = first.await.unwrap().unwrap_err();
        assert!(err.is_aborted());

        // The second call now owns the slot
        assert!(!pipeline.abort(first_id));
        assert!(pipeline.abort(second_id));
        assert!(second.await.unwrap().unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn abort_right_after_begin_skips_the_backend() {
        let backend = ScriptedBackend::replying(200, KIT);
        let pipeline = SubmissionPipeline::new(backend.clone(), CancellationToken::new());
        let request = validate(Some(&image()), Some(&audio()), None).unwrap();

        let id = Uuid::new_v4();
        let token = pipeline.begin(id);
        assert!(pipeline.is_busy());
        assert!(pipeline.abort(id));

        let err = pipeline.run(id, token, request, &auth()).await.unwrap_err();
        assert_eq!(err, SubmissionError::Aborted("cancelled".to_string()));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn begin_on_a_closed_pipeline_aborts_without_io() {
        let backend = ScriptedBackend::replying(200, KIT);
        let context = CancellationToken::new();
        let pipeline = SubmissionPipeline::new(backend.clone(), context.clone());
        let request = validate(Some(&image()), Some(&audio()), None).unwrap();
        context.cancel();

        let id = Uuid::new_v4();
        let token = pipeline.begin(id);
        let err = pipeline.run(id, token, request, &auth()).await.unwrap_err();
        assert_eq!(err, SubmissionError::Aborted("context closed".to_string()));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
