//! HTTP surface: enroll, recognize, status, records.
//!
//! Thin transport glue over the engine and the store; every outcome the core
//! can produce maps to a structured JSON reply, never a bare fault.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use mien_core::{enroll, CosineMatcher, EnrollOutcome, Matcher, VectorStore};

use crate::engine::{EngineError, EngineHandle, ModelState};

/// Sentinel label reported when the best match is below threshold.
const UNKNOWN_LABEL: &str = "Unknown";

/// Photos arrive as multipart uploads; phone camera JPEGs run a few MiB.
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub store: Arc<VectorStore>,
    pub threshold: f32,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/enroll", post(enroll_face))
        .route("/recognize", post(recognize_face))
        .route("/status", get(status))
        .route("/records", get(records))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "mien API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EnrollParams {
    label: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum EnrollResponse {
    Ok,
    AlreadyRegistered { label: String, score: f32 },
    NoFace,
    ModelNotReady,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum RecognizeResponse {
    Ok { label: String, score: f32 },
    NoFace,
    NoDb,
    ModelNotReady,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct RecordsResponse {
    count: usize,
    labels: Vec<String>,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Pull the `file` part out of the multipart body.
async fn read_photo(multipart: &mut Multipart) -> Result<Option<Vec<u8>>, MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            return Ok(Some(field.bytes().await?.to_vec()));
        }
    }
    Ok(None)
}

/// Run the shared front half of both data endpoints: readiness check,
/// multipart read, embedding extraction. `Err` carries the ready-made reply.
async fn extract_embedding(
    state: &AppState,
    multipart: &mut Multipart,
) -> Result<mien_core::Embedding, ExtractReply> {
    if !matches!(state.engine.state(), ModelState::Ready) {
        return Err(ExtractReply::NotReady);
    }

    let photo = match read_photo(multipart).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return Err(ExtractReply::Error(error_response(
                StatusCode::BAD_REQUEST,
                "missing `file` part",
            )))
        }
        Err(e) => {
            return Err(ExtractReply::Error(error_response(
                StatusCode::BAD_REQUEST,
                e.to_string(),
            )))
        }
    };

    match state.engine.extract(photo).await {
        Ok(embedding) => Ok(embedding),
        Err(EngineError::NoFaceDetected) => Err(ExtractReply::NoFace),
        Err(e @ EngineError::BadImage(_)) => Err(ExtractReply::Error(error_response(
            StatusCode::BAD_REQUEST,
            e.to_string(),
        ))),
        Err(e) => Err(ExtractReply::Error(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        ))),
    }
}

enum ExtractReply {
    NotReady,
    NoFace,
    Error(Response),
}

// ── Handlers ─────────────────────────────────────────────────────────────────

// POST /enroll?label=<s>&force=<bool> — multipart body with a `file` part
async fn enroll_face(
    State(state): State<AppState>,
    Query(params): Query<EnrollParams>,
    mut multipart: Multipart,
) -> Response {
    if params.label.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "label must not be empty");
    }

    let embedding = match extract_embedding(&state, &mut multipart).await {
        Ok(embedding) => embedding,
        Err(ExtractReply::NotReady) => return Json(EnrollResponse::ModelNotReady).into_response(),
        Err(ExtractReply::NoFace) => return Json(EnrollResponse::NoFace).into_response(),
        Err(ExtractReply::Error(response)) => return response,
    };

    match enroll(
        &state.store,
        &CosineMatcher,
        state.threshold,
        &params.label,
        embedding,
        params.force,
    ) {
        Ok(EnrollOutcome::Enrolled) => {
            tracing::info!(label = %params.label, force = params.force, "enrolled new record");
            Json(EnrollResponse::Ok).into_response()
        }
        Ok(EnrollOutcome::AlreadyRegistered { label, score }) => {
            tracing::info!(existing = %label, score, "enrollment refused by duplicate guard");
            Json(EnrollResponse::AlreadyRegistered { label, score }).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// POST /recognize — multipart body with a `file` part
async fn recognize_face(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let embedding = match extract_embedding(&state, &mut multipart).await {
        Ok(embedding) => embedding,
        Err(ExtractReply::NotReady) => return Json(RecognizeResponse::ModelNotReady).into_response(),
        Err(ExtractReply::NoFace) => return Json(RecognizeResponse::NoFace).into_response(),
        Err(ExtractReply::Error(response)) => return response,
    };

    let records = match state.store.load() {
        Ok(records) => records,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    // An empty store is a distinct outcome, reported before any scoring.
    if records.is_empty() {
        return Json(RecognizeResponse::NoDb).into_response();
    }

    let result = CosineMatcher.best_match(&embedding, &records, state.threshold);
    let label = result
        .label
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
    tracing::info!(%label, score = result.score, "recognition complete");

    Json(RecognizeResponse::Ok {
        label,
        score: result.score,
    })
    .into_response()
}

// GET /status
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (status, message) = match state.engine.state() {
        ModelState::Loading => ("loading", None),
        ModelState::Ready => ("ready", None),
        ModelState::Failed(message) => ("error", Some(message)),
    };
    Json(StatusResponse {
        status,
        message,
        version: env!("CARGO_PKG_VERSION"),
    })
}

// GET /records — enrolled labels, one entry per stored record
async fn records(State(state): State<AppState>) -> Response {
    match state.store.load() {
        Ok(records) => {
            let labels = records.iter().map(|r| r.label.clone()).collect();
            Json(RecordsResponse {
                count: records.len(),
                labels,
            })
            .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{spawn, ModelPaths};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mien_core::FaceRecord;
    use tower::ServiceExt;

    fn multipart_body() -> (String, String) {
        let boundary = "mien-test-boundary";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.jpg\"\r\n\r\nnot-an-image\r\n--{boundary}--\r\n"
        );
        (
            format!("multipart/form-data; boundary={boundary}"),
            body,
        )
    }

    /// App over a never-ready engine (bogus model paths) and a temp store.
    async fn test_app(dir: &tempfile::TempDir) -> (Router, Arc<VectorStore>) {
        let handle = spawn(ModelPaths {
            detector: "/nonexistent/det_10g.onnx".into(),
            embedder: "/nonexistent/w600k_r50.onnx".into(),
        });
        // Let the loader thread reach its terminal state.
        while matches!(handle.state(), ModelState::Loading) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let store = Arc::new(VectorStore::open(dir.path().join("faces.json")));
        let app = router(AppState {
            engine: handle,
            store: Arc::clone(&store),
            threshold: mien_core::RECOGNITION_THRESHOLD,
        });
        (app, store)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_enroll_response_wire_format() {
        let json = serde_json::to_value(EnrollResponse::AlreadyRegistered {
            label: "alice".into(),
            score: 0.91,
        })
        .unwrap();
        assert_eq!(json["status"], "already_registered");
        assert_eq!(json["label"], "alice");

        let json = serde_json::to_value(EnrollResponse::Ok).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[test]
    fn test_recognize_response_wire_format() {
        let json = serde_json::to_value(RecognizeResponse::Ok {
            label: UNKNOWN_LABEL.to_string(),
            score: 0.12,
        })
        .unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["label"], "Unknown");

        let json = serde_json::to_value(RecognizeResponse::NoDb).unwrap();
        assert_eq!(json["status"], "no_db");
    }

    #[test]
    fn test_status_response_omits_empty_message() {
        let json = serde_json::to_value(StatusResponse {
            status: "ready",
            message: None,
            version: "0.1.0",
        })
        .unwrap();
        assert_eq!(json["status"], "ready");
        assert!(json.get("message").is_none());
    }

    #[tokio::test]
    async fn test_status_reports_model_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _store) = test_app(&dir).await;

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");
        assert!(json["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_data_endpoints_answer_model_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _store) = test_app(&dir).await;
        let (content_type, body) = multipart_body();

        let response = app
            .clone()
            .oneshot(
                Request::post("/recognize")
                    .header("content-type", &content_type)
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "model_not_ready");

        let response = app
            .oneshot(
                Request::post("/enroll?label=alice")
                    .header("content-type", &content_type)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "model_not_ready");
    }

    #[tokio::test]
    async fn test_enroll_rejects_empty_label() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _store) = test_app(&dir).await;
        let (content_type, body) = multipart_body();

        let response = app
            .oneshot(
                Request::post("/enroll?label=%20")
                    .header("content-type", &content_type)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_records_lists_store_contents() {
        let dir = tempfile::tempdir().unwrap();
        let (app, store) = test_app(&dir).await;
        store
            .append(FaceRecord {
                label: "alice".into(),
                vector: vec![1.0, 0.0],
            })
            .unwrap();
        store
            .append(FaceRecord {
                label: "alice".into(),
                vector: vec![0.9, 0.1],
            })
            .unwrap();

        let response = app
            .oneshot(Request::get("/records").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["count"], 2);
        assert_eq!(json["labels"][0], "alice");
        assert_eq!(json["labels"][1], "alice");
    }
}
