//! Engine thread: owns the ONNX sessions and serves extraction requests.
//!
//! The sessions live on a dedicated OS thread; HTTP handlers talk to it
//! through an mpsc channel with oneshot replies. Model loading happens on
//! that thread after spawn, so the daemon answers `/status` while the models
//! are still coming up.

use mien_core::{Embedding, FaceDetector, FaceEmbedder};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// Lifecycle of the process-wide model state. Readers only ever observe this
/// enum; the sessions themselves never leave the engine thread.
#[derive(Debug, Clone)]
pub enum ModelState {
    Loading,
    Ready,
    Failed(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("could not decode image: {0}")]
    BadImage(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] mien_core::detector::DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] mien_core::embedder::EmbedderError),
    #[error("no face detected in the supplied image")]
    NoFaceDetected,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Paths to the two ONNX models.
pub struct ModelPaths {
    pub detector: String,
    pub embedder: String,
}

enum EngineRequest {
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    state: watch::Receiver<ModelState>,
}

impl EngineHandle {
    /// Current model lifecycle state.
    pub fn state(&self) -> ModelState {
        self.state.borrow().clone()
    }

    /// Decode a photo, detect the first face, and extract its embedding.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Returns immediately. The thread loads both models and publishes
/// Loading → Ready (or Failed) through the handle, then enters the request
/// loop. After a failed load the thread exits; data requests then surface
/// [`EngineError::ChannelClosed`], and callers checking [`ModelState`] first
/// never get that far.
pub fn spawn(paths: ModelPaths) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (state_tx, state_rx) = watch::channel(ModelState::Loading);

    std::thread::Builder::new()
        .name("mien-engine".into())
        .spawn(move || {
            let (mut detector, mut embedder) = match load_models(&paths) {
                Ok(pair) => pair,
                Err(message) => {
                    tracing::error!(%message, "model initialization failed");
                    let _ = state_tx.send(ModelState::Failed(message));
                    return;
                }
            };
            let _ = state_tx.send(ModelState::Ready);
            tracing::info!("engine ready");

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, reply } => {
                        let _ = reply.send(run_extract(&mut detector, &mut embedder, &image));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle {
        tx,
        state: state_rx,
    }
}

fn load_models(paths: &ModelPaths) -> Result<(FaceDetector, FaceEmbedder), String> {
    tracing::info!(
        detector = %paths.detector,
        embedder = %paths.embedder,
        "loading models"
    );
    let detector = FaceDetector::load(&paths.detector).map_err(|e| e.to_string())?;
    let embedder = FaceEmbedder::load(&paths.embedder).map_err(|e| e.to_string())?;
    Ok((detector, embedder))
}

/// Decode → detect → embed the first detected face.
fn run_extract(
    detector: &mut FaceDetector,
    embedder: &mut FaceEmbedder,
    image_bytes: &[u8],
) -> Result<Embedding, EngineError> {
    let photo = image::load_from_memory(image_bytes)?.to_rgb8();

    let faces = detector.detect(&photo)?;
    let Some(face) = faces.first() else {
        return Err(EngineError::NoFaceDetected);
    };
    tracing::debug!(
        faces = faces.len(),
        confidence = face.confidence,
        "detection complete"
    );

    embedder.extract(&photo, face).map_err(EngineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_past_loading(handle: &EngineHandle) -> ModelState {
        let mut state = handle.state.clone();
        loop {
            let current = state.borrow().clone();
            if !matches!(current, ModelState::Loading) {
                return current;
            }
            state
                .changed()
                .await
                .expect("state channel closed while still Loading");
        }
    }

    #[tokio::test]
    async fn test_missing_models_reach_failed_state() {
        let handle = spawn(ModelPaths {
            detector: "/nonexistent/det_10g.onnx".into(),
            embedder: "/nonexistent/w600k_r50.onnx".into(),
        });
        let state = wait_past_loading(&handle).await;
        assert!(matches!(state, ModelState::Failed(_)));
    }

    #[tokio::test]
    async fn test_extract_after_failed_load_reports_channel_closed() {
        let handle = spawn(ModelPaths {
            detector: "/nonexistent/det_10g.onnx".into(),
            embedder: "/nonexistent/w600k_r50.onnx".into(),
        });
        wait_past_loading(&handle).await;
        let result = handle.extract(vec![1, 2, 3]).await;
        assert!(matches!(result, Err(EngineError::ChannelClosed)));
    }
}
