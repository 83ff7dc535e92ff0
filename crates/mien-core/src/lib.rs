//! mien-core — embedding store, cosine matcher, and ONNX face pipeline.
//!
//! The matcher and store are pure and synchronous; the detector and embedder
//! drive ONNX Runtime sessions and are owned by the daemon's engine thread.

pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod store;
pub mod types;

pub use detector::FaceDetector;
pub use embedder::{FaceEmbedder, EMBEDDING_DIM};
pub use matcher::{CosineMatcher, MatchResult, Matcher, RECOGNITION_THRESHOLD};
pub use store::{enroll, CorruptPolicy, EnrollOutcome, StoreError, VectorStore};
pub use types::{Detection, Embedding, FaceRecord};
