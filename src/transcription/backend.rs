//! # Transcription Backend Contract
//!
//! The job engine treats the actual speech-to-text computation as a black
//! box. A backend knows how to load a model instance of a given size; an
//! instance knows how to turn an `InputRef` into text.
//!
//! ## Cooperative Cancellation:
//! Every request carries a deadline and a cancellation token. Backends are
//! expected to watch the token and return early when it fires. The execution
//! pool also drops the call future on timeout, so a backend that ignores the
//! token still stops being polled.

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::jobs::job::{InputRef, Segment};
use crate::transcription::model::ModelSize;

/// Everything a single transcription call needs.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub input: InputRef,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

/// Raw output of a transcription call, before the pool attaches timing and
/// model information.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptionOutput {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<Segment>,
    pub confidence: Option<f32>,
    pub audio_duration_secs: Option<f64>,
}

/// A loaded, exclusively-leased model.
///
/// `transcribe` takes `&mut self`: an instance is never shared between two
/// concurrent calls, so backends that are not thread-safe need no locking.
#[async_trait]
pub trait ModelInstance: Send + Sync {
    fn size(&self) -> ModelSize;

    async fn transcribe(&mut self, request: &TranscriptionRequest) -> anyhow::Result<TranscriptionOutput>;
}

/// Factory for model instances. Loading is expensive, so the registry calls
/// this only on a cache miss.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self, size: ModelSize) -> anyhow::Result<Box<dyn ModelInstance>>;
}
