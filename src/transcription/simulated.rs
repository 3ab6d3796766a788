//! # Simulated Backend
//!
//! A deterministic stand-in for a real Whisper engine. It waits for a fixed
//! delay (honoring cancellation) and produces a canned transcript naming the
//! uploaded file. Useful for local development and for exercising the job
//! engine without model weights.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::jobs::job::Segment;
use crate::transcription::backend::{
    ModelInstance, TranscriptionBackend, TranscriptionOutput, TranscriptionRequest,
};
use crate::transcription::model::ModelSize;

pub struct SimulatedBackend {
    /// How long each transcription call takes
    delay: Duration,
}

impl SimulatedBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl TranscriptionBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn load(&self, size: ModelSize) -> Result<Box<dyn ModelInstance>> {
        tracing::info!(model = %size, "Loading simulated model");
        Ok(Box::new(SimulatedModel {
            size,
            delay: self.delay,
        }))
    }
}

struct SimulatedModel {
    size: ModelSize,
    delay: Duration,
}

#[async_trait]
impl ModelInstance for SimulatedModel {
    fn size(&self) -> ModelSize {
        self.size
    }

    async fn transcribe(&mut self, request: &TranscriptionRequest) -> Result<TranscriptionOutput> {
        tokio::select! {
            _ = request.cancel.cancelled() => {
                return Err(anyhow!("transcription of {} was cancelled", request.input.file_name));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        let text = format!(
            "This is a simulated transcription result for the audio file: {}",
            request.input.file_name
        );
        let duration = self.delay.as_secs_f64().max(1.0);
        let confidence = estimate_confidence(&text, duration);

        Ok(TranscriptionOutput {
            segments: vec![Segment {
                start: 0.0,
                end: duration,
                text: text.clone(),
                confidence: Some(confidence),
            }],
            text,
            language: Some("en".to_string()),
            confidence: Some(confidence),
            audio_duration_secs: Some(duration),
        })
    }
}

/// Heuristic confidence for backends that do not report one.
///
/// Rewards a plausible speaking pace, common words and sentence casing;
/// penalizes empty or garbled text.
pub fn estimate_confidence(text: &str, audio_duration: f64) -> f32 {
    if text.trim().is_empty() {
        return 0.2;
    }

    let mut confidence = 0.5f32;

    let chars_per_second = text.len() as f64 / audio_duration.max(0.001);
    if chars_per_second > 10.0 && chars_per_second < 100.0 {
        confidence += 0.2;
    } else {
        confidence -= 0.1;
    }

    let common_words = ["the", "and", "to", "of", "a", "in", "is", "it", "you", "that"];
    let text_lower = text.to_lowercase();
    let common_word_count = common_words
        .iter()
        .filter(|&&word| text_lower.split_whitespace().any(|w| w == word))
        .count();
    confidence += 0.1 * (common_word_count as f32 / common_words.len() as f32);

    if text.chars().next().is_some_and(|c| c.is_uppercase()) {
        confidence += 0.1;
    }

    if text.contains("...") || text.contains("???") {
        confidence -= 0.2;
    }

    confidence.clamp(0.0, 1.0)
}
