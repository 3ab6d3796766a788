//! # Remote Whisper Backend
//!
//! Talks to a Whisper HTTP service that keeps the actual model in its own
//! process. The service exposes:
//! - `POST /model/load/{size}` - make sure a model of that size is resident
//! - `POST /transcribe?model_size={size}` - multipart upload, returns JSON
//!
//! Loading an instance here means asking the service to load the size and
//! keeping a client bound to it. The registry still caps how many of these
//! leases run at once, which is what keeps the remote service from being
//! flooded.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::jobs::job::Segment;
use crate::transcription::backend::{
    ModelInstance, TranscriptionBackend, TranscriptionOutput, TranscriptionRequest,
};
use crate::transcription::model::ModelSize;
use crate::upload::AudioFormat;

pub struct RemoteWhisperBackend {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteWhisperBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building HTTP client for the Whisper service")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TranscriptionBackend for RemoteWhisperBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn load(&self, size: ModelSize) -> Result<Box<dyn ModelInstance>> {
        let url = format!("{}/model/load/{}", self.base_url, size);
        tracing::info!(model = %size, url = %url, "Asking Whisper service to load model");

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("Whisper service unreachable at {}", self.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("loading {} model failed with {}: {}", size, status, body));
        }

        Ok(Box::new(RemoteModel {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            size,
        }))
    }
}

struct RemoteModel {
    client: reqwest::Client,
    base_url: String,
    size: ModelSize,
}

/// Response body of the service's `/transcribe` endpoint.
#[derive(Debug, Deserialize)]
struct RemoteTranscription {
    text: String,
    language: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<RemoteSegment>,
    confidence_score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RemoteSegment {
    start_time: f64,
    end_time: f64,
    text: String,
    confidence: Option<f32>,
}

impl From<RemoteTranscription> for TranscriptionOutput {
    fn from(remote: RemoteTranscription) -> Self {
        Self {
            text: remote.text,
            language: remote.language,
            segments: remote
                .segments
                .into_iter()
                .map(|s| Segment {
                    start: s.start_time,
                    end: s.end_time,
                    text: s.text,
                    confidence: s.confidence,
                })
                .collect(),
            confidence: remote.confidence_score,
            audio_duration_secs: remote.duration,
        }
    }
}

#[async_trait]
impl ModelInstance for RemoteModel {
    fn size(&self) -> ModelSize {
        self.size
    }

    async fn transcribe(&mut self, request: &TranscriptionRequest) -> Result<TranscriptionOutput> {
        let bytes = tokio::fs::read(&request.input.path)
            .await
            .with_context(|| format!("reading upload {}", request.input.path.display()))?;

        let mut part = Part::bytes(bytes).file_name(request.input.file_name.clone());
        if let Some(format) = AudioFormat::from_file_name(&request.input.file_name) {
            part = part.mime_str(format.mime_type())?;
        }
        let form = Form::new().part("file", part);
        let url = format!("{}/transcribe", self.base_url);

        let call = self
            .client
            .post(&url)
            .query(&[("model_size", self.size.as_str())])
            .multipart(form)
            .send();

        let response = tokio::select! {
            _ = request.cancel.cancelled() => {
                return Err(anyhow!("transcription of {} was cancelled", request.input.file_name));
            }
            response = call => response.context("Whisper service request failed")?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Whisper service returned {}: {}", status, body));
        }

        let remote: RemoteTranscription = response
            .json()
            .await
            .context("Whisper service returned an unreadable body")?;
        Ok(remote.into())
    }
}
