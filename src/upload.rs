//! # Upload Validation and Storage
//!
//! Checks an incoming audio upload and streams it to disk. The job engine
//! only ever sees the resulting `InputRef`; anything rejected here never
//! becomes a job.
//!
//! ## Rules:
//! - Extension must be one of mp3, wav, m4a, flac, ogg
//! - Content type, when sent, must be `audio/*` or `application/octet-stream`
//! - The file must be non-empty and no larger than the configured limit
//!
//! Stored files get a UUID-based name so client-supplied names never touch
//! the filesystem.

use actix_web::web::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::jobs::InputRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
    M4a,
    Flac,
    Ogg,
}

impl AudioFormat {
    pub const SUPPORTED: &'static str = "mp3, wav, m4a, flac, ogg";

    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let extension = Path::new(file_name).extension()?.to_str()?.to_lowercase();
        match extension.as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "wav" => Some(AudioFormat::Wav),
            "m4a" => Some(AudioFormat::M4a),
            "flac" => Some(AudioFormat::Flac),
            "ogg" => Some(AudioFormat::Ogg),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::M4a => "m4a",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::M4a => "audio/mp4",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Ogg => "audio/ogg",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no audio file was provided (expected a 'file' field)")]
    MissingFile,

    #[error("uploaded file has no name")]
    MissingName,

    #[error("unsupported audio format for '{0}'; supported formats: {supported}", supported = AudioFormat::SUPPORTED)]
    UnsupportedFormat(String),

    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("uploaded file is empty")]
    Empty,

    #[error("file exceeds the maximum size of {max_mb}MB")]
    TooLarge { max_mb: u64 },

    #[error("invalid value for '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("upload was interrupted: {0}")]
    Stream(String),

    #[error("could not store upload: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated upload sitting in the upload directory.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub path: PathBuf,
    pub file_name: String,
    pub format: AudioFormat,
    pub size_bytes: u64,
}

impl StoredUpload {
    pub fn input_ref(&self) -> InputRef {
        InputRef::new(self.path.clone(), self.file_name.clone())
    }

    /// Delete the stored file, e.g. when admission turned the job away.
    pub async fn discard(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not remove rejected upload");
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    upload_dir: PathBuf,
    max_bytes: u64,
}

impl UploadPolicy {
    pub fn new(upload_dir: impl Into<PathBuf>, max_file_size_mb: u64) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            max_bytes: max_file_size_mb.saturating_mul(1024 * 1024),
        }
    }

    pub fn max_mb(&self) -> u64 {
        self.max_bytes / (1024 * 1024)
    }

    pub fn validate_name(&self, file_name: Option<&str>) -> Result<AudioFormat, UploadError> {
        let file_name = file_name.map(str::trim).filter(|name| !name.is_empty()).ok_or(UploadError::MissingName)?;
        AudioFormat::from_file_name(file_name).ok_or_else(|| UploadError::UnsupportedFormat(file_name.to_string()))
    }

    pub fn validate_content_type(&self, content_type: Option<&str>) -> Result<(), UploadError> {
        match content_type {
            None => Ok(()),
            Some(ct) if ct.starts_with("audio/") || ct == "application/octet-stream" => Ok(()),
            Some(ct) => Err(UploadError::UnsupportedContentType(ct.to_string())),
        }
    }

    /// Stream `body` into the upload directory, enforcing the size limit as
    /// bytes arrive. A partially written file is removed on any failure.
    pub async fn persist<S, E>(&self, file_name: &str, body: S) -> Result<StoredUpload, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let format = self.validate_name(Some(file_name))?;
        tokio::fs::create_dir_all(&self.upload_dir).await?;

        let path = self
            .upload_dir
            .join(format!("{}.{}", Uuid::new_v4(), format.extension()));

        match self.write(&path, body).await {
            Ok(size_bytes) => {
                tracing::debug!(path = %path.display(), size_bytes, "Stored upload");
                Ok(StoredUpload {
                    path,
                    file_name: file_name.trim().to_string(),
                    format,
                    size_bytes,
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    async fn write<S, E>(&self, path: &Path, body: S) -> Result<u64, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let mut body = std::pin::pin!(body);
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| UploadError::Stream(e.to_string()))?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(UploadError::TooLarge { max_mb: self.max_mb() });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if written == 0 {
            return Err(UploadError::Empty);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        stream::iter(parts.into_iter().map(|part| Ok(Bytes::from_static(part))))
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(AudioFormat::from_file_name("Meeting.MP3"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::from_file_name("voice.ogg"), Some(AudioFormat::Ogg));
        assert_eq!(AudioFormat::from_file_name("notes.txt"), None);
        assert_eq!(AudioFormat::from_file_name("no_extension"), None);
    }

    #[test]
    fn test_content_type_rules() {
        let policy = UploadPolicy::new("/tmp", 1);
        assert!(policy.validate_content_type(Some("audio/wav")).is_ok());
        assert!(policy.validate_content_type(Some("application/octet-stream")).is_ok());
        assert!(policy.validate_content_type(None).is_ok());
        assert!(matches!(
            policy.validate_content_type(Some("text/plain")),
            Err(UploadError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_oversized_limit_saturates() {
        let policy = UploadPolicy::new("/tmp", u64::MAX);
        assert_eq!(policy.max_mb(), u64::MAX / (1024 * 1024));
        assert!(policy.max_mb() > 0);
    }

    #[tokio::test]
    async fn test_persist_writes_under_safe_name() {
        let dir = tempfile::tempdir().unwrap();
        let policy = UploadPolicy::new(dir.path(), 1);

        let stored = policy
            .persist("../../etc/passwd.wav", chunks(vec![b"RIFF", b"data"]))
            .await
            .unwrap();

        assert_eq!(stored.size_bytes, 8);
        assert_eq!(stored.format, AudioFormat::Wav);
        assert_eq!(stored.path.parent(), Some(dir.path()));
        assert_eq!(tokio::fs::read(&stored.path).await.unwrap(), b"RIFFdata");
        assert_eq!(stored.input_ref().file_name, "../../etc/passwd.wav");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let policy = UploadPolicy::new(dir.path(), 1);
        let big: &'static [u8] = Box::leak(vec![0u8; 1024 * 1024 + 1].into_boxed_slice());

        let err = policy.persist("big.mp3", chunks(vec![big])).await.unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { max_mb: 1 }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_and_unsupported_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let policy = UploadPolicy::new(dir.path(), 1);

        assert!(matches!(
            policy.persist("silence.flac", chunks(vec![])).await,
            Err(UploadError::Empty)
        ));
        assert!(matches!(
            policy.persist("slides.pdf", chunks(vec![b"%PDF"])).await,
            Err(UploadError::UnsupportedFormat(_))
        ));
    }
}
