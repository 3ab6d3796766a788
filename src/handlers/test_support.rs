//! Fixtures shared by the handler tests.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::config::AppConfig;
use crate::jobs::facade::JobStatusView;
use crate::jobs::{InMemoryJobStore, JobId, JobStore, SchedulerSettings, TranscriptionService};
use crate::state::AppState;
use crate::transcription::testing::{Script, ScriptedBackend};
use crate::transcription::ModelRegistry;

pub const BOUNDARY: &str = "----transcription-jobs-test";

/// App state over an in-memory store and a scripted backend. Uploads land in
/// the returned temp dir; `hang.wav` never finishes on its own.
pub async fn test_state(max_queue_depth: usize) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.upload.upload_dir = dir.path().to_string_lossy().into_owned();
    config.scheduler.max_queue_depth = max_queue_depth;
    config.scheduler.worker_count = 2;

    let backend = ScriptedBackend::new(Duration::from_millis(10))
        .with_script("hang.wav", Script::Hang(Duration::from_secs(30)));
    let models = Arc::new(ModelRegistry::new(Arc::new(backend), 2));
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let service = TranscriptionService::start(store, models, SchedulerSettings::from(&config.scheduler))
        .await
        .unwrap();

    (AppState::new(config, service), dir)
}

/// Body of a `multipart/form-data` request. Parts with a file name become
/// file parts; the rest are plain text fields.
pub fn multipart_body(parts: &[(&str, Option<&str>, &str)]) -> String {
    let mut body = String::new();
    for (name, file_name, content) in parts {
        body.push_str(&format!("--{}\r\n", BOUNDARY));
        match file_name {
            Some(file_name) => {
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    name, file_name
                ));
                body.push_str("Content-Type: application/octet-stream\r\n\r\n");
            }
            None => body.push_str(&format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)),
        }
        body.push_str(content);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));
    body
}

pub async fn wait_terminal(state: &AppState, id: JobId) -> JobStatusView {
    for _ in 0..500 {
        let view = state.service.status(id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never finished", id);
}
