//! Scripted backend for exercising the job engine in tests.
//!
//! Each input file name can be mapped to a behavior (fail, panic, hang);
//! everything else succeeds after a fixed delay. Call statistics record
//! start order and peak concurrency.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transcription::backend::{
    ModelInstance, TranscriptionBackend, TranscriptionOutput, TranscriptionRequest,
};
use crate::transcription::model::ModelSize;

#[derive(Debug, Clone)]
pub enum Script {
    Fail(&'static str),
    Panic,
    /// Sleep for the duration without watching the cancellation token.
    Hang(Duration),
}

#[derive(Debug, Default)]
pub struct CallStats {
    loads: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl CallStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// File names in the order their transcription calls started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

struct ActiveGuard(Arc<CallStats>);

impl ActiveGuard {
    fn enter(stats: &Arc<CallStats>, name: &str) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(now, Ordering::SeqCst);
        stats.started.lock().unwrap().push(name.to_string());
        Self(Arc::clone(stats))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedBackend {
    delay: Duration,
    scripts: Arc<HashMap<String, Script>>,
    unavailable: HashSet<ModelSize>,
    stats: Arc<CallStats>,
}

impl ScriptedBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            scripts: Arc::new(HashMap::new()),
            unavailable: HashSet::new(),
            stats: Arc::new(CallStats::default()),
        }
    }

    pub fn with_script(mut self, file_name: &str, script: Script) -> Self {
        Arc::make_mut(&mut self.scripts).insert(file_name.to_string(), script);
        self
    }

    pub fn with_unavailable(mut self, size: ModelSize) -> Self {
        self.unavailable.insert(size);
        self
    }

    pub fn stats(&self) -> Arc<CallStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl TranscriptionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn load(&self, size: ModelSize) -> Result<Box<dyn ModelInstance>> {
        if self.unavailable.contains(&size) {
            return Err(anyhow!("no weights for {}", size));
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedModel {
            size,
            delay: self.delay,
            scripts: Arc::clone(&self.scripts),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct ScriptedModel {
    size: ModelSize,
    delay: Duration,
    scripts: Arc<HashMap<String, Script>>,
    stats: Arc<CallStats>,
}

#[async_trait]
impl ModelInstance for ScriptedModel {
    fn size(&self) -> ModelSize {
        self.size
    }

    async fn transcribe(&mut self, request: &TranscriptionRequest) -> Result<TranscriptionOutput> {
        let name = request.input.file_name.clone();
        let _active = ActiveGuard::enter(&self.stats, &name);

        match self.scripts.get(&name).cloned() {
            Some(Script::Fail(message)) => Err(anyhow!(message)),
            Some(Script::Panic) => panic!("scripted panic for {}", name),
            Some(Script::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(TranscriptionOutput {
                    text: format!("late transcript of {}", name),
                    ..Default::default()
                })
            }
            None => {
                tokio::select! {
                    _ = request.cancel.cancelled() => Err(anyhow!("cancelled")),
                    _ = tokio::time::sleep(self.delay) => Ok(TranscriptionOutput {
                        text: format!("transcript of {}", name),
                        language: Some("en".to_string()),
                        ..Default::default()
                    }),
                }
            }
        }
    }
}
