//! # Model Registry
//!
//! Owns every loaded model instance and hands them out as exclusive, scoped
//! leases. This is the only place that decides when a model is loaded,
//! reused or evicted.
//!
//! ## Key Features:
//! - **Bounded handles**: at most `capacity` instances exist at once, loaded
//!   or leased (each one is expensive in memory)
//! - **Instance caching**: a released instance goes back to an idle cache
//!   keyed by size and is reused by the next job asking for that size
//! - **Scoped release**: `ModelLease` returns its instance on drop, so error,
//!   timeout and panic paths cannot leak a slot
//! - **Eviction**: only idle instances are ever evicted, either to make room
//!   for a different size or on an explicit operator command
//!
//! ## Thread Safety:
//! Slot accounting uses a `tokio::sync::Semaphore`; the idle cache sits
//! behind a short-lived `std::sync::Mutex` that is never held across an
//! `.await`, so no lock spans a model load or a transcription call.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::transcription::backend::{
    ModelInstance, TranscriptionBackend, TranscriptionOutput, TranscriptionRequest,
};
use crate::transcription::model::ModelSize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model {size} is unavailable: {reason}")]
    Unavailable { size: ModelSize, reason: String },

    #[error("model acquisition was cancelled")]
    Cancelled,

    #[error("model registry is closed")]
    Closed,
}

/// Usage statistics for one model size.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelMetrics {
    /// Transcription calls served by instances of this size
    pub total_requests: u64,
    /// Calls that ended in an error, timeout or panic
    pub failed_requests: u64,
    /// Total time spent inside transcription calls (milliseconds)
    pub total_processing_time_ms: u64,
}

impl ModelMetrics {
    pub fn success_rate(&self) -> f32 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_requests - self.failed_requests) as f32 / self.total_requests as f32
        }
    }

    pub fn average_processing_time_ms(&self) -> u64 {
        if self.total_requests == 0 {
            0
        } else {
            self.total_processing_time_ms / self.total_requests
        }
    }

    fn record(&mut self, processing_time_ms: u64, success: bool) {
        self.total_requests += 1;
        self.total_processing_time_ms += processing_time_ms;
        if !success {
            self.failed_requests += 1;
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    idle: HashMap<ModelSize, Vec<Box<dyn ModelInstance>>>,
    /// Instances currently out on a lease, including ones still loading
    leased: HashMap<ModelSize, usize>,
    metrics: HashMap<ModelSize, ModelMetrics>,
}

impl RegistryInner {
    fn idle_count(&self, size: ModelSize) -> usize {
        self.idle.get(&size).map_or(0, Vec::len)
    }

    fn leased_count(&self, size: ModelSize) -> usize {
        self.leased.get(&size).copied().unwrap_or(0)
    }

    fn loaded(&self) -> usize {
        self.idle.values().map(Vec::len).sum::<usize>() + self.leased.values().sum::<usize>()
    }

    fn take_idle(&mut self, size: ModelSize) -> Option<Box<dyn ModelInstance>> {
        self.idle.get_mut(&size).and_then(Vec::pop)
    }

    /// Pop an idle instance of any size but `keep`, preferring the size with
    /// the most idle copies.
    fn evict_idle_other_than(&mut self, keep: ModelSize) -> Option<Box<dyn ModelInstance>> {
        let victim = self
            .idle
            .iter()
            .filter(|(size, instances)| **size != keep && !instances.is_empty())
            .max_by_key(|(_, instances)| instances.len())
            .map(|(size, _)| *size)?;
        self.take_idle(victim)
    }
}

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ModelRegistry {
    backend: Arc<dyn TranscriptionBackend>,
    slots: Arc<Semaphore>,
    capacity: usize,
    inner: Arc<Mutex<RegistryInner>>,
}

impl ModelRegistry {
    /// Create a registry allowing at most `capacity` concurrently existing
    /// model instances.
    pub fn new(backend: Arc<dyn TranscriptionBackend>, capacity: usize) -> Self {
        Self {
            backend,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
        }
    }

    /// Lease an instance of `size`, waiting for a free slot if needed.
    ///
    /// ## Process:
    /// 1. Wait for a slot (or for `cancel` to fire)
    /// 2. Reuse an idle instance of the same size if one is cached
    /// 3. Otherwise load a new one, first evicting an idle instance of some
    ///    other size if every slot is taken by loaded models
    ///
    /// Holding a slot guarantees step 3 finds something to evict: at most
    /// `capacity - 1` other instances can be leased at that moment.
    pub async fn acquire(&self, size: ModelSize, cancel: &CancellationToken) -> Result<ModelLease, ModelError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => permit.map_err(|_| ModelError::Closed)?,
        };

        let (cached, evicted) = {
            let mut inner = lock(&self.inner);
            let cached = inner.take_idle(size);
            let evicted = if cached.is_none() && inner.loaded() >= self.capacity {
                inner.evict_idle_other_than(size)
            } else {
                None
            };
            *inner.leased.entry(size).or_default() += 1;
            (cached, evicted)
        };

        if let Some(old) = evicted {
            tracing::info!(evicted = %old.size(), requested = %size, "Evicting idle model to make room");
            drop(old);
        }

        let mut lease = ModelLease {
            instance: cached,
            size,
            discard: false,
            inner: Arc::clone(&self.inner),
            _permit: permit,
        };

        if lease.instance.is_none() {
            tracing::info!(model = %size, backend = self.backend.name(), "Loading model instance");
            let started = Instant::now();

            let loaded = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                loaded = self.backend.load(size) => loaded,
            };

            match loaded {
                Ok(instance) => {
                    tracing::info!(
                        model = %size,
                        load_ms = started.elapsed().as_millis() as u64,
                        "Model instance loaded"
                    );
                    lease.instance = Some(instance);
                }
                Err(e) => {
                    tracing::warn!(model = %size, error = %e, "Model failed to load");
                    return Err(ModelError::Unavailable {
                        size,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        Ok(lease)
    }

    /// Load an instance of `size` into the idle cache ahead of demand.
    pub async fn preload(&self, size: ModelSize) -> Result<(), ModelError> {
        let lease = self.acquire(size, &CancellationToken::new()).await?;
        drop(lease);
        Ok(())
    }

    /// Drop every idle instance of `size`. Leased instances are untouched.
    pub fn evict_idle(&self, size: ModelSize) -> usize {
        let evicted = lock(&self.inner).idle.remove(&size).unwrap_or_default();
        let count = evicted.len();
        if count > 0 {
            tracing::info!(model = %size, count, "Evicted idle model instances");
        }
        count
    }

    pub fn leased_count(&self) -> usize {
        lock(&self.inner).leased.values().sum()
    }

    pub fn summary(&self) -> RegistrySummary {
        let inner = lock(&self.inner);
        let models = ModelSize::ALL
            .into_iter()
            .map(|size| ModelSummary {
                size,
                size_mb: size.size_mb(),
                description: size.description(),
                idle: inner.idle_count(size),
                leased: inner.leased_count(size),
                metrics: inner.metrics.get(&size).cloned().unwrap_or_default(),
            })
            .collect();

        RegistrySummary {
            backend: self.backend.name(),
            capacity: self.capacity,
            loaded: inner.loaded(),
            leased: inner.leased.values().sum(),
            available_slots: self.slots.available_permits(),
            models,
        }
    }
}

/// Exclusive use of one model instance. Dropping the lease releases it.
pub struct ModelLease {
    instance: Option<Box<dyn ModelInstance>>,
    size: ModelSize,
    discard: bool,
    inner: Arc<Mutex<RegistryInner>>,
    // Declared last so the slot frees only after the instance is back in
    // the idle cache.
    _permit: OwnedSemaphorePermit,
}

impl ModelLease {
    pub fn size(&self) -> ModelSize {
        self.size
    }

    pub async fn transcribe(&mut self, request: &TranscriptionRequest) -> anyhow::Result<TranscriptionOutput> {
        match self.instance.as_mut() {
            Some(instance) => instance.transcribe(request).await,
            None => Err(anyhow::anyhow!("model lease for {} holds no instance", self.size)),
        }
    }

    /// Do not return the instance to the cache on release. Used when a call
    /// was abandoned mid-flight and the instance state is unknown.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn record_usage(&self, processing_time: Duration, success: bool) {
        lock(&self.inner)
            .metrics
            .entry(self.size)
            .or_default()
            .record(processing_time.as_millis() as u64, success);
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        let discarded = {
            let mut inner = lock(&self.inner);
            if let Some(count) = inner.leased.get_mut(&self.size) {
                *count = count.saturating_sub(1);
            }
            match self.instance.take() {
                Some(instance) if !self.discard => {
                    inner.idle.entry(self.size).or_default().push(instance);
                    None
                }
                other => other,
            }
        };
        drop(discarded);
    }
}

#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub size: ModelSize,
    pub size_mb: u32,
    pub description: &'static str,
    pub idle: usize,
    pub leased: usize,
    pub metrics: ModelMetrics,
}

/// Point-in-time view of the registry for the models endpoint.
#[derive(Debug, Serialize)]
pub struct RegistrySummary {
    pub backend: &'static str,
    pub capacity: usize,
    pub loaded: usize,
    pub leased: usize,
    pub available_slots: usize,
    pub models: Vec<ModelSummary>,
}
