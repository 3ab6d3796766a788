//! # Transcription Module
//!
//! Everything on the model side of the job engine: the backend contract,
//! the concrete backends, and the registry that leases model instances to
//! workers.
//!
//! ## Key Components:
//! - **Backend contract**: `TranscriptionBackend` loads instances, `ModelInstance` transcribes
//! - **Simulated backend**: deterministic transcripts for development
//! - **Remote backend**: forwards uploads to a Whisper HTTP service
//! - **Model Registry**: bounded pool of loaded instances with scoped leases
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest

pub mod backend;     // Backend and instance traits
pub mod model;       // Model sizes
pub mod registry;    // Bounded pool of loaded instances
pub mod remote;      // Whisper HTTP service client
pub mod simulated;   // Canned transcripts

#[cfg(test)]
pub mod testing;

pub use backend::TranscriptionBackend;
pub use model::ModelSize;
pub use registry::{ModelError, ModelRegistry};
