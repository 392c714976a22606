//! EngineLink engine
//!
//! An engine process serves one model version: it receives predict requests
//! that reference shared-memory input segments, runs them on a bounded pool
//! of inference slots and returns outputs through new segments.

pub mod backend;
pub mod engine;
pub mod keys;
pub mod shape;
pub mod slots;

pub use backend::{
    build_backend, CompletionCallback, InferenceBackend, InferenceResult, InputTensor,
    OutputTensor, ReferenceBackend,
};
pub use engine::{EngineOptions, EngineProcess, ModelIdentity};
pub use slots::{EngineState, EngineStats, SlotPool};
