//! EngineLink dispatch front-end
//!
//! Resolves model versions to engine processes, moves request tensors into
//! shared memory, exchanges envelopes with the engines and turns their
//! replies back into protocol responses.

pub mod convert;
pub mod dispatcher;
pub mod engine_client;
pub mod registry;
pub mod supervisor;

pub use dispatcher::Dispatcher;
pub use engine_client::{EngineClient, ReplyChannel};
pub use registry::{ModelRegistry, ResolvedEngine, VersionEntry};
pub use supervisor::EngineSupervisor;
