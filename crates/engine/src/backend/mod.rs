//! Inference backend seam
//!
//! The engine loop never runs a network itself. It hands a slot index and
//! the attached input tensors to an [`InferenceBackend`] and is told about
//! the result through a completion callback, which may fire on any thread.

mod reference;

pub use reference::ReferenceBackend;

use enginelink_common::config::ModelConfig;
use enginelink_common::{DType, NamedBuffer, Result, TensorSpec};
use std::collections::BTreeMap;

/// One request input, viewed in place in its shared-memory segment
#[derive(Debug)]
pub struct InputTensor {
    /// Network tensor name (aliases already resolved)
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u64>,
    buffer: NamedBuffer,
}

impl InputTensor {
    pub fn new(name: String, dtype: DType, shape: Vec<u64>, buffer: NamedBuffer) -> Self {
        Self {
            name,
            dtype,
            shape,
            buffer,
        }
    }

    /// Tensor bytes, read directly from the mapped segment
    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn buffer_name(&self) -> &str {
        self.buffer.name()
    }
}

/// One network output produced by an inference
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

/// Outputs on success, backend message on failure
pub type InferenceResult = std::result::Result<Vec<OutputTensor>, String>;

/// Invoked exactly once per accepted submission
pub type CompletionCallback = Box<dyn FnOnce(InferenceResult) + Send + 'static>;

/// Asynchronous inference executor with a fixed network signature
pub trait InferenceBackend: Send {
    /// Current input signature
    fn inputs(&self) -> Vec<TensorSpec>;

    /// Current output signature
    fn outputs(&self) -> Vec<TensorSpec>;

    /// Replace the shapes of the named inputs
    ///
    /// Only called while no inference is in flight.
    fn reshape(&mut self, shapes: &BTreeMap<String, Vec<u64>>) -> Result<()>;

    /// Set the leading dimension of every input
    ///
    /// Only called while no inference is in flight.
    fn set_batch_size(&mut self, batch_size: u64) -> Result<()>;

    /// Start an inference on `slot`
    ///
    /// On `Ok` the callback is invoked exactly once, possibly from another
    /// thread. On `Err` it is never invoked.
    fn start_async(
        &mut self,
        slot: usize,
        inputs: Vec<InputTensor>,
        on_complete: CompletionCallback,
    ) -> Result<()>;
}

/// Build the backend configured for a model
pub fn build_backend(model: &ModelConfig, threads: usize) -> Result<Box<dyn InferenceBackend>> {
    Ok(Box::new(ReferenceBackend::new(model, threads)?))
}
