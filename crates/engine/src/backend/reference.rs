//! Reference backend
//!
//! Executes configured element-wise networks on a dedicated rayon pool:
//! every output is derived from one source input, either copied as is or,
//! for float32 tensors, multiplied by a constant factor.

use super::{CompletionCallback, InferenceBackend, InferenceResult, InputTensor, OutputTensor};
use enginelink_common::config::{BackendKind, ModelConfig, OutputConfig};
use enginelink_common::{DType, EngineLinkError, Result, TensorSpec};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

pub struct ReferenceBackend {
    kind: BackendKind,
    inputs: Vec<TensorSpec>,
    outputs: Vec<OutputConfig>,
    pool: rayon::ThreadPool,
}

impl ReferenceBackend {
    /// Build the network described by a model entry
    pub fn new(model: &ModelConfig, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("backend-{}", i))
            .build()
            .map_err(|e| EngineLinkError::resource(format!("backend thread pool: {}", e)))?;

        let inputs = model
            .inputs
            .iter()
            .map(|t| TensorSpec {
                name: t.name.clone(),
                dtype: t.dtype,
                shape: t.shape.clone(),
            })
            .collect();

        debug!(
            "Reference backend for {} with {} threads ({:?})",
            model.name,
            threads.max(1),
            model.backend
        );

        Ok(Self {
            kind: model.backend.clone(),
            inputs,
            outputs: model.outputs.clone(),
            pool,
        })
    }

    fn input_mut(&mut self, name: &str) -> Result<&mut TensorSpec> {
        self.inputs
            .iter_mut()
            .find(|spec| spec.name == name)
            .ok_or_else(|| EngineLinkError::Reshape(format!("network has no input {}", name)))
    }
}

impl InferenceBackend for ReferenceBackend {
    fn inputs(&self) -> Vec<TensorSpec> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<TensorSpec> {
        self.outputs
            .iter()
            .filter_map(|out| {
                self.inputs
                    .iter()
                    .find(|spec| spec.name == out.source)
                    .map(|source| TensorSpec {
                        name: out.name.clone(),
                        dtype: source.dtype,
                        shape: source.shape.clone(),
                    })
            })
            .collect()
    }

    fn reshape(&mut self, shapes: &BTreeMap<String, Vec<u64>>) -> Result<()> {
        for (name, shape) in shapes {
            let spec = self.input_mut(name)?;
            if shape.len() != spec.shape.len() {
                return Err(EngineLinkError::Reshape(format!(
                    "cannot change rank of {} from {} to {}",
                    name,
                    spec.shape.len(),
                    shape.len()
                )));
            }
            spec.shape = shape.clone();
        }
        Ok(())
    }

    fn set_batch_size(&mut self, batch_size: u64) -> Result<()> {
        if batch_size == 0 {
            return Err(EngineLinkError::Reshape("batch size must be positive".into()));
        }
        if let Some(scalar) = self.inputs.iter().find(|spec| spec.shape.is_empty()) {
            return Err(EngineLinkError::Reshape(format!(
                "input {} has no batch dimension",
                scalar.name
            )));
        }
        for spec in &mut self.inputs {
            spec.shape[0] = batch_size;
        }
        Ok(())
    }

    fn start_async(
        &mut self,
        slot: usize,
        inputs: Vec<InputTensor>,
        on_complete: CompletionCallback,
    ) -> Result<()> {
        let kind = self.kind.clone();
        let outputs = self.outputs.clone();

        self.pool.spawn(move || {
            let start = Instant::now();
            let result = run(&kind, &outputs, &inputs);
            trace!("Slot {} inference took {:?}", slot, start.elapsed());
            drop(inputs);
            on_complete(result);
        });

        Ok(())
    }
}

fn run(kind: &BackendKind, outputs: &[OutputConfig], inputs: &[InputTensor]) -> InferenceResult {
    outputs
        .iter()
        .map(|out| {
            let source = inputs
                .iter()
                .find(|input| input.name == out.source)
                .ok_or_else(|| format!("missing source input {} for {}", out.source, out.name))?;

            let data = match kind {
                BackendKind::Passthrough => source.data().to_vec(),
                BackendKind::Scale { factor } => scale(source, *factor)?,
            };

            Ok(OutputTensor {
                name: out.name.clone(),
                dtype: source.dtype,
                shape: source.shape.clone(),
                data,
            })
        })
        .collect()
}

fn scale(source: &InputTensor, factor: f32) -> std::result::Result<Vec<u8>, String> {
    if source.dtype != DType::Float32 {
        return Err(format!(
            "scale requires float32 input, {} is {}",
            source.name, source.dtype
        ));
    }

    Ok(source
        .data()
        .par_chunks_exact(4)
        .flat_map_iter(|chunk| {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            (value * factor).to_le_bytes()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginelink_common::config::{ShmConfig, TensorConfig};
    use enginelink_common::BufferManager;
    use std::sync::mpsc;
    use std::time::Duration;

    fn model(backend: BackendKind) -> ModelConfig {
        ModelConfig {
            name: "resnet".to_string(),
            versions: vec![1],
            num_ireq: None,
            reshape: Default::default(),
            backend,
            inputs: vec![TensorConfig {
                name: "data".to_string(),
                dtype: DType::Float32,
                shape: vec![1, 4],
            }],
            outputs: vec![OutputConfig {
                name: "prob".to_string(),
                source: "data".to_string(),
            }],
            mapping: Default::default(),
        }
    }

    fn input(manager: &BufferManager, values: &[f32]) -> (InputTensor, enginelink_common::NamedBuffer) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let owned = manager.create_from(&bytes).unwrap();
        let view = manager.attach(owned.name()).unwrap();
        let tensor = InputTensor::new(
            "data".to_string(),
            DType::Float32,
            vec![1, values.len() as u64],
            view,
        );
        (tensor, owned)
    }

    fn infer(backend: &mut ReferenceBackend, inputs: Vec<InputTensor>) -> InferenceResult {
        let (tx, rx) = mpsc::channel();
        backend
            .start_async(0, inputs, Box::new(move |result| tx.send(result).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_passthrough_copies_source() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BufferManager::new(&ShmConfig {
            root: dir.path().to_path_buf(),
            prefix: "ref".to_string(),
        })
        .unwrap();

        let mut backend = ReferenceBackend::new(&model(BackendKind::Passthrough), 2).unwrap();
        let (tensor, _owned) = input(&manager, &[1.0, 2.0, 3.0, 4.0]);

        let outputs = infer(&mut backend, vec![tensor]).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "prob");
        assert_eq!(outputs[0].shape, vec![1, 4]);
        assert_eq!(outputs[0].data.len(), 16);
        assert_eq!(&outputs[0].data[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_scale_multiplies() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BufferManager::new(&ShmConfig {
            root: dir.path().to_path_buf(),
            prefix: "ref".to_string(),
        })
        .unwrap();

        let mut backend =
            ReferenceBackend::new(&model(BackendKind::Scale { factor: 2.0 }), 1).unwrap();
        let (tensor, _owned) = input(&manager, &[1.5, -2.0, 0.0, 4.0]);

        let outputs = infer(&mut backend, vec![tensor]).unwrap();
        let values: Vec<f32> = outputs[0]
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![3.0, -4.0, 0.0, 8.0]);
    }

    #[test]
    fn test_missing_source_reports_failure() {
        let mut backend = ReferenceBackend::new(&model(BackendKind::Passthrough), 1).unwrap();
        let result = infer(&mut backend, Vec::new());
        assert!(result.unwrap_err().contains("missing source input data"));
    }

    #[test]
    fn test_reshape_and_batch_size() {
        let mut backend = ReferenceBackend::new(&model(BackendKind::Passthrough), 1).unwrap();

        let mut shapes = BTreeMap::new();
        shapes.insert("data".to_string(), vec![3, 8]);
        backend.reshape(&shapes).unwrap();
        assert_eq!(backend.inputs()[0].shape, vec![3, 8]);
        assert_eq!(backend.outputs()[0].shape, vec![3, 8]);

        backend.set_batch_size(5).unwrap();
        assert_eq!(backend.inputs()[0].shape, vec![5, 8]);

        shapes.insert("data".to_string(), vec![8]);
        assert!(matches!(
            backend.reshape(&shapes),
            Err(EngineLinkError::Reshape(_))
        ));

        let mut unknown = BTreeMap::new();
        unknown.insert("nope".to_string(), vec![1]);
        assert!(backend.reshape(&unknown).is_err());
        assert!(backend.set_batch_size(0).is_err());
    }
}
