//! Engine process event loop
//!
//! One engine serves one model version. It listens on the version's
//! request socket, validates each predict request, makes sure the network
//! matches the request's shapes, submits it on a free inference slot and
//! returns the outputs to the request's reply socket once the backend
//! reports completion.
//!
//! Everything that touches the backend or the slot pool runs on the single
//! loop task. Backend completions arrive over a channel and are processed
//! between connections, and also while the loop waits for a slot or for
//! in-flight work to finish before a reshape.
//!
//! Output segments are created by the engine and handed to the requester:
//! the requester adopts them before acknowledging the reply. If it hangs up
//! without acknowledging, the engine unlinks them itself.

use crate::backend::{CompletionCallback, InferenceBackend, InferenceResult, InputTensor, OutputTensor};
use crate::keys::ModelKeys;
use crate::shape::{self, RequestShape, ShapeAdjustment};
use crate::slots::{EngineState, EngineStats, SlotPool};
use bytes::Bytes;
use enginelink_common::config::{EngineLinkConfig, KeyMapping, ModelConfig, ReshapePolicy};
use enginelink_common::envelope::{
    dense_byte_len, encode_reply, MetadataReplyEnvelope, PredictRequestEnvelope,
};
use enginelink_common::transport::{self, SocketListener};
use enginelink_common::{
    BufferManager, EngineLinkError, Envelope, NamedBuffer, ReplyStatus, Result, TensorEntry,
    TensorSpec, METRICS,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Model name and version served by an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIdentity {
    pub name: String,
    pub version: i64,
}

impl ModelIdentity {
    pub fn new(name: impl Into<String>, version: i64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[model: {}, version: {}]", self.name, self.version)
    }
}

/// Runtime settings of one engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Number of inference slots
    pub num_ireq: usize,
    pub reshape: ReshapePolicy,
    /// Bound on reading a request and on delivering a reply
    pub io_timeout: Duration,
    pub max_frame_bytes: usize,
    pub socket_dir: PathBuf,
}

impl EngineOptions {
    pub fn from_config(config: &EngineLinkConfig, model: &ModelConfig) -> Self {
        Self {
            num_ireq: config.num_ireq_for(model),
            reshape: model.reshape,
            io_timeout: Duration::from_millis(config.engine.io_timeout_ms),
            max_frame_bytes: config.engine.max_frame_bytes,
            socket_dir: config.socket_dir.clone(),
        }
    }
}

/// Backend completion for one slot
struct CompletionEvent {
    slot: usize,
    result: InferenceResult,
}

/// Request occupying a slot
struct InflightRequest {
    reply_address: PathBuf,
    started: Instant,
}

enum Next {
    Shutdown,
    Completion(CompletionEvent),
    Delivered(std::result::Result<(), tokio::task::JoinError>),
    Connection(Result<UnixStream>),
}

/// Engine serving one model version
pub struct EngineProcess {
    identity: ModelIdentity,
    options: EngineOptions,
    backend: Box<dyn InferenceBackend>,
    keys: ModelKeys,
    buffers: BufferManager,
    listener: SocketListener,
    pool: SlotPool,
    stats: Arc<EngineStats>,
    inflight: HashMap<usize, InflightRequest>,
    completions_tx: mpsc::UnboundedSender<CompletionEvent>,
    completions_rx: mpsc::UnboundedReceiver<CompletionEvent>,
    deliveries: JoinSet<()>,
}

impl EngineProcess {
    /// Bind the request socket and get ready to serve
    pub async fn start(
        identity: ModelIdentity,
        backend: Box<dyn InferenceBackend>,
        mapping: &KeyMapping,
        options: EngineOptions,
        buffers: BufferManager,
    ) -> Result<Self> {
        if options.num_ireq == 0 {
            return Err(EngineLinkError::config(format!(
                "{} needs at least one inference slot",
                identity
            )));
        }

        let inputs = backend.inputs();
        let outputs = backend.outputs();
        let keys = ModelKeys::new(
            mapping,
            inputs.iter().map(|spec| spec.name.as_str()),
            outputs.iter().map(|spec| spec.name.as_str()),
        );

        let address = transport::engine_address(&options.socket_dir, &identity.name, identity.version);
        let listener = SocketListener::bind(&address).await?;

        let pool = SlotPool::new(options.num_ireq);
        let stats = pool.stats();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        info!(
            "{} Engine listening on {} with {} inference slots, input keys {:?}",
            identity,
            address.display(),
            options.num_ireq,
            keys.input_keys()
        );
        stats.set_state(EngineState::Listening);

        Ok(Self {
            identity,
            options,
            backend,
            keys,
            buffers,
            listener,
            pool,
            stats,
            inflight: HashMap::new(),
            completions_tx,
            completions_rx,
            deliveries: JoinSet::new(),
        })
    }

    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    /// Request socket path
    pub fn address(&self) -> &Path {
        self.listener.path()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until `shutdown` resolves, then finish in-flight work
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => Next::Shutdown,
                Some(event) = self.completions_rx.recv() => Next::Completion(event),
                Some(joined) = self.deliveries.join_next() => Next::Delivered(joined),
                accepted = self.listener.accept() => Next::Connection(accepted),
            };

            match next {
                Next::Shutdown => break,
                Next::Completion(event) => self.complete(event),
                Next::Delivered(joined) => {
                    if let Err(e) = joined {
                        error!("{} Reply delivery task failed: {}", self.identity, e);
                    }
                }
                Next::Connection(Ok(stream)) => self.handle_connection(stream).await,
                Next::Connection(Err(e)) => {
                    warn!("{} Failed to accept connection: {}", self.identity, e);
                }
            }
        }

        info!(
            "{} Shutting down with {} inferences in flight",
            self.identity,
            self.inflight.len()
        );
        self.drain().await;
        while let Some(joined) = self.deliveries.join_next().await {
            if let Err(e) = joined {
                error!("{} Reply delivery task failed: {}", self.identity, e);
            }
        }
        self.stats.set_state(EngineState::Stopped);
        info!("{} Engine stopped", self.identity);

        Ok(())
    }

    async fn handle_connection(&mut self, mut stream: UnixStream) {
        let read = transport::read_frame_or_eof(&mut stream, self.options.max_frame_bytes);
        let frame = match timeout(self.options.io_timeout, read).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                trace!("{} Probe connection", self.identity);
                return;
            }
            Ok(Err(e)) => {
                warn!("{} Failed to read request: {}", self.identity, e);
                return;
            }
            Err(_) => {
                warn!("{} Timed out reading request", self.identity);
                return;
            }
        };
        drop(stream);

        match Envelope::decode(&frame) {
            Ok(Envelope::PredictRequest(request)) => self.handle_predict(request).await,
            Ok(Envelope::MetadataRequest(request)) => self.handle_metadata(&request.reply_address),
            Ok(other) => warn!("{} Ignoring unexpected {}", self.identity, other.kind()),
            Err(e) => {
                self.stats.record_rejection();
                warn!("{} Dropping undecodable request: {}", self.identity, e);
            }
        }
    }

    async fn handle_predict(&mut self, request: PredictRequestEnvelope) {
        let reply_address = PathBuf::from(&request.reply_address);
        trace!(
            "{} Predict request with {} inputs, reply to {}",
            self.identity,
            request.tensors.len(),
            reply_address.display()
        );

        let inputs = match self.prepare_inputs(&request.tensors) {
            Ok(inputs) => inputs,
            Err(e) => return self.reject(reply_address, e),
        };
        if let Err(e) = self.adjust_network(&inputs).await {
            return self.reject(reply_address, e);
        }
        let slot = match self.acquire_slot().await {
            Ok(slot) => slot,
            Err(e) => return self.reject(reply_address, e),
        };

        self.submit(slot, inputs, reply_address);
    }

    /// Validate request entries and attach their segments
    fn prepare_inputs(&self, entries: &[TensorEntry]) -> Result<Vec<InputTensor>> {
        self.keys
            .check_request(entries.iter().map(|entry| entry.tensor_name.as_str()))?;

        entries
            .iter()
            .map(|entry| {
                let tensor = self.keys.input_tensor(&entry.tensor_name).ok_or_else(|| {
                    EngineLinkError::invalid_input(format!("unknown input {}", entry.tensor_name))
                })?;

                let expected = dense_byte_len(entry.dtype, &entry.shape).ok_or_else(|| {
                    EngineLinkError::invalid_input(format!(
                        "shape {:?} of {} overflows",
                        entry.shape, entry.tensor_name
                    ))
                })?;
                if expected != entry.byte_len {
                    return Err(EngineLinkError::invalid_input(format!(
                        "input {} declares {} bytes, {} {:?} needs {}",
                        entry.tensor_name, entry.byte_len, entry.dtype, entry.shape, expected
                    )));
                }

                let buffer = self.buffers.attach(&entry.buffer_name)?;
                if buffer.len() as u64 != entry.byte_len {
                    return Err(EngineLinkError::invalid_input(format!(
                        "segment {} holds {} bytes, input {} declares {}",
                        entry.buffer_name,
                        buffer.len(),
                        entry.tensor_name,
                        entry.byte_len
                    )));
                }

                Ok(InputTensor::new(
                    tensor.to_string(),
                    entry.dtype,
                    entry.shape.clone(),
                    buffer,
                ))
            })
            .collect()
    }

    /// Bring the network in line with the request, waiting for in-flight work
    async fn adjust_network(&mut self, inputs: &[InputTensor]) -> Result<()> {
        let network = self.backend.inputs();
        let request: Vec<RequestShape<'_>> = inputs
            .iter()
            .map(|input| RequestShape {
                tensor: &input.name,
                dtype: input.dtype,
                shape: &input.shape,
            })
            .collect();

        let adjustment = shape::plan(self.options.reshape, &network, &request)?;
        if adjustment == ShapeAdjustment::None {
            return Ok(());
        }

        self.stats.set_state(EngineState::Reshaping);
        if !self.pool.is_idle() {
            debug!(
                "{} Waiting for {} inferences before reshaping",
                self.identity,
                self.inflight.len()
            );
            self.drain().await;
        }

        let start = Instant::now();
        let result = match &adjustment {
            ShapeAdjustment::Reshape(shapes) => self.backend.reshape(shapes),
            ShapeAdjustment::BatchSize(batch_size) => self.backend.set_batch_size(*batch_size),
            ShapeAdjustment::None => Ok(()),
        };
        self.stats.set_state(EngineState::Listening);

        result.map_err(|e| match e {
            EngineLinkError::Reshape(_) => e,
            other => EngineLinkError::Reshape(other.message()),
        })?;

        METRICS.engine.reshapes.inc();
        info!(
            "{} Network adjusted ({:?}) in {:?}",
            self.identity,
            adjustment,
            start.elapsed()
        );
        Ok(())
    }

    /// Take a free slot, processing completions until one is returned
    async fn acquire_slot(&mut self) -> Result<usize> {
        loop {
            if let Some(slot) = self.pool.try_acquire() {
                return Ok(slot);
            }

            trace!(
                "{} All {} inference slots busy",
                self.identity,
                self.pool.capacity()
            );
            match self.completions_rx.recv().await {
                Some(event) => self.complete(event),
                None => return Err(EngineLinkError::internal("completion channel closed")),
            }
        }
    }

    /// Wait until every slot is free
    async fn drain(&mut self) {
        while !self.pool.is_idle() {
            match self.completions_rx.recv().await {
                Some(event) => self.complete(event),
                None => break,
            }
        }
    }

    fn submit(&mut self, slot: usize, inputs: Vec<InputTensor>, reply_address: PathBuf) {
        self.stats.set_state(EngineState::DispatchingInference);

        let completions = self.completions_tx.clone();
        let on_complete: CompletionCallback = Box::new(move |result| {
            // the loop may already be gone at process exit
            let _ = completions.send(CompletionEvent { slot, result });
        });

        self.inflight.insert(
            slot,
            InflightRequest {
                reply_address: reply_address.clone(),
                started: Instant::now(),
            },
        );

        match self.backend.start_async(slot, inputs, on_complete) {
            Ok(()) => {
                METRICS.engine.requests_accepted.inc();
                trace!("{} Inference started on slot {}", self.identity, slot);
            }
            Err(e) => {
                self.inflight.remove(&slot);
                self.pool.release(slot);
                METRICS.engine.inference_failures.inc();
                warn!("{} Failed to start inference: {}", self.identity, e);

                let err = match e {
                    EngineLinkError::BackendInference(_) => e,
                    other => EngineLinkError::BackendInference(other.message()),
                };
                self.send_reply(reply_address, encode_reply(&[], &ReplyStatus::from_error(&err)), Vec::new());
            }
        }

        self.stats.set_state(EngineState::Listening);
    }

    fn complete(&mut self, event: CompletionEvent) {
        let Some(request) = self.inflight.remove(&event.slot) else {
            warn!(
                "{} Completion for slot {} with no request in flight",
                self.identity, event.slot
            );
            return;
        };

        let resume = self.stats.state();
        self.stats.set_state(EngineState::Returning);
        let elapsed = request.started.elapsed();
        METRICS.engine.inference_duration.observe(elapsed.as_secs_f64());
        self.stats.record_completion();

        let staged = event
            .result
            .map_err(EngineLinkError::BackendInference)
            .and_then(|outputs| self.stage_outputs(outputs));

        let (entries, buffers, status) = match staged {
            Ok((entries, buffers)) => (
                entries,
                buffers,
                ReplyStatus::Ok {
                    model_version: self.identity.version,
                },
            ),
            Err(e) => {
                METRICS.engine.inference_failures.inc();
                warn!("{} Inference on slot {} failed: {}", self.identity, event.slot, e);
                (Vec::new(), Vec::new(), ReplyStatus::from_error(&e))
            }
        };

        self.pool.release(event.slot);
        debug!(
            "{} Slot {} finished in {:?}",
            self.identity, event.slot, elapsed
        );

        self.send_reply(request.reply_address, encode_reply(&entries, &status), buffers);
        self.stats.set_state(resume);
    }

    /// Copy outputs into fresh owned segments
    fn stage_outputs(
        &self,
        outputs: Vec<OutputTensor>,
    ) -> Result<(Vec<TensorEntry>, Vec<NamedBuffer>)> {
        let mut entries = Vec::with_capacity(outputs.len());
        let mut buffers = Vec::with_capacity(outputs.len());

        for output in outputs {
            // segments created so far are unlinked on drop if this fails
            let buffer = self.buffers.create_from(&output.data)?;
            entries.push(TensorEntry {
                tensor_name: self.keys.output_key(&output.name).to_string(),
                buffer_name: buffer.name().to_string(),
                byte_len: output.data.len() as u64,
                dtype: output.dtype,
                shape: output.shape,
            });
            buffers.push(buffer);
        }

        Ok((entries, buffers))
    }

    fn handle_metadata(&mut self, reply_address: &str) {
        let inputs = self
            .backend
            .inputs()
            .into_iter()
            .map(|spec| {
                let name = self.keys.input_key(&spec.name).to_string();
                TensorSpec {
                    name,
                    dtype: spec.dtype,
                    shape: spec.shape,
                }
            })
            .collect();
        let outputs = self
            .backend
            .outputs()
            .into_iter()
            .map(|spec| {
                let name = self.keys.output_key(&spec.name).to_string();
                TensorSpec {
                    name,
                    dtype: spec.dtype,
                    shape: spec.shape,
                }
            })
            .collect();

        let reply = Envelope::MetadataReply(MetadataReplyEnvelope {
            status: ReplyStatus::Ok {
                model_version: self.identity.version,
            },
            inputs,
            outputs,
        });
        self.send_reply(PathBuf::from(reply_address), reply.encode(), Vec::new());
    }

    fn reject(&mut self, reply_address: PathBuf, err: EngineLinkError) {
        self.stats.record_rejection();
        debug!("{} PREDICT error: {}", self.identity, err);
        self.send_reply(reply_address, encode_reply(&[], &ReplyStatus::from_error(&err)), Vec::new());
    }

    fn send_reply(&mut self, address: PathBuf, payload: Bytes, outputs: Vec<NamedBuffer>) {
        self.deliveries.spawn(deliver_reply(
            self.identity.to_string(),
            address,
            payload,
            outputs,
            self.options.io_timeout,
        ));
    }
}

/// Send a reply and hand its output segments over once acknowledged
async fn deliver_reply(
    identity: String,
    address: PathBuf,
    payload: Bytes,
    outputs: Vec<NamedBuffer>,
    io_timeout: Duration,
) {
    let delivery = async {
        let mut stream = transport::send_frame(&address, &payload, io_timeout).await?;
        transport::read_ack(&mut stream).await
    };

    match delivery.await {
        Ok(()) => {
            trace!(
                "{} Reply delivered to {}, handing over {} segments",
                identity,
                address.display(),
                outputs.len()
            );
            for buffer in outputs {
                buffer.release();
            }
        }
        Err(e) => {
            METRICS.engine.reply_failures.inc();
            warn!(
                "{} Reply to {} not delivered, discarding {} output segments: {}",
                identity,
                address.display(),
                outputs.len(),
                e
            );
            drop(outputs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceBackend;
    use enginelink_common::config::{BackendKind, OutputConfig, ShmConfig, TensorConfig};
    use enginelink_common::envelope::{decode_reply, encode_request, MetadataRequestEnvelope};
    use enginelink_common::{DType, ErrorCode};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const RESNET_SHAPE: [u64; 4] = [1, 3, 224, 224];

    /// Passthrough backend whose completions wait for a gate
    struct GatedBackend {
        inputs: Vec<TensorSpec>,
        started: Arc<AtomicUsize>,
        reshapes: Arc<AtomicUsize>,
        gate: crossbeam::channel::Receiver<()>,
    }

    impl GatedBackend {
        fn new(started: Arc<AtomicUsize>, gate: crossbeam::channel::Receiver<()>) -> Self {
            Self {
                inputs: vec![TensorSpec {
                    name: "data".to_string(),
                    dtype: DType::Float32,
                    shape: RESNET_SHAPE.to_vec(),
                }],
                started,
                reshapes: Arc::new(AtomicUsize::new(0)),
                gate,
            }
        }
    }

    impl InferenceBackend for GatedBackend {
        fn inputs(&self) -> Vec<TensorSpec> {
            self.inputs.clone()
        }

        fn outputs(&self) -> Vec<TensorSpec> {
            vec![TensorSpec {
                name: "prob".to_string(),
                ..self.inputs[0].clone()
            }]
        }

        fn reshape(&mut self, shapes: &BTreeMap<String, Vec<u64>>) -> Result<()> {
            for input in &mut self.inputs {
                if let Some(shape) = shapes.get(&input.name) {
                    input.shape = shape.clone();
                }
            }
            self.reshapes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_batch_size(&mut self, _batch_size: u64) -> Result<()> {
            Ok(())
        }

        fn start_async(
            &mut self,
            _slot: usize,
            inputs: Vec<InputTensor>,
            on_complete: CompletionCallback,
        ) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.clone();
            std::thread::spawn(move || {
                let _ = gate.recv();
                let outputs = vec![OutputTensor {
                    name: "prob".to_string(),
                    dtype: inputs[0].dtype,
                    shape: inputs[0].shape.clone(),
                    data: inputs[0].data().to_vec(),
                }];
                drop(inputs);
                on_complete(Ok(outputs));
            });
            Ok(())
        }
    }

    /// Backend that fails a configurable number of times before working
    struct FaultyBackend {
        refuse_submissions: usize,
        fail_completions: usize,
    }

    impl InferenceBackend for FaultyBackend {
        fn inputs(&self) -> Vec<TensorSpec> {
            vec![TensorSpec {
                name: "data".to_string(),
                dtype: DType::Float32,
                shape: vec![1, 2],
            }]
        }

        fn outputs(&self) -> Vec<TensorSpec> {
            vec![TensorSpec {
                name: "prob".to_string(),
                dtype: DType::Float32,
                shape: vec![1, 2],
            }]
        }

        fn reshape(&mut self, _shapes: &BTreeMap<String, Vec<u64>>) -> Result<()> {
            Ok(())
        }

        fn set_batch_size(&mut self, _batch_size: u64) -> Result<()> {
            Ok(())
        }

        fn start_async(
            &mut self,
            _slot: usize,
            inputs: Vec<InputTensor>,
            on_complete: CompletionCallback,
        ) -> Result<()> {
            if self.refuse_submissions > 0 {
                self.refuse_submissions -= 1;
                return Err(EngineLinkError::BackendInference("request queue full".into()));
            }
            let fail = self.fail_completions > 0;
            if fail {
                self.fail_completions -= 1;
            }
            std::thread::spawn(move || {
                if fail {
                    on_complete(Err("device lost".to_string()));
                } else {
                    on_complete(Ok(vec![OutputTensor {
                        name: "prob".to_string(),
                        dtype: DType::Float32,
                        shape: inputs[0].shape.clone(),
                        data: inputs[0].data().to_vec(),
                    }]));
                }
            });
            Ok(())
        }
    }

    #[derive(Clone)]
    struct Client {
        buffers: BufferManager,
        socket_dir: PathBuf,
        address: PathBuf,
    }

    type Input = (&'static str, DType, Vec<u64>, Vec<u8>);

    impl Client {
        fn stage(&self, inputs: &[Input]) -> (Vec<TensorEntry>, Vec<NamedBuffer>) {
            let mut entries = Vec::new();
            let mut owned = Vec::new();
            for (key, dtype, shape, data) in inputs {
                let buffer = self.buffers.create_from(data).unwrap();
                entries.push(TensorEntry {
                    tensor_name: key.to_string(),
                    buffer_name: buffer.name().to_string(),
                    byte_len: data.len() as u64,
                    dtype: *dtype,
                    shape: shape.clone(),
                });
                owned.push(buffer);
            }
            (entries, owned)
        }

        async fn predict(self, inputs: Vec<Input>) -> (ReplyStatus, Vec<(TensorEntry, Vec<u8>)>) {
            let reply_path = transport::reply_address(&self.socket_dir);
            let listener = SocketListener::bind(&reply_path).await.unwrap();
            let (entries, owned) = self.stage(&inputs);

            let payload = encode_request(&entries, &reply_path.to_string_lossy());
            transport::send_frame(&self.address, &payload, Duration::from_secs(5))
                .await
                .unwrap();

            let mut stream = timeout(Duration::from_secs(10), listener.accept())
                .await
                .unwrap()
                .unwrap();
            let frame = transport::read_frame(&mut stream, 1 << 26).await.unwrap();
            let (tensors, status) = decode_reply(&frame).unwrap();

            let mut outputs = Vec::new();
            for entry in tensors {
                let buffer = self.buffers.adopt(&entry.buffer_name).unwrap();
                let data = buffer.as_slice().to_vec();
                buffer.unlink().unwrap();
                outputs.push((entry, data));
            }
            transport::write_ack(&mut stream).await.unwrap();
            drop(owned);

            (status, outputs)
        }

        async fn metadata(&self) -> MetadataReplyEnvelope {
            let reply_path = transport::reply_address(&self.socket_dir);
            let listener = SocketListener::bind(&reply_path).await.unwrap();
            let request = Envelope::MetadataRequest(MetadataRequestEnvelope {
                reply_address: reply_path.to_string_lossy().into_owned(),
            });
            transport::send_frame(&self.address, &request.encode(), Duration::from_secs(5))
                .await
                .unwrap();

            let mut stream = listener.accept().await.unwrap();
            let frame = transport::read_frame(&mut stream, 1 << 20).await.unwrap();
            transport::write_ack(&mut stream).await.unwrap();
            match Envelope::decode(&frame).unwrap() {
                Envelope::MetadataReply(reply) => reply,
                other => panic!("unexpected {}", other.kind()),
            }
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        shm_root: PathBuf,
        client: Client,
        stats: Arc<EngineStats>,
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<Result<()>>,
    }

    impl Harness {
        async fn start(
            backend: Box<dyn InferenceBackend>,
            mapping: KeyMapping,
            num_ireq: usize,
            reshape: ReshapePolicy,
        ) -> Self {
            Self::start_with_io_timeout(backend, mapping, num_ireq, reshape, Duration::from_secs(5))
                .await
        }

        async fn start_with_io_timeout(
            backend: Box<dyn InferenceBackend>,
            mapping: KeyMapping,
            num_ireq: usize,
            reshape: ReshapePolicy,
            io_timeout: Duration,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let shm_root = dir.path().join("shm");
            std::fs::create_dir_all(&shm_root).unwrap();
            let socket_dir = dir.path().join("sock");

            let buffers = BufferManager::new(&ShmConfig {
                root: shm_root.clone(),
                prefix: "eltest".to_string(),
            })
            .unwrap();

            let options = EngineOptions {
                num_ireq,
                reshape,
                io_timeout,
                max_frame_bytes: 1 << 20,
                socket_dir: socket_dir.clone(),
            };
            let engine = EngineProcess::start(
                ModelIdentity::new("resnet", 1),
                backend,
                &mapping,
                options,
                buffers.clone(),
            )
            .await
            .unwrap();

            let client = Client {
                buffers,
                socket_dir,
                address: engine.address().to_path_buf(),
            };
            let stats = engine.stats();
            let (shutdown, rx) = oneshot::channel::<()>();
            let handle = tokio::spawn(engine.run_until(async move {
                let _ = rx.await;
            }));

            Self {
                _dir: dir,
                shm_root,
                client,
                stats,
                shutdown,
                handle,
            }
        }

        async fn stop(self) {
            let Harness {
                _dir,
                shm_root,
                client,
                stats,
                shutdown,
                handle,
            } = self;

            let _ = shutdown.send(());
            handle.await.unwrap().unwrap();
            assert_eq!(stats.state(), EngineState::Stopped);
            assert!(!client.address.exists());
            assert_eq!(
                std::fs::read_dir(&shm_root).unwrap().count(),
                0,
                "shared-memory segments leaked"
            );
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn resnet_input(key: &'static str) -> Input {
        resnet_batch(key, RESNET_SHAPE[0])
    }

    fn resnet_batch(key: &'static str, batch: u64) -> Input {
        let shape = vec![batch, RESNET_SHAPE[1], RESNET_SHAPE[2], RESNET_SHAPE[3]];
        let len = shape.iter().product::<u64>() as usize * 4;
        (key, DType::Float32, shape, vec![7u8; len])
    }

    fn error_code(status: &ReplyStatus) -> ErrorCode {
        match status {
            ReplyStatus::Error { code, .. } => *code,
            ReplyStatus::Ok { .. } => panic!("expected an error reply"),
        }
    }

    #[tokio::test]
    async fn test_single_slot_blocks_second_request() {
        let (gate_tx, gate_rx) = crossbeam::channel::unbounded();
        let started = Arc::new(AtomicUsize::new(0));
        let backend = GatedBackend::new(Arc::clone(&started), gate_rx);
        let harness =
            Harness::start(Box::new(backend), KeyMapping::default(), 1, ReshapePolicy::Auto).await;
        let stats = Arc::clone(&harness.stats);

        let a = tokio::spawn(harness.client.clone().predict(vec![resnet_input("data")]));
        wait_until("request A to start", || started.load(Ordering::SeqCst) == 1).await;

        let b = tokio::spawn(harness.client.clone().predict(vec![resnet_input("data")]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // B waits for A's slot
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stats.acquisitions(), 1);
        assert_eq!(stats.free_slots(), 0);
        assert!(!b.is_finished());

        gate_tx.send(()).unwrap();
        let (status, outputs) = a.await.unwrap();
        assert_eq!(status, ReplyStatus::Ok { model_version: 1 });
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0.tensor_name, "prob");
        assert_eq!(outputs[0].0.shape, RESNET_SHAPE.to_vec());
        assert_eq!(outputs[0].1, resnet_input("data").3);

        wait_until("request B to start", || started.load(Ordering::SeqCst) == 2).await;
        gate_tx.send(()).unwrap();
        let (status, _) = b.await.unwrap();
        assert_eq!(status, ReplyStatus::Ok { model_version: 1 });

        assert_eq!(stats.peak_in_flight(), 1);
        assert_eq!(stats.completed(), 2);
        wait_until("slot release", || stats.free_slots() == 1).await;
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_without_slot() {
        let (_gate_tx, gate_rx) = crossbeam::channel::unbounded();
        let started = Arc::new(AtomicUsize::new(0));
        let backend = GatedBackend::new(Arc::clone(&started), gate_rx);
        let harness =
            Harness::start(Box::new(backend), KeyMapping::default(), 1, ReshapePolicy::Auto).await;

        let (status, outputs) = harness
            .client
            .clone()
            .predict(vec![resnet_input("bogus_input")])
            .await;

        assert_eq!(error_code(&status), ErrorCode::InvalidInput);
        assert!(outputs.is_empty());
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(harness.stats.acquisitions(), 0);
        assert_eq!(harness.stats.rejected(), 1);
        assert_eq!(harness.stats.free_slots(), 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_size_mismatch_rejected() {
        let backend = FaultyBackend {
            refuse_submissions: 0,
            fail_completions: 0,
        };
        let harness =
            Harness::start(Box::new(backend), KeyMapping::default(), 1, ReshapePolicy::Auto).await;

        let (status, _) = harness
            .client
            .clone()
            .predict(vec![("data", DType::Float32, vec![1, 2], vec![0u8; 5])])
            .await;
        assert_eq!(error_code(&status), ErrorCode::InvalidInput);
        assert_eq!(harness.stats.acquisitions(), 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_backend_failures_reported_and_loop_continues() {
        let backend = FaultyBackend {
            refuse_submissions: 1,
            fail_completions: 1,
        };
        let harness =
            Harness::start(Box::new(backend), KeyMapping::default(), 1, ReshapePolicy::Auto).await;
        let input = || vec![("data", DType::Float32, vec![1, 2], f32_bytes(&[0.5, 1.5]))];

        let (status, _) = harness.client.clone().predict(input()).await;
        assert_eq!(error_code(&status), ErrorCode::BackendInference);
        assert_eq!(harness.stats.free_slots(), 1);

        let (status, outputs) = harness.client.clone().predict(input()).await;
        match status {
            ReplyStatus::Error { code, message } => {
                assert_eq!(code, ErrorCode::BackendInference);
                assert!(message.contains("device lost"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(outputs.is_empty());

        let (status, outputs) = harness.client.clone().predict(input()).await;
        assert_eq!(status, ReplyStatus::Ok { model_version: 1 });
        assert_eq!(outputs[0].1, f32_bytes(&[0.5, 1.5]));

        assert_eq!(harness.stats.acquisitions(), 3);
        wait_until("slot release", || harness.stats.free_slots() == 1).await;
        harness.stop().await;
    }

    fn reference_model(reshape: ReshapePolicy) -> ModelConfig {
        let mut mapping = KeyMapping::default();
        mapping.inputs.insert("data".to_string(), "image".to_string());
        mapping.outputs.insert("prob".to_string(), "scores".to_string());
        ModelConfig {
            name: "resnet".to_string(),
            versions: vec![1],
            num_ireq: Some(2),
            reshape,
            backend: BackendKind::Scale { factor: 2.0 },
            inputs: vec![TensorConfig {
                name: "data".to_string(),
                dtype: DType::Float32,
                shape: vec![1, 4],
            }],
            outputs: vec![OutputConfig {
                name: "prob".to_string(),
                source: "data".to_string(),
            }],
            mapping,
        }
    }

    async fn reference_harness(reshape: ReshapePolicy) -> Harness {
        let model = reference_model(reshape);
        let backend = ReferenceBackend::new(&model, 2).unwrap();
        Harness::start(Box::new(backend), model.mapping.clone(), 2, reshape).await
    }

    #[tokio::test]
    async fn test_aliases_and_metadata() {
        let harness = reference_harness(ReshapePolicy::Auto).await;

        let metadata = harness.client.metadata().await;
        assert_eq!(metadata.status, ReplyStatus::Ok { model_version: 1 });
        assert_eq!(metadata.inputs[0].name, "image");
        assert_eq!(metadata.inputs[0].shape, vec![1, 4]);
        assert_eq!(metadata.outputs[0].name, "scores");

        let input = ("image", DType::Float32, vec![1, 4], f32_bytes(&[1.0, 2.0, 3.0, 4.0]));
        let (status, outputs) = harness.client.clone().predict(vec![input]).await;
        assert_eq!(status, ReplyStatus::Ok { model_version: 1 });
        assert_eq!(outputs[0].0.tensor_name, "scores");
        assert_eq!(outputs[0].1, f32_bytes(&[2.0, 4.0, 6.0, 8.0]));

        // the tensor name is not a valid key once aliased
        let input = ("data", DType::Float32, vec![1, 4], f32_bytes(&[1.0; 4]));
        let (status, _) = harness.client.clone().predict(vec![input]).await;
        assert_eq!(error_code(&status), ErrorCode::InvalidInput);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_auto_reshape() {
        let harness = reference_harness(ReshapePolicy::Auto).await;

        let input = ("image", DType::Float32, vec![2, 4], f32_bytes(&[1.0; 8]));
        let (status, outputs) = harness.client.clone().predict(vec![input]).await;
        assert_eq!(status, ReplyStatus::Ok { model_version: 1 });
        assert_eq!(outputs[0].0.shape, vec![2, 4]);

        let metadata = harness.client.metadata().await;
        assert_eq!(metadata.inputs[0].shape, vec![2, 4]);

        // rank changes are never a reshape
        let input = ("image", DType::Float32, vec![8], f32_bytes(&[1.0; 8]));
        let (status, _) = harness.client.clone().predict(vec![input]).await;
        assert_eq!(error_code(&status), ErrorCode::InvalidInput);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_batch_size_only_and_disabled() {
        let harness = reference_harness(ReshapePolicy::BatchSizeOnly).await;

        let input = ("image", DType::Float32, vec![3, 4], f32_bytes(&[1.0; 12]));
        let (status, _) = harness.client.clone().predict(vec![input]).await;
        assert_eq!(status, ReplyStatus::Ok { model_version: 1 });

        let input = ("image", DType::Float32, vec![3, 2], f32_bytes(&[1.0; 6]));
        let (status, _) = harness.client.clone().predict(vec![input]).await;
        assert_eq!(error_code(&status), ErrorCode::InvalidShape);
        harness.stop().await;

        let harness = reference_harness(ReshapePolicy::Disabled).await;
        let input = ("image", DType::Float32, vec![2, 4], f32_bytes(&[1.0; 8]));
        let (status, _) = harness.client.clone().predict(vec![input]).await;
        assert_eq!(error_code(&status), ErrorCode::InvalidShape);
        assert_eq!(harness.stats.acquisitions(), 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_unacknowledged_outputs_unlinked() {
        let harness = reference_harness(ReshapePolicy::Auto).await;
        let client = harness.client.clone();

        let reply_path = transport::reply_address(&client.socket_dir);
        let listener = SocketListener::bind(&reply_path).await.unwrap();
        let (entries, owned) = client.stage(&[(
            "image",
            DType::Float32,
            vec![1, 4],
            f32_bytes(&[1.0; 4]),
        )]);
        let payload = encode_request(&entries, &reply_path.to_string_lossy());
        transport::send_frame(&client.address, &payload, Duration::from_secs(5))
            .await
            .unwrap();

        let mut stream = listener.accept().await.unwrap();
        let frame = transport::read_frame(&mut stream, 1 << 20).await.unwrap();
        let (tensors, status) = decode_reply(&frame).unwrap();
        assert_eq!(status, ReplyStatus::Ok { model_version: 1 });
        assert!(client.buffers.exists(&tensors[0].buffer_name));

        // hang up without acknowledging
        drop(stream);
        drop(owned);

        let buffers = client.buffers.clone();
        let name = tensors[0].buffer_name.clone();
        wait_until("output unlink", move || !buffers.exists(&name)).await;
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_slot_bound_with_two_slots() {
        let (gate_tx, gate_rx) = crossbeam::channel::unbounded();
        let started = Arc::new(AtomicUsize::new(0));
        let backend = GatedBackend::new(Arc::clone(&started), gate_rx);
        let harness =
            Harness::start(Box::new(backend), KeyMapping::default(), 2, ReshapePolicy::Auto).await;
        let stats = Arc::clone(&harness.stats);

        let requests: Vec<_> = (0..3)
            .map(|_| tokio::spawn(harness.client.clone().predict(vec![resnet_input("data")])))
            .collect();
        wait_until("two requests to start", || started.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // the third request waits for a slot
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(stats.free_slots(), 0);
        assert_eq!(stats.in_flight(), 2);

        gate_tx.send(()).unwrap();
        wait_until("third request to start", || started.load(Ordering::SeqCst) == 3).await;
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();

        for request in requests {
            let (status, outputs) = request.await.unwrap();
            assert_eq!(status, ReplyStatus::Ok { model_version: 1 });
            assert_eq!(outputs.len(), 1);
        }
        assert_eq!(stats.peak_in_flight(), 2);
        assert_eq!(stats.completed(), 3);
        wait_until("slot release", || stats.free_slots() == 2).await;
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_reshape_waits_for_inflight_requests() {
        let (gate_tx, gate_rx) = crossbeam::channel::unbounded();
        let started = Arc::new(AtomicUsize::new(0));
        let backend = GatedBackend::new(Arc::clone(&started), gate_rx);
        let reshapes = Arc::clone(&backend.reshapes);
        let harness =
            Harness::start(Box::new(backend), KeyMapping::default(), 2, ReshapePolicy::Auto).await;
        let stats = Arc::clone(&harness.stats);

        let a = tokio::spawn(harness.client.clone().predict(vec![resnet_input("data")]));
        let b = tokio::spawn(harness.client.clone().predict(vec![resnet_input("data")]));
        wait_until("old-shape requests to start", || started.load(Ordering::SeqCst) == 2).await;

        let c = tokio::spawn(harness.client.clone().predict(vec![resnet_batch("data", 2)]));
        wait_until("reshape to be pending", || stats.state() == EngineState::Reshaping).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reshapes.load(Ordering::SeqCst), 0);
        assert_eq!(started.load(Ordering::SeqCst), 2);

        // one old-shape inference finishing is not enough
        gate_tx.send(()).unwrap();
        wait_until("first completion", || stats.completed() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reshapes.load(Ordering::SeqCst), 0);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(stats.state(), EngineState::Reshaping);

        gate_tx.send(()).unwrap();
        wait_until("reshape", || reshapes.load(Ordering::SeqCst) == 1).await;
        wait_until("new-shape request to start", || started.load(Ordering::SeqCst) == 3).await;
        gate_tx.send(()).unwrap();

        for request in [a, b] {
            let (status, outputs) = request.await.unwrap();
            assert_eq!(status, ReplyStatus::Ok { model_version: 1 });
            assert_eq!(outputs[0].0.shape, RESNET_SHAPE.to_vec());
        }
        let (status, outputs) = c.await.unwrap();
        assert_eq!(status, ReplyStatus::Ok { model_version: 1 });
        assert_eq!(outputs[0].0.shape, vec![2, 3, 224, 224]);
        assert_eq!(stats.peak_in_flight(), 2);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_slow_acknowledgement_keeps_outputs() {
        let model = reference_model(ReshapePolicy::Auto);
        let backend = ReferenceBackend::new(&model, 2).unwrap();
        let harness = Harness::start_with_io_timeout(
            Box::new(backend),
            model.mapping.clone(),
            2,
            ReshapePolicy::Auto,
            Duration::from_millis(100),
        )
        .await;
        let client = harness.client.clone();

        let reply_path = transport::reply_address(&client.socket_dir);
        let listener = SocketListener::bind(&reply_path).await.unwrap();
        let (entries, owned) = client.stage(&[(
            "image",
            DType::Float32,
            vec![1, 4],
            f32_bytes(&[1.0; 4]),
        )]);
        let payload = encode_request(&entries, &reply_path.to_string_lossy());
        transport::send_frame(&client.address, &payload, Duration::from_secs(5))
            .await
            .unwrap();

        let mut stream = listener.accept().await.unwrap();
        let frame = transport::read_frame(&mut stream, 1 << 20).await.unwrap();
        let (tensors, _) = decode_reply(&frame).unwrap();
        let output = client.buffers.adopt(&tensors[0].buffer_name).unwrap();

        // acknowledge well after the engine's I/O timeout
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(client.buffers.exists(output.name()));
        transport::write_ack(&mut stream).await.unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(client.buffers.exists(output.name()));
        output.unlink().unwrap();
        drop(owned);
        harness.stop().await;
    }
}
