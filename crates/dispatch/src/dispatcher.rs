//! Dispatch front-end
//!
//! Translates external predict, metadata and status requests into engine
//! envelopes and back. Input tensors are copied into fresh shared-memory
//! segments owned by the dispatcher; the engine only attaches them. Output
//! segments are created by the engine and adopted here before the reply is
//! acknowledged. Every segment either side created for a request is
//! unlinked exactly once, by the dispatcher on success and on every error
//! path, or by the engine when its reply is never acknowledged.

use crate::convert;
use crate::engine_client::{EngineClient, ReplyChannel};
use crate::registry::{ModelRegistry, ResolvedEngine};
use enginelink_common::envelope::{decode_reply, encode_request, MetadataRequestEnvelope};
use enginelink_common::transport;
use enginelink_common::{
    BufferManager, EngineLinkConfig, EngineLinkError, Envelope, NamedBuffer, Result, TensorEntry,
    TensorSpec, METRICS,
};
use enginelink_proto::{
    GetModelMetadataResponse, GetModelStatusResponse, ModelSpec, PredictRequest, PredictResponse,
    TensorInfo, TensorProto,
};
use prometheus::IntGauge;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Front-end handle shared by all request handlers
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ModelRegistry,
    buffers: BufferManager,
    socket_dir: PathBuf,
    request_timeout: Duration,
    io_timeout: Duration,
    max_frame_bytes: usize,
}

impl Dispatcher {
    pub fn new(config: &EngineLinkConfig, registry: ModelRegistry, buffers: BufferManager) -> Self {
        Self {
            registry,
            buffers,
            socket_dir: config.socket_dir.clone(),
            request_timeout: config.request_timeout(),
            io_timeout: Duration::from_millis(config.dispatch.io_timeout_ms),
            max_frame_bytes: config.engine.max_frame_bytes,
        }
    }

    /// Override the reply deadline
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Predict entry point for gRPC/REST handlers
    pub async fn predict_status(
        &self,
        request: PredictRequest,
    ) -> std::result::Result<PredictResponse, tonic::Status> {
        self.predict(request).await.map_err(|e| e.to_status())
    }

    /// Run one prediction on the engine serving the requested model version
    pub async fn predict(&self, request: PredictRequest) -> Result<PredictResponse> {
        let start = Instant::now();
        METRICS.dispatch.requests_total.inc();
        let active = ActiveRequest::enter(&METRICS.dispatch.active_requests);

        let result = self.run_predict(request).await;

        drop(active);
        METRICS
            .dispatch
            .request_duration
            .observe(start.elapsed().as_secs_f64());
        match &result {
            Ok(_) => METRICS.dispatch.requests_success.inc(),
            Err(e) => {
                METRICS.dispatch.requests_failed.inc();
                debug!("PREDICT error: {}", e);
            }
        }
        result
    }

    async fn run_predict(&self, request: PredictRequest) -> Result<PredictResponse> {
        let PredictRequest {
            model_spec,
            inputs,
            output_filter,
        } = request;
        let engine = self
            .registry
            .resolve(&model_spec.name, model_spec.version)
            .await?;

        // Validate everything before the first segment is created
        let mut staged = Vec::with_capacity(inputs.len());
        for (key, tensor) in &inputs {
            let (dtype, shape) = convert::input_metadata(key, tensor)?;
            staged.push((key, tensor, dtype, shape));
        }

        // Owned input segments, unlinked when this function returns
        let mut input_buffers = Vec::with_capacity(staged.len());
        let mut entries = Vec::with_capacity(staged.len());
        for (key, tensor, dtype, shape) in staged {
            let buffer = self.buffers.create_from(&tensor.tensor_content)?;
            entries.push(TensorEntry {
                tensor_name: key.clone(),
                buffer_name: buffer.name().to_string(),
                byte_len: tensor.tensor_content.len() as u64,
                dtype,
                shape,
            });
            input_buffers.push(buffer);
        }

        let reply = ReplyChannel::open(&self.socket_dir).await?;
        let payload = encode_request(&entries, reply.address());
        let client = EngineClient::new(&engine.address, self.io_timeout);

        let (frame, mut stream) = self
            .with_deadline(&engine, async {
                client.send(&payload).await?;
                reply.receive(self.max_frame_bytes).await
            })
            .await?;

        let (tensors, status) = decode_reply(&frame)?;
        let outputs = self.take_outputs(tensors, &mut stream).await;
        drop(reply);

        let model_version = status.into_result()?;
        let outputs = outputs?;

        let mut response_outputs = HashMap::with_capacity(outputs.len());
        for (entry, buffer) in outputs {
            if !output_filter.is_empty() && !output_filter.contains(&entry.tensor_name) {
                discard(buffer);
                continue;
            }
            let tensor = TensorProto::new(
                convert::data_type(entry.dtype),
                entry.shape.iter().map(|&d| d as i64).collect(),
                buffer.as_slice()[..entry.byte_len as usize].to_vec(),
            );
            discard(buffer);
            response_outputs.insert(entry.tensor_name, tensor);
        }

        for buffer in input_buffers {
            discard(buffer);
        }

        if let Some(missing) = output_filter
            .iter()
            .find(|name| !response_outputs.contains_key(*name))
        {
            return Err(EngineLinkError::invalid_input(format!(
                "Requested output {} is not produced by model {}",
                missing, engine.model_name
            )));
        }

        Ok(PredictResponse {
            model_spec: ModelSpec::new(engine.model_name, Some(model_version)),
            outputs: response_outputs,
        })
    }

    /// Adopt every output segment, then acknowledge the reply
    ///
    /// The acknowledgement is sent even when an output is missing so the
    /// engine does not unlink the segments that were adopted.
    async fn take_outputs(
        &self,
        tensors: Vec<TensorEntry>,
        stream: &mut UnixStream,
    ) -> Result<Vec<(TensorEntry, NamedBuffer)>> {
        let mut adopted = Vec::with_capacity(tensors.len());
        let mut failure = None;

        for entry in tensors {
            match self.buffers.adopt(&entry.buffer_name) {
                Ok(buffer) => adopted.push((entry, buffer)),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        // Until the engine reads the ACK it still owns the outputs and
        // unlinks them when the stream closes
        if let Err(e) = timeout(self.io_timeout, transport::write_ack(stream))
            .await
            .unwrap_or_else(|_| Err(EngineLinkError::timeout("acknowledging reply")))
        {
            warn!("Failed to acknowledge engine reply: {}", e);
            for (_, buffer) in adopted {
                buffer.release();
            }
            return Err(EngineLinkError::Connection(format!(
                "reply not acknowledged: {}",
                e
            )));
        }

        let mut outputs = Vec::with_capacity(adopted.len());
        for (entry, buffer) in adopted {
            if (buffer.len() as u64) < entry.byte_len {
                failure.get_or_insert(EngineLinkError::internal(format!(
                    "output {} declares {} bytes, segment holds {}",
                    entry.tensor_name,
                    entry.byte_len,
                    buffer.len()
                )));
                discard(buffer);
            } else {
                outputs.push((entry, buffer));
            }
        }

        match failure {
            Some(e) => {
                outputs.into_iter().for_each(|(_, buffer)| discard(buffer));
                Err(e)
            }
            None => Ok(outputs),
        }
    }

    /// Model signature as currently configured in the engine
    pub async fn model_metadata(&self, model_spec: &ModelSpec) -> Result<GetModelMetadataResponse> {
        let engine = self
            .registry
            .resolve(&model_spec.name, model_spec.version)
            .await?;

        let reply = ReplyChannel::open(&self.socket_dir).await?;
        let request = Envelope::MetadataRequest(MetadataRequestEnvelope {
            reply_address: reply.address().to_string(),
        });
        let client = EngineClient::new(&engine.address, self.io_timeout);

        let (frame, mut stream) = self
            .with_deadline(&engine, async {
                client.send(&request.encode()).await?;
                reply.receive(self.max_frame_bytes).await
            })
            .await?;
        if let Err(e) = transport::write_ack(&mut stream).await {
            warn!("Failed to acknowledge metadata reply: {}", e);
        }

        let metadata = match Envelope::decode(&frame)? {
            Envelope::MetadataReply(metadata) => metadata,
            other => {
                return Err(EngineLinkError::malformed(format!(
                    "expected metadata reply, got {}",
                    other.kind()
                )))
            }
        };
        let version = metadata.status.into_result()?;

        let into_map = |specs: Vec<TensorSpec>| -> BTreeMap<String, TensorInfo> {
            specs
                .into_iter()
                .map(|spec| (spec.name.clone(), convert::tensor_info(spec)))
                .collect()
        };
        Ok(GetModelMetadataResponse {
            model_spec: ModelSpec::new(engine.model_name, Some(version)),
            inputs: into_map(metadata.inputs),
            outputs: into_map(metadata.outputs),
        })
    }

    /// Lifecycle state of a model's versions
    pub async fn model_status(&self, model_spec: &ModelSpec) -> Result<GetModelStatusResponse> {
        self.registry
            .status(&model_spec.name, model_spec.version)
            .await
    }

    /// Bound an exchange by the request timeout
    async fn with_deadline<T, F>(&self, engine: &ResolvedEngine, exchange: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                METRICS.dispatch.requests_timed_out.inc();
                warn!(
                    "[model: {}, version: {}] No reply within {:?}",
                    engine.model_name, engine.version, self.request_timeout
                );
                Err(EngineLinkError::timeout(format!(
                    "no reply from model {} version {} within {:?}",
                    engine.model_name, engine.version, self.request_timeout
                )))
            }
        }
    }
}

/// Counts a request as active until dropped, including when its future is cancelled
struct ActiveRequest<'a>(&'a IntGauge);

impl<'a> ActiveRequest<'a> {
    fn enter(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Unlink an owned segment, logging a failed unlink instead of failing the request
fn discard(buffer: NamedBuffer) {
    let name = buffer.name().to_string();
    if let Err(e) = buffer.unlink() {
        warn!("Failed to unlink segment {}: {}", name, e);
    }
}
