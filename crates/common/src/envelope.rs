//! Predict envelope wire codec
//!
//! An envelope is the only thing that travels over the engine sockets. It
//! describes tensors by reference: each entry names the shared-memory buffer
//! holding the bytes, plus the dtype and shape needed to interpret them. No
//! tensor data is ever embedded.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header   := magic "ELNK" | version u8 | kind u8
//! string   := len u32 | utf-8 bytes
//! shape    := ndim u32 | dim u64 * ndim
//! entry    := tensor_name string | buffer_name string | byte_len u64 | dtype u8 | shape
//! spec     := name string | dtype u8 | shape
//! status   := code u8 (0 = OK) | model_version i64 | message string
//!
//! kind 1 predict request  := reply_address string | count u32 | entry * count
//! kind 2 predict reply    := status | count u32 | entry * count
//! kind 3 metadata request := reply_address string
//! kind 4 metadata reply   := status | count u32 | spec * count | count u32 | spec * count
//! ```
//!
//! Decoding rejects truncated input, trailing bytes, unknown kinds, unknown
//! dtype tags and unknown status codes.

use crate::error::{EngineLinkError, ErrorCode, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAGIC: [u8; 4] = *b"ELNK";
const VERSION: u8 = 1;

const KIND_PREDICT_REQUEST: u8 = 1;
const KIND_PREDICT_REPLY: u8 = 2;
const KIND_METADATA_REQUEST: u8 = 3;
const KIND_METADATA_REPLY: u8 = 4;

const MAX_STRING_LEN: usize = 64 * 1024;
const MAX_DIMS: usize = 64;

/// Element type of a tensor, matching the set the inference backend accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DType {
    Float32 = 1,
    Float64 = 2,
    Float16 = 3,
    Int8 = 4,
    Int16 = 5,
    Int32 = 6,
    Int64 = 7,
    UInt8 = 8,
    UInt16 = 9,
    Bool = 10,
    /// Raw bytes / strings, one byte per element
    Bytes = 11,
}

impl DType {
    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            DType::Float64 | DType::Int64 => 8,
            DType::Float32 | DType::Int32 => 4,
            DType::Float16 | DType::Int16 | DType::UInt16 => 2,
            DType::Int8 | DType::UInt8 | DType::Bool | DType::Bytes => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        let dtype = match tag {
            1 => DType::Float32,
            2 => DType::Float64,
            3 => DType::Float16,
            4 => DType::Int8,
            5 => DType::Int16,
            6 => DType::Int32,
            7 => DType::Int64,
            8 => DType::UInt8,
            9 => DType::UInt16,
            10 => DType::Bool,
            11 => DType::Bytes,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Number of bytes a dense tensor of this shape and dtype occupies
pub fn dense_byte_len(dtype: DType, shape: &[u64]) -> Option<u64> {
    shape
        .iter()
        .try_fold(dtype.size() as u64, |acc, &dim| acc.checked_mul(dim))
}

/// Reference to one tensor held in a named shared-memory buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorEntry {
    pub tensor_name: String,
    pub buffer_name: String,
    pub byte_len: u64,
    pub dtype: DType,
    pub shape: Vec<u64>,
}

/// Signature of one model input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u64>,
}

/// Outcome carried by reply envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Served by this model version
    Ok { model_version: i64 },
    Error { code: ErrorCode, message: String },
}

impl ReplyStatus {
    pub fn from_error(err: &EngineLinkError) -> Self {
        ReplyStatus::Error {
            code: err.code(),
            message: err.message(),
        }
    }

    /// Turn an error status back into the error it describes
    pub fn into_result(self) -> Result<i64> {
        match self {
            ReplyStatus::Ok { model_version } => Ok(model_version),
            ReplyStatus::Error { code, message } => Err(EngineLinkError::from_wire(code, message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictRequestEnvelope {
    pub reply_address: String,
    pub tensors: Vec<TensorEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictReplyEnvelope {
    pub status: ReplyStatus,
    pub tensors: Vec<TensorEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequestEnvelope {
    pub reply_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataReplyEnvelope {
    pub status: ReplyStatus,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

/// Any message exchanged with an engine process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    PredictRequest(PredictRequestEnvelope),
    PredictReply(PredictReplyEnvelope),
    MetadataRequest(MetadataRequestEnvelope),
    MetadataReply(MetadataReplyEnvelope),
}

impl Envelope {
    /// Serialize into one frame payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);

        match self {
            Envelope::PredictRequest(req) => {
                buf.put_u8(KIND_PREDICT_REQUEST);
                put_string(&mut buf, &req.reply_address);
                put_entries(&mut buf, &req.tensors);
            }
            Envelope::PredictReply(reply) => {
                buf.put_u8(KIND_PREDICT_REPLY);
                put_status(&mut buf, &reply.status);
                put_entries(&mut buf, &reply.tensors);
            }
            Envelope::MetadataRequest(req) => {
                buf.put_u8(KIND_METADATA_REQUEST);
                put_string(&mut buf, &req.reply_address);
            }
            Envelope::MetadataReply(reply) => {
                buf.put_u8(KIND_METADATA_REPLY);
                put_status(&mut buf, &reply.status);
                put_specs(&mut buf, &reply.inputs);
                put_specs(&mut buf, &reply.outputs);
            }
        }

        buf.freeze()
    }

    /// Parse one frame payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader { buf: data };

        let magic = reader.take(MAGIC.len(), "magic")?;
        if magic != MAGIC {
            return Err(EngineLinkError::malformed("bad magic"));
        }
        let version = reader.u8("version")?;
        if version != VERSION {
            return Err(EngineLinkError::malformed(format!(
                "unsupported envelope version {}",
                version
            )));
        }

        let envelope = match reader.u8("kind")? {
            KIND_PREDICT_REQUEST => Envelope::PredictRequest(PredictRequestEnvelope {
                reply_address: reader.string("reply address")?,
                tensors: reader.entries()?,
            }),
            KIND_PREDICT_REPLY => Envelope::PredictReply(PredictReplyEnvelope {
                status: reader.status()?,
                tensors: reader.entries()?,
            }),
            KIND_METADATA_REQUEST => Envelope::MetadataRequest(MetadataRequestEnvelope {
                reply_address: reader.string("reply address")?,
            }),
            KIND_METADATA_REPLY => Envelope::MetadataReply(MetadataReplyEnvelope {
                status: reader.status()?,
                inputs: reader.specs()?,
                outputs: reader.specs()?,
            }),
            other => {
                return Err(EngineLinkError::malformed(format!(
                    "unknown envelope kind {}",
                    other
                )))
            }
        };

        if reader.buf.has_remaining() {
            return Err(EngineLinkError::malformed(format!(
                "{} trailing bytes",
                reader.buf.remaining()
            )));
        }

        Ok(envelope)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::PredictRequest(_) => "predict request",
            Envelope::PredictReply(_) => "predict reply",
            Envelope::MetadataRequest(_) => "metadata request",
            Envelope::MetadataReply(_) => "metadata reply",
        }
    }
}

/// Encode a predict request referencing already materialized buffers
pub fn encode_request(tensors: &[TensorEntry], reply_address: &str) -> Bytes {
    Envelope::PredictRequest(PredictRequestEnvelope {
        reply_address: reply_address.to_string(),
        tensors: tensors.to_vec(),
    })
    .encode()
}

/// Decode a predict request into its tensor entries and reply address
pub fn decode_request(data: &[u8]) -> Result<(Vec<TensorEntry>, String)> {
    match Envelope::decode(data)? {
        Envelope::PredictRequest(req) => Ok((req.tensors, req.reply_address)),
        other => Err(EngineLinkError::malformed(format!(
            "expected predict request, got {}",
            other.kind()
        ))),
    }
}

/// Encode a predict reply
pub fn encode_reply(tensors: &[TensorEntry], status: &ReplyStatus) -> Bytes {
    Envelope::PredictReply(PredictReplyEnvelope {
        status: status.clone(),
        tensors: tensors.to_vec(),
    })
    .encode()
}

/// Decode a predict reply into its tensor entries and status
pub fn decode_reply(data: &[u8]) -> Result<(Vec<TensorEntry>, ReplyStatus)> {
    match Envelope::decode(data)? {
        Envelope::PredictReply(reply) => Ok((reply.tensors, reply.status)),
        other => Err(EngineLinkError::malformed(format!(
            "expected predict reply, got {}",
            other.kind()
        ))),
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_shape(buf: &mut BytesMut, shape: &[u64]) {
    buf.put_u32_le(shape.len() as u32);
    for &dim in shape {
        buf.put_u64_le(dim);
    }
}

fn put_entries(buf: &mut BytesMut, entries: &[TensorEntry]) {
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        put_string(buf, &entry.tensor_name);
        put_string(buf, &entry.buffer_name);
        buf.put_u64_le(entry.byte_len);
        buf.put_u8(entry.dtype.tag());
        put_shape(buf, &entry.shape);
    }
}

fn put_specs(buf: &mut BytesMut, specs: &[TensorSpec]) {
    buf.put_u32_le(specs.len() as u32);
    for spec in specs {
        put_string(buf, &spec.name);
        buf.put_u8(spec.dtype.tag());
        put_shape(buf, &spec.shape);
    }
}

fn put_status(buf: &mut BytesMut, status: &ReplyStatus) {
    match status {
        ReplyStatus::Ok { model_version } => {
            buf.put_u8(0);
            buf.put_i64_le(*model_version);
            put_string(buf, "");
        }
        ReplyStatus::Error { code, message } => {
            buf.put_u8(*code as u8);
            buf.put_i64_le(0);
            put_string(buf, message);
        }
    }
}

/// Bounds-checked cursor over an encoded envelope
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(EngineLinkError::malformed(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        self.ensure(len, what)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.ensure(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.ensure(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.ensure(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self, what: &str) -> Result<i64> {
        self.ensure(8, what)?;
        Ok(self.buf.get_i64_le())
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let len = self.u32(what)? as usize;
        if len > MAX_STRING_LEN {
            return Err(EngineLinkError::malformed(format!(
                "{} length {} exceeds limit",
                what, len
            )));
        }
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| EngineLinkError::malformed(format!("{} is not valid UTF-8", what)))
    }

    fn dtype(&mut self) -> Result<DType> {
        let tag = self.u8("dtype")?;
        DType::from_tag(tag)
            .ok_or_else(|| EngineLinkError::malformed(format!("unknown dtype tag {}", tag)))
    }

    fn shape(&mut self) -> Result<Vec<u64>> {
        let ndim = self.u32("shape rank")? as usize;
        if ndim > MAX_DIMS {
            return Err(EngineLinkError::malformed(format!("shape rank {} exceeds limit", ndim)));
        }
        self.ensure(ndim * 8, "shape")?;
        (0..ndim).map(|_| self.u64("dimension")).collect()
    }

    /// Read an element count, refusing counts the remaining bytes cannot hold
    fn count(&mut self, what: &str, min_item_len: usize) -> Result<usize> {
        let count = self.u32(what)? as usize;
        if count.saturating_mul(min_item_len) > self.buf.remaining() {
            return Err(EngineLinkError::malformed(format!(
                "truncated {}: {} items announced",
                what, count
            )));
        }
        Ok(count)
    }

    fn entries(&mut self) -> Result<Vec<TensorEntry>> {
        // two strings + byte_len + dtype + rank
        let count = self.count("tensor entries", 4 + 4 + 8 + 1 + 4)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(TensorEntry {
                tensor_name: self.string("tensor name")?,
                buffer_name: self.string("buffer name")?,
                byte_len: self.u64("byte length")?,
                dtype: self.dtype()?,
                shape: self.shape()?,
            });
        }
        Ok(entries)
    }

    fn specs(&mut self) -> Result<Vec<TensorSpec>> {
        let count = self.count("tensor specs", 4 + 1 + 4)?;
        let mut specs = Vec::with_capacity(count);
        for _ in 0..count {
            specs.push(TensorSpec {
                name: self.string("tensor name")?,
                dtype: self.dtype()?,
                shape: self.shape()?,
            });
        }
        Ok(specs)
    }

    fn status(&mut self) -> Result<ReplyStatus> {
        let code = self.u8("status code")?;
        let model_version = self.i64("model version")?;
        let message = self.string("status message")?;
        if code == 0 {
            return Ok(ReplyStatus::Ok { model_version });
        }
        let code = ErrorCode::from_u8(code)
            .ok_or_else(|| EngineLinkError::malformed(format!("unknown status code {}", code)))?;
        Ok(ReplyStatus::Error { code, message })
    }
}
