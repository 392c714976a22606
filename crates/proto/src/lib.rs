//! EngineLink external protocol types
//!
//! These mirror the TensorFlow Serving `PredictionService` and
//! `ModelService` messages that gRPC and REST front-ends hand to the
//! dispatch layer. Tensor payloads travel as raw little-endian bytes
//! (`tensor_content`), exactly as TensorFlow Serving encodes them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Identifies a served model and, optionally, one of its versions.
///
/// A missing version (or version 0) asks for the newest available one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, version: Option<i64>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// TensorFlow `DataType` subset accepted by the serving backend.
///
/// Discriminants follow `tensorflow/core/framework/types.proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "DT_FLOAT")]
    DtFloat = 1,
    #[serde(rename = "DT_DOUBLE")]
    DtDouble = 2,
    #[serde(rename = "DT_INT32")]
    DtInt32 = 3,
    #[serde(rename = "DT_UINT8")]
    DtUint8 = 4,
    #[serde(rename = "DT_INT16")]
    DtInt16 = 5,
    #[serde(rename = "DT_INT8")]
    DtInt8 = 6,
    #[serde(rename = "DT_STRING")]
    DtString = 7,
    #[serde(rename = "DT_INT64")]
    DtInt64 = 9,
    #[serde(rename = "DT_BOOL")]
    DtBool = 10,
    #[serde(rename = "DT_UINT16")]
    DtUint16 = 17,
    #[serde(rename = "DT_HALF")]
    DtHalf = 19,
}

impl DataType {
    /// Size of one element in bytes, `None` for variable-length strings
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DataType::DtFloat | DataType::DtInt32 => Some(4),
            DataType::DtDouble | DataType::DtInt64 => Some(8),
            DataType::DtInt16 | DataType::DtUint16 | DataType::DtHalf => Some(2),
            DataType::DtUint8 | DataType::DtInt8 | DataType::DtBool => Some(1),
            DataType::DtString => None,
        }
    }
}

/// Tensor dimensions. Negative values are never valid in a predict request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub dims: Vec<i64>,
}

/// A tensor as carried by the external protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorProto {
    pub dtype: DataType,
    pub tensor_shape: TensorShape,
    #[serde(default)]
    pub tensor_content: Vec<u8>,
}

impl TensorProto {
    /// Create a tensor from its dtype, dimensions and raw content
    pub fn new(dtype: DataType, dims: Vec<i64>, tensor_content: Vec<u8>) -> Self {
        Self {
            dtype,
            tensor_shape: TensorShape { dims },
            tensor_content,
        }
    }

    /// Build a `DT_FLOAT` tensor from native values
    pub fn from_f32(dims: Vec<i64>, values: &[f32]) -> Self {
        let content = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DataType::DtFloat, dims, content)
    }

    /// Decode `DT_FLOAT` content; `None` for other dtypes or ragged content
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.dtype != DataType::DtFloat || self.tensor_content.len() % 4 != 0 {
            return None;
        }
        Some(
            self.tensor_content
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub model_spec: ModelSpec,
    pub inputs: HashMap<String, TensorProto>,
    /// Restrict the response to these outputs; empty means all of them.
    #[serde(default)]
    pub output_filter: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub model_spec: ModelSpec,
    pub outputs: HashMap<String, TensorProto>,
}

/// Lifecycle state of one model version, as reported by `GetModelStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelVersionState {
    Start,
    Loading,
    Available,
    Unloading,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusProto {
    pub error_code: i32,
    pub error_message: String,
}

impl StatusProto {
    pub fn ok() -> Self {
        Self {
            error_code: 0,
            error_message: "OK".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersionStatus {
    pub version: i64,
    pub state: ModelVersionState,
    pub status: StatusProto,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetModelStatusResponse {
    pub model_version_status: Vec<ModelVersionStatus>,
}

/// Signature entry for one input or output tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DataType,
    pub tensor_shape: TensorShape,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetModelMetadataResponse {
    pub model_spec: ModelSpec,
    pub inputs: BTreeMap<String, TensorInfo>,
    pub outputs: BTreeMap<String, TensorInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_content_roundtrip() {
        let tensor = TensorProto::from_f32(vec![2, 2], &[1.0, -2.5, 3.0, 4.25]);
        assert_eq!(tensor.tensor_content.len(), 16);
        assert_eq!(tensor.to_f32().unwrap(), vec![1.0, -2.5, 3.0, 4.25]);
    }

    #[test]
    fn test_to_f32_rejects_other_dtypes() {
        let tensor = TensorProto::new(DataType::DtInt32, vec![1], vec![0, 0, 0, 0]);
        assert!(tensor.to_f32().is_none());
    }

    #[test]
    fn test_dtype_json_names() {
        let json = serde_json::to_string(&DataType::DtFloat).unwrap();
        assert_eq!(json, "\"DT_FLOAT\"");

        let state: ModelVersionState = serde_json::from_str("\"AVAILABLE\"").unwrap();
        assert_eq!(state, ModelVersionState::Available);
    }

    #[test]
    fn test_model_spec_without_version() {
        let spec: ModelSpec = serde_json::from_str(r#"{"name":"resnet"}"#).unwrap();
        assert_eq!(spec, ModelSpec::new("resnet", None));
    }
}
