//! Conversion between external protocol tensors and envelope metadata

use enginelink_common::envelope::dense_byte_len;
use enginelink_common::{DType, EngineLinkError, Result, TensorSpec};
use enginelink_proto::{DataType, TensorInfo, TensorProto, TensorShape};

pub fn dtype(data_type: DataType) -> DType {
    match data_type {
        DataType::DtFloat => DType::Float32,
        DataType::DtDouble => DType::Float64,
        DataType::DtHalf => DType::Float16,
        DataType::DtInt8 => DType::Int8,
        DataType::DtInt16 => DType::Int16,
        DataType::DtInt32 => DType::Int32,
        DataType::DtInt64 => DType::Int64,
        DataType::DtUint8 => DType::UInt8,
        DataType::DtUint16 => DType::UInt16,
        DataType::DtBool => DType::Bool,
        DataType::DtString => DType::Bytes,
    }
}

pub fn data_type(dtype: DType) -> DataType {
    match dtype {
        DType::Float32 => DataType::DtFloat,
        DType::Float64 => DataType::DtDouble,
        DType::Float16 => DataType::DtHalf,
        DType::Int8 => DataType::DtInt8,
        DType::Int16 => DataType::DtInt16,
        DType::Int32 => DataType::DtInt32,
        DType::Int64 => DataType::DtInt64,
        DType::UInt8 => DataType::DtUint8,
        DType::UInt16 => DataType::DtUint16,
        DType::Bool => DataType::DtBool,
        DType::Bytes => DataType::DtString,
    }
}

/// Dimensions of an incoming tensor; negative sizes are rejected
pub fn shape(key: &str, shape: &TensorShape) -> Result<Vec<u64>> {
    shape
        .dims
        .iter()
        .map(|&dim| {
            u64::try_from(dim).map_err(|_| {
                EngineLinkError::invalid_input(format!(
                    "input {} has negative dimension in {:?}",
                    key, shape.dims
                ))
            })
        })
        .collect()
}

pub fn tensor_shape(dims: &[u64]) -> TensorShape {
    TensorShape {
        dims: dims.iter().map(|&d| d as i64).collect(),
    }
}

/// Validate an incoming tensor and return its envelope dtype and shape
///
/// Content must be dense: element count times element size. String tensors
/// travel as one byte per element.
pub fn input_metadata(key: &str, tensor: &TensorProto) -> Result<(DType, Vec<u64>)> {
    let dtype = dtype(tensor.dtype);
    let dims = shape(key, &tensor.tensor_shape)?;

    let expected = dense_byte_len(dtype, &dims).ok_or_else(|| {
        EngineLinkError::invalid_input(format!("input {} shape {:?} overflows", key, dims))
    })?;
    if expected != tensor.tensor_content.len() as u64 {
        return Err(EngineLinkError::invalid_input(format!(
            "input {} carries {} bytes, {:?} of {:?} needs {}",
            key,
            tensor.tensor_content.len(),
            dims,
            tensor.dtype,
            expected
        )));
    }

    Ok((dtype, dims))
}

pub fn tensor_info(spec: TensorSpec) -> TensorInfo {
    TensorInfo {
        tensor_shape: tensor_shape(&spec.shape),
        dtype: data_type(spec.dtype),
        name: spec.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_mapping_is_bijective() {
        for dt in [
            DataType::DtFloat,
            DataType::DtDouble,
            DataType::DtHalf,
            DataType::DtInt8,
            DataType::DtInt16,
            DataType::DtInt32,
            DataType::DtInt64,
            DataType::DtUint8,
            DataType::DtUint16,
            DataType::DtBool,
            DataType::DtString,
        ] {
            assert_eq!(data_type(dtype(dt)), dt);
            if let Some(size) = dt.element_size() {
                assert_eq!(dtype(dt).size(), size);
            }
        }
    }

    #[test]
    fn test_input_metadata() {
        let tensor = TensorProto::from_f32(vec![1, 3], &[1.0, 2.0, 3.0]);
        assert_eq!(
            input_metadata("data", &tensor).unwrap(),
            (DType::Float32, vec![1, 3])
        );

        let short = TensorProto::new(DataType::DtFloat, vec![1, 3], vec![0; 8]);
        assert!(matches!(
            input_metadata("data", &short),
            Err(EngineLinkError::InvalidInput(_))
        ));

        let negative = TensorProto::new(DataType::DtFloat, vec![-1, 3], vec![0; 12]);
        assert!(input_metadata("data", &negative).is_err());

        let text = TensorProto::new(DataType::DtString, vec![5], b"hello".to_vec());
        assert_eq!(input_metadata("text", &text).unwrap(), (DType::Bytes, vec![5]));

        let empty = TensorProto::new(DataType::DtInt32, vec![0, 4], Vec::new());
        assert_eq!(input_metadata("ids", &empty).unwrap(), (DType::Int32, vec![0, 4]));
    }
}
