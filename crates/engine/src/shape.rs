//! Input shape adjustment
//!
//! Before a request is submitted its input shapes are compared with the
//! network signature. Depending on the model's reshape policy a mismatch
//! either triggers a network reshape, a batch size change, or a rejection.
//! Dtype and rank mismatches are always rejected.

use enginelink_common::config::ReshapePolicy;
use enginelink_common::{DType, EngineLinkError, Result, TensorSpec};
use std::collections::BTreeMap;

/// What the network needs before a request can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeAdjustment {
    /// Network already matches
    None,
    /// New shapes for the listed inputs
    Reshape(BTreeMap<String, Vec<u64>>),
    /// New leading dimension for every input
    BatchSize(u64),
}

/// Shape of one request input, addressed by tensor name
#[derive(Debug, Clone, Copy)]
pub struct RequestShape<'a> {
    pub tensor: &'a str,
    pub dtype: DType,
    pub shape: &'a [u64],
}

/// Decide how the network must change to serve a request
pub fn plan(
    policy: ReshapePolicy,
    network: &[TensorSpec],
    request: &[RequestShape<'_>],
) -> Result<ShapeAdjustment> {
    let mut changed = BTreeMap::new();

    for input in request {
        let spec = network
            .iter()
            .find(|spec| spec.name == input.tensor)
            .ok_or_else(|| {
                EngineLinkError::invalid_input(format!("network has no input {}", input.tensor))
            })?;

        if spec.dtype != input.dtype {
            return Err(EngineLinkError::invalid_input(format!(
                "input {} expects {}, got {}",
                input.tensor, spec.dtype, input.dtype
            )));
        }
        if spec.shape.len() != input.shape.len() {
            return Err(EngineLinkError::invalid_input(format!(
                "input {} expects rank {} {:?}, got {:?}",
                input.tensor,
                spec.shape.len(),
                spec.shape,
                input.shape
            )));
        }
        if spec.shape.as_slice() != input.shape {
            changed.insert(input.tensor.to_string(), input.shape.to_vec());
        }
    }

    if changed.is_empty() {
        return Ok(ShapeAdjustment::None);
    }

    match policy {
        ReshapePolicy::Auto => Ok(ShapeAdjustment::Reshape(changed)),
        ReshapePolicy::BatchSizeOnly => batch_size_of(network, request).map(ShapeAdjustment::BatchSize),
        ReshapePolicy::Disabled => Err(EngineLinkError::invalid_shape(format!(
            "reshaping is disabled, mismatched inputs: {}",
            describe(network, &changed)
        ))),
    }
}

/// The common new batch size, if only leading dimensions differ
fn batch_size_of(network: &[TensorSpec], request: &[RequestShape<'_>]) -> Result<u64> {
    let mut batch_size = None;

    for input in request {
        let Some((&batch, rest)) = input.shape.split_first() else {
            return Err(EngineLinkError::invalid_shape(format!(
                "input {} has no batch dimension",
                input.tensor
            )));
        };
        let spec = network
            .iter()
            .find(|spec| spec.name == input.tensor)
            .ok_or_else(|| {
                EngineLinkError::invalid_input(format!("network has no input {}", input.tensor))
            })?;

        if spec.shape[1..] != *rest {
            return Err(EngineLinkError::invalid_shape(format!(
                "only the batch dimension of {} may change: expected [_, {:?}], got {:?}",
                input.tensor,
                &spec.shape[1..],
                input.shape
            )));
        }
        match batch_size {
            None => batch_size = Some(batch),
            Some(expected) if expected != batch => {
                return Err(EngineLinkError::invalid_shape(format!(
                    "inputs disagree on batch size: {} and {}",
                    expected, batch
                )))
            }
            Some(_) => {}
        }
    }

    match batch_size {
        Some(0) | None => Err(EngineLinkError::invalid_shape("batch size must be positive")),
        Some(batch) => Ok(batch),
    }
}

fn describe(network: &[TensorSpec], changed: &BTreeMap<String, Vec<u64>>) -> String {
    changed
        .iter()
        .map(|(name, shape)| {
            let expected = network
                .iter()
                .find(|spec| &spec.name == name)
                .map(|spec| format!("{:?}", spec.shape))
                .unwrap_or_default();
            format!("{} expected {} got {:?}", name, expected, shape)
        })
        .collect::<Vec<_>>()
        .join(", ")
}
