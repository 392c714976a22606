//! Client-facing key mapping
//!
//! Clients address inputs and outputs by key. A key is the tensor name
//! unless the model's mapping assigns it an alias.

use enginelink_common::config::KeyMapping;
use enginelink_common::{EngineLinkError, Result};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct ModelKeys {
    /// key -> input tensor
    inputs: BTreeMap<String, String>,
    /// output tensor -> key
    outputs: BTreeMap<String, String>,
}

impl ModelKeys {
    pub fn new<'a>(
        mapping: &KeyMapping,
        input_tensors: impl IntoIterator<Item = &'a str>,
        output_tensors: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let inputs = input_tensors
            .into_iter()
            .map(|tensor| {
                let key = mapping.inputs.get(tensor).map(String::as_str).unwrap_or(tensor);
                (key.to_string(), tensor.to_string())
            })
            .collect();

        let outputs = output_tensors
            .into_iter()
            .map(|tensor| {
                let key = mapping.outputs.get(tensor).map(String::as_str).unwrap_or(tensor);
                (tensor.to_string(), key.to_string())
            })
            .collect();

        Self { inputs, outputs }
    }

    /// Expected input keys, sorted
    pub fn input_keys(&self) -> Vec<&str> {
        self.inputs.keys().map(String::as_str).collect()
    }

    /// Tensor an input key refers to
    pub fn input_tensor(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).map(String::as_str)
    }

    /// Key an input tensor is exposed under
    pub fn input_key<'a>(&'a self, tensor: &'a str) -> &'a str {
        self.inputs
            .iter()
            .find(|(_, t)| t.as_str() == tensor)
            .map(|(key, _)| key.as_str())
            .unwrap_or(tensor)
    }

    /// Key an output tensor is exposed under
    pub fn output_key<'a>(&'a self, tensor: &'a str) -> &'a str {
        self.outputs.get(tensor).map(String::as_str).unwrap_or(tensor)
    }

    /// Check that a request carries exactly the expected input keys, once each
    pub fn check_request<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let mut seen = BTreeSet::new();
        let mut received = Vec::new();
        let mut invalid = false;

        for key in keys {
            received.push(key);
            if !self.inputs.contains_key(key) || !seen.insert(key) {
                invalid = true;
            }
        }

        if invalid || seen.len() != self.inputs.len() {
            return Err(EngineLinkError::invalid_input(format!(
                "Request contains invalid input keys {:?}, expected keys: {:?}",
                received,
                self.input_keys()
            )));
        }
        Ok(())
    }
}
