//! Request and response shapes for the remote tensor-prediction service.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::SeqExampleBuff;

/// Input tensor name carrying offline user examples.
pub const USER_EXAMPLES: &str = "userExamples";

/// Input tensor name carrying online/context user examples.
pub const USER_CONTEXT_EXAMPLES: &str = "userContextExamples";

/// Input tensor name carrying per-item examples.
pub const ITEM_EXAMPLES: &str = "itemExamples";

/// A one-dimensional string tensor of serialized examples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringTensor {
    /// Tensor shape; always `[values.len()]`.
    pub shape: Vec<i64>,

    /// Raw string values.
    pub values: Vec<Vec<u8>>,
}

impl StringTensor {
    /// Build a tensor whose shape equals the blob count.
    pub fn from_blobs(values: Vec<Vec<u8>>) -> Self {
        let len = i64::try_from(values.len()).unwrap_or(i64::MAX);
        Self {
            shape: vec![len],
            values,
        }
    }

    /// Build a tensor from feature blobs, in order.
    pub fn from_examples<'a>(examples: impl IntoIterator<Item = &'a SeqExampleBuff>) -> Self {
        Self::from_blobs(examples.into_iter().map(|e| e.buff.clone()).collect())
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the tensor has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A prediction request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Served model name.
    pub model_name: String,

    /// Model version; `None` serves the latest.
    pub version: Option<i64>,

    /// Named input tensors.
    pub inputs: BTreeMap<String, StringTensor>,

    /// Output tensors to return.
    pub output_filter: Vec<String>,
}

impl PredictRequest {
    /// Create a request for a model.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    /// Pin a model version.
    pub fn with_version(mut self, version: Option<i64>) -> Self {
        self.version = version;
        self
    }

    /// Add a named input.
    pub fn with_input(mut self, name: impl Into<String>, tensor: StringTensor) -> Self {
        self.inputs.insert(name.into(), tensor);
        self
    }

    /// Request a named output.
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output_filter.push(name.into());
        self
    }
}

/// A prediction response: named float outputs, flattened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    /// Output tensors by name.
    pub outputs: HashMap<String, Vec<f32>>,
}

impl PredictResponse {
    /// Response with a single output.
    pub fn single(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            outputs: HashMap::from([(name.into(), values)]),
        }
    }

    /// Take a named output out of the response.
    pub fn take_output(&mut self, name: &str) -> Option<Vec<f32>> {
        self.outputs.remove(name)
    }
}
