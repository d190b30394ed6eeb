//! Tensor inference client.
//!
//! Three layers, innermost first:
//!
//! - [`ConnectionPool`] bounds concurrent calls. A [`PooledConnection`] guard
//!   returns its connection when dropped, whichever way the call exits.
//! - [`TfServingClient`] implements [`PredictionService`] against the
//!   TensorFlow Serving REST predict API.
//! - [`InferenceClient`] turns assembled features into the three named
//!   string inputs, bounds the call with its own timeout and extracts one
//!   named float output.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use infer_core::tensor::{ITEM_EXAMPLES, USER_CONTEXT_EXAMPLES, USER_EXAMPLES};
use infer_core::{
    Error, ExampleFeatures, InferenceSettings, ModelConfig, PredictRequest, PredictResponse,
    PredictionService, Result, StringTensor,
};
use serde_json::{Map, Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ============================================================================
// Connection pool
// ============================================================================

/// A bounded pool of reusable connections.
pub struct ConnectionPool<T> {
    conns: Arc<[T]>,
    free: Arc<Mutex<Vec<usize>>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl<T> ConnectionPool<T> {
    /// Create a pool over pre-built connections.
    pub fn new(connections: Vec<T>, acquire_timeout: Duration) -> Self {
        let size = connections.len();
        Self {
            conns: connections.into(),
            free: Arc::new(Mutex::new((0..size).collect())),
            permits: Arc::new(Semaphore::new(size)),
            acquire_timeout,
        }
    }

    /// Create a pool of `size` connections built by `make`.
    pub fn with_size(size: usize, acquire_timeout: Duration, make: impl Fn() -> T) -> Self {
        Self::new((0..size).map(|_| make()).collect(), acquire_timeout)
    }

    /// Take a connection, waiting at most the acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when no connection frees up in time.
    pub async fn acquire(&self) -> Result<PooledConnection<T>> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::pool_exhausted(format!(
                "no connection available within {:?}",
                self.acquire_timeout
            ))
        })?
        .map_err(|_| Error::pool_exhausted("pool closed"))?;

        let index = lock(&self.free)
            .pop()
            .ok_or_else(|| Error::pool_exhausted("permit granted but no free connection"))?;

        Ok(PooledConnection {
            conns: Arc::clone(&self.conns),
            index,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }

    /// Connections not currently lent out.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Total connections.
    pub fn size(&self) -> usize {
        self.conns.len()
    }
}

impl<T> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size())
            .field("available", &self.available())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// A connection on loan from a [`ConnectionPool`].
///
/// The slot goes back to the pool before the permit is released.
#[derive(Debug)]
pub struct PooledConnection<T> {
    conns: Arc<[T]>,
    index: usize,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conns[self.index]
    }
}

impl<T> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        lock(&self.free).push(self.index);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// TensorFlow Serving
// ============================================================================

/// TensorFlow Serving REST client.
pub struct TfServingClient {
    name: String,
    base_url: String,
    pool: ConnectionPool<reqwest::Client>,
}

impl TfServingClient {
    /// Create a client for the server at `base_url` (e.g. `http://tfs:8501`).
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, settings: &InferenceSettings) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pool: ConnectionPool::with_size(
                settings.pool_size,
                settings.acquire_timeout(),
                reqwest::Client::new,
            ),
        }
    }

    fn predict_url(&self, request: &PredictRequest) -> String {
        match request.version {
            Some(version) => format!(
                "{}/v1/models/{}/versions/{version}:predict",
                self.base_url, request.model_name
            ),
            None => format!("{}/v1/models/{}:predict", self.base_url, request.model_name),
        }
    }

    fn request_body(request: &PredictRequest) -> Value {
        let inputs: Map<String, Value> = request
            .inputs
            .iter()
            .map(|(name, tensor)| {
                let values: Vec<Value> = tensor
                    .values
                    .iter()
                    .map(|blob| json!({ "b64": BASE64.encode(blob) }))
                    .collect();
                (name.clone(), Value::Array(values))
            })
            .collect();
        json!({ "inputs": inputs })
    }

    fn parse_outputs(request: &PredictRequest, body: &Value) -> Result<PredictResponse> {
        let outputs = body
            .get("outputs")
            .ok_or_else(|| Error::inference("missing outputs in predict response"))?;

        let mut parsed = HashMap::new();
        match outputs {
            // several named outputs
            Value::Object(named) => {
                for (name, value) in named {
                    if request.output_filter.is_empty() || request.output_filter.contains(name) {
                        parsed.insert(name.clone(), flatten_floats(value));
                    }
                }
            }
            // a single unnamed output
            other => {
                let name = request
                    .output_filter
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::inference("unnamed output and no output filter"))?;
                parsed.insert(name, flatten_floats(other));
            }
        }
        Ok(PredictResponse { outputs: parsed })
    }
}

fn flatten_floats(value: &Value) -> Vec<f32> {
    fn walk(value: &Value, out: &mut Vec<f32>) {
        match value {
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    out.push(f as f32);
                }
            }
            Value::Array(values) => values.iter().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, &mut out);
    out
}

#[async_trait]
impl PredictionService for TfServingClient {
    async fn predict(&self, request: PredictRequest) -> Result<PredictResponse> {
        let client = self.pool.acquire().await?;

        let response = client
            .post(self.predict_url(&request))
            .json(&Self::request_body(&request))
            .send()
            .await
            .map_err(|e| Error::inference_with_source(format!("{}: predict call failed", self.name), e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::inference(format!(
                "{}: predict error {status}: {error_text}",
                self.name
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::inference_with_source(format!("{}: bad predict response", self.name), e))?;

        Self::parse_outputs(&request, &body)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TfServingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TfServingClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("pool", &self.pool)
            .finish()
    }
}

// ============================================================================
// Inference client
// ============================================================================

/// Runs one model against assembled features.
#[derive(Clone)]
pub struct InferenceClient {
    service: Arc<dyn PredictionService>,
    model_name: String,
    version: Option<i64>,
    timeout: Duration,
}

impl InferenceClient {
    /// Create a client.
    pub fn new(
        service: Arc<dyn PredictionService>,
        model_name: impl Into<String>,
        settings: &InferenceSettings,
    ) -> Self {
        Self {
            service,
            model_name: model_name.into(),
            version: settings.model_version,
            timeout: settings.timeout(),
        }
    }

    /// Create a client for a tenant's model.
    pub fn for_model(model: &ModelConfig, settings: &InferenceSettings) -> Self {
        Self::new(Arc::clone(&model.predictor), model.model_name.clone(), settings)
    }

    /// Build the predict request for `features`.
    ///
    /// Item blobs are sent only when `include_items` is set; otherwise the
    /// item tensor is empty.
    pub fn build_request(
        &self,
        features: &ExampleFeatures,
        tensor_name: &str,
        include_items: bool,
    ) -> PredictRequest {
        let items = if include_items {
            StringTensor::from_examples(&features.items)
        } else {
            StringTensor::from_blobs(Vec::new())
        };

        PredictRequest::new(self.model_name.clone())
            .with_version(self.version)
            .with_input(USER_EXAMPLES, StringTensor::from_examples([&features.user]))
            .with_input(
                USER_CONTEXT_EXAMPLES,
                StringTensor::from_examples([&features.user_context]),
            )
            .with_input(ITEM_EXAMPLES, items)
            .with_output(tensor_name)
    }

    /// Predict and return the `tensor_name` output.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] if no connection could be acquired
    /// - [`Error::Timeout`] if the call outlives the inference timeout
    /// - [`Error::Inference`] if the call fails or the output is missing
    pub async fn infer(
        &self,
        features: &ExampleFeatures,
        tensor_name: &str,
        include_items: bool,
    ) -> Result<Vec<f32>> {
        let request = self.build_request(features, tensor_name, include_items);

        let mut response = tokio::time::timeout(self.timeout, self.service.predict(request))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        response.take_output(tensor_name).ok_or_else(|| {
            Error::inference(format!(
                "{}: output {tensor_name} missing from response",
                self.model_name
            ))
        })
    }
}

impl fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceClient")
            .field("service", &self.service.name())
            .field("model_name", &self.model_name)
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Mock
// ============================================================================

/// Prediction service returning canned outputs.
///
/// Clones share counters and switches.
#[derive(Clone, Default)]
pub struct MockPredictionService {
    outputs: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    delay: Option<Duration>,
    failing: Arc<AtomicBool>,
    failures_left: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    item_counts: Arc<Mutex<Vec<usize>>>,
    last_request: Arc<Mutex<Option<PredictRequest>>>,
}

impl MockPredictionService {
    /// Create a mock with no outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `values` for output `name`.
    pub fn with_output(self, name: impl Into<String>, values: Vec<f32>) -> Self {
        lock(&self.outputs).insert(name.into(), values);
        self
    }

    /// Delay every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Number of item blobs sent, one entry per call.
    pub fn item_counts(&self) -> Vec<usize> {
        lock(&self.item_counts).clone()
    }

    /// Calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request.
    pub fn last_request(&self) -> Option<PredictRequest> {
        lock(&self.last_request).clone()
    }
}

#[async_trait]
impl PredictionService for MockPredictionService {
    async fn predict(&self, request: PredictRequest) -> Result<PredictResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let wanted = request.output_filter.clone();
        lock(&self.item_counts).push(request.inputs.get(ITEM_EXAMPLES).map_or(0, |t| t.len()));
        *lock(&self.last_request) = Some(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scheduled_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure || self.failing.load(Ordering::SeqCst) {
            return Err(Error::inference("mock prediction failed"));
        }

        let outputs = lock(&self.outputs)
            .iter()
            .filter(|(name, _)| wanted.is_empty() || wanted.contains(*name))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect();
        Ok(PredictResponse { outputs })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl fmt::Debug for MockPredictionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPredictionService")
            .field("calls", &self.calls())
            .field("delay", &self.delay)
            .finish()
    }
}
