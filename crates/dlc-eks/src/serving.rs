//! TensorFlow Serving REST client

use dlc_core::{DlcError, DlcResult, EksConfig};
use dlc_runtime::{retry, retry_until, RetryConfig};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `{"instances": [1.0, 2.0, 5.0]}` for half_plus_two models
pub fn half_plus_two_payload() -> Value {
    json!({ "instances": [1.0, 2.0, 5.0] })
}

/// Single tokenized sentence for NLP models such as albert
pub fn nlp_payload() -> Value {
    json!({ "instances": [[2, 1952, 25, 10901, 3]] })
}

/// One blank 28x28 image, flattened
pub fn mnist_payload() -> Value {
    let pixels = vec![0; 784];
    json!({ "instances": [pixels] })
}

/// Batched half_plus_two input for neuronx models
pub fn neuronx_payload() -> Value {
    json!({ "instances": [[1.0, 2.0, 5.0]] })
}

/// Client for TensorFlow Serving's REST API
pub struct TfServingClient {
    client: reqwest::Client,
    host: String,
    retry: RetryConfig,
}

impl TfServingClient {
    /// Create a client for `host` with a per-request timeout
    pub fn new(host: impl Into<String>, timeout: Duration) -> DlcResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DlcError::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            host: host.into(),
            retry: RetryConfig::fixed(10, Duration::from_secs(10)),
        })
    }

    /// Client for a port-forwarded server, retrying per the `[eks]` table
    pub fn from_config(config: &EksConfig) -> DlcResult<Self> {
        Ok(Self::new("127.0.0.1", Duration::from_secs(30))?.with_retry(RetryConfig::fixed(
            config.inference_attempts,
            Duration::from_secs(config.inference_interval_secs),
        )))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn model_url(&self, model_name: &str, port: u16) -> String {
        format!("http://{}:{}/v1/models/{}", self.host, port, model_name)
    }

    /// One prediction request
    ///
    /// Fails on transport errors, non-success statuses, and bodies that
    /// mention an error.
    pub async fn predict(&self, model_name: &str, port: u16, body: &Value) -> DlcResult<Value> {
        let url = format!("{}:predict", self.model_url(model_name, port));
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            warn!(url = %url, status = %status, "Prediction failed");
            return Err(DlcError::Inference(format!("{} returned {}: {}", url, status, text)));
        }
        if text.contains("error") {
            warn!(url = %url, "Prediction returned an error");
            return Err(DlcError::Inference(format!("{} returned an error: {}", url, text)));
        }

        debug!(url = %url, "Prediction succeeded");
        Ok(serde_json::from_str(&text)?)
    }

    /// Predict with retries while the server warms up
    pub async fn request_tensorflow_inference(
        &self,
        model_name: &str,
        port: u16,
        body: &Value,
    ) -> DlcResult<Value> {
        let what = format!("inference on {}", model_name);
        let output = retry(&self.retry, &what, || self.predict(model_name, port, body)).await?;
        info!(model = model_name, port = port, "Inference succeeded");
        Ok(output)
    }

    /// Whether any version of `model_name` reports `AVAILABLE`
    pub async fn model_available(&self, model_name: &str, port: u16) -> DlcResult<bool> {
        let url = self.model_url(model_name, port);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let status: Value = response.json().await?;
        let available = status["model_version_status"]
            .as_array()
            .map(|versions| versions.iter().any(|v| v["state"] == "AVAILABLE"))
            .unwrap_or(false);
        Ok(available)
    }

    /// Poll the model status endpoint until the model is loaded
    pub async fn wait_for_model_available(&self, model_name: &str, port: u16) -> DlcResult<()> {
        let what = format!("model {} available", model_name);
        retry_until(&self.retry, &what, || self.model_available(model_name, port)).await
    }
}
