//! ResNet50 pre/post-processing in front of TensorFlow Serving
//!
//! Decodes the request image, resizes it to 224x224 RGB and forwards it to
//! the model server: over REST normally, over gRPC on Neuron hosts.

use image::imageops::FilterType;
use prost::Message;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{InferenceError, InferenceResult};
use crate::grpc::{self, PredictionClients, TensorProto};

pub const IMAGE_SIZE: u32 = 224;
pub const BATCH_SIZE: usize = 1;
pub const CHANNELS: usize = 3;

/// Model and input names of the compiled Neuron model
pub const NEURON_MODEL_NAME: &str = "compiled_models";
pub const NEURON_INPUT_NAME: &str = "images";

/// Deadline for a gRPC prediction
pub const GRPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variable reporting the Neuron cores on the host
pub const NEURON_CORES_ENV: &str = "NEURON_CORE_HOST_TOTAL";

/// Whether the host has Neuron cores
pub fn is_neuron_host<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(NEURON_CORES_ENV)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|cores| cores > 0)
        .unwrap_or(false)
}

/// A `[batch, height, width, channel]` batch of RGB pixels
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    pixels: Vec<u8>,
}

impl ImageBatch {
    /// Decode, convert to RGB, resize and repeat to the batch size
    pub fn from_encoded(bytes: &[u8]) -> InferenceResult<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| InferenceError::invalid_request(format!("Unable to decode image: {}", e)))?;
        let resized = decoded
            .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom)
            .to_rgb8();
        let single = resized.into_raw();

        let mut pixels = Vec::with_capacity(single.len() * BATCH_SIZE);
        for _ in 0..BATCH_SIZE {
            pixels.extend_from_slice(&single);
        }
        Ok(Self { pixels })
    }

    pub fn shape(&self) -> [usize; 4] {
        [BATCH_SIZE, IMAGE_SIZE as usize, IMAGE_SIZE as usize, CHANNELS]
    }

    /// Nested integer lists for the REST `instances` field
    pub fn to_instances(&self) -> Value {
        let row_len = IMAGE_SIZE as usize * CHANNELS;
        let image_len = IMAGE_SIZE as usize * row_len;
        let batch: Vec<Value> = self
            .pixels
            .chunks(image_len)
            .map(|image| {
                let rows: Vec<Value> = image
                    .chunks(row_len)
                    .map(|row| {
                        let cols: Vec<Value> = row.chunks(CHANNELS).map(|px| json!(px)).collect();
                        Value::Array(cols)
                    })
                    .collect();
                Value::Array(rows)
            })
            .collect();
        Value::Array(batch)
    }

    pub fn to_tensor(&self) -> TensorProto {
        let values: Vec<f32> = self.pixels.iter().map(|&p| p as f32).collect();
        TensorProto::from_f32(&self.shape(), &values)
    }
}

/// Forwards ResNet50 requests to TensorFlow Serving
pub struct Resnet50Handler {
    http: reqwest::Client,
    rest_uri: String,
    grpc_port: u16,
    neuron_host: bool,
    clients: PredictionClients,
}

impl Resnet50Handler {
    pub fn new(rest_uri: impl Into<String>, grpc_port: u16, neuron_host: bool) -> InferenceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(GRPC_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::internal(format!("failed to create HTTP client: {}", e)))?;
        info!(neuron_host = neuron_host, "ResNet50 handler ready");
        Ok(Self {
            http,
            rest_uri: rest_uri.into(),
            grpc_port,
            neuron_host,
            clients: PredictionClients::new(),
        })
    }

    pub fn is_neuron_host(&self) -> bool {
        self.neuron_host
    }

    /// Handle one request body; returns the response body and content type
    pub async fn handle(&self, body: &[u8], accept: Option<&str>) -> InferenceResult<(Vec<u8>, String)> {
        let batch = ImageBatch::from_encoded(body)?;
        if self.neuron_host {
            self.predict_grpc(&batch).await
        } else {
            self.predict_rest(&batch, accept).await
        }
    }

    async fn predict_rest(
        &self,
        batch: &ImageBatch,
        accept: Option<&str>,
    ) -> InferenceResult<(Vec<u8>, String)> {
        let body = json!({
            "signature_name": "serving_default",
            "instances": batch.to_instances(),
        });
        let response = self
            .http
            .post(&self.rest_uri)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| InferenceError::upstream(e.to_string()))?;

        let status = response.status();
        let content = response
            .bytes()
            .await
            .map_err(|e| InferenceError::upstream(e.to_string()))?;
        if status != reqwest::StatusCode::OK {
            return Err(InferenceError::upstream(String::from_utf8_lossy(&content).into_owned()));
        }

        debug!(uri = %self.rest_uri, bytes = content.len(), "REST prediction");
        let content_type = accept.unwrap_or("application/json").to_string();
        Ok((content.to_vec(), content_type))
    }

    async fn predict_grpc(&self, batch: &ImageBatch) -> InferenceResult<(Vec<u8>, String)> {
        let request = grpc::predict_request(NEURON_MODEL_NAME, NEURON_INPUT_NAME, batch.to_tensor());
        debug!(bytes = request.encoded_len(), "Encoded predict request");

        let mut client = self.clients.get(self.grpc_port).await?;
        let response = client
            .predict(request, GRPC_TIMEOUT)
            .await
            .map_err(|status| InferenceError::upstream(status.message().to_string()))?;
        info!(port = self.grpc_port, "Returning the response for gRPC port");

        let body = serde_json::to_vec(&response.to_json())
            .map_err(|e| InferenceError::internal(e.to_string()))?;
        Ok((body, "application/json".to_string()))
    }
}
