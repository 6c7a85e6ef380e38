//! TensorFlow Serving gRPC prediction client
//!
//! Messages mirror the `tensorflow.serving` protos closely enough for the
//! Predict call. Unused proto fields are omitted.

use prost::Message;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use crate::error::{InferenceError, InferenceResult};

const PREDICT_PATH: &str = "/tensorflow.serving.PredictionService/Predict";

/// `tensorflow.DataType` values used here
pub mod data_type {
    pub const DT_FLOAT: i32 = 1;
    pub const DT_DOUBLE: i32 = 2;
    pub const DT_INT32: i32 = 3;
    pub const DT_UINT8: i32 = 4;
    pub const DT_STRING: i32 = 7;
    pub const DT_INT64: i32 = 9;
    pub const DT_BOOL: i32 = 10;

    pub fn name(dtype: i32) -> String {
        match dtype {
            DT_FLOAT => "DT_FLOAT".to_string(),
            DT_DOUBLE => "DT_DOUBLE".to_string(),
            DT_INT32 => "DT_INT32".to_string(),
            DT_UINT8 => "DT_UINT8".to_string(),
            DT_STRING => "DT_STRING".to_string(),
            DT_INT64 => "DT_INT64".to_string(),
            DT_BOOL => "DT_BOOL".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ModelSpec {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub signature_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Dim {
    #[prost(int64, tag = "1")]
    pub size: i64,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "2")]
    pub dim: Vec<Dim>,
    #[prost(bool, tag = "3")]
    pub unknown_rank: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int32, tag = "1")]
    pub dtype: i32,
    #[prost(message, optional, tag = "2")]
    pub tensor_shape: Option<TensorShapeProto>,
    #[prost(int32, tag = "3")]
    pub version_number: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub tensor_content: Vec<u8>,
    #[prost(float, repeated, tag = "5")]
    pub float_val: Vec<f32>,
    #[prost(double, repeated, tag = "6")]
    pub double_val: Vec<f64>,
    #[prost(int32, repeated, tag = "7")]
    pub int_val: Vec<i32>,
    #[prost(bytes = "vec", repeated, tag = "8")]
    pub string_val: Vec<Vec<u8>>,
    #[prost(int64, repeated, tag = "10")]
    pub int64_val: Vec<i64>,
    #[prost(bool, repeated, tag = "11")]
    pub bool_val: Vec<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PredictRequest {
    #[prost(message, optional, tag = "1")]
    pub model_spec: Option<ModelSpec>,
    #[prost(map = "string, message", tag = "2")]
    pub inputs: HashMap<String, TensorProto>,
    #[prost(string, repeated, tag = "3")]
    pub output_filter: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PredictResponse {
    #[prost(map = "string, message", tag = "1")]
    pub outputs: HashMap<String, TensorProto>,
    #[prost(message, optional, tag = "2")]
    pub model_spec: Option<ModelSpec>,
}

impl TensorProto {
    /// Float tensor with packed little-endian content
    pub fn from_f32(shape: &[usize], values: &[f32]) -> Self {
        let mut content = Vec::with_capacity(values.len() * 4);
        for v in values {
            content.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: data_type::DT_FLOAT,
            tensor_shape: Some(TensorShapeProto {
                dim: shape
                    .iter()
                    .map(|&size| Dim {
                        size: size as i64,
                        name: String::new(),
                    })
                    .collect(),
                unknown_rank: false,
            }),
            tensor_content: content,
            ..Self::default()
        }
    }

    pub fn shape(&self) -> Vec<i64> {
        self.tensor_shape
            .as_ref()
            .map(|s| s.dim.iter().map(|d| d.size).collect())
            .unwrap_or_default()
    }

    /// JSON in the protobuf canonical mapping (camelCase, int64 as strings)
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("dtype".to_string(), json!(data_type::name(self.dtype)));
        if let Some(shape) = &self.tensor_shape {
            let dims: Vec<Value> = shape
                .dim
                .iter()
                .map(|d| {
                    let mut dim = Map::new();
                    dim.insert("size".to_string(), json!(d.size.to_string()));
                    if !d.name.is_empty() {
                        dim.insert("name".to_string(), json!(d.name));
                    }
                    Value::Object(dim)
                })
                .collect();
            obj.insert("tensorShape".to_string(), json!({ "dim": dims }));
        }
        if !self.float_val.is_empty() {
            obj.insert("floatVal".to_string(), json!(self.float_val));
        }
        if !self.double_val.is_empty() {
            obj.insert("doubleVal".to_string(), json!(self.double_val));
        }
        if !self.int_val.is_empty() {
            obj.insert("intVal".to_string(), json!(self.int_val));
        }
        if !self.int64_val.is_empty() {
            let vals: Vec<String> = self.int64_val.iter().map(|v| v.to_string()).collect();
            obj.insert("int64Val".to_string(), json!(vals));
        }
        if !self.bool_val.is_empty() {
            obj.insert("boolVal".to_string(), json!(self.bool_val));
        }
        if !self.tensor_content.is_empty() {
            use base64::Engine;
            obj.insert(
                "tensorContent".to_string(),
                json!(base64::engine::general_purpose::STANDARD.encode(&self.tensor_content)),
            );
        }
        Value::Object(obj)
    }
}

impl ModelSpec {
    fn to_json(&self) -> Value {
        json!({ "name": self.name, "signatureName": self.signature_name })
    }
}

impl PredictResponse {
    pub fn to_json(&self) -> Value {
        let mut outputs: Vec<(&String, &TensorProto)> = self.outputs.iter().collect();
        outputs.sort_by(|a, b| a.0.cmp(b.0));
        let outputs: Map<String, Value> = outputs
            .into_iter()
            .map(|(name, tensor)| (name.clone(), tensor.to_json()))
            .collect();

        let mut obj = Map::new();
        obj.insert("outputs".to_string(), Value::Object(outputs));
        if let Some(spec) = &self.model_spec {
            obj.insert("modelSpec".to_string(), spec.to_json());
        }
        Value::Object(obj)
    }
}

/// Unary client for `tensorflow.serving.PredictionService`
#[derive(Debug, Clone)]
pub struct PredictionServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl PredictionServiceClient {
    /// Client for `localhost:{port}`; connects on first use
    pub fn for_local_port(port: u16) -> InferenceResult<Self> {
        let endpoint = Endpoint::from_shared(format!("http://localhost:{}", port))
            .map_err(|e| InferenceError::internal(format!("invalid gRPC endpoint: {}", e)))?;
        Ok(Self {
            inner: tonic::client::Grpc::new(endpoint.connect_lazy()),
        })
    }

    pub async fn predict(
        &mut self,
        request: PredictRequest,
        timeout: Duration,
    ) -> Result<PredictResponse, tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("service was not ready: {}", e)))?;

        let mut request = tonic::Request::new(request);
        request.set_timeout(timeout);
        let codec: ProstCodec<PredictRequest, PredictResponse> = ProstCodec::default();
        let response = self
            .inner
            .unary(request, PathAndQuery::from_static(PREDICT_PATH), codec)
            .await?;
        Ok(response.into_inner())
    }
}

/// One lazily created client per gRPC port
#[derive(Default)]
pub struct PredictionClients {
    clients: RwLock<HashMap<u16, PredictionServiceClient>>,
}

impl PredictionClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, port: u16) -> InferenceResult<PredictionServiceClient> {
        if let Some(client) = self.clients.read().await.get(&port) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(&port) {
            return Ok(client.clone());
        }
        info!(port = port, "Creating prediction service client");
        let client = PredictionServiceClient::for_local_port(port)?;
        clients.insert(port, client.clone());
        Ok(client)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

/// Build the Predict request for a float image batch
pub fn predict_request(model_name: &str, input_name: &str, tensor: TensorProto) -> PredictRequest {
    let mut inputs = HashMap::new();
    inputs.insert(input_name.to_string(), tensor);
    PredictRequest {
        model_spec: Some(ModelSpec {
            name: model_name.to_string(),
            signature_name: "serving_default".to_string(),
        }),
        inputs,
        output_filter: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_tensor_layout() {
        let tensor = TensorProto::from_f32(&[1, 2], &[1.0, -2.5]);
        assert_eq!(tensor.dtype, data_type::DT_FLOAT);
        assert_eq!(tensor.shape(), vec![1, 2]);
        assert_eq!(tensor.tensor_content.len(), 8);
        assert_eq!(&tensor.tensor_content[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_request_wire_format() {
        let request = predict_request(
            "compiled_models",
            "images",
            TensorProto::from_f32(&[1, 1], &[0.5]),
        );
        let bytes = request.encode_to_vec();
        let decoded = PredictRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);

        let spec = decoded.model_spec.unwrap();
        assert_eq!(spec.name, "compiled_models");
        assert_eq!(spec.signature_name, "serving_default");
        assert!(decoded.inputs.contains_key("images"));
        assert_eq!(request.encoded_len(), bytes.len());
    }

    #[test]
    fn test_response_json() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "probabilities".to_string(),
            TensorProto {
                dtype: data_type::DT_FLOAT,
                tensor_shape: Some(TensorShapeProto {
                    dim: vec![
                        Dim { size: 1, name: String::new() },
                        Dim { size: 2, name: String::new() },
                    ],
                    unknown_rank: false,
                }),
                float_val: vec![0.25, 0.75],
                ..TensorProto::default()
            },
        );
        outputs.insert(
            "classes".to_string(),
            TensorProto {
                dtype: data_type::DT_INT64,
                int64_val: vec![7],
                ..TensorProto::default()
            },
        );
        let response = PredictResponse {
            outputs,
            model_spec: Some(ModelSpec {
                name: "compiled_models".to_string(),
                signature_name: "serving_default".to_string(),
            }),
        };

        assert_eq!(
            response.to_json(),
            json!({
                "outputs": {
                    "classes": { "dtype": "DT_INT64", "int64Val": ["7"] },
                    "probabilities": {
                        "dtype": "DT_FLOAT",
                        "tensorShape": { "dim": [{ "size": "1" }, { "size": "2" }] },
                        "floatVal": [0.25, 0.75]
                    }
                },
                "modelSpec": { "name": "compiled_models", "signatureName": "serving_default" }
            })
        );
    }

    #[tokio::test]
    async fn test_client_cache_per_port() {
        let clients = PredictionClients::new();
        assert!(clients.is_empty().await);
        clients.get(9000).await.unwrap();
        clients.get(9000).await.unwrap();
        clients.get(9001).await.unwrap();
        assert_eq!(clients.len().await, 2);
    }
}
