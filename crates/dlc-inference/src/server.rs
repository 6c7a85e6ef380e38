//! HTTP surface: `GET /ping` and `POST /invocations`

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{InferenceError, InferenceResult};
use crate::resnet::Resnet50Handler;
use crate::sdxl::{self, PipelineLoader, SdxlModel};

/// A model handler behind `/invocations`
#[async_trait]
pub trait InferenceHandler: Send + Sync {
    /// Handle one invocation; returns the body and its content type
    async fn invoke(
        &self,
        body: Bytes,
        content_type: Option<&str>,
        accept: Option<&str>,
    ) -> InferenceResult<(Vec<u8>, String)>;

    /// Handler name for logs
    fn name(&self) -> &'static str;
}

#[async_trait]
impl InferenceHandler for Resnet50Handler {
    async fn invoke(
        &self,
        body: Bytes,
        _content_type: Option<&str>,
        accept: Option<&str>,
    ) -> InferenceResult<(Vec<u8>, String)> {
        self.handle(&body, accept).await
    }

    fn name(&self) -> &'static str {
        "resnet50"
    }
}

/// SDXL text-to-image handler
pub struct SdxlHandler {
    model: Arc<SdxlModel>,
}

impl SdxlHandler {
    pub fn new(model: SdxlModel) -> Self {
        Self {
            model: Arc::new(model),
        }
    }

    /// Load pipelines from `model_dir`, honoring `SDXL_DISABLE_REFINER`
    pub fn load<F>(loader: &dyn PipelineLoader, model_dir: &Path, lookup: F) -> InferenceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let disable_refiner = sdxl::refiner_disabled(lookup);
        Ok(Self::new(SdxlModel::load(loader, model_dir, disable_refiner)?))
    }
}

#[async_trait]
impl InferenceHandler for SdxlHandler {
    async fn invoke(
        &self,
        body: Bytes,
        content_type: Option<&str>,
        accept: Option<&str>,
    ) -> InferenceResult<(Vec<u8>, String)> {
        let request = sdxl::input_fn(&body, content_type)?;

        // Sampling is CPU/GPU bound; keep it off the async workers
        let model = self.model.clone();
        let images = tokio::task::spawn_blocking(move || sdxl::predict_fn(&request, &model))
            .await
            .map_err(|e| InferenceError::internal(format!("prediction task failed: {}", e)))??;

        let (image, content_type) = sdxl::output_fn(images, accept)?;
        Ok((image, content_type.to_string()))
    }

    fn name(&self) -> &'static str {
        "sdxl"
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub handler: Arc<dyn InferenceHandler>,
}

/// Create the inference router
pub fn create_router(handler: Arc<dyn InferenceHandler>) -> Router {
    let state = Arc::new(AppState { handler });

    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn invocations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, InferenceError> {
    let content_type = header_str(&headers, header::CONTENT_TYPE);
    let accept = header_str(&headers, header::ACCEPT);
    info!(
        handler = state.handler.name(),
        bytes = body.len(),
        content_type = content_type.unwrap_or(""),
        "Invocation"
    );

    let (payload, response_type) = state.handler.invoke(body, content_type, accept).await?;
    Ok(([(header::CONTENT_TYPE, response_type)], payload).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resnet::tests::{fake_model_server, png};
    use crate::sdxl::tests::{model, FakePipeline};
    use crate::sdxl::{DiffusionPipeline, ModelArchitecture};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn sdxl_router() -> Router {
        let (model, _, _) = model(true);
        create_router(Arc::new(SdxlHandler::new(model)))
    }

    fn invocation(content_type: &str, accept: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/invocations")
            .header(header::CONTENT_TYPE, content_type)
            .header(header::ACCEPT, accept)
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let response = sdxl_router()
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sdxl_returns_png() {
        let body = json!({ "text_prompts": [{ "text": "a red barn" }], "height": 64, "width": 64 });
        let response = sdxl_router()
            .oneshot(invocation("application/json", "image/png", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[tokio::test]
    async fn test_sdxl_invalid_request() {
        let response = sdxl_router()
            .oneshot(invocation("application/json", "image/png", r#"{"steps": 10}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error["type"], "Invalid Request");
        assert_eq!(error["message"], "text_prompts missing");
    }

    #[tokio::test]
    async fn test_sdxl_wrong_accept() {
        let body = json!({ "text_prompts": [{ "text": "a" }], "height": 64, "width": 64 });
        let response = sdxl_router()
            .oneshot(invocation("application/json", "application/json", body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[derive(Default)]
    struct RecordingLoader {
        loaded: Mutex<Vec<ModelArchitecture>>,
    }

    impl PipelineLoader for RecordingLoader {
        fn load(
            &self,
            architecture: ModelArchitecture,
            _model_dir: &Path,
        ) -> InferenceResult<Box<dyn DiffusionPipeline>> {
            self.loaded.lock().unwrap().push(architecture);
            Ok(Box::new(FakePipeline::default()))
        }
    }

    #[tokio::test]
    async fn test_sdxl_load_with_refiner_disabled() {
        let loader = RecordingLoader::default();
        let handler = SdxlHandler::load(&loader, Path::new("/opt/ml/model"), |key| {
            (key == "SDXL_DISABLE_REFINER").then(|| "true".to_string())
        })
        .unwrap();
        assert_eq!(*loader.loaded.lock().unwrap(), vec![ModelArchitecture::SdxlV1Base]);

        let router = create_router(Arc::new(handler));
        let body = json!({ "text_prompts": [{ "text": "a" }], "height": 64, "width": 64, "use_refiner": true });
        let response = router
            .oneshot(invocation("application/json", "image/png", body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error["message"], "Pipeline is not available");
    }

    #[tokio::test]
    async fn test_sdxl_load_with_refiner() {
        let loader = RecordingLoader::default();
        let handler = SdxlHandler::load(&loader, Path::new("/opt/ml/model"), |_| None).unwrap();
        assert_eq!(
            *loader.loaded.lock().unwrap(),
            vec![ModelArchitecture::SdxlV1Base, ModelArchitecture::SdxlV1Refiner]
        );
        assert!(handler.model.has_refiner());
    }

    #[tokio::test]
    async fn test_resnet_invocation() {
        let uri = fake_model_server(StatusCode::OK).await;
        let handler = Resnet50Handler::new(uri, 9000, false).unwrap();
        let router = create_router(Arc::new(handler));

        let response = router
            .oneshot(invocation("application/x-image", "application/json", png(50, 40)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["shape"], json!([1, 224, 224, 3]));
    }

    #[tokio::test]
    async fn test_resnet_bad_image() {
        let handler = Resnet50Handler::new("http://127.0.0.1:9/unused", 9000, false).unwrap();
        let response = create_router(Arc::new(handler))
            .oneshot(invocation("application/x-image", "application/json", "garbage"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
