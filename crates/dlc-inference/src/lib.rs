//! dlc-inference: In-container inference handlers
//!
//! This crate provides the model handlers served inside inference containers:
//! - SDXL text-to-image and image-to-image
//! - ResNet50 forwarding to TensorFlow Serving over REST or gRPC
//! - The `/ping` and `/invocations` HTTP surface

pub mod error;
pub mod grpc;
pub mod resnet;
pub mod sdxl;
pub mod server;

pub use error::{InferenceError, InferenceResult};
pub use resnet::Resnet50Handler;
pub use sdxl::{DiffusionPipeline, PipelineLoader, SdxlModel};
pub use server::{create_router, InferenceHandler, SdxlHandler};
