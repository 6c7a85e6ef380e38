//! dlc-eks: TensorFlow inference tests on EKS
//!
//! This crate provides:
//! - Manifest template rendering
//! - A kubectl wrapper with readiness polling and port forwarding
//! - TensorFlow Serving container arguments and a REST client
//! - The single-node inference scenarios

pub mod kubectl;
pub mod scenario;
pub mod serving;
pub mod template;
pub mod tensorflow;

pub use kubectl::{Kubectl, PortForward};
pub use scenario::{Deployment, EksTensorflowTest, Outcome, Scenario};
pub use serving::TfServingClient;
pub use template::{
    render_template, single_node_inference_template_path, write_eks_yaml_file_from_template,
    Replacements,
};
pub use tensorflow::{eks_tensorflow_model_base_path, tensorflow_command_args, ModelServer};
