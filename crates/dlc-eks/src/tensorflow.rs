//! TensorFlow Serving container arguments

use dlc_core::{DlcResult, ImageUri};

/// Serving binaries move from S3 model paths to a local sync at this version.
const LOCAL_MODEL_VERSION: &str = "2.7";

const NEURON_MODELS_BUCKET: &str = "s3://aws-dlc-sample-models";

/// Default bucket for non-neuron models
pub const TENSORFLOW_MODELS_BUCKET: &str = "s3://tensoflow-trained-models";

/// Model server binary and ports for an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelServer {
    pub binary: &'static str,
    pub port: u16,
    pub rest_api_port: u16,
    pub s3_location: String,
}

impl ModelServer {
    /// Server layout for `image`, with `models_bucket` used for non-neuron images
    pub fn for_image(image: &ImageUri, models_bucket: &str) -> Self {
        if image.is_neuron() {
            Self {
                binary: "/usr/local/bin/tensorflow_model_server_neuron",
                port: 8500,
                rest_api_port: 8501,
                s3_location: NEURON_MODELS_BUCKET.to_string(),
            }
        } else {
            Self {
                binary: "/usr/bin/tensorflow_model_server",
                port: 8501,
                rest_api_port: 8500,
                s3_location: models_bucket.to_string(),
            }
        }
    }

    fn flags(&self, model_name: &str, model_base_path: &str) -> [String; 4] {
        [
            format!("--port={}", self.port),
            format!("--rest_api_port={}", self.rest_api_port),
            format!("--model_name={}", model_name),
            format!("--model_base_path={}", model_base_path),
        ]
    }
}

fn serves_from_s3(image: &ImageUri) -> DlcResult<bool> {
    image.is_below_framework_version(LOCAL_MODEL_VERSION, "tensorflow")
}

/// Where the serving container finds `model_name`
///
/// Older servers read straight from S3; newer ones read a local copy synced
/// at container start.
pub fn eks_tensorflow_model_base_path(
    image: &ImageUri,
    model_name: &str,
    models_bucket: &str,
) -> DlcResult<String> {
    if serves_from_s3(image)? {
        let bucket = ModelServer::for_image(image, models_bucket).s3_location;
        Ok(format!("{}/{}", bucket, model_name))
    } else {
        Ok(format!("/tensorflow_model/{}", model_name))
    }
}

/// `<COMMAND>` and `<ARGS>` manifest values for a serving container
pub fn tensorflow_command_args(
    image: &ImageUri,
    model_name: &str,
    model_base_path: &str,
    models_bucket: &str,
) -> DlcResult<(String, String)> {
    let server = ModelServer::for_image(image, models_bucket);
    let flags = server.flags(model_name, model_base_path);

    if serves_from_s3(image)? {
        let command = format!("[{}]", server.binary);
        let args = format!(
            "[{}]",
            flags
                .iter()
                .map(|f| format!("'{}'", f))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok((command, args))
    } else {
        let command = "['/bin/sh', '-c']".to_string();
        let args = format!(
            "['mkdir -p /tensorflow_model && aws s3 sync {s3}/{model}/ /tensorflow_model/{model}/ && {server} {flags}']",
            s3 = server.s3_location,
            model = model_name,
            server = server.binary,
            flags = flags.join(" "),
        );
        Ok((command, args))
    }
}
