//! Stable Diffusion XL handler
//!
//! Request validation, parameter defaults, optional img2img input and the
//! refiner stage. The diffusion models themselves sit behind
//! [`DiffusionPipeline`].

use base64::Engine;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{InferenceError, InferenceResult};

pub const DEFAULT_SEED: u64 = 0;
pub const DEFAULT_HEIGHT: u32 = 1024;
pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_SAMPLER: Sampler = Sampler::DpmPp2M;
pub const DEFAULT_CFG_SCALE: f64 = 7.0;
pub const DEFAULT_STEPS: u32 = 40;
pub const DEFAULT_IMAGE_STRENGTH: f64 = 0.35;
pub const DEFAULT_REFINER_STEPS: u32 = 40;
pub const DEFAULT_REFINER_STRENGTH: f64 = 0.2;

/// Guidance scale used for the refiner stage
pub const REFINER_CFG_SCALE: f64 = 5.0;

/// Latents are this many times smaller than the decoded image
pub const LATENT_SCALE: u32 = 8;

/// Init images are cropped down to a multiple of this size
const INIT_IMAGE_MULTIPLE: u32 = 64;

/// Environment variable disabling the refiner when set to `true`
pub const DISABLE_REFINER_ENV: &str = "SDXL_DISABLE_REFINER";

/// Sampling algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    EulerEdm,
    HeunEdm,
    EulerAncestral,
    DpmPp2SAncestral,
    DpmPp2M,
    LinearMultistep,
}

impl Sampler {
    pub const ALL: [Sampler; 6] = [
        Sampler::EulerEdm,
        Sampler::HeunEdm,
        Sampler::EulerAncestral,
        Sampler::DpmPp2SAncestral,
        Sampler::DpmPp2M,
        Sampler::LinearMultistep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sampler::EulerEdm => "EulerEDMSampler",
            Sampler::HeunEdm => "HeunEDMSampler",
            Sampler::EulerAncestral => "EulerAncestralSampler",
            Sampler::DpmPp2SAncestral => "DPMPP2SAncestralSampler",
            Sampler::DpmPp2M => "DPMPP2MSampler",
            Sampler::LinearMultistep => "LinearMultistepSampler",
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sampler {
    type Err = InferenceError;

    fn from_str(s: &str) -> InferenceResult<Self> {
        Sampler::ALL
            .iter()
            .copied()
            .find(|sampler| sampler.as_str() == s)
            .ok_or_else(|| InferenceError::invalid_request(format!("'{}' is not a valid Sampler", s)))
    }
}

/// Which checkpoint a pipeline is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    SdxlV1Base,
    SdxlV1Refiner,
}

/// Parameters for one sampling run
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub sampler: Sampler,
    pub scale: f64,
    pub img2img_strength: f64,
    pub seed: u64,
}

/// Latent tensor of shape `(1, channels, height, width)`
#[derive(Debug, Clone, PartialEq)]
pub struct Latents {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
    pub data: Vec<f32>,
}

/// Conditioning for the refiner stage, derived from the base latents
#[derive(Debug, Clone, PartialEq)]
pub struct RefinerConditioning {
    pub orig_width: u32,
    pub orig_height: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub prompt: String,
    pub negative_prompt: String,
    pub crop_coords_top: u32,
    pub crop_coords_left: u32,
    pub aesthetic_score: f64,
    pub negative_aesthetic_score: f64,
}

impl RefinerConditioning {
    pub fn from_latents(latents: &Latents, prompt: &str, negative_prompt: &str) -> Self {
        let width = latents.width * LATENT_SCALE;
        let height = latents.height * LATENT_SCALE;
        Self {
            orig_width: width,
            orig_height: height,
            target_width: width,
            target_height: height,
            prompt: prompt.to_string(),
            negative_prompt: negative_prompt.to_string(),
            crop_coords_top: 0,
            crop_coords_left: 0,
            aesthetic_score: 6.0,
            negative_aesthetic_score: 2.5,
        }
    }
}

/// Decoded init image, cropped to a multiple of 64 pixels
#[derive(Debug, Clone)]
pub struct InitImage {
    pub image: RgbImage,
}

impl InitImage {
    pub fn from_base64(encoded: &str) -> InferenceResult<Self> {
        let invalid = || InferenceError::invalid_request("Unable to decode init_image");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| invalid())?;
        let decoded = image::load_from_memory(&bytes).map_err(|_| invalid())?;

        let width = decoded.width() - decoded.width() % INIT_IMAGE_MULTIPLE;
        let height = decoded.height() - decoded.height() % INIT_IMAGE_MULTIPLE;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        let image = decoded
            .resize_exact(width, height, FilterType::Lanczos3)
            .to_rgb8();
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Result of a base pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub samples: Vec<RgbImage>,
    /// Present when latents were requested
    pub latents: Option<Latents>,
}

/// Failure inside a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Invalid parameter combination; reported to the client
    Value(String),
    /// Anything else
    Runtime(String),
}

impl From<PipelineError> for InferenceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Value(message) => InferenceError::invalid_request(message),
            PipelineError::Runtime(message) => InferenceError::internal(message),
        }
    }
}

/// A loaded diffusion model
pub trait DiffusionPipeline: Send + Sync {
    fn text_to_image(
        &self,
        params: &SamplingParams,
        prompt: &str,
        negative_prompt: &str,
        return_latents: bool,
    ) -> Result<PipelineOutput, PipelineError>;

    fn image_to_image(
        &self,
        params: &SamplingParams,
        image: &InitImage,
        prompt: &str,
        negative_prompt: &str,
        return_latents: bool,
    ) -> Result<PipelineOutput, PipelineError>;

    /// Denoise base latents with the refiner checkpoint
    fn refine(
        &self,
        params: &SamplingParams,
        latents: &Latents,
        conditioning: &RefinerConditioning,
    ) -> Result<Vec<RgbImage>, PipelineError>;
}

/// Builds pipelines from a model directory
pub trait PipelineLoader {
    fn load(
        &self,
        architecture: ModelArchitecture,
        model_dir: &Path,
    ) -> InferenceResult<Box<dyn DiffusionPipeline>>;
}

/// Whether `SDXL_DISABLE_REFINER` asks to skip the refiner
pub fn refiner_disabled<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(DISABLE_REFINER_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Base pipeline plus the optional refiner
pub struct SdxlModel {
    pub base: Box<dyn DiffusionPipeline>,
    pub refiner: Option<Box<dyn DiffusionPipeline>>,
}

impl SdxlModel {
    /// Load the base model, and the refiner unless disabled
    pub fn load(
        loader: &dyn PipelineLoader,
        model_dir: &Path,
        disable_refiner: bool,
    ) -> InferenceResult<Self> {
        let base = loader.load(ModelArchitecture::SdxlV1Base, model_dir)?;
        let refiner = if disable_refiner {
            info!("Refiner model disabled by {} environment variable", DISABLE_REFINER_ENV);
            None
        } else {
            Some(loader.load(ModelArchitecture::SdxlV1Refiner, model_dir)?)
        };
        Ok(Self { base, refiner })
    }

    pub fn has_refiner(&self) -> bool {
        self.refiner.is_some()
    }
}

/// One entry of `text_prompts`
#[derive(Debug, Clone, Deserialize)]
pub struct TextPrompt {
    pub text: Option<String>,
    pub weight: Option<f64>,
}

/// Body of an SDXL invocation
#[derive(Debug, Clone, Deserialize)]
pub struct SdxlRequest {
    pub text_prompts: Vec<TextPrompt>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub sampler: Option<String>,
    pub cfg_scale: Option<f64>,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    pub use_refiner: Option<bool>,
    pub refiner_steps: Option<u32>,
    pub refiner_strength: Option<f64>,
    pub init_image: Option<String>,
    pub image_strength: Option<f64>,
}

fn media_type(header: Option<&str>) -> Option<&str> {
    header.map(|h| h.split(';').next().unwrap_or(h).trim())
}

/// Parse a request body; only JSON with `text_prompts` is accepted
pub fn input_fn(body: &[u8], content_type: Option<&str>) -> InferenceResult<SdxlRequest> {
    if media_type(content_type) != Some("application/json") {
        return Err(InferenceError::invalid_request(
            "Content-type must be application/json",
        ));
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| InferenceError::invalid_request(format!("Invalid JSON body: {}", e)))?;
    if value.get("text_prompts").is_none() {
        return Err(InferenceError::invalid_request("text_prompts missing"));
    }
    serde_json::from_value(value).map_err(|e| InferenceError::invalid_request(e.to_string()))
}

/// Run the base pipeline and, if requested, the refiner; returns PNG bytes
pub fn predict_fn(request: &SdxlRequest, model: &SdxlModel) -> InferenceResult<Vec<Vec<u8>>> {
    let mut prompts = Vec::new();
    let mut negative_prompts = Vec::new();
    for text_prompt in &request.text_prompts {
        let text = text_prompt
            .text
            .as_deref()
            .ok_or_else(|| InferenceError::invalid_request("text missing from text_prompt"))?;
        if text_prompt.weight.unwrap_or(1.0) < 0.0 {
            negative_prompts.push(text);
        } else {
            prompts.push(text);
        }
    }

    if prompts.len() != 1 {
        return Err(InferenceError::invalid_request(
            "One prompt with positive or default weight must be supplied",
        ));
    }
    if negative_prompts.len() > 1 {
        return Err(InferenceError::invalid_request(
            "Only one negative weighted prompt can be supplied",
        ));
    }
    let prompt = prompts[0];
    let negative_prompt = negative_prompts.first().copied().unwrap_or("");

    let use_refiner = request.use_refiner.unwrap_or(model.has_refiner());
    let init_image = request
        .init_image
        .as_deref()
        .map(InitImage::from_base64)
        .transpose()?;

    let refiner = match (&model.refiner, use_refiner) {
        (None, true) => {
            return Err(InferenceError::invalid_request("Pipeline is not available"));
        }
        (Some(refiner), true) => Some(&**refiner),
        (_, false) => None,
    };

    let sampler = match request.sampler.as_deref() {
        Some(name) => name.parse()?,
        None => DEFAULT_SAMPLER,
    };
    let mut params = SamplingParams {
        width: request.width.unwrap_or(DEFAULT_WIDTH),
        height: request.height.unwrap_or(DEFAULT_HEIGHT),
        steps: request.steps.unwrap_or(DEFAULT_STEPS),
        sampler,
        scale: request.cfg_scale.unwrap_or(DEFAULT_CFG_SCALE),
        img2img_strength: 1.0,
        seed: request.seed.unwrap_or(DEFAULT_SEED),
    };

    let output = match &init_image {
        Some(image) => {
            params.width = image.width();
            params.height = image.height();
            params.img2img_strength = request.image_strength.unwrap_or(DEFAULT_IMAGE_STRENGTH);
            debug!(width = params.width, height = params.height, "Running image to image");
            model
                .base
                .image_to_image(&params, image, prompt, negative_prompt, use_refiner)?
        }
        None => {
            debug!(width = params.width, height = params.height, "Running text to image");
            model
                .base
                .text_to_image(&params, prompt, negative_prompt, use_refiner)?
        }
    };

    let samples = match (refiner, &output.latents) {
        (Some(refiner), Some(latents)) => {
            info!("Running refinement stage");
            let refiner_params = SamplingParams {
                width: latents.width * LATENT_SCALE,
                height: latents.height * LATENT_SCALE,
                steps: request.refiner_steps.unwrap_or(DEFAULT_REFINER_STEPS),
                sampler: Sampler::EulerEdm,
                scale: REFINER_CFG_SCALE,
                img2img_strength: request.refiner_strength.unwrap_or(DEFAULT_REFINER_STRENGTH),
                seed: params.seed,
            };
            let conditioning = RefinerConditioning::from_latents(latents, prompt, negative_prompt);
            refiner.refine(&refiner_params, latents, &conditioning)?
        }
        _ => output.samples,
    };

    samples.into_iter().map(encode_png).collect()
}

fn encode_png(sample: RgbImage) -> InferenceResult<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(sample)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .map_err(|e| InferenceError::internal(format!("failed to encode PNG: {}", e)))?;
    Ok(bytes)
}

/// First generated image; the client must accept `image/png`
pub fn output_fn(images: Vec<Vec<u8>>, accept: Option<&str>) -> InferenceResult<(Vec<u8>, &'static str)> {
    if media_type(accept) != Some("image/png") {
        return Err(InferenceError::invalid_request("Accept header must be image/png"));
    }
    let first = images
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::internal("pipeline returned no images"))?;
    Ok((first, "image/png"))
}
