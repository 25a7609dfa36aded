//! Pretrained collaborators consumed by the guidance loop
//!
//! Architectures and weights live outside this crate. Each network is reached
//! through a narrow trait so the sampling core can be driven by any backend,
//! and tests can plug in small deterministic stand-ins.

#[cfg(test)]
pub mod mock;

use anyhow::Result;
use candle_core::{Device, Tensor};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::EditError;

/// Number of classes predicted by the face parser
pub const NUM_FACE_CLASSES: usize = 19;

/// ID-conditioned noise predictor
pub trait DenoisingModel: Send + Sync {
    /// `x` is `[B, C, H, W]` in [-1, 1], `timesteps` is `[B]` on the 0..1000 training
    /// scale and `identity` is the L2-normalized source embedding.
    /// Returns `[B, C, H, W]` epsilon, or `[B, 2C, H, W]` with learned variance values.
    fn forward(&self, x: &Tensor, timesteps: &Tensor, identity: &Tensor) -> Result<Tensor>;
}

/// Face recognition network
pub trait IdentityEmbedder: Send + Sync {
    /// Square input resolution the network expects
    fn input_size(&self) -> usize {
        112
    }

    /// `[B, 3, S, S]` ImageNet-normalized images to `[B, D]` embeddings
    fn embed(&self, images: &Tensor) -> Result<Tensor>;
}

/// Semantic face parser
pub trait FaceParser: Send + Sync {
    fn input_size(&self) -> usize {
        512
    }

    /// `[B, 3, S, S]` ImageNet-normalized images to `[B, 19, S, S]` class logits
    fn parse(&self, images: &Tensor) -> Result<Tensor>;
}

/// 68-point facial landmarks in pixel coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarks {
    pub points: Vec<(f32, f32)>,
}

impl FaceLandmarks {
    pub const LEFT_EYE: std::ops::Range<usize> = 36..42;
    pub const RIGHT_EYE: std::ops::Range<usize> = 42..48;
}

pub trait LandmarkLocator: Send + Sync {
    /// `image` is `[1, 3, H, W]` in [0, 1]. `None` when no face is found.
    fn locate(&self, image: &Tensor) -> Result<Option<FaceLandmarks>>;
}

pub trait GazeEstimator: Send + Sync {
    /// `[B, 1, h, w]` grayscale eye crops to `[B, 2]` gaze angles
    fn estimate(&self, eye_crops: &Tensor) -> Result<Tensor>;
}

/// Borrowed handles to every collaborator, passed explicitly into each step
#[derive(Clone, Copy)]
pub struct Networks<'a> {
    pub denoiser: &'a dyn DenoisingModel,
    pub embedder: &'a dyn IdentityEmbedder,
    pub parser: &'a dyn FaceParser,
    pub landmarks: &'a dyn LandmarkLocator,
    pub gaze: &'a dyn GazeEstimator,
}

/// Owned collaborators produced by a [`NetworkLoader`]
pub struct LoadedNetworks {
    pub denoiser: Box<dyn DenoisingModel>,
    pub embedder: Box<dyn IdentityEmbedder>,
    pub parser: Box<dyn FaceParser>,
    pub landmarks: Box<dyn LandmarkLocator>,
    pub gaze: Box<dyn GazeEstimator>,
}

impl LoadedNetworks {
    pub fn as_networks(&self) -> Networks<'_> {
        Networks {
            denoiser: self.denoiser.as_ref(),
            embedder: self.embedder.as_ref(),
            parser: self.parser.as_ref(),
            landmarks: self.landmarks.as_ref(),
            gaze: self.gaze.as_ref(),
        }
    }
}

/// Builds the collaborators from verified checkpoint files
pub trait NetworkLoader {
    fn load(&self, checkpoints: &CheckpointConfig, device: &Device) -> Result<LoadedNetworks>;
}

/// Pretrained weight files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub model: PathBuf,
    pub identity: PathBuf,
    pub face_parser: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gaze: Option<PathBuf>,
}

impl CheckpointConfig {
    fn entries(&self) -> Vec<(&'static str, &PathBuf)> {
        let mut entries = vec![
            ("model", &self.model),
            ("identity", &self.identity),
            ("face_parser", &self.face_parser),
        ];
        if let Some(gaze) = &self.gaze {
            entries.push(("gaze", gaze));
        }
        entries
    }
}

/// Check every checkpoint exists before anything is loaded or sampled
pub fn verify_checkpoints(checkpoints: &CheckpointConfig) -> Result<()> {
    for (name, path) in checkpoints.entries() {
        if !path.is_file() {
            return Err(EditError::CollaboratorLoadFailure {
                name: name.to_string(),
                reason: format!("checkpoint not found: {}", path.display()),
            }
            .into());
        }
        info!("Found {} checkpoint: {}", name, path.display());
    }
    Ok(())
}

/// Resolve `"auto"`, `"cpu"` or `"cuda:N"` to a device. There is no fallback once
/// an explicit accelerator was requested.
pub fn select_device(name: &str) -> Result<Device> {
    let name = name.trim();
    let device = match name {
        "" | "auto" => Device::cuda_if_available(0)
            .map_err(|e| EditError::DeviceUnavailable(e.to_string()))?,
        "cpu" => Device::Cpu,
        s if s.starts_with("cuda") => {
            let ordinal = s["cuda".len()..].trim_start_matches(':');
            let ordinal: usize = if ordinal.is_empty() {
                0
            } else {
                ordinal
                    .parse()
                    .map_err(|_| EditError::DeviceUnavailable(format!("bad device ordinal in '{}'", s)))?
            };
            Device::new_cuda(ordinal).map_err(|e| EditError::DeviceUnavailable(format!("{}: {}", s, e)))?
        }
        other => {
            return Err(EditError::DeviceUnavailable(format!("unknown device '{}'", other)).into());
        }
    };
    if matches!(name, "" | "auto") && device.is_cpu() {
        warn!("No CUDA device found, sampling on CPU");
    }
    Ok(device)
}
