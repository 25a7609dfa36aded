//! Small deterministic collaborators for tests. All of them are built from
//! differentiable tensor ops so gradients reach the sample.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};

use crate::diffusion::GaussianDiffusion;
use super::{
    DenoisingModel, FaceLandmarks, FaceParser, GazeEstimator, IdentityEmbedder, LandmarkLocator,
    Networks, NUM_FACE_CLASSES,
};

pub struct MockDenoiser {
    learned: bool,
}

impl MockDenoiser {
    pub fn learned_sigma() -> Self {
        Self { learned: true }
    }

    pub fn fixed_sigma() -> Self {
        Self { learned: false }
    }
}

impl DenoisingModel for MockDenoiser {
    fn forward(&self, x: &Tensor, _timesteps: &Tensor, _identity: &Tensor) -> Result<Tensor> {
        let eps = x.affine(0.05, 0.0)?;
        if self.learned {
            Ok(Tensor::cat(&[&eps, &x.zeros_like()?], 1)?)
        } else {
            Ok(eps)
        }
    }
}

/// Knows the clean image: returns the exact noise separating `x` from it at the
/// requested timestep, with the smallest learned variance
pub struct OracleDenoiser {
    clean: Tensor,
    /// (model timestep, alpha_bar) of every respaced step
    schedule: Vec<(f32, f64)>,
}

impl OracleDenoiser {
    pub fn new(clean: Tensor, diffusion: &GaussianDiffusion) -> Self {
        let schedule = (0..diffusion.num_timesteps())
            .map(|t| (diffusion.model_timestep(t), diffusion.alpha_cumprod(t)))
            .collect();
        Self { clean, schedule }
    }

    fn alpha_cumprod(&self, timestep: f32) -> Result<f64> {
        self.schedule
            .iter()
            .min_by(|a, b| (a.0 - timestep).abs().total_cmp(&(b.0 - timestep).abs()))
            .map(|&(_, alpha_cumprod)| alpha_cumprod)
            .context("empty schedule")
    }
}

impl DenoisingModel for OracleDenoiser {
    fn forward(&self, x: &Tensor, timesteps: &Tensor, _identity: &Tensor) -> Result<Tensor> {
        let timestep = timesteps.flatten_all()?.to_vec1::<f32>()?.first().copied().context("no timestep")?;
        let alpha_cumprod = self.alpha_cumprod(timestep)?;
        // eps = (x - sqrt(ab) * x0) / sqrt(1 - ab)
        let eps = x
            .broadcast_sub(&self.clean.affine(alpha_cumprod.sqrt(), 0.0)?)?
            .affine(1.0 / (1.0 - alpha_cumprod).sqrt(), 0.0)?;
        let var_values = x.ones_like()?.affine(-1.0, 0.0)?;
        Ok(Tensor::cat(&[&eps, &var_values], 1)?)
    }
}

/// Channel means projected to 4 dims, so crops of a flat image embed identically
pub struct MockEmbedder {
    size: usize,
    projection: Tensor,
}

impl MockEmbedder {
    pub fn new(size: usize) -> Result<Self> {
        let projection = Tensor::new(
            &[[1.0f32, 0.2, -0.3, 0.5], [0.1, 1.0, 0.4, -0.2], [-0.4, 0.3, 1.0, 0.1]],
            &Device::Cpu,
        )?;
        Ok(Self { size, projection })
    }
}

impl IdentityEmbedder for MockEmbedder {
    fn input_size(&self) -> usize {
        self.size
    }

    fn embed(&self, images: &Tensor) -> Result<Tensor> {
        let (batch_size, channels, _, _) = images.dims4()?;
        let pooled = images.mean_keepdim(3)?.mean_keepdim(2)?.reshape((batch_size, channels))?;
        Ok(pooled.matmul(&self.projection)?.affine(1.0, 0.5)?)
    }
}

/// Logits that depend smoothly on the input, with one class pushed to the top
pub struct MockParser {
    size: usize,
    dominant: usize,
}

impl MockParser {
    pub fn new(size: usize, dominant: usize) -> Self {
        Self { size, dominant }
    }
}

impl FaceParser for MockParser {
    fn input_size(&self) -> usize {
        self.size
    }

    fn parse(&self, images: &Tensor) -> Result<Tensor> {
        let mut channels = Vec::with_capacity(NUM_FACE_CLASSES);
        for class in 0..NUM_FACE_CLASSES {
            let bias = if class == self.dominant { 100.0 } else { 0.0 };
            channels.push(images.narrow(1, class % 3, 1)?.affine(0.1 * (class as f64 + 1.0), bias)?);
        }
        Ok(Tensor::cat(&channels, 1)?)
    }
}

/// Eyes at fixed fractions of the image, or no face at all
pub struct MockLandmarks {
    found: bool,
}

impl MockLandmarks {
    pub fn found() -> Self {
        Self { found: true }
    }

    pub fn missing() -> Self {
        Self { found: false }
    }
}

impl LandmarkLocator for MockLandmarks {
    fn locate(&self, image: &Tensor) -> Result<Option<FaceLandmarks>> {
        if !self.found {
            return Ok(None);
        }
        let (_, _, height, width) = image.dims4()?;
        let (w, h) = (width as f32, height as f32);
        let mut points = vec![(0.5 * w, 0.5 * h); 68];
        let ring = [(-0.1, 0.0), (-0.05, -0.04), (0.05, -0.04), (0.1, 0.0), (0.05, 0.04), (-0.05, 0.04)];
        for (i, (dx, dy)) in ring.iter().enumerate() {
            points[FaceLandmarks::LEFT_EYE.start + i] = ((0.3 + dx) * w, (0.4 + dy) * h);
            points[FaceLandmarks::RIGHT_EYE.start + i] = ((0.7 + dx) * w, (0.4 + dy) * h);
        }
        Ok(Some(FaceLandmarks { points }))
    }
}

pub struct MockGaze;

impl GazeEstimator for MockGaze {
    fn estimate(&self, eye_crops: &Tensor) -> Result<Tensor> {
        let batch_size = eye_crops.dim(0)?;
        let mean = eye_crops.mean_keepdim(3)?.mean_keepdim(2)?.reshape((batch_size, 1))?;
        Ok(Tensor::cat(&[&mean, &mean.affine(-0.5, 0.1)?], 1)?)
    }
}

/// Owns one of each mock so tests can borrow a [`Networks`] bundle
pub struct MockNetworks {
    pub denoiser: MockDenoiser,
    pub embedder: MockEmbedder,
    pub parser: MockParser,
    pub landmarks: MockLandmarks,
    pub gaze: MockGaze,
}

impl MockNetworks {
    /// Parser reports skin everywhere, eyes are found
    pub fn new(embed_size: usize, parse_size: usize) -> Result<Self> {
        Ok(Self {
            denoiser: MockDenoiser::learned_sigma(),
            embedder: MockEmbedder::new(embed_size)?,
            parser: MockParser::new(parse_size, 1),
            landmarks: MockLandmarks::found(),
            gaze: MockGaze,
        })
    }

    pub fn networks(&self) -> Networks<'_> {
        Networks {
            denoiser: &self.denoiser,
            embedder: &self.embedder,
            parser: &self.parser,
            landmarks: &self.landmarks,
            gaze: &self.gaze,
        }
    }
}
