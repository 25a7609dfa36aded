pub mod data_loader;
pub mod guidance;
pub mod image_utils;
pub mod loss_terms;
pub mod mask_scheduler;
pub mod metrics;
pub mod orchestrator;
pub mod rank_store;

// Re-export key types
pub use data_loader::{ImageFolder, LoadedPair, PairPaths, PairStream, Prefetcher};
pub use guidance::{guidance_gradient, GuidanceContext, GuidanceWeights, NonFinitePolicy};
pub use loss_terms::{RegionMask, GAZE_WINDOW};
pub use mask_scheduler::{mask_scale, MaskScheduler, MASK_RAMP_START};
pub use metrics::LossAccumulator;
pub use orchestrator::{PairReport, RunSummary, SamplingOrchestrator};
pub use rank_store::{format_distance, RankStore, RankedResult};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::diffusion::{space_timesteps, BetaSchedule};
use crate::error::EditError;
use crate::models::{select_device, verify_checkpoints, CheckpointConfig, NetworkLoader};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: String,
    pub config: ConfigData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    pub name: Option<String>,
    pub process: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// `"auto"`, `"cpu"` or `"cuda:N"`
    #[serde(default = "default_device")]
    pub device: String,
    pub data: DataConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub guidance: GuidanceConfig,
    pub checkpoints: CheckpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// Pairs decoded ahead of the sampler
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub path: PathBuf,
    #[serde(default = "default_visualization_name")]
    pub visualization_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub iterations_num: usize,
    pub skip_timesteps: usize,
    pub timestep_respacing: String,
    pub diffusion_steps: usize,
    /// Beta schedule the denoiser was trained with
    pub noise_schedule: BetaSchedule,
    pub masking_threshold: usize,
    pub enforce_background: bool,
    pub ddim: bool,
    pub ddim_eta: f64,
    pub batch_size: usize,
    pub seed: Option<u64>,
    pub parallel_iterations: bool,
    pub num_threads: Option<usize>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            iterations_num: 4,
            skip_timesteps: 25,
            timestep_respacing: "100".to_string(),
            diffusion_steps: 1000,
            noise_schedule: BetaSchedule::Linear,
            masking_threshold: 30,
            enforce_background: true,
            ddim: false,
            ddim_eta: 0.0,
            batch_size: 1,
            seed: Some(404),
            parallel_iterations: false,
            num_threads: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceConfig {
    pub identity_weight: f64,
    pub segmentation_weight: f64,
    pub gaze_weight: f64,
    pub background_weight: f64,
    /// Extra fixed crops evaluated by the identity loss
    pub aug_num: usize,
    pub non_finite: NonFinitePolicy,
    pub max_grad_norm: Option<f64>,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        let weights = GuidanceWeights::default();
        Self {
            identity_weight: weights.identity,
            segmentation_weight: weights.segmentation,
            gaze_weight: weights.gaze,
            background_weight: weights.background,
            aug_num: 8,
            non_finite: NonFinitePolicy::Abort,
            max_grad_norm: None,
        }
    }
}

impl GuidanceConfig {
    pub fn weights(&self) -> GuidanceWeights {
        GuidanceWeights {
            identity: self.identity_weight,
            segmentation: self.segmentation_weight,
            gaze: self.gaze_weight,
            background: self.background_weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub author: String,
    pub version: String,
    pub description: String,
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_image_size() -> usize {
    256
}

fn default_prefetch() -> usize {
    4
}

fn default_visualization_name() -> String {
    "output.png".to_string()
}

impl ProcessConfig {
    /// Reject settings the sampler cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { EditError::InvalidConfig(msg).into() };
        let sampling = &self.sampling;

        if sampling.iterations_num == 0 {
            return Err(invalid("iterations_num must be at least 1".into()));
        }
        if sampling.batch_size == 0 {
            return Err(invalid("batch_size must be at least 1".into()));
        }
        if self.data.image_size == 0 {
            return Err(invalid("image_size must be at least 1".into()));
        }
        if sampling.num_threads == Some(0) {
            return Err(invalid("num_threads must be at least 1".into()));
        }
        if !(sampling.ddim_eta >= 0.0) {
            return Err(invalid(format!("ddim_eta must be non-negative, got {}", sampling.ddim_eta)));
        }
        if let Some(max_norm) = self.guidance.max_grad_norm {
            if !(max_norm > 0.0) {
                return Err(invalid(format!("max_grad_norm must be positive, got {}", max_norm)));
            }
        }

        let steps = space_timesteps(sampling.diffusion_steps, &sampling.timestep_respacing)
            .map_err(|e| invalid(e.to_string()))?
            .len();
        if sampling.skip_timesteps >= steps {
            return Err(invalid(format!(
                "skip_timesteps ({}) must be below the {} respaced steps",
                sampling.skip_timesteps, steps
            )));
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

/// Load the config, then for every process: validate, pick the device, verify and
/// load the checkpoints, and run the sampler over all pairs.
pub fn run_from_config<P: AsRef<Path>>(path: P, loader: &dyn NetworkLoader) -> Result<Vec<RunSummary>> {
    let config = load_config(path)?;
    info!(
        "Starting job '{}'{}",
        config.job,
        config.config.name.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default()
    );

    let mut summaries = Vec::with_capacity(config.config.process.len());
    for process in &config.config.process {
        process.validate()?;
        let device = select_device(&process.device)?;
        info!("Using device: {:?}", device);

        verify_checkpoints(&process.checkpoints)?;
        let networks = loader.load(&process.checkpoints, &device).map_err(|e| {
            EditError::CollaboratorLoadFailure { name: "networks".to_string(), reason: format!("{:#}", e) }
        })?;

        let orchestrator = SamplingOrchestrator::new(process.clone(), device, networks.as_networks())?;
        summaries.push(orchestrator.run()?);
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mock::{MockDenoiser, MockEmbedder, MockGaze, MockLandmarks, MockParser};
    use crate::models::LoadedNetworks;
    use candle_core::Device;
    use image::{Rgb, RgbImage};

    const MINIMAL: &str = r#"
job: edit
config:
  name: smoke
  process:
    - device: cpu
      data:
        source_dir: /data/src
        target_dir: /data/targ
      output:
        path: /out
      checkpoints:
        model: Model.pt
        identity: Arcface.tar
        face_parser: FaceParser.pth
"#;

    #[test]
    fn test_defaults_fill_missing_sections() -> Result<()> {
        let config: Config = serde_yaml::from_str(MINIMAL)?;
        let process = &config.config.process[0];
        assert_eq!(process.device, "cpu");
        assert_eq!(process.data.image_size, 256);
        assert_eq!(process.output.visualization_name, "output.png");
        assert_eq!(process.sampling.iterations_num, 4);
        assert_eq!(process.sampling.skip_timesteps, 25);
        assert_eq!(process.sampling.timestep_respacing, "100");
        assert_eq!(process.sampling.noise_schedule, BetaSchedule::Linear);
        assert!(process.sampling.enforce_background);
        assert_eq!(process.sampling.seed, Some(404));
        assert_eq!(process.guidance.weights(), GuidanceWeights::default());
        assert_eq!(process.guidance.non_finite, NonFinitePolicy::Abort);
        assert!(process.checkpoints.gaze.is_none());
        process.validate()?;
        Ok(())
    }

    #[test]
    fn test_partial_sections_and_policy_names() -> Result<()> {
        let yaml = MINIMAL.replace(
            "      checkpoints:",
            "      sampling:\n        ddim: true\n        noise_schedule: cosine\n        masking_threshold: 25\n      guidance:\n        non_finite: zero\n        max_grad_norm: 5.0\n      checkpoints:",
        );
        let config: Config = serde_yaml::from_str(&yaml)?;
        let process = &config.config.process[0];
        assert!(process.sampling.ddim);
        assert_eq!(process.sampling.noise_schedule, BetaSchedule::Cosine);
        assert_eq!(process.sampling.masking_threshold, 25);
        assert_eq!(process.sampling.batch_size, 1);
        assert_eq!(process.guidance.non_finite, NonFinitePolicy::Zero);
        assert_eq!(process.guidance.max_grad_norm, Some(5.0));
        assert_eq!(process.guidance.aug_num, 8);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() -> Result<()> {
        let config: Config = serde_yaml::from_str(MINIMAL)?;
        let base = config.config.process[0].clone();

        let mut skip = base.clone();
        skip.sampling.skip_timesteps = 100;
        let mut respacing = base.clone();
        respacing.sampling.timestep_respacing = "2000".into();
        let mut batch = base.clone();
        batch.sampling.batch_size = 0;
        let mut norm = base.clone();
        norm.guidance.max_grad_norm = Some(0.0);

        for bad in [skip, respacing, batch, norm] {
            let err = bad.validate().unwrap_err();
            assert_eq!(err.downcast_ref::<EditError>().map(|e| e.kind()), Some("invalid_config"));
        }

        // Strides need not divide the schedule evenly
        let mut uneven = base.clone();
        uneven.sampling.timestep_respacing = "30,7".into();
        uneven.sampling.skip_timesteps = 10;
        uneven.validate()?;
        Ok(())
    }

    struct MockLoader;

    impl NetworkLoader for MockLoader {
        fn load(&self, _checkpoints: &CheckpointConfig, _device: &Device) -> Result<LoadedNetworks> {
            Ok(LoadedNetworks {
                denoiser: Box::new(MockDenoiser::learned_sigma()),
                embedder: Box::new(MockEmbedder::new(8)?),
                parser: Box::new(MockParser::new(16, 1)),
                landmarks: Box::new(MockLandmarks::found()),
                gaze: Box::new(MockGaze),
            })
        }
    }

    fn write_config(root: &Path, with_weights: bool) -> Result<PathBuf> {
        let src = root.join("src");
        let targ = root.join("targ");
        fs::create_dir_all(&src)?;
        fs::create_dir_all(&targ)?;
        RgbImage::from_pixel(8, 8, Rgb([180, 120, 100])).save(src.join("a.png"))?;
        RgbImage::from_pixel(8, 8, Rgb([90, 60, 50])).save(targ.join("b.png"))?;
        if with_weights {
            for name in ["Model.pt", "Arcface.tar", "FaceParser.pth"] {
                fs::write(root.join(name), b"weights")?;
            }
        }

        let yaml = format!(
            r#"
job: edit
config:
  process:
    - device: cpu
      data:
        source_dir: {root}/src
        target_dir: {root}/targ
        image_size: 8
        prefetch: 1
      output:
        path: {root}/out
      sampling:
        iterations_num: 2
        skip_timesteps: 5
        timestep_respacing: "10"
        masking_threshold: 3
      guidance:
        aug_num: 2
      checkpoints:
        model: {root}/Model.pt
        identity: {root}/Arcface.tar
        face_parser: {root}/FaceParser.pth
"#,
            root = root.display()
        );
        let path = root.join("edit.yaml");
        fs::write(&path, yaml)?;
        Ok(path)
    }

    #[test]
    fn test_run_from_config_end_to_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), true)?;
        let summaries = run_from_config(&path, &MockLoader)?;
        assert_eq!(summaries.len(), 1);
        let pair = &summaries[0].pairs[0];
        assert_eq!(pair.candidates.len(), 2);
        assert!(pair.candidates[0].distance <= pair.candidates[1].distance);
        assert!(dir.path().join("out").join("0").join("Rank").is_dir());
        assert!(dir.path().join("out").join("0").join("output_i_1_b_0.png").is_file());
        Ok(())
    }

    #[test]
    fn test_missing_weights_abort_before_sampling() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_config(dir.path(), false)?;
        let err = run_from_config(&path, &MockLoader).unwrap_err();
        assert_eq!(err.downcast_ref::<EditError>().map(|e| e.kind()), Some("collaborator_load_failure"));
        assert!(!dir.path().join("out").exists());
        Ok(())
    }
}
