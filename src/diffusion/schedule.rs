//! Gaussian diffusion schedule with timestep respacing
//! Precomputes the per-timestep coefficients used by the forward process,
//! the posterior and the guided reverse steps.

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::DenoisingModel;

/// Beta schedule of the pretrained denoiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetaSchedule {
    #[default]
    Linear,
    Cosine,
}

/// Output of one mean/variance prediction
pub struct MeanVariance {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

pub struct GaussianDiffusion {
    original_num_steps: usize,
    timestep_map: Vec<usize>,

    // Precomputed values, indexed by respaced timestep
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl GaussianDiffusion {
    /// Build a respaced diffusion from `diffusion_steps` base steps.
    /// `respacing` is either empty (keep every step), `ddimN`, or a comma separated
    /// list of per-section step counts such as `"100"` or `"10,15,20"`.
    pub fn new(diffusion_steps: usize, schedule: BetaSchedule, respacing: &str) -> Result<Self> {
        if diffusion_steps < 2 {
            bail!("diffusion needs at least 2 steps, got {}", diffusion_steps);
        }
        let base_betas = match schedule {
            BetaSchedule::Linear => linear_beta_schedule(diffusion_steps),
            BetaSchedule::Cosine => cosine_beta_schedule(diffusion_steps),
        };
        let use_timesteps = space_timesteps(diffusion_steps, respacing)
            .with_context(|| format!("Invalid timestep respacing '{}'", respacing))?;

        // Respaced betas keep alphas_cumprod identical at the retained steps
        let mut betas = Vec::with_capacity(use_timesteps.len());
        let mut timestep_map = Vec::with_capacity(use_timesteps.len());
        let mut last_alpha_cumprod = 1.0;
        let mut cumprod = 1.0;
        for (i, beta) in base_betas.iter().enumerate() {
            cumprod *= 1.0 - beta;
            if use_timesteps.contains(&i) {
                betas.push(1.0 - cumprod / last_alpha_cumprod);
                last_alpha_cumprod = cumprod;
                timestep_map.push(i);
            }
        }

        Ok(Self::from_betas(betas, timestep_map, diffusion_steps))
    }

    fn from_betas(betas: Vec<f64>, timestep_map: Vec<usize>, original_num_steps: usize) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0;
        for beta in &betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }
        let mut alphas_cumprod_prev = vec![1.0];
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..alphas_cumprod.len() - 1]);

        let posterior_variance: Vec<f64> = betas
            .iter()
            .zip(alphas_cumprod.iter().zip(&alphas_cumprod_prev))
            .map(|(beta, (acp, prev))| beta * (1.0 - prev) / (1.0 - acp))
            .collect();
        // Posterior variance is 0 at the first step, so the log is clipped to the second value
        let mut posterior_log_variance_clipped: Vec<f64> =
            posterior_variance.iter().map(|v| v.ln()).collect();
        if posterior_variance.len() > 1 {
            posterior_log_variance_clipped[0] = posterior_variance[1].ln();
        }

        let posterior_mean_coef1 = betas
            .iter()
            .zip(alphas_cumprod.iter().zip(&alphas_cumprod_prev))
            .map(|(beta, (acp, prev))| beta * prev.sqrt() / (1.0 - acp))
            .collect();
        let posterior_mean_coef2 = betas
            .iter()
            .zip(alphas_cumprod.iter().zip(&alphas_cumprod_prev))
            .map(|(beta, (acp, prev))| (1.0 - prev) * (1.0 - beta).sqrt() / (1.0 - acp))
            .collect();

        Self {
            original_num_steps,
            timestep_map,
            sqrt_alphas_cumprod: alphas_cumprod.iter().map(|a| a.sqrt()).collect(),
            sqrt_one_minus_alphas_cumprod: alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect(),
            sqrt_recip_alphas_cumprod: alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect(),
            sqrt_recipm1_alphas_cumprod: alphas_cumprod.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect(),
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        }
    }

    /// Number of respaced timesteps
    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        self.alphas_cumprod[t]
    }

    pub fn alpha_cumprod_prev(&self, t: usize) -> f64 {
        self.alphas_cumprod_prev[t]
    }

    pub fn sqrt_one_minus_alpha_cumprod(&self, t: usize) -> f64 {
        self.sqrt_one_minus_alphas_cumprod[t]
    }

    /// Timestep value handed to the denoiser, rescaled to the 0..1000 range it was trained on
    pub fn model_timestep(&self, t: usize) -> f32 {
        (self.timestep_map[t] as f64 * 1000.0 / self.original_num_steps as f64) as f32
    }

    /// Forward-noise `x_start` to timestep `t`: sqrt(acp) * x + sqrt(1 - acp) * noise
    pub fn q_sample(&self, x_start: &Tensor, t: usize, noise: &Tensor) -> Result<Tensor> {
        let scaled = x_start.affine(self.sqrt_alphas_cumprod[t], 0.0)?;
        let noise = noise.affine(self.sqrt_one_minus_alphas_cumprod[t], 0.0)?;
        Ok(scaled.broadcast_add(&noise)?)
    }

    pub fn predict_xstart_from_eps(&self, x: &Tensor, t: usize, eps: &Tensor) -> Result<Tensor> {
        let a = x.affine(self.sqrt_recip_alphas_cumprod[t], 0.0)?;
        let b = eps.affine(self.sqrt_recipm1_alphas_cumprod[t], 0.0)?;
        Ok((a - b)?)
    }

    pub fn predict_eps_from_xstart(&self, x: &Tensor, t: usize, pred_xstart: &Tensor) -> Result<Tensor> {
        let a = x.affine(self.sqrt_recip_alphas_cumprod[t], 0.0)?;
        Ok(((a - pred_xstart)? / self.sqrt_recipm1_alphas_cumprod[t])?)
    }

    /// Mean of q(x_{t-1} | x_t, x_0)
    pub fn q_posterior_mean(&self, x_start: &Tensor, x: &Tensor, t: usize) -> Result<Tensor> {
        let a = x_start.affine(self.posterior_mean_coef1[t], 0.0)?;
        let b = x.affine(self.posterior_mean_coef2[t], 0.0)?;
        Ok((a + b)?)
    }

    /// Predict the reverse-step mean and variance for `x` at timestep `t`.
    /// A denoiser returning twice the image channels carries a learned variance
    /// interpolation in the second half; otherwise the fixed large variance is used.
    pub fn p_mean_variance(
        &self,
        model: &dyn DenoisingModel,
        x: &Tensor,
        t: usize,
        identity: &Tensor,
    ) -> Result<MeanVariance> {
        let (batch_size, channels, _, _) = x.dims4()?;
        let timesteps = Tensor::full(self.model_timestep(t), batch_size, x.device())?;
        let model_output = model.forward(x, &timesteps, identity)?;
        let out_channels = model_output.dim(1)?;

        let (eps, log_variance) = if out_channels == channels * 2 {
            let eps = model_output.narrow(1, 0, channels)?;
            let var_values = model_output.narrow(1, channels, channels)?;
            let min_log = self.posterior_log_variance_clipped[t];
            let max_log = self.betas[t].ln();
            // frac = (v + 1) / 2, log_var = frac * max_log + (1 - frac) * min_log
            let frac = var_values.affine(0.5, 0.5)?;
            let log_variance = frac.affine(max_log - min_log, min_log)?;
            (eps, log_variance)
        } else if out_channels == channels {
            let fixed = if t == 0 { self.posterior_variance.get(1).copied().unwrap_or(self.betas[0]) } else { self.betas[t] };
            let log_variance = x.ones_like()?.affine(fixed.ln(), 0.0)?.detach();
            (model_output, log_variance)
        } else {
            bail!(
                "denoiser returned {} channels for a {}-channel sample",
                out_channels,
                channels
            );
        };

        let pred_xstart = self.predict_xstart_from_eps(x, t, &eps)?;
        let mean = self.q_posterior_mean(&pred_xstart, x, t)?;
        let variance = log_variance.exp()?;

        Ok(MeanVariance { mean, variance, log_variance, pred_xstart })
    }
}

fn linear_beta_schedule(num_timesteps: usize) -> Vec<f64> {
    // Linear schedule from Ho et al, extended to work for any number of diffusion steps
    let scale = 1000.0 / num_timesteps as f64;
    let beta_start = scale * 0.0001;
    let beta_end = scale * 0.02;
    (0..num_timesteps)
        .map(|i| beta_start + (beta_end - beta_start) * (i as f64) / (num_timesteps as f64 - 1.0))
        .collect()
}

fn cosine_beta_schedule(num_timesteps: usize) -> Vec<f64> {
    let max_beta = 0.999;
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_timesteps as f64;
            let t2 = (i + 1) as f64 / num_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// Pick the base timesteps retained by a respacing description
pub fn space_timesteps(num_timesteps: usize, respacing: &str) -> Result<BTreeSet<usize>> {
    let respacing = respacing.trim();
    if respacing.is_empty() {
        return Ok((0..num_timesteps).collect());
    }

    if let Some(desired) = respacing.strip_prefix("ddim") {
        let desired: usize = desired.parse().context("ddim respacing needs a step count")?;
        for stride in 1..num_timesteps {
            if (0..num_timesteps).step_by(stride).count() == desired {
                return Ok((0..num_timesteps).step_by(stride).collect());
            }
        }
        bail!("cannot create exactly {} steps with an integer stride", desired);
    }

    let section_counts = respacing
        .split(',')
        .map(|s| s.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("respacing sections must be integers")?;

    let size_per = num_timesteps / section_counts.len();
    let extra = num_timesteps % section_counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();
    for (i, &section_count) in section_counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count || section_count == 0 {
            bail!("cannot divide section of {} steps into {}", size, section_count);
        }
        let frac_stride = if section_count <= 1 {
            1.0
        } else {
            (size - 1) as f64 / (section_count - 1) as f64
        };
        let mut cur_idx = 0.0f64;
        for _ in 0..section_count {
            all_steps.insert(start_idx + cur_idx.round() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }
    Ok(all_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_respacing_keeps_requested_count() -> Result<()> {
        let steps = space_timesteps(1000, "100")?;
        assert_eq!(steps.len(), 100);
        assert_eq!(steps.iter().next().copied(), Some(0));
        assert_eq!(steps.iter().last().copied(), Some(999));

        let ddim = space_timesteps(1000, "ddim50")?;
        assert_eq!(ddim.len(), 50);
        assert!(space_timesteps(10, "20").is_err());
        Ok(())
    }

    #[test]
    fn test_respaced_alphas_match_base_schedule() -> Result<()> {
        let full = GaussianDiffusion::new(1000, BetaSchedule::Linear, "")?;
        let spaced = GaussianDiffusion::new(1000, BetaSchedule::Linear, "100")?;
        assert_eq!(spaced.num_timesteps(), 100);
        for t in [0usize, 10, 50, 99] {
            let base_t = spaced.timestep_map[t];
            assert!((spaced.alpha_cumprod(t) - full.alpha_cumprod(base_t)).abs() < 1e-9);
        }
        // Noise grows with t
        assert!(spaced.sqrt_one_minus_alpha_cumprod(99) > spaced.sqrt_one_minus_alpha_cumprod(10));
        assert!((spaced.model_timestep(99) - 999.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_q_sample_without_noise_scales_input() -> Result<()> {
        let diffusion = GaussianDiffusion::new(1000, BetaSchedule::Linear, "100")?;
        let device = Device::Cpu;
        let x = Tensor::ones((1, 3, 4, 4), DType::F32, &device)?;
        let noise = x.zeros_like()?;
        let noised = diffusion.q_sample(&x, 40, &noise)?;
        let expected = diffusion.alpha_cumprod(40).sqrt() as f32;
        let got: Vec<f32> = noised.flatten_all()?.to_vec1()?;
        assert!(got.iter().all(|v| (v - expected).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_xstart_eps_round_trip() -> Result<()> {
        let diffusion = GaussianDiffusion::new(1000, BetaSchedule::Cosine, "50")?;
        let device = Device::Cpu;
        let x = Tensor::new(&[[[[0.3f32, -0.2], [0.1, 0.9]]]], &device)?;
        let eps = Tensor::new(&[[[[0.5f32, 0.5], [-1.0, 0.0]]]], &device)?;
        let xstart = diffusion.predict_xstart_from_eps(&x, 20, &eps)?;
        let back = diffusion.predict_eps_from_xstart(&x, 20, &xstart)?;
        let diff = (back - eps)?.abs()?.max_keepdim(3)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(diff.iter().all(|d| *d < 1e-4));
        Ok(())
    }
}
