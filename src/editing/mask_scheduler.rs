//! Background-consistent correction applied after every reverse step
//!
//! Outside the face region the sample tracks the target forward-noised to the
//! current timestep. Inside it the sample is free, with the freedom ramping in as
//! the noise level drops.

use anyhow::Result;
use candle_core::Tensor;
use log::trace;
use rand::rngs::StdRng;

use super::guidance::GuidanceContext;
use crate::diffusion::{gaussian_noise, GaussianDiffusion, StepOutput};

/// Respaced timestep where the soft mask starts to open
pub const MASK_RAMP_START: usize = 75;

/// Soft mask factor in [0, 1]: 0 at `t + 1 >= MASK_RAMP_START`, rising linearly
/// to 1 at `t + 1 <= masking_threshold`.
pub fn mask_scale(t: usize, masking_threshold: usize) -> f64 {
    let span = MASK_RAMP_START as f64 - masking_threshold as f64;
    if span <= 0.0 {
        return if t + 1 >= MASK_RAMP_START { 0.0 } else { 1.0 };
    }
    let ramp = (MASK_RAMP_START as f64 - (t + 1) as f64) / span;
    ramp.min(1.0).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskScheduler {
    pub masking_threshold: usize,
    pub enforce_background: bool,
}

impl MaskScheduler {
    pub fn new(masking_threshold: usize, enforce_background: bool) -> Self {
        Self { masking_threshold, enforce_background }
    }

    pub fn scale(&self, t: usize) -> f64 {
        mask_scale(t, self.masking_threshold)
    }

    /// Region mask scaled for timestep `t`, never above the region mask itself
    pub fn soft_mask(&self, region_mask: &Tensor, t: usize) -> Result<Tensor> {
        Ok(region_mask.affine(self.scale(t), 0.0)?)
    }

    fn blends_at(&self, t: usize) -> bool {
        self.enforce_background || t > self.masking_threshold
    }

    /// Blend the step output with the target noised to `t`. Noise for the
    /// background reference is drawn from `rng`.
    pub fn apply(
        &self,
        out: StepOutput,
        t: usize,
        ctx: &GuidanceContext,
        diffusion: &GaussianDiffusion,
        rng: &mut StdRng,
    ) -> Result<StepOutput> {
        if !self.blends_at(t) {
            return Ok(out);
        }

        let noise = gaussian_noise(ctx.target.dims(), rng, ctx.target.device())?;
        let background = diffusion
            .q_sample(&ctx.target, t, &noise)?
            .broadcast_as(out.sample.shape())?;
        let soft_mask = self.soft_mask(ctx.region_mask.tensor(), t)?;
        let inverse = soft_mask.affine(-1.0, 1.0)?;
        trace!("Mask blend at t={} with scale {:.3}", t, self.scale(t));

        let sample = (out.sample.broadcast_mul(&soft_mask)? + background.broadcast_mul(&inverse)?)?;
        Ok(StepOutput { sample, pred_xstart: out.pred_xstart })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::BetaSchedule;
    use crate::editing::loss_terms::RegionMask;
    use crate::editing::GuidanceConfig;
    use crate::models::mock::MockNetworks;
    use candle_core::{DType, Device};
    use rand::SeedableRng;

    fn context(labels: Vec<u32>, size: usize) -> Result<GuidanceContext> {
        let device = Device::Cpu;
        let mocks = MockNetworks::new(8, 16)?;
        let source = Tensor::full(0.2f32, (1, 3, size, size), &device)?;
        let target = Tensor::full(-0.4f32, (1, 3, size, size), &device)?;
        let mut ctx = GuidanceContext::new(source, target, mocks.networks(), &GuidanceConfig::default())?;
        ctx.region_mask = RegionMask::from_labels(labels, size, size, &device)?;
        Ok(ctx)
    }

    fn step_output(value: f32, size: usize) -> Result<StepOutput> {
        let sample = Tensor::full(value, (1, 3, size, size), &Device::Cpu)?;
        Ok(StepOutput { pred_xstart: sample.clone(), sample })
    }

    fn flat(t: &Tensor) -> Result<Vec<f32>> {
        Ok(t.flatten_all()?.to_vec1()?)
    }

    #[test]
    fn test_scale_bounds_and_monotonicity() {
        for threshold in [10, 25, 30, 74] {
            let mut previous = f64::INFINITY;
            for t in 0..100 {
                let scale = mask_scale(t, threshold);
                assert!((0.0..=1.0).contains(&scale));
                // non-increasing in t, so it only grows as t counts down
                assert!(scale <= previous);
                previous = scale;
            }
            assert_eq!(mask_scale(0, threshold), 1.0);
            assert_eq!(mask_scale(80, threshold), 0.0);
        }
        assert!((mask_scale(49, 25) - 0.5).abs() < 1e-12);
        assert_eq!(mask_scale(24, 25), 1.0);
    }

    #[test]
    fn test_soft_mask_never_exceeds_region() -> Result<()> {
        let device = Device::Cpu;
        let scheduler = MaskScheduler::new(25, true);
        let region = RegionMask::from_labels(vec![0, 1, 1, 17], 2, 2, &device)?;
        for t in [0, 24, 40, 74, 99] {
            let soft = scheduler.soft_mask(region.tensor(), t)?;
            let excess = (soft - region.tensor())?.max_keepdim(2)?.max_keepdim(3)?;
            assert!(excess.flatten_all()?.to_vec1::<f32>()?[0] <= 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_passthrough_below_threshold_without_enforcement() -> Result<()> {
        let diffusion = GaussianDiffusion::new(1000, BetaSchedule::Linear, "100")?;
        let ctx = context(vec![1; 16], 4)?;
        let scheduler = MaskScheduler::new(25, false);
        let out = step_output(0.7, 4)?;
        let mut rng = StdRng::seed_from_u64(3);
        let result = scheduler.apply(out.clone(), 10, &ctx, &diffusion, &mut rng)?;
        assert_eq!(flat(&result.sample)?, flat(&out.sample)?);
        Ok(())
    }

    #[test]
    fn test_high_noise_follows_background_without_enforcement() -> Result<()> {
        // At t=80 the ramp has not opened: the face region is closed and the
        // whole sample is replaced by the noised target
        let diffusion = GaussianDiffusion::new(1000, BetaSchedule::Linear, "100")?;
        let ctx = context(vec![1; 16], 4)?;
        let scheduler = MaskScheduler::new(25, false);
        let out = step_output(0.7, 4)?;

        let mut rng = StdRng::seed_from_u64(5);
        let mut reference_rng = rng.clone();
        let result = scheduler.apply(out, 80, &ctx, &diffusion, &mut rng)?;
        let noise = gaussian_noise(ctx.target.dims(), &mut reference_rng, &Device::Cpu)?;
        let background = diffusion.q_sample(&ctx.target, 80, &noise)?;
        for (a, b) in flat(&result.sample)?.iter().zip(flat(&background)?) {
            assert!((a - b).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_enforced_background_at_low_noise() -> Result<()> {
        let diffusion = GaussianDiffusion::new(1000, BetaSchedule::Linear, "100")?;
        // Top row is face, bottom row is background
        let ctx = context(vec![1, 1, 0, 0], 2)?;
        let scheduler = MaskScheduler::new(25, true);
        assert_eq!(scheduler.scale(10), 1.0);
        let out = step_output(0.7, 2)?;

        let mut rng = StdRng::seed_from_u64(9);
        let mut reference_rng = rng.clone();
        let result = scheduler.apply(out, 10, &ctx, &diffusion, &mut rng)?;
        let noise = gaussian_noise(ctx.target.dims(), &mut reference_rng, &Device::Cpu)?;
        let background = flat(&diffusion.q_sample(&ctx.target, 10, &noise)?)?;

        let values = flat(&result.sample)?;
        for channel in 0..3 {
            let base = channel * 4;
            assert!((values[base] - 0.7).abs() < 1e-6);
            assert!((values[base + 1] - 0.7).abs() < 1e-6);
            assert!((values[base + 2] - background[base + 2]).abs() < 1e-6);
            assert!((values[base + 3] - background[base + 3]).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_background_reference_tiles_over_batch() -> Result<()> {
        let diffusion = GaussianDiffusion::new(1000, BetaSchedule::Linear, "100")?;
        let ctx = context(vec![0; 16], 4)?;
        let scheduler = MaskScheduler::new(25, true);
        let sample = Tensor::zeros((3, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let out = StepOutput { pred_xstart: sample.clone(), sample };
        let mut rng = StdRng::seed_from_u64(2);
        let result = scheduler.apply(out, 50, &ctx, &diffusion, &mut rng)?;
        assert_eq!(result.sample.dims(), &[3, 3, 4, 4]);
        let first = flat(&result.sample.get(0)?)?;
        assert_eq!(first, flat(&result.sample.get(2)?)?);
        Ok(())
    }
}
