//! Guided reverse diffusion steps and the progressive sample loop
//!
//! The loop is a lazy, non-restartable sequence: each item is one reverse
//! transition, produced from the previous sample. Guidance and masking are
//! injected as callbacks so the loop knows nothing about faces.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::iter::Rev;
use std::ops::Range;

use super::schedule::GaussianDiffusion;
use super::ensure_finite;
use crate::models::DenoisingModel;

/// Which reverse transition drives the loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerKind {
    Ddpm,
    Ddim { eta: f64 },
}

/// Result of one reverse transition
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub sample: Tensor,
    pub pred_xstart: Tensor,
}

/// One element of the progressive loop
#[derive(Debug, Clone)]
pub struct LoopStep {
    /// Position in the sequence, 0 for the first transition
    pub index: usize,
    /// Respaced timestep this transition started from
    pub t: usize,
    pub output: StepOutput,
}

/// Draw standard normal noise from a seeded generator
pub fn gaussian_noise(shape: &[usize], rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let num_elements: usize = shape.iter().product();
    let data: Vec<f32> = (0..num_elements)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

impl GaussianDiffusion {
    /// DDPM step. The guidance gradient shifts the predicted mean by `variance * gradient`.
    pub fn p_sample<G>(
        &self,
        model: &dyn DenoisingModel,
        x: &Tensor,
        t: usize,
        identity: &Tensor,
        guidance: &mut G,
        noise: &Tensor,
    ) -> Result<StepOutput>
    where
        G: FnMut(&Tensor, usize) -> Result<Tensor>,
    {
        let out = self.p_mean_variance(model, x, t, identity)?;
        let gradient = guidance(x, t)?;
        let mean = (&out.mean + (&out.variance * &gradient)?)?;

        let sample = if t == 0 {
            mean
        } else {
            let std = out.log_variance.affine(0.5, 0.0)?.exp()?;
            (mean + (std * noise)?)?
        };

        Ok(StepOutput { sample: sample.detach(), pred_xstart: out.pred_xstart.detach() })
    }

    /// DDIM step with score conditioning: eps -= sqrt(1 - alpha_bar) * gradient
    pub fn ddim_sample<G>(
        &self,
        model: &dyn DenoisingModel,
        x: &Tensor,
        t: usize,
        identity: &Tensor,
        guidance: &mut G,
        noise: &Tensor,
        eta: f64,
    ) -> Result<StepOutput>
    where
        G: FnMut(&Tensor, usize) -> Result<Tensor>,
    {
        let out = self.p_mean_variance(model, x, t, identity)?;
        let alpha_bar = self.alpha_cumprod(t);
        let alpha_bar_prev = self.alpha_cumprod_prev(t);

        let gradient = guidance(x, t)?;
        let eps = self.predict_eps_from_xstart(x, t, &out.pred_xstart)?;
        let eps = (eps - gradient.affine((1.0 - alpha_bar).sqrt(), 0.0)?)?;
        let pred_xstart = self.predict_xstart_from_eps(x, t, &eps)?;
        let eps = self.predict_eps_from_xstart(x, t, &pred_xstart)?;

        let sigma = eta
            * ((1.0 - alpha_bar_prev) / (1.0 - alpha_bar)).sqrt()
            * (1.0 - alpha_bar / alpha_bar_prev).sqrt();
        let direction = (1.0 - alpha_bar_prev - sigma * sigma).max(0.0).sqrt();
        let mean_pred = (pred_xstart.affine(alpha_bar_prev.sqrt(), 0.0)? + eps.affine(direction, 0.0)?)?;

        let sample = if t == 0 || sigma == 0.0 {
            mean_pred
        } else {
            (mean_pred + noise.affine(sigma, 0.0)?)?
        };

        Ok(StepOutput { sample: sample.detach(), pred_xstart: pred_xstart.detach() })
    }

    /// Start a progressive loop from `init_image` forward-noised to the first retained
    /// timestep. The sequence has `num_timesteps - skip_timesteps` elements, running
    /// from timestep `num_timesteps - skip_timesteps - 1` down to 0.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_loop_progressive<'a, G, P>(
        &'a self,
        model: &'a dyn DenoisingModel,
        init_image: &Tensor,
        batch_size: usize,
        skip_timesteps: usize,
        identity: &'a Tensor,
        sampler: SamplerKind,
        mut rng: StdRng,
        guidance: G,
        postprocess: P,
    ) -> Result<SampleLoop<'a, G, P>>
    where
        G: FnMut(&Tensor, usize) -> Result<Tensor>,
        P: FnMut(StepOutput, usize) -> Result<StepOutput>,
    {
        if skip_timesteps >= self.num_timesteps() {
            bail!(
                "skip_timesteps ({}) must be below the number of timesteps ({})",
                skip_timesteps,
                self.num_timesteps()
            );
        }
        let (_, channels, height, width) = init_image.dims4()?;
        let shape = [batch_size, channels, height, width];
        let steps = self.num_timesteps() - skip_timesteps;

        let noise = gaussian_noise(&shape, &mut rng, init_image.device())?;
        let img = self.q_sample(init_image, steps - 1, &noise)?;
        debug!("Sample loop starts at t={} for shape {:?}", steps - 1, shape);

        Ok(SampleLoop {
            diffusion: self,
            model,
            identity,
            sampler,
            shape,
            img: Some(img),
            indices: (0..steps).rev(),
            position: 0,
            rng,
            guidance,
            postprocess,
        })
    }
}

pub struct SampleLoop<'a, G, P> {
    diffusion: &'a GaussianDiffusion,
    model: &'a dyn DenoisingModel,
    identity: &'a Tensor,
    sampler: SamplerKind,
    shape: [usize; 4],
    img: Option<Tensor>,
    indices: Rev<Range<usize>>,
    position: usize,
    rng: StdRng,
    guidance: G,
    postprocess: P,
}

impl<'a, G, P> SampleLoop<'a, G, P>
where
    G: FnMut(&Tensor, usize) -> Result<Tensor>,
    P: FnMut(StepOutput, usize) -> Result<StepOutput>,
{
    /// Transitions left in the sequence
    pub fn remaining(&self) -> usize {
        if self.img.is_some() { self.indices.len() } else { 0 }
    }

    fn step(&mut self, x: &Tensor, t: usize) -> Result<StepOutput> {
        let noise = gaussian_noise(&self.shape, &mut self.rng, x.device())?;
        let out = match self.sampler {
            SamplerKind::Ddpm => self.diffusion.p_sample(
                self.model,
                x,
                t,
                self.identity,
                &mut self.guidance,
                &noise,
            )?,
            SamplerKind::Ddim { eta } => self.diffusion.ddim_sample(
                self.model,
                x,
                t,
                self.identity,
                &mut self.guidance,
                &noise,
                eta,
            )?,
        };
        let out = (self.postprocess)(out, t)?;
        ensure_finite(&out.sample, t, "sample")?;
        Ok(out)
    }
}

impl<'a, G, P> Iterator for SampleLoop<'a, G, P>
where
    G: FnMut(&Tensor, usize) -> Result<Tensor>,
    P: FnMut(StepOutput, usize) -> Result<StepOutput>,
{
    type Item = Result<LoopStep>;

    fn next(&mut self) -> Option<Self::Item> {
        let x = self.img.take()?;
        let t = self.indices.next()?;
        match self.step(&x, t) {
            Ok(output) => {
                self.img = Some(output.sample.clone());
                let index = self.position;
                self.position += 1;
                Some(Ok(LoopStep { index, t, output }))
            }
            // A failed step poisons the trajectory, the loop ends here
            Err(e) => Some(Err(e)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}
