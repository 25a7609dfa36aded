//! Per-step guidance gradient
//!
//! `guidance_gradient` evaluates the weighted loss on the predicted clean image
//! and differentiates it with respect to the noisy sample. Everything it needs is
//! passed in: the per-pair [`GuidanceContext`], the collaborators and the schedule.

use anyhow::Result;
use candle_core::{DType, Tensor, Var};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::image_utils::to_unit_range;
use super::loss_terms::{
    background_loss, embed_identity, gaze_loss, identity_loss, parse_logits, parsing_labels,
    segmentation_loss, EyeBoxes, RegionMask, GAZE_WINDOW,
};
use super::metrics::LossAccumulator;
use super::GuidanceConfig;
use crate::diffusion::{ensure_finite, GaussianDiffusion};
use crate::error::EditError;
use crate::models::Networks;

/// What to do with a gradient holding NaN or infinity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NonFinitePolicy {
    /// End the trajectory with `NumericInstability`
    #[default]
    Abort,
    /// Continue with a zero gradient for this step
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceWeights {
    pub identity: f64,
    pub segmentation: f64,
    pub gaze: f64,
    pub background: f64,
}

impl Default for GuidanceWeights {
    fn default() -> Self {
        Self { identity: 1.0, segmentation: 200.0, gaze: 200.0, background: 50.0 }
    }
}

/// Everything fixed for one source/target pair. Built once, shared read-only by
/// every step of every iteration of that pair.
#[derive(Debug, Clone)]
pub struct GuidanceContext {
    /// `[1, 3, H, W]` in [-1, 1]
    pub source: Tensor,
    /// `[1, 3, H, W]` in [-1, 1]
    pub target: Tensor,
    pub region_mask: RegionMask,
    /// L2-normalized `[1, D]`, also the denoiser's identity condition
    pub source_embedding: Tensor,
    /// Parser logits of the target at image resolution
    pub target_logits: Tensor,
    /// `None` when no face landmarks were found on the target
    pub eye_boxes: Option<EyeBoxes>,
    pub weights: GuidanceWeights,
    pub aug_num: usize,
    pub non_finite: NonFinitePolicy,
    pub max_grad_norm: Option<f64>,
}

impl GuidanceContext {
    pub fn new(source: Tensor, target: Tensor, nets: Networks<'_>, config: &GuidanceConfig) -> Result<Self> {
        let (_, _, height, width) = target.dims4()?;
        let source01 = to_unit_range(&source)?;
        let target01 = to_unit_range(&target)?;

        let source_embedding = embed_identity(nets.embedder, &source01)?.detach();
        let target_logits = parse_logits(nets.parser, &target01, height, width)?.detach();
        let region_mask = RegionMask::from_labels(parsing_labels(&target_logits)?, height, width, target.device())?;

        let eye_boxes = match nets.landmarks.locate(&target01)? {
            Some(landmarks) => EyeBoxes::from_landmarks(&landmarks, height, width),
            None => None,
        };
        if eye_boxes.is_none() {
            warn!("No eye landmarks on target, gaze guidance disabled for this pair");
        }

        Ok(Self {
            source,
            target,
            region_mask,
            source_embedding,
            target_logits,
            eye_boxes,
            weights: config.weights(),
            aug_num: config.aug_num,
            non_finite: config.non_finite,
            max_grad_norm: config.max_grad_norm,
        })
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64)
}

/// Negated gradient of the weighted guidance loss at `(x, t)`.
///
/// The loss is evaluated on `x_in = pred_xstart * f + x * (1 - f)` with
/// `f = sqrt(1 - alpha_bar_t)`. The region mask enters as a constant.
pub fn guidance_gradient(
    x: &Tensor,
    t: usize,
    ctx: &GuidanceContext,
    nets: Networks<'_>,
    diffusion: &GaussianDiffusion,
    metrics: &mut LossAccumulator,
) -> Result<Tensor> {
    let x = Var::from_tensor(&x.detach())?;
    let out = diffusion.p_mean_variance(nets.denoiser, x.as_tensor(), t, &ctx.source_embedding)?;
    let fac = diffusion.sqrt_one_minus_alpha_cumprod(t);
    let x_in = (out.pred_xstart.affine(fac, 0.0)? + x.as_tensor().affine(1.0 - fac, 0.0)?)?;
    let x_in01 = to_unit_range(&x_in)?;
    let target01 = to_unit_range(&ctx.target)?;
    let mask = ctx.region_mask.tensor();
    let weights = &ctx.weights;

    let mut loss = Tensor::zeros((), x_in.dtype(), x_in.device())?;

    if weights.identity != 0.0 {
        let id = identity_loss(nets.embedder, &x_in01, mask, &ctx.source_embedding, ctx.aug_num)?;
        metrics.update_metric("id_loss", scalar(&id)?);
        loss = (loss + id.affine(weights.identity, 0.0)?)?;
    }

    if weights.segmentation != 0.0 {
        let seg = segmentation_loss(nets.parser, &x_in01, &ctx.target_logits)?;
        metrics.update_metric("seg_loss", scalar(&seg)?);
        loss = (loss + seg.affine(weights.segmentation, 0.0)?)?;
    }

    if weights.gaze != 0.0 && GAZE_WINDOW.contains(t) {
        match &ctx.eye_boxes {
            Some(eyes) => {
                let gaze = gaze_loss(nets.gaze, &x_in01, &target01, eyes)?;
                metrics.update_metric("gaze_loss", scalar(&gaze)?);
                loss = (loss + gaze.affine(weights.gaze, 0.0)?)?;
            }
            None => metrics.record_soft_failure(&EditError::LandmarkNotFound),
        }
    }

    if weights.background != 0.0 {
        let l2 = background_loss(&x_in, &ctx.target)?;
        metrics.update_metric("l2_loss", scalar(&l2)?);
        loss = (loss + l2.affine(weights.background, 0.0)?)?;
    }

    // Diagnostic only, against the target with the face region blanked
    let outside = ctx.target.broadcast_mul(&mask.affine(-1.0, 1.0)?)?;
    let bg = background_loss(&x_in.detach(), &outside)?;
    metrics.update_metric("bg_loss", scalar(&bg)?);

    let gradient = match loss.backward()?.remove(x.as_tensor()) {
        Some(gradient) => gradient,
        // No active term touched the sample
        None => x.zeros_like()?,
    };

    let gradient = match ensure_finite(&gradient, t, "gradient") {
        Ok(()) => gradient,
        Err(e) => match ctx.non_finite {
            NonFinitePolicy::Abort => return Err(e),
            NonFinitePolicy::Zero => {
                warn!("Non-finite gradient at t={}, continuing without guidance for this step", t);
                metrics.record_soft_failure(&EditError::NumericInstability { step: t, what: "gradient" });
                gradient.zeros_like()?
            }
        },
    };

    let gradient = match ctx.max_grad_norm {
        Some(max_norm) => clip_norm(&gradient, max_norm)?,
        None => gradient,
    };
    debug!("t={} loss={:.6}", t, scalar(&loss)?);

    Ok(gradient.neg()?)
}

/// Rescale `gradient` so its L2 norm is at most `max_norm`
fn clip_norm(gradient: &Tensor, max_norm: f64) -> Result<Tensor> {
    let norm = scalar(&gradient.sqr()?.sum_all()?.sqrt()?)?;
    if norm > max_norm && norm > 0.0 {
        Ok(gradient.affine(max_norm / norm, 0.0)?)
    } else {
        Ok(gradient.clone())
    }
}
