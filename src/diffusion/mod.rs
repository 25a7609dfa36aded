pub mod schedule;
pub mod sampler;

pub use schedule::{space_timesteps, BetaSchedule, GaussianDiffusion, MeanVariance};
pub use sampler::{gaussian_noise, LoopStep, SampleLoop, SamplerKind, StepOutput};

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::error::EditError;

/// Fail with `NumericInstability` when `tensor` holds a NaN or an infinity.
/// Both propagate through a sum, so one reduction is enough.
pub fn ensure_finite(tensor: &Tensor, step: usize, what: &'static str) -> Result<()> {
    let total = tensor.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if total.is_finite() {
        Ok(())
    } else {
        Err(EditError::NumericInstability { step, what }.into())
    }
}
