//! Drives the guided reverse diffusion over every source/target pair
//!
//! Per pair: build the [`GuidanceContext`] once, run `iterations_num` independent
//! trajectories from the forward-noised target, composite each final prediction
//! against the target background, score it by identity distance to the source and
//! store it in the pair's rank directory.

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

use super::data_loader::{ImageFolder, PairPaths, PairStream, Prefetcher};
use super::guidance::{guidance_gradient, GuidanceContext};
use super::image_utils::{colorize_parsing, save_image, to_unit_range};
use super::loss_terms::{identity_distance, RegionMask};
use super::mask_scheduler::MaskScheduler;
use super::metrics::LossAccumulator;
use super::rank_store::{format_distance, RankStore, RankedResult};
use super::ProcessConfig;
use crate::diffusion::{GaussianDiffusion, LoopStep, SamplerKind};
use crate::error::EditError;
use crate::models::Networks;

/// Outcome of one source/target pair
#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub index: usize,
    pub source: PathBuf,
    pub target: PathBuf,
    /// Ascending identity distance
    pub candidates: Vec<RankedResult>,
    /// Trajectories dropped after a numeric failure
    pub failed_iterations: usize,
}

impl PairReport {
    pub fn best(&self) -> Option<&RankedResult> {
        self.candidates.first()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub pairs: Vec<PairReport>,
    pub data_restarts: u64,
    pub landmark_misses: u64,
}

/// Final composite of one trajectory
struct Candidate {
    iteration: usize,
    distance: f32,
    composite: Tensor,
}

pub struct SamplingOrchestrator<'a> {
    process: ProcessConfig,
    device: Device,
    nets: Networks<'a>,
    diffusion: GaussianDiffusion,
    scheduler: MaskScheduler,
    sampler: SamplerKind,
}

impl<'a> SamplingOrchestrator<'a> {
    pub fn new(process: ProcessConfig, device: Device, nets: Networks<'a>) -> Result<Self> {
        process.validate()?;
        let sampling = &process.sampling;
        let diffusion = GaussianDiffusion::new(
            sampling.diffusion_steps,
            sampling.noise_schedule,
            &sampling.timestep_respacing,
        )?;
        let scheduler = MaskScheduler::new(sampling.masking_threshold, sampling.enforce_background);
        let sampler = if sampling.ddim {
            SamplerKind::Ddim { eta: sampling.ddim_eta }
        } else {
            SamplerKind::Ddpm
        };
        info!(
            "Sampler: {:?}, {:?} schedule, {} respaced steps, skipping {}",
            sampler,
            sampling.noise_schedule,
            diffusion.num_timesteps(),
            sampling.skip_timesteps
        );
        Ok(Self { process, device, nets, diffusion, scheduler, sampler })
    }

    /// Edit every pair of the configured folders
    pub fn run(&self) -> Result<RunSummary> {
        let data = &self.process.data;
        let sources = ImageFolder::scan(&data.source_dir)?;
        let targets = ImageFolder::scan(&data.target_dir)?;
        let stream = PairStream::new(sources, targets)?;
        let total = stream.len();
        info!("Number of pairs: {}", total);

        let mut totals = LossAccumulator::new();
        let mut summary = RunSummary::default();
        let start = Instant::now();

        for loaded in Prefetcher::spawn(stream, total, data.image_size, data.prefetch) {
            let loaded = loaded?;
            if loaded.paths.wrapped {
                totals.record_soft_failure(&EditError::DataExhausted(loaded.paths.index));
            }
            let (source, target) = loaded.to_tensors(&self.device)?;
            let report = self.edit_pair(&loaded.paths, &source, &target, &mut totals)?;
            if let Some(best) = report.best() {
                info!("Pair {} best distance {}", report.index, format_distance(best.distance));
            }
            summary.pairs.push(report);
        }

        summary.data_restarts = totals.soft_failures("data_exhausted");
        summary.landmark_misses = totals.soft_failures("landmark_not_found");
        info!("Edited {} pairs in {:.1}s", summary.pairs.len(), start.elapsed().as_secs_f64());
        Ok(summary)
    }

    fn pair_dir(&self, index: usize) -> PathBuf {
        self.process.output.path.join(index.to_string())
    }

    /// Run every iteration of one pair. `source` and `target` are `[1, 3, H, W]` in [-1, 1].
    pub fn edit_pair(
        &self,
        paths: &PairPaths,
        source: &Tensor,
        target: &Tensor,
        totals: &mut LossAccumulator,
    ) -> Result<PairReport> {
        info!("Editing pair {}: {} -> {}", paths.index, paths.source.display(), paths.target.display());
        let pair_dir = self.pair_dir(paths.index);
        let store = RankStore::new(&pair_dir)?;
        let ctx = GuidanceContext::new(source.clone(), target.clone(), self.nets, &self.process.guidance)
            .context("Failed to prepare guidance context")?;

        let sampling = &self.process.sampling;
        let shared = Mutex::new(LossAccumulator::new());
        let iterations = 0..sampling.iterations_num;
        let outcomes: Vec<Result<Candidate>> = if sampling.parallel_iterations {
            let threads = sampling
                .num_threads
                .unwrap_or_else(num_cpus::get)
                .clamp(1, sampling.iterations_num);
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
            pool.install(|| {
                iterations
                    .into_par_iter()
                    .map(|i| self.run_iteration(paths.index, i, &ctx, &shared))
                    .collect()
            })
        } else {
            iterations.map(|i| self.run_iteration(paths.index, i, &ctx, &shared)).collect()
        };

        let mut failed_iterations = 0;
        let mut candidates = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let candidate = match outcome {
                Ok(candidate) => candidate,
                Err(e) => match e.downcast_ref::<EditError>() {
                    Some(EditError::NumericInstability { .. }) => {
                        error!("Pair {}: dropping trajectory: {}", paths.index, e);
                        failed_iterations += 1;
                        continue;
                    }
                    _ => return Err(e),
                },
            };
            self.save_visualization(&pair_dir, &ctx, &candidate)?;
            let stored = store.store(candidate.distance, &candidate.composite.squeeze(0)?)?;
            info!(
                "Pair {} iteration {}: identity distance {}",
                paths.index,
                candidate.iteration,
                format_distance(stored.distance)
            );
            candidates.push(stored);
        }
        // Only this run's candidates; the rank directory may hold earlier ones
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        let shared = shared.into_inner().map_err(|_| anyhow!("loss accumulator lock poisoned"))?;
        totals.merge(&shared);

        Ok(PairReport {
            index: paths.index,
            source: paths.source.clone(),
            target: paths.target.clone(),
            candidates,
            failed_iterations,
        })
    }

    /// One generator per (pair, iteration): the same seed replays the same trajectory
    fn iteration_rng(&self, pair_index: usize, iteration: usize) -> StdRng {
        match self.process.sampling.seed {
            Some(seed) => {
                let unit = ((pair_index as u64) << 32) | iteration as u64;
                StdRng::seed_from_u64(seed.wrapping_add(unit))
            }
            None => StdRng::from_entropy(),
        }
    }

    fn run_iteration(
        &self,
        pair_index: usize,
        iteration: usize,
        ctx: &GuidanceContext,
        shared: &Mutex<LossAccumulator>,
    ) -> Result<Candidate> {
        info!("Pair {}: start iteration {}", pair_index, iteration);
        let mut seeds = self.iteration_rng(pair_index, iteration);
        let loop_rng = StdRng::from_rng(&mut seeds)?;
        let mut mask_rng = StdRng::from_rng(&mut seeds)?;
        let mut metrics = LossAccumulator::new();

        let last = {
            let nets = self.nets;
            let diffusion = &self.diffusion;
            let scheduler = self.scheduler;
            let sampling = &self.process.sampling;

            let samples = diffusion.sample_loop_progressive(
                nets.denoiser,
                &ctx.target,
                sampling.batch_size,
                sampling.skip_timesteps,
                &ctx.source_embedding,
                self.sampler,
                loop_rng,
                |x: &Tensor, t: usize| guidance_gradient(x, t, ctx, nets, diffusion, &mut metrics),
                |out, t: usize| scheduler.apply(out, t, ctx, diffusion, &mut mask_rng),
            )?;
            let progress = StepProgress::new(samples.remaining() as u64, sampling.parallel_iterations);

            let mut last: Option<LoopStep> = None;
            for step in samples {
                let step = step?;
                progress.tick(step.t);
                last = Some(step);
            }
            progress.finish();
            last.context("reverse diffusion produced no steps")?
        };

        let label = format!("pair {} iteration {}", pair_index, iteration);
        shared
            .lock()
            .map_err(|_| anyhow!("loss accumulator lock poisoned"))?
            .merge(&metrics);
        metrics.log_averages(&label);

        self.evaluate_final(iteration, ctx, &last)
    }

    /// Composite the first batch element against the target and score it
    fn evaluate_final(&self, iteration: usize, ctx: &GuidanceContext, last: &LoopStep) -> Result<Candidate> {
        let prediction = last.output.pred_xstart.get(0)?.unsqueeze(0)?;
        let mask = if self.process.sampling.enforce_background {
            ctx.region_mask.clone()
        } else {
            let prediction01 = to_unit_range(&prediction)?.clamp(0f32, 1f32)?;
            RegionMask::from_image(self.nets.parser, &prediction01)?
        };

        let inverse = mask.tensor().affine(-1.0, 1.0)?;
        let composite = (ctx.target.broadcast_mul(&inverse)? + prediction.broadcast_mul(mask.tensor())?)?
            .clamp(-1f32, 1f32)?;

        let composite01 = to_unit_range(&composite)?;
        let source01 = to_unit_range(&ctx.source)?.clamp(0f32, 1f32)?;
        let distance = identity_distance(self.nets.embedder, &composite01, &source01)?;
        if !distance.is_finite() {
            return Err(EditError::NumericInstability { step: last.t, what: "identity distance" }.into());
        }
        Ok(Candidate { iteration, distance, composite })
    }

    /// Strip of source | target | edited | mask | target parsing | edited parsing
    fn save_visualization(&self, pair_dir: &Path, ctx: &GuidanceContext, candidate: &Candidate) -> Result<()> {
        let (height, width) = ctx.region_mask.dims();
        let edited01 = to_unit_range(&candidate.composite)?;
        let edited_parsing = RegionMask::from_image(self.nets.parser, &edited01)?;

        let mask = ctx.region_mask.tensor().squeeze(0)?.affine(2.0, -1.0)?.repeat((3, 1, 1))?;
        let panels = [
            ctx.source.squeeze(0)?,
            ctx.target.squeeze(0)?,
            candidate.composite.squeeze(0)?,
            mask,
            colorize_parsing(ctx.region_mask.labels(), height, width, &self.device)?,
            colorize_parsing(edited_parsing.labels(), height, width, &self.device)?,
        ];
        let strip = Tensor::cat(&panels, 2)?;

        let name = Path::new(&self.process.output.visualization_name);
        let stem = name.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "output".into());
        let path = pair_dir.join(format!("{}_i_{}_b_0.png", stem, candidate.iteration));
        save_image(&strip, &path)
    }
}

/// Step counter for one trajectory. Hidden for parallel iterations.
struct StepProgress {
    #[cfg(feature = "progress-bar")]
    bar: ProgressBar,
}

impl StepProgress {
    #[cfg(feature = "progress-bar")]
    fn new(steps: u64, hidden: bool) -> Self {
        let bar = if hidden { ProgressBar::hidden() } else { ProgressBar::new(steps) };
        if let Ok(style) = ProgressStyle::default_bar().template("{bar:40} {pos}/{len} t={msg} [{elapsed_precise}]") {
            bar.set_style(style);
        }
        Self { bar }
    }

    #[cfg(not(feature = "progress-bar"))]
    fn new(_steps: u64, _hidden: bool) -> Self {
        Self {}
    }

    fn tick(&self, t: usize) {
        #[cfg(feature = "progress-bar")]
        {
            self.bar.set_message(t.to_string());
            self.bar.inc(1);
        }
        #[cfg(not(feature = "progress-bar"))]
        log::debug!("step t={}", t);
    }

    fn finish(&self) {
        #[cfg(feature = "progress-bar")]
        self.bar.finish_and_clear();
    }
}
