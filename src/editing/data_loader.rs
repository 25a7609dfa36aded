//! Source/target pair streaming
//!
//! Both folders are scanned once and sorted, so pair order is stable across runs.
//! When either side runs out the stream restarts both from the beginning, in the
//! same order. A worker thread decodes pairs ahead of the sampler through a
//! bounded channel.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use image::RgbImage;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::thread::{self, JoinHandle};

use super::image_utils::{load_rgb, rgb_to_tensor};
use crate::error::EditError;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Sorted list of the images below a directory
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    paths: Vec<PathBuf>,
}

impl ImageFolder {
    pub fn scan<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut paths = Vec::new();
        collect_images(&root, &mut paths)?;
        paths.sort();
        info!("Found {} images in {}", paths.len(), root.display());
        Ok(Self { root, paths })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read image directory: {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if let Some(ext) = path.extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                out.push(path);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairPaths {
    /// Position in the stream, keeps counting across restarts
    pub index: usize,
    pub source: PathBuf,
    pub target: PathBuf,
    /// Set on the first pair after the stream restarted
    pub wrapped: bool,
}

pub struct PairStream {
    sources: Vec<PathBuf>,
    targets: Vec<PathBuf>,
    cursor: usize,
    produced: usize,
}

impl PairStream {
    pub fn new(sources: ImageFolder, targets: ImageFolder) -> Result<Self> {
        if sources.is_empty() {
            bail!("No source images found in {}", sources.root().display());
        }
        if targets.is_empty() {
            bail!("No target images found in {}", targets.root().display());
        }
        if sources.len() != targets.len() {
            warn!(
                "{} source images but {} target images, the shorter side restarts both",
                sources.len(),
                targets.len()
            );
        }
        Ok(Self { sources: sources.paths, targets: targets.paths, cursor: 0, produced: 0 })
    }

    /// Number of source images
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Next pair. Never fails: running out restarts from the first pair and flags
    /// the restart on the returned pair.
    pub fn next_pair(&mut self) -> PairPaths {
        let mut wrapped = false;
        if self.cursor >= self.sources.len() || self.cursor >= self.targets.len() {
            warn!("{}", EditError::DataExhausted(self.produced));
            self.cursor = 0;
            wrapped = true;
        }
        let pair = PairPaths {
            index: self.produced,
            source: self.sources[self.cursor].clone(),
            target: self.targets[self.cursor].clone(),
            wrapped,
        };
        self.cursor += 1;
        self.produced += 1;
        pair
    }
}

/// Decoded pair, still on the host
#[derive(Debug, Clone)]
pub struct LoadedPair {
    pub paths: PairPaths,
    pub source: RgbImage,
    pub target: RgbImage,
}

impl LoadedPair {
    pub fn load(paths: PairPaths, image_size: usize) -> Result<Self> {
        let source = load_rgb(&paths.source, image_size)?;
        let target = load_rgb(&paths.target, image_size)?;
        Ok(Self { paths, source, target })
    }

    /// Source and target as `[1, 3, H, W]` tensors in [-1, 1]
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let source = rgb_to_tensor(&self.source, device)?.affine(2.0, -1.0)?;
        let target = rgb_to_tensor(&self.target, device)?.affine(2.0, -1.0)?;
        Ok((source, target))
    }
}

/// Loads `count` pairs on a worker thread, at most `capacity` ahead of the consumer
pub struct Prefetcher {
    receiver: Option<Receiver<Result<LoadedPair>>>,
    worker: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn spawn(mut stream: PairStream, count: usize, image_size: usize, capacity: usize) -> Self {
        let (sender, receiver) = sync_channel(capacity.max(1));
        let worker = thread::spawn(move || {
            for _ in 0..count {
                let paths = stream.next_pair();
                debug!("Prefetching pair {}: {}", paths.index, paths.source.display());
                let loaded = LoadedPair::load(paths, image_size);
                // Consumer hung up
                if sender.send(loaded).is_err() {
                    break;
                }
            }
        });
        Self { receiver: Some(receiver), worker: Some(worker) }
    }
}

impl Iterator for Prefetcher {
    type Item = Result<LoadedPair>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Closing the channel first unblocks a worker waiting on a full buffer
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Prefetch worker panicked");
            }
        }
    }
}
