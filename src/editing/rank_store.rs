//! Append-only store of composited candidates, named by identity distance
//!
//! Filenames are the distance with four decimals, so a plain listing of the
//! `Rank` directory is already ordered best first.

use anyhow::{Context, Result};
use candle_core::Tensor;
use log::{debug, info};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use super::image_utils::save_image;

pub const RANK_DIR: &str = "Rank";

pub fn format_distance(distance: f32) -> String {
    format!("{:.4}", distance.max(0.0))
}

/// One stored candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub distance: f32,
    pub path: PathBuf,
}

impl RankedResult {
    /// Parse `0.1234.png` or `0.1234_2.png`
    fn from_path(path: PathBuf) -> Option<Self> {
        if path.extension()?.to_str()? != "png" {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let distance = stem.split('_').next()?.parse::<f32>().ok()?;
        Some(Self { distance, path })
    }
}

#[derive(Debug, Clone)]
pub struct RankStore {
    dir: PathBuf,
}

impl RankStore {
    /// Rank directory below `pair_dir`, created if missing
    pub fn new<P: AsRef<Path>>(pair_dir: P) -> Result<Self> {
        let dir = pair_dir.as_ref().join(RANK_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create rank directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a `[3, H, W]` image in [-1, 1]. An existing file with the same
    /// distance is kept and the new one gets a numeric suffix.
    pub fn store(&self, distance: f32, image: &Tensor) -> Result<RankedResult> {
        let name = format_distance(distance);
        let mut path = self.dir.join(format!("{}.png", name));
        let mut suffix = 1;
        while path.exists() {
            path = self.dir.join(format!("{}_{}.png", name, suffix));
            suffix += 1;
        }
        save_image(image, &path)?;
        debug!("Stored candidate {}", path.display());
        Ok(RankedResult { distance, path })
    }

    /// All stored candidates, ascending distance
    pub fn ranked(&self) -> Result<Vec<RankedResult>> {
        let mut results: Vec<RankedResult> = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read rank directory: {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| RankedResult::from_path(entry.path()))
            .collect();
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.path.cmp(&b.path)));
        Ok(results)
    }
}

/// Ranked candidates of every pair directory below `output_root`
pub fn collect_rankings<P: AsRef<Path>>(output_root: P) -> Result<Vec<(String, Vec<RankedResult>)>> {
    let output_root = output_root.as_ref();
    let mut pairs = Vec::new();
    let entries = fs::read_dir(output_root)
        .with_context(|| format!("Failed to read output directory: {}", output_root.display()))?;
    for entry in entries {
        let pair_dir = entry?.path();
        if !pair_dir.join(RANK_DIR).is_dir() {
            continue;
        }
        let name = pair_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ranked = RankStore { dir: pair_dir.join(RANK_DIR) }.ranked()?;
        pairs.push((name, ranked));
    }
    // Numeric pair indices first, in index order, then any other names
    pairs.sort_by(|a, b| match (a.0.parse::<usize>(), b.0.parse::<usize>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.0.cmp(&b.0),
    });
    info!("Collected rankings for {} pairs", pairs.len());
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_format_distance() {
        assert_eq!(format_distance(0.12345), "0.1235");
        assert_eq!(format_distance(1.0), "1.0000");
        assert_eq!(format_distance(-1e-7), "0.0000");
    }

    #[test]
    fn test_store_never_overwrites() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RankStore::new(dir.path().join("0"))?;
        let image = Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu)?;

        let first = store.store(0.25, &image)?;
        let second = store.store(0.25, &image)?;
        assert_eq!(first.path.file_name().unwrap(), "0.2500.png");
        assert_eq!(second.path.file_name().unwrap(), "0.2500_1.png");
        assert!(first.path.exists() && second.path.exists());
        Ok(())
    }

    #[test]
    fn test_ranked_ascending() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RankStore::new(dir.path().join("3"))?;
        let image = Tensor::zeros((3, 2, 2), DType::F32, &Device::Cpu)?;
        for distance in [0.7, 0.05, 0.3] {
            store.store(distance, &image)?;
        }
        fs::write(store.dir().join("notes.txt"), "ignored")?;

        let ranked = store.ranked()?;
        let distances: Vec<f32> = ranked.iter().map(|r| r.distance).collect();
        assert_eq!(distances, vec![0.05, 0.3, 0.7]);

        let all = collect_rankings(dir.path())?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "3");
        assert_eq!(all[0].1.len(), 3);
        Ok(())
    }

    #[test]
    fn test_pairs_sorted_by_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = Tensor::zeros((3, 2, 2), DType::F32, &Device::Cpu)?;
        for pair in ["10", "2", "extra", "0"] {
            RankStore::new(dir.path().join(pair))?.store(0.5, &image)?;
        }
        let names: Vec<String> = collect_rankings(dir.path())?.into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["0", "2", "10", "extra"]);
        Ok(())
    }
}
