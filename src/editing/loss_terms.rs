//! Loss terms over the pretrained collaborators
//!
//! Every function here is stateless: same inputs, same output. Images enter in
//! [0, 1] unless noted and are brought to each network's input convention here.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};

use super::image_utils::{imagenet_normalize, resize_bilinear};
use crate::models::{FaceLandmarks, FaceParser, GazeEstimator, IdentityEmbedder};

/// Parser classes kept by the region mask: skin, brows, eyes, nose, mouth and lips
pub const FOREGROUND_CLASSES: [u32; 9] = [1, 2, 3, 4, 5, 10, 11, 12, 13];

/// Fractional anchors of the deterministic identity crops
const CROP_ANCHORS: [(f64, f64); 5] = [(0.5, 0.5), (0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)];

/// Open interval of respaced timesteps, both ends excluded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestepWindow {
    pub after: usize,
    pub before: usize,
}

impl TimestepWindow {
    pub fn contains(&self, t: usize) -> bool {
        t > self.after && t < self.before
    }
}

/// Gaze alignment only runs in the low-noise window 10 < t < 50
pub const GAZE_WINDOW: TimestepWindow = TimestepWindow { after: 10, before: 50 };

/// Binary foreground map derived from a face parsing
#[derive(Debug, Clone)]
pub struct RegionMask {
    mask: Tensor,
    labels: Vec<u32>,
    height: usize,
    width: usize,
}

impl RegionMask {
    /// Build from per-pixel labels, selecting [`FOREGROUND_CLASSES`]
    pub fn from_labels(labels: Vec<u32>, height: usize, width: usize, device: &Device) -> Result<Self> {
        let values: Vec<f32> = labels
            .iter()
            .map(|label| if FOREGROUND_CLASSES.contains(label) { 1.0 } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(values, (1, 1, height, width), device)?;
        Ok(Self { mask, labels, height, width })
    }

    /// Parse `image` (`[1, 3, H, W]` in [0, 1]) and keep the foreground classes
    pub fn from_image(parser: &dyn FaceParser, image: &Tensor) -> Result<Self> {
        let (_, _, height, width) = image.dims4()?;
        let logits = parse_logits(parser, &image.detach(), height, width)?;
        let labels = parsing_labels(&logits)?;
        Self::from_labels(labels, height, width, image.device())
    }

    /// `[1, 1, H, W]` with values in {0, 1}. Never part of the gradient graph.
    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Run the parser at its canonical resolution and bring the logits back to `height` x `width`
pub fn parse_logits(parser: &dyn FaceParser, image: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let size = parser.input_size();
    let input = imagenet_normalize(&resize_bilinear(image, size, size)?)?;
    let logits = parser.parse(&input).context("face parser failed")?;
    resize_bilinear(&logits, height, width)
}

/// Argmax labels of the first batch element
pub fn parsing_labels(logits: &Tensor) -> Result<Vec<u32>> {
    let labels = logits.get(0)?.argmax_keepdim(0)?.to_dtype(DType::U32)?;
    Ok(labels.flatten_all()?.to_vec1::<u32>()?)
}

/// x / max(||x||, eps) along the embedding dimension
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.clamp(1e-12f32, f32::MAX)?;
    Ok(x.broadcast_div(&norm)?)
}

/// 1 - cosine similarity per row, `b` broadcast over the rows of `a`
pub fn cosine_distance(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let dot = a.broadcast_mul(b)?.sum(D::Minus1)?;
    let norm_a = a.sqr()?.sum(D::Minus1)?.sqrt()?;
    let norm_b = b.sqr()?.sum(D::Minus1)?.sqrt()?;
    let cos = dot.broadcast_div(&norm_a.broadcast_mul(&norm_b)?.clamp(1e-12f32, f32::MAX)?)?;
    Ok(cos.affine(-1.0, 1.0)?)
}

/// ImageNet normalization followed by a resize to the embedder resolution
pub fn embedder_input(embedder: &dyn IdentityEmbedder, image: &Tensor) -> Result<Tensor> {
    let size = embedder.input_size();
    resize_bilinear(&imagenet_normalize(image)?, size, size)
}

/// L2-normalized identity embedding of `[B, 3, H, W]` images in [0, 1]
pub fn embed_identity(embedder: &dyn IdentityEmbedder, image: &Tensor) -> Result<Tensor> {
    let embedding = embedder.embed(&embedder_input(embedder, image)?).context("identity embedder failed")?;
    l2_normalize(&embedding)
}

/// Identity distance between two single images in [0, 1]
pub fn identity_distance(embedder: &dyn IdentityEmbedder, a: &Tensor, b: &Tensor) -> Result<f32> {
    let ea = embed_identity(embedder, &a.detach())?;
    let eb = embed_identity(embedder, &b.detach())?;
    Ok(cosine_distance(&ea, &eb)?.mean_all()?.to_scalar::<f32>()?)
}

/// The full image plus `aug_num` fixed sub-windows, each resized to `size`.
/// Output is stacked crop-major: `[(1 + aug_num) * B, C, size, size]`.
pub fn augment_crops(x: &Tensor, size: usize, aug_num: usize) -> Result<Tensor> {
    let (_, _, height, width) = x.dims4()?;
    let mut crops = Vec::with_capacity(aug_num + 1);
    crops.push(resize_bilinear(x, size, size)?);
    for k in 0..aug_num {
        let scale = (0.9 - 0.05 * (k / CROP_ANCHORS.len()) as f64).max(0.6);
        let (ax, ay) = CROP_ANCHORS[k % CROP_ANCHORS.len()];
        let crop_h = ((height as f64 * scale).round() as usize).clamp(1, height);
        let crop_w = ((width as f64 * scale).round() as usize).clamp(1, width);
        let top = ((height - crop_h) as f64 * ay).round() as usize;
        let left = ((width - crop_w) as f64 * ax).round() as usize;
        let crop = x.narrow(2, top, crop_h)?.narrow(3, left, crop_w)?;
        crops.push(resize_bilinear(&crop, size, size)?);
    }
    Ok(Tensor::cat(&crops, 0)?)
}

/// Identity loss of the masked prediction against the source embedding.
///
/// `prediction` is `[B, 3, H, W]` in [0, 1]. Each batch element is evaluated on the
/// full image and every crop; the per-element mean distance over its crops is summed
/// across the batch.
pub fn identity_loss(
    embedder: &dyn IdentityEmbedder,
    prediction: &Tensor,
    mask: &Tensor,
    source_embedding: &Tensor,
    aug_num: usize,
) -> Result<Tensor> {
    let batch_size = prediction.dim(0)?;
    let masked = imagenet_normalize(prediction)?.broadcast_mul(mask)?;
    let crops = augment_crops(&masked, embedder.input_size(), aug_num)?;
    let embeddings = l2_normalize(&embedder.embed(&crops).context("identity embedder failed")?)?;
    let dists = cosine_distance(&embeddings, source_embedding)?;

    let total = dists.dim(0)?;
    let mut loss = Tensor::zeros((), dists.dtype(), dists.device())?;
    for i in 0..batch_size.min(total) {
        let indices: Vec<u32> = (i..total).step_by(batch_size).map(|j| j as u32).collect();
        let indices = Tensor::new(indices.as_slice(), dists.device())?;
        loss = (loss + dists.index_select(&indices, 0)?.mean_all()?)?;
    }
    Ok(loss)
}

/// Sum over the foreground classes of the L1 distance between predicted and target logits.
/// `target_logits` is `[1, 19, H, W]` at the prediction's resolution.
pub fn segmentation_loss(parser: &dyn FaceParser, prediction: &Tensor, target_logits: &Tensor) -> Result<Tensor> {
    let (_, _, height, width) = prediction.dims4()?;
    let logits = parse_logits(parser, prediction, height, width)?;
    let classes = Tensor::new(&FOREGROUND_CLASSES, prediction.device())?;
    let pred = logits.index_select(&classes, 1)?;
    let targ = target_logits.index_select(&classes, 1)?;
    // Equal pixel counts per class, so the overall mean times the class count is the per-class sum
    let mean = pred.broadcast_sub(&targ)?.abs()?.mean_all()?;
    Ok(mean.affine(FOREGROUND_CLASSES.len() as f64, 0.0)?)
}

/// Pixel box, end-exclusive
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl PixelBox {
    fn crop(&self, image: &Tensor) -> Result<Tensor> {
        Ok(image.narrow(2, self.y0, self.y1 - self.y0)?.narrow(3, self.x0, self.x1 - self.x0)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeBoxes {
    pub left: PixelBox,
    pub right: PixelBox,
}

impl EyeBoxes {
    /// Square-ish boxes around each eye contour with half a contour width of margin.
    /// `None` when a box would be empty after clipping to the image.
    pub fn from_landmarks(landmarks: &FaceLandmarks, height: usize, width: usize) -> Option<Self> {
        if landmarks.points.len() < FaceLandmarks::RIGHT_EYE.end {
            return None;
        }
        let eye_box = |range: std::ops::Range<usize>| -> Option<PixelBox> {
            let points = &landmarks.points[range];
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (f32::MAX, f32::MAX, f32::MIN, f32::MIN);
            for &(x, y) in points {
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
            let margin = 0.5 * (max_x - min_x);
            let cy = 0.5 * (min_y + max_y);
            let half_h = 0.5 * (max_x - min_x).max(max_y - min_y);
            let x0 = (min_x - margin).max(0.0).floor() as usize;
            let x1 = ((max_x + margin).ceil().max(0.0) as usize).min(width);
            let y0 = (cy - half_h).max(0.0).floor() as usize;
            let y1 = ((cy + half_h).ceil().max(0.0) as usize).min(height);
            (x1 > x0 && y1 > y0).then_some(PixelBox { x0, y0, x1, y1 })
        };
        Some(Self {
            left: eye_box(FaceLandmarks::LEFT_EYE)?,
            right: eye_box(FaceLandmarks::RIGHT_EYE)?,
        })
    }
}

fn eye_gaze(gaze: &dyn GazeEstimator, image: &Tensor, eye: &PixelBox) -> Result<Tensor> {
    let crop = eye.crop(image)?.mean_keepdim(1)?;
    gaze.estimate(&crop).context("gaze estimator failed")
}

/// L1 gaze difference of both eyes between prediction (`[B, 3, H, W]`) and target
/// (`[1, 3, H, W]`), both in [0, 1] and cropped by the same target boxes.
pub fn gaze_loss(gaze: &dyn GazeEstimator, prediction: &Tensor, target: &Tensor, eyes: &EyeBoxes) -> Result<Tensor> {
    let mut loss = Tensor::zeros((), prediction.dtype(), prediction.device())?;
    for eye in [&eyes.left, &eyes.right] {
        let src = eye_gaze(gaze, prediction, eye)?;
        let targ = eye_gaze(gaze, &target.detach(), eye)?;
        loss = (loss + src.broadcast_sub(&targ)?.abs()?.mean_all()?)?;
    }
    Ok(loss)
}

/// Plain MSE of the prediction against the target image, independent of any mask
pub fn background_loss(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    let target = target.broadcast_as(prediction.shape())?;
    Ok(candle_nn::loss::mse(prediction, &target)?)
}
