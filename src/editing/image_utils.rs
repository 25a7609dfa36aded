//! Image utilities for the editing pipeline
//! Loading, saving, differentiable resizing and the normalizations the
//! pretrained collaborators expect.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, RgbImage};
use std::path::Path;

/// ImageNet channel statistics used by the identity embedder and the face parser
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Colors for the 19 parsing classes (background, skin, brows, eyes, glasses,
/// ears, earring, nose, mouth, lips, neck, necklace, cloth, hair, hat)
pub const PARSING_PALETTE: [[u8; 3]; 19] = [
    [0, 0, 0], [255, 0, 0], [0, 204, 204], [0, 0, 204], [255, 153, 51], [204, 0, 204], [0, 0, 0],
    [204, 0, 0], [102, 51, 0], [0, 0, 0], [76, 153, 0], [102, 204, 0], [255, 255, 0], [0, 0, 153],
    [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0],
];

/// Open an image, resize it to `size` x `size` and convert to RGB
pub fn load_rgb<P: AsRef<Path>>(path: P, size: usize) -> Result<RgbImage> {
    let path = path.as_ref();
    let img = image::open(path).with_context(|| format!("Failed to load image: {}", path.display()))?;
    Ok(img.resize_exact(size as u32, size as u32, FilterType::Triangle).to_rgb8())
}

/// `[1, 3, H, W]` tensor with values in [0, 1]
pub fn rgb_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let data = img.as_raw().clone();
    let tensor = Tensor::from_vec(data, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// Save a `[C, H, W]` tensor with values in [-1, 1]. Single channel images are
/// written as grayscale RGB.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tensor = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let (channels, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    let tensor = match channels {
        3 => tensor,
        1 => tensor.repeat((3, 1, 1))?,
        c => anyhow::bail!("Unsupported number of channels: {}", c),
    };

    // Convert from [-1, 1] to [0, 255]
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.round()?;
    let data: Vec<u8> = tensor
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| v as u8)
        .collect();

    let img = RgbImage::from_raw(width as u32, height as u32, data)
        .context("Failed to create image buffer")?;
    img.save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("Failed to save image: {}", path.display()))?;
    Ok(())
}

/// Row-interpolation weights for a half-pixel aligned bilinear resize of `input` to `output`
fn interpolation_matrix(output: usize, input: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; output * input];
    let scale = input as f64 / output as f64;
    for o in 0..output {
        let src = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(input - 1);
        let i1 = (i0 + 1).min(input - 1);
        let w1 = (src - i0 as f64).min(1.0) as f32;
        weights[o * input + i0] += 1.0 - w1;
        weights[o * input + i1] += w1;
    }
    Ok(Tensor::from_vec(weights, (output, input), device)?)
}

/// Bilinear resize of a `[B, C, H, W]` tensor, written as two matmuls so gradients flow
/// back to the input for any scale factor.
pub fn resize_bilinear(x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    if (h, w) == (height, width) {
        return Ok(x.clone());
    }
    let device = x.device();
    let rows = interpolation_matrix(height, h, device)?.to_dtype(x.dtype())?;
    let cols = interpolation_matrix(width, w, device)?.to_dtype(x.dtype())?.t()?.contiguous()?;

    let x = x.reshape((b * c * h, w))?.matmul(&cols)?.reshape((b * c, h, width))?;
    let rows = rows.unsqueeze(0)?.broadcast_as((b * c, height, h))?.contiguous()?;
    Ok(rows.matmul(&x)?.reshape((b, c, height, width))?)
}

fn channel_constants(values: [f32; 3], like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::new(&values, like.device())?.to_dtype(like.dtype())?.reshape((1, 3, 1, 1))?)
}

/// (x - mean) / std with ImageNet statistics, `x` in [0, 1]
pub fn imagenet_normalize(x: &Tensor) -> Result<Tensor> {
    let mean = channel_constants(IMAGENET_MEAN, x)?;
    let std = channel_constants(IMAGENET_STD, x)?;
    Ok(x.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

/// [-1, 1] to [0, 1]
pub fn to_unit_range(x: &Tensor) -> Result<Tensor> {
    Ok(x.affine(0.5, 0.5)?)
}

/// Per-pixel parsing labels to a `[3, H, W]` color map in [-1, 1]
pub fn colorize_parsing(labels: &[u32], height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; 3 * height * width];
    let plane = height * width;
    for (i, &label) in labels.iter().enumerate().take(plane) {
        let color = PARSING_PALETTE.get(label as usize).copied().unwrap_or([0, 0, 0]);
        for (ch, value) in color.iter().enumerate() {
            data[ch * plane + i] = *value as f32 / 127.5 - 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (3, height, width), device)?)
}
