use super::ModelError;
use candle_core::{Device, Tensor};
use image::{RgbImage, imageops::FilterType};
use serde::Deserialize;
use std::path::Path;

/// Resizing and normalisation parameters from `preprocessor_config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageProcessorConfig {
    pub min_pixels: usize,
    pub max_pixels: usize,
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    #[serde(alias = "spatial_merge_size")]
    pub merge_size: usize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self {
            min_pixels: 56 * 56,
            max_pixels: 28 * 28 * 1280,
            patch_size: 14,
            temporal_patch_size: 2,
            merge_size: 2,
            image_mean: [0.481_454_66, 0.457_827_5, 0.408_210_73],
            image_std: [0.268_629_54, 0.261_302_58, 0.275_777_11],
        }
    }
}

impl ImageProcessorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ModelError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn factor(&self) -> usize {
        self.patch_size * self.merge_size
    }
}

/// Flattened patches of one image plus its `[t, h, w]` patch grid.
#[derive(Debug)]
pub struct ProcessedImage {
    /// `(t * h * w, channels * temporal * patch * patch)`, f32.
    pub pixel_values: Tensor,
    pub grid_thw: [usize; 3],
}

impl ProcessedImage {
    /// Number of `<|image_pad|>` tokens the image occupies after merging.
    pub fn token_count(&self, merge_size: usize) -> usize {
        let [t, h, w] = self.grid_thw;
        t * h * w / (merge_size * merge_size)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageProcessor {
    config: ImageProcessorConfig,
}

impl ImageProcessor {
    pub fn new(config: ImageProcessorConfig) -> Self {
        Self { config }
    }

    pub fn process(&self, image: &RgbImage, device: &Device) -> Result<ProcessedImage, ModelError> {
        let cfg = &self.config;
        let (width, height) = image.dimensions();
        let (resized_h, resized_w) = smart_resize(
            height as usize,
            width as usize,
            cfg.factor(),
            cfg.min_pixels,
            cfg.max_pixels,
        )?;

        let resized;
        let image = if (resized_w, resized_h) == (width as usize, height as usize) {
            image
        } else {
            resized = image::imageops::resize(
                image,
                resized_w as u32,
                resized_h as u32,
                FilterType::CatmullRom,
            );
            &resized
        };

        let grid_h = resized_h / cfg.patch_size;
        let grid_w = resized_w / cfg.patch_size;
        let patches = self.patchify(image, grid_h, grid_w);
        let patch_dim = 3 * cfg.temporal_patch_size * cfg.patch_size * cfg.patch_size;
        let pixel_values = Tensor::from_vec(patches, (grid_h * grid_w, patch_dim), device)?;

        Ok(ProcessedImage {
            pixel_values,
            grid_thw: [1, grid_h, grid_w],
        })
    }

    // Patches are emitted in merge-block order; within a patch the layout is
    // channel, frame, row, column. A still image fills every frame.
    fn patchify(&self, image: &RgbImage, grid_h: usize, grid_w: usize) -> Vec<f32> {
        let cfg = &self.config;
        let (patch, merge, frames) = (cfg.patch_size, cfg.merge_size, cfg.temporal_patch_size);
        let mut data = Vec::with_capacity(grid_h * grid_w * 3 * frames * patch * patch);

        for bh in 0..grid_h / merge {
            for bw in 0..grid_w / merge {
                for ih in 0..merge {
                    for iw in 0..merge {
                        let gy = (bh * merge + ih) * patch;
                        let gx = (bw * merge + iw) * patch;
                        for channel in 0..3 {
                            let (mean, std) = (cfg.image_mean[channel], cfg.image_std[channel]);
                            for _ in 0..frames {
                                for py in 0..patch {
                                    for px in 0..patch {
                                        let value = image.get_pixel((gx + px) as u32, (gy + py) as u32)
                                            [channel] as f32
                                            / 255.0;
                                        data.push((value - mean) / std);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        data
    }
}

/// Picks the size closest to `height`x`width` whose sides are multiples of
/// `factor` and whose area lies within `[min_pixels, max_pixels]`.
pub fn smart_resize(
    height: usize,
    width: usize,
    factor: usize,
    min_pixels: usize,
    max_pixels: usize,
) -> Result<(usize, usize), ModelError> {
    let (h, w, f) = (height.max(1) as f64, width.max(1) as f64, factor.max(1) as f64);
    if h.max(w) / h.min(w) > 200.0 {
        return Err(ModelError::Input(format!(
            "aspect ratio of {width}x{height} exceeds 200"
        )));
    }

    let mut h_bar = f.max((h / f).round_ties_even() * f);
    let mut w_bar = f.max((w / f).round_ties_even() * f);
    if h_bar * w_bar > max_pixels as f64 {
        let beta = (h * w / max_pixels as f64).sqrt();
        h_bar = f.max((h / beta / f).floor() * f);
        w_bar = f.max((w / beta / f).floor() * f);
    } else if h_bar * w_bar < min_pixels as f64 {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = (h * beta / f).ceil() * f;
        w_bar = (w * beta / f).ceil() * f;
    }
    Ok((h_bar as usize, w_bar as usize))
}
