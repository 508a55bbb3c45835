use base64::{
    Engine as _,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use image::{DynamicImage, GenericImageView, RgbImage, imageops::FilterType};

use crate::error::ChartQaError;

/// Default bound on either image axis, in pixels.
pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

// Browser clients are inconsistent about trailing padding.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// An RGB raster whose sides are bounded by the normalizer's maximum.
#[derive(Clone, Debug)]
pub struct NormalizedImage {
    rgb: RgbImage,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.rgb
    }
}

/// Decodes uploaded images, coerces them to RGB and bounds their size.
#[derive(Clone, Debug)]
pub struct ImageNormalizer {
    max_dimension: u32,
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DIMENSION)
    }
}

impl ImageNormalizer {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
        }
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Decodes a base64 payload (bare or as a `data:` URL) and normalizes it.
    pub fn normalize_base64(&self, payload: &str) -> Result<NormalizedImage, ChartQaError> {
        let bytes = decode_base64_payload(payload)?;
        self.normalize(&bytes)
    }

    /// Decodes encoded image bytes and normalizes the result.
    pub fn normalize(&self, bytes: &[u8]) -> Result<NormalizedImage, ChartQaError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|err| ChartQaError::Decode(err.to_string()))?;
        Ok(self.normalize_image(&decoded))
    }

    /// Converts an already decoded image to a bounded RGB raster.
    pub fn normalize_image(&self, image: &DynamicImage) -> NormalizedImage {
        let (width, height) = image.dimensions();
        let rgb = image.to_rgb8();
        let (target_width, target_height) = self.target_size(width, height);
        if (target_width, target_height) == (width, height) {
            return NormalizedImage { rgb };
        }

        log::debug!("Resizing image from {width}x{height} to {target_width}x{target_height}");
        let resized = image::imageops::resize(&rgb, target_width, target_height, FilterType::Lanczos3);
        NormalizedImage { rgb: resized }
    }

    /// Size an image of `width`x`height` is normalized to.
    ///
    /// Images within bounds keep their size. Larger ones are scaled uniformly by
    /// `min(max / width, max / height)`, rounding to the nearest pixel.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        let max = self.max_dimension;
        if width <= max && height <= max {
            return (width, height);
        }
        let ratio = f64::min(max as f64 / width as f64, max as f64 / height as f64);
        let scale = |side: u32| ((side as f64 * ratio).round() as u32).clamp(1, max);
        (scale(width), scale(height))
    }
}

/// Decodes the base64 body of an image field, accepting `data:<mime>;base64,` URLs.
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, ChartQaError> {
    let trimmed = payload.trim();
    let body = match trimmed.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest
                .split_once(',')
                .ok_or_else(|| ChartQaError::Decode("malformed data URL".to_string()))?;
            if !meta.ends_with(";base64") {
                return Err(ChartQaError::Decode(
                    "data URLs must use base64 encoding".to_string(),
                ));
            }
            data
        }
        None => trimmed,
    };

    let decoded = if body.bytes().any(|b| b.is_ascii_whitespace()) {
        let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        BASE64.decode(compact)
    } else {
        BASE64.decode(body)
    };
    decoded.map_err(|err| ChartQaError::Decode(format!("invalid base64 image payload: {err}")))
}
