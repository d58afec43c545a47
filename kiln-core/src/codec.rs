use std::io::Cursor;

use base64::prelude::*;
use image::{DynamicImage, GrayImage, ImageFormat};
use tracing::{debug, info};

use crate::engine::{GenerationEngine, GenerationParams};
use crate::error::{DecodeError, EngineError};

/// How an embedded image payload should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Base64-encoded bytes inline in the request.
    Embedded,
    /// A URL to fetch the bytes from.
    Url,
}

/// Block size for coarse mask derivation, matching the latent downsampling
/// factor of the generation engines this serves.
pub const MASK_BLOCK: u32 = 8;

/// Decode one request image, either from an inline base64 payload or by
/// fetching a URL. `name` is the request field, used for logs and errors.
pub async fn decode(
    payload: &str,
    name: &str,
    source: ImageSource,
    client: &reqwest::Client,
) -> Result<DynamicImage, DecodeError> {
    let bytes = match source {
        ImageSource::Embedded => {
            // Tolerate line-wrapped payloads.
            let cleaned: String = payload.split_whitespace().collect();
            BASE64_STANDARD
                .decode(cleaned.as_bytes())
                .map_err(|e| DecodeError::Base64 {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?
        }
        ImageSource::Url => client
            .get(payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DecodeError::Fetch {
                name: name.to_string(),
                reason: e.to_string(),
            })?
            .bytes()
            .await
            .map_err(|e| DecodeError::Fetch {
                name: name.to_string(),
                reason: e.to_string(),
            })?
            .to_vec(),
    };
    let image = image::load_from_memory(&bytes).map_err(|e| DecodeError::Image {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    debug!(name, width = image.width(), height = image.height(), "decoded image");
    Ok(image)
}

/// Encode an image as a base64 PNG payload.
pub fn encode_png_base64(image: &DynamicImage) -> Result<String, EngineError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| EngineError::Failed(format!("png encode failed: {e}")))?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

/// Max-pool `mask` over `block`×`block` tiles. Partial edge tiles pool over
/// the pixels present.
pub fn block_reduce_max(mask: &GrayImage, block: u32) -> GrayImage {
    let (width, height) = mask.dimensions();
    let out_w = width.div_ceil(block);
    let out_h = height.div_ceil(block);
    GrayImage::from_fn(out_w, out_h, |bx, by| {
        let mut max = 0u8;
        for y in (by * block)..((by + 1) * block).min(height) {
            for x in (bx * block)..((bx + 1) * block).min(width) {
                max = max.max(mask.get_pixel(x, y)[0]);
            }
        }
        image::Luma([max])
    })
}

/// Nearest-neighbor expansion by `factor`, cropped back to `width`×`height`.
pub fn upsample_nearest(mask: &GrayImage, factor: u32, width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| *mask.get_pixel(x / factor, y / factor))
}

/// Preprocessing for masked generation with a patch-based fill mode.
///
/// The alpha channel of `init_image` selects the region to regenerate. The
/// transparent region is filled by the engine's patch-based inpainting, a
/// coarse mask is derived by max-pooling the inverted alpha over
/// [`MASK_BLOCK`] tiles and expanding it back, and both results replace
/// `init_image` and `mask_image` in the generation parameters. Pure
/// preprocessing; no generation happens here.
pub fn patch_fill_preprocess(
    engine: &dyn GenerationEngine,
    params: &mut GenerationParams,
) -> Result<(), EngineError> {
    let init = params
        .init_image
        .take()
        .ok_or_else(|| EngineError::Failed("FILL_MODE=patchmatch requires an init_image".into()))?;
    let (width, height) = (init.width(), init.height());
    let rgba = init.to_rgba8();

    // 255 where the source is transparent, i.e. the region to fill.
    let fill_mask = GrayImage::from_fn(width, height, |x, y| {
        image::Luma([255 - rgba.get_pixel(x, y)[3]])
    });

    let filled = engine
        .patch_fill(&init.to_rgb8(), &fill_mask)
        .ok_or(EngineError::Unsupported("patch-based fill"))??;

    let coarse = block_reduce_max(&fill_mask, MASK_BLOCK);
    let mask = upsample_nearest(&coarse, MASK_BLOCK, width, height);
    info!(width, height, "patch fill preprocessing complete");

    params.init_image = Some(DynamicImage::ImageRgb8(filled));
    params.mask_image = Some(DynamicImage::ImageLuma8(mask));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 0, 128])
            } else {
                Rgb([0, 255, 64])
            }
        }))
    }

    #[tokio::test]
    async fn png_round_trip_preserves_geometry_and_channels() {
        let original = checkerboard(48, 32);
        let encoded = encode_png_base64(&original).unwrap();
        let client = reqwest::Client::new();
        let decoded = decode(&encoded, "image", ImageSource::Embedded, &client)
            .await
            .unwrap();
        assert_eq!(decoded.width(), 48);
        assert_eq!(decoded.height(), 32);
        assert_eq!(decoded.color().channel_count(), original.color().channel_count());
    }

    #[tokio::test]
    async fn malformed_base64_is_a_decode_error() {
        let client = reqwest::Client::new();
        let err = decode("%%%not-base64%%%", "init_image", ImageSource::Embedded, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Base64 { .. }));
    }

    #[tokio::test]
    async fn valid_base64_of_garbage_is_an_image_error() {
        let client = reqwest::Client::new();
        let payload = BASE64_STANDARD.encode(b"not an image at all");
        let err = decode(&payload, "image", ImageSource::Embedded, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Image { .. }));
    }

    #[test]
    fn block_reduce_takes_tile_maximum() {
        let mut mask = GrayImage::new(16, 16);
        mask.put_pixel(3, 3, image::Luma([200]));
        let reduced = block_reduce_max(&mask, 8);
        assert_eq!(reduced.dimensions(), (2, 2));
        assert_eq!(reduced.get_pixel(0, 0)[0], 200);
        assert_eq!(reduced.get_pixel(1, 1)[0], 0);
    }

    #[test]
    fn derived_mask_matches_source_dimensions() {
        // Multiples of the block size round-trip exactly.
        for (w, h) in [(64, 64), (64, 128), (512, 256)] {
            let mask = GrayImage::new(w, h);
            let coarse = block_reduce_max(&mask, MASK_BLOCK);
            let expanded = upsample_nearest(&coarse, MASK_BLOCK, w, h);
            assert_eq!(expanded.dimensions(), (w, h));
        }
        // Non-multiples still come back at source resolution.
        let mask = GrayImage::new(50, 30);
        let coarse = block_reduce_max(&mask, MASK_BLOCK);
        let expanded = upsample_nearest(&coarse, MASK_BLOCK, 50, 30);
        assert_eq!(expanded.dimensions(), (50, 30));
    }
}
