//! C3: thumbnail generator. Produces padded-crop face thumbnails and
//! whole-image thumbnails at fixed target sizes (spec.md §4.3). Callers are
//! expected to have already applied EXIF orientation correction to the image
//! passed in here (the worker runtime does this once in step 2 of §4.7 and
//! caches the oriented buffer for all downstream use, including this
//! module); `apply_orientation` below is the shared primitive both the
//! worker and the `fix-orientation` maintenance op call before handing this
//! module an image.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use std::io::Cursor;

use super::ports::CatalogError;

const WHOLE_IMAGE_TARGET: u32 = 300;
const WHOLE_IMAGE_QUALITY: u8 = 85;
const FACE_TARGET: u32 = 150;
const FACE_QUALITY: u8 = 90;
pub const FACE_PADDING: f32 = 0.3;

/// A face bounding box in the owning image's pixel coordinates, as stored on
/// `Face` (top/right/bottom/left, spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct BBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl BBox {
    fn width(&self) -> i32 {
        self.right - self.left
    }

    fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Expands by `padding` fraction of width/height on each axis and clips
    /// to `(image_width, image_height)` (spec.md §4.3).
    fn padded_and_clipped(&self, padding: f32, image_width: u32, image_height: u32) -> (u32, u32, u32, u32) {
        let pad_x = (self.width() as f32 * padding) as i32;
        let pad_y = (self.height() as f32 * padding) as i32;

        let left = (self.left - pad_x).max(0);
        let top = (self.top - pad_y).max(0);
        let right = (self.right + pad_x).min(image_width as i32);
        let bottom = (self.bottom + pad_y).min(image_height as i32);

        let width = (right - left).max(0) as u32;
        let height = (bottom - top).max(0) as u32;
        (left.max(0) as u32, top.max(0) as u32, width, height)
    }
}

/// Applies the EXIF `Orientation` tag's transform to a decoded image. Shared
/// by the worker runtime (once per image, before everything else) and the
/// `fix-orientation` maintenance op (when re-reading an original to rebuild
/// a representative thumbnail).
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, CatalogError> {
    let rgb = img.to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), quality);
    encoder
        .encode(&rgb, rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8)
        .map_err(|e| CatalogError::Io(format!("jpeg encode failed: {e}")))?;
    Ok(bytes)
}

/// Whole-image thumbnail: resize to fit 300x300 preserving aspect ratio,
/// flattening to RGB, JPEG quality 85 (spec.md §4.3). `img` must already be
/// orientation-corrected.
pub fn whole_image_thumbnail(img: &RgbImage) -> Result<Vec<u8>, CatalogError> {
    let dynamic = DynamicImage::ImageRgb8(img.clone());
    let resized = dynamic.resize(WHOLE_IMAGE_TARGET, WHOLE_IMAGE_TARGET, FilterType::Lanczos3);
    encode_jpeg(&resized, WHOLE_IMAGE_QUALITY)
}

/// Face thumbnail: expand `bbox` by 30% on each axis, clip to image bounds,
/// crop, resize to fit 150x150, JPEG quality 90 (spec.md §4.3). `img` must
/// already be orientation-corrected. Applied identically whether called
/// online (C7) or by the rebuild-thumbnails maintenance op (C9).
pub fn face_thumbnail(img: &RgbImage, bbox: BBox) -> Result<Vec<u8>, CatalogError> {
    let (width, height) = img.dimensions();
    let (x, y, w, h) = bbox.padded_and_clipped(FACE_PADDING, width, height);
    if w == 0 || h == 0 {
        return Err(CatalogError::Io("face bbox clipped to empty crop".into()));
    }

    let dynamic = DynamicImage::ImageRgb8(img.clone());
    let cropped = dynamic.crop_imm(x, y, w, h);
    let resized = cropped.resize(FACE_TARGET, FACE_TARGET, FilterType::Lanczos3);
    encode_jpeg(&resized, FACE_QUALITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb([120, 130, 140]))
    }

    #[test]
    fn whole_image_thumbnail_fits_within_300() {
        let img = solid(1200, 600);
        let bytes = whole_image_thumbnail(&img).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert!(decoded.width() <= 300 && decoded.height() <= 300);
        // Aspect ratio preserved: 1200x600 is 2:1.
        assert_eq!(decoded.width(), 300);
        assert_eq!(decoded.height(), 150);
    }

    #[test]
    fn face_thumbnail_pads_and_clips_to_image_bounds() {
        let img = solid(200, 200);
        let bbox = BBox { top: 0, right: 50, bottom: 50, left: 0 };
        let bytes = face_thumbnail(&img, bbox).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert!(decoded.width() <= 150 && decoded.height() <= 150);
        assert!(decoded.width() > 0 && decoded.height() > 0);
    }

    #[test]
    fn face_thumbnail_errors_on_degenerate_bbox() {
        let img = solid(10, 10);
        let bbox = BBox { top: 5, right: 5, bottom: 5, left: 5 };
        assert!(face_thumbnail(&img, bbox).is_err());
    }
}
