//! Concrete `Detector` backed by ONNX Runtime: UltraFace-slim-320 for bounding
//! boxes, a 512-d ArcFace-style embedder for the crop. Adapted from the
//! image-classification processor this crate's teacher shipped; the
//! mobilenet-feature branch isn't needed here; C7 already decodes and
//! orients the image before calling `detect`, so this module only runs
//! inference over an already-RGB buffer.

use image::{imageops::FilterType, GenericImageView, RgbImage};
use ndarray017::Array4;
use ort::{inputs, session::Session, value::TensorRef};
use std::sync::{Condvar, Mutex};

use crate::domain::{CatalogError, DetectedFace, Detector};

const SESSION_POOL_SIZE: usize = 4;
const DETECT_SCORE_THRESHOLD: f32 = 0.7;

struct SessionBundle {
    face_detect: Session,
    face_embed: Session,
}

pub struct OrtDetector {
    pool: Mutex<Vec<SessionBundle>>,
    available: Condvar,
}

impl OrtDetector {
    pub fn new(face_detect_path: &str, face_embed_path: &str) -> Result<Self, CatalogError> {
        let mut bundles = Vec::with_capacity(SESSION_POOL_SIZE);
        for _ in 0..SESSION_POOL_SIZE {
            let face_detect = Session::builder()
                .map_err(|e| CatalogError::Detect(e.to_string()))?
                .commit_from_file(face_detect_path)
                .map_err(|e| CatalogError::Detect(e.to_string()))?;
            let face_embed = Session::builder()
                .map_err(|e| CatalogError::Detect(e.to_string()))?
                .commit_from_file(face_embed_path)
                .map_err(|e| CatalogError::Detect(e.to_string()))?;
            bundles.push(SessionBundle { face_detect, face_embed });
        }

        Ok(Self {
            pool: Mutex::new(bundles),
            available: Condvar::new(),
        })
    }

    fn with_session<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut SessionBundle) -> Result<T, CatalogError>,
    {
        let mut bundle = {
            let mut pool = self
                .pool
                .lock()
                .map_err(|_| CatalogError::Detect("session pool poisoned".into()))?;
            loop {
                if let Some(b) = pool.pop() {
                    break b;
                }
                pool = self
                    .available
                    .wait(pool)
                    .map_err(|_| CatalogError::Detect("session pool wait failed".into()))?;
            }
        };

        let result = f(&mut bundle);
        self.pool.lock().unwrap().push(bundle);
        self.available.notify_one();
        result
    }
}

impl Detector for OrtDetector {
    fn detect(&self, rgb_image: &RgbImage) -> Result<Vec<DetectedFace>, CatalogError> {
        let (width, height) = rgb_image.dimensions();
        let img = image::DynamicImage::ImageRgb8(rgb_image.clone());

        // UltraFace-slim expects a 320x240 stretched input.
        let resized_detect = img.resize_exact(320, 240, FilterType::CatmullRom);
        let mut input_detect = Array4::<f32>::zeros((1, 3, 240, 320));
        for (x, y, pixel) in resized_detect.pixels() {
            input_detect[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - 127.0) / 128.0;
            input_detect[[0, 1, y as usize, x as usize]] = (pixel[1] as f32 - 127.0) / 128.0;
            input_detect[[0, 2, y as usize, x as usize]] = (pixel[2] as f32 - 127.0) / 128.0;
        }
        let tensor_detect = TensorRef::from_array_view(&input_detect)
            .map_err(|e| CatalogError::Detect(format!("detection tensor: {e}")))?;

        let (boxes, scores) = self.with_session(|bundle| {
            let outputs = bundle
                .face_detect
                .run(inputs![tensor_detect])
                .map_err(|e| CatalogError::Detect(format!("detection inference: {e}")))?;

            let out0 = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| CatalogError::Detect(e.to_string()))?
                .1
                .to_vec();
            let out1 = outputs[1]
                .try_extract_tensor::<f32>()
                .map_err(|e| CatalogError::Detect(e.to_string()))?
                .1
                .to_vec();

            if out0.len() == 17680 && out1.len() == 8840 {
                Ok((out0, out1))
            } else if out1.len() == 17680 && out0.len() == 8840 {
                Ok((out1, out0))
            } else {
                Err(CatalogError::Detect(format!(
                    "unexpected detector output shapes: {} and {}",
                    out0.len(),
                    out1.len()
                )))
            }
        })?;

        let anchors = ultraface_anchors();

        let mut candidates = Vec::new();
        for i in 0..anchors.len() {
            let score = scores[i * 2 + 1];
            if score > DETECT_SCORE_THRESHOLD {
                let anchor = anchors[i];
                let dx = boxes[i * 4];
                let dy = boxes[i * 4 + 1];
                let dw = boxes[i * 4 + 2];
                let dh = boxes[i * 4 + 3];

                let center_x = anchor[0] + dx * 0.1 * anchor[2];
                let center_y = anchor[1] + dy * 0.1 * anchor[3];
                let w = anchor[2] * (dw * 0.2).exp();
                let h = anchor[3] * (dh * 0.2).exp();

                let x1 = ((center_x - w / 2.0) * width as f32) as i32;
                let y1 = ((center_y - h / 2.0) * height as f32) as i32;
                let x2 = ((center_x + w / 2.0) * width as f32) as i32;
                let y2 = ((center_y + h / 2.0) * height as f32) as i32;

                candidates.push((score, x1, y1, x2, y2));
            }
        }

        let picked = non_max_suppression(candidates);

        let mut detected = Vec::new();
        for (score, x1, y1, x2, y2) in picked {
            let x1c = x1.clamp(0, width as i32) as u32;
            let y1c = y1.clamp(0, height as i32) as u32;
            let x2c = (x2.max(0) as u32).min(width);
            let y2c = (y2.max(0) as u32).min(height);
            let w = x2c.saturating_sub(x1c);
            let h = y2c.saturating_sub(y1c);
            if w < 2 || h < 2 {
                continue;
            }

            let face_img = img.crop_imm(x1c, y1c, w, h);
            let face_resized = face_img.resize_exact(112, 112, FilterType::CatmullRom);
            let mut input_embed = Array4::<f32>::zeros((1, 3, 112, 112));
            for (fx, fy, pixel) in face_resized.pixels() {
                input_embed[[0, 0, fy as usize, fx as usize]] = (pixel[0] as f32 - 127.5) / 128.0;
                input_embed[[0, 1, fy as usize, fx as usize]] = (pixel[1] as f32 - 127.5) / 128.0;
                input_embed[[0, 2, fy as usize, fx as usize]] = (pixel[2] as f32 - 127.5) / 128.0;
            }
            let tensor_embed = TensorRef::from_array_view(&input_embed)
                .map_err(|e| CatalogError::Detect(format!("embedding tensor: {e}")))?;

            let mut embedding = self.with_session(|bundle| {
                let outputs = bundle
                    .face_embed
                    .run(inputs![tensor_embed])
                    .map_err(|e| CatalogError::Detect(format!("embedding inference: {e}")))?;
                Ok(outputs[0]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| CatalogError::Detect(e.to_string()))?
                    .1
                    .to_vec())
            })?;

            crate::domain::embedding::l2_normalize(&mut embedding);

            detected.push(DetectedFace {
                top: y1c as i32,
                right: x2c as i32,
                bottom: y2c as i32,
                left: x1c as i32,
                embedding,
                det_score: score,
                age: None,
                gender: None,
            });
        }

        Ok(detected)
    }
}

fn ultraface_anchors() -> Vec<[f32; 4]> {
    let mut anchors = Vec::with_capacity(4420);
    let feature_maps = [[40, 30], [20, 15], [10, 8], [5, 4]];
    let strides = [8, 16, 32, 64];
    let min_sizes = [
        vec![10.0, 16.0, 24.0],
        vec![32.0, 48.0],
        vec![64.0, 96.0],
        vec![128.0, 192.0, 256.0],
    ];

    for i in 0..4 {
        let map_w = feature_maps[i][0];
        let map_h = feature_maps[i][1];
        let stride = strides[i];
        for y in 0..map_h {
            for x in 0..map_w {
                for &min_size in &min_sizes[i] {
                    let anchor_x = (x as f32 + 0.5) * stride as f32 / 320.0;
                    let anchor_y = (y as f32 + 0.5) * stride as f32 / 240.0;
                    let anchor_w = min_size / 320.0;
                    let anchor_h = min_size / 240.0;
                    anchors.push([anchor_x, anchor_y, anchor_w, anchor_h]);
                }
            }
        }
    }
    anchors
}

/// Greedy NMS with both IoU and intersection-over-min-area suppression, so a
/// small box fully nested inside a larger one is also dropped.
fn non_max_suppression(mut candidates: Vec<(f32, i32, i32, i32, i32)>) -> Vec<(f32, i32, i32, i32, i32)> {
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut picked: Vec<(f32, i32, i32, i32, i32)> = Vec::new();

    for (score, x1, y1, x2, y2) in candidates {
        let w1 = (x2 - x1).max(0);
        let h1 = (y2 - y1).max(0);
        let area1 = (w1 * h1) as f32;
        if area1 <= 0.0 {
            continue;
        }

        let mut keep = true;
        for &(_, px1, py1, px2, py2) in &picked {
            let ix1 = x1.max(px1);
            let iy1 = y1.max(py1);
            let ix2 = x2.min(px2);
            let iy2 = y2.min(py2);
            let iw = (ix2 - ix1).max(0);
            let ih = (iy2 - iy1).max(0);
            let intersection = (iw * ih) as f32;
            if intersection <= 0.0 {
                continue;
            }

            let pw = (px2 - px1).max(0);
            let ph = (py2 - py1).max(0);
            let area2 = (pw * ph) as f32;
            let union = area1 + area2 - intersection;
            let iou = intersection / union;
            let iom = intersection / area1.min(area2);

            if iou > 0.3 || iom > 0.4 {
                keep = false;
                break;
            }
        }
        if keep {
            picked.push((score, x1, y1, x2, y2));
        }
    }

    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_nested_lower_score_box() {
        let candidates = vec![(0.95, 10, 10, 110, 110), (0.80, 20, 20, 100, 100)];
        let picked = non_max_suppression(candidates);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].0, 0.95);
    }

    #[test]
    fn nms_keeps_disjoint_boxes() {
        let candidates = vec![(0.9, 0, 0, 50, 50), (0.8, 200, 200, 260, 260)];
        let picked = non_max_suppression(candidates);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn anchor_count_matches_ultraface_slim_320() {
        assert_eq!(ultraface_anchors().len(), 4420);
    }
}
