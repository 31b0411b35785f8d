//! EXIF metadata extraction, shared by the worker runtime's step 2 and the
//! `fix-orientation` maintenance op (spec.md §4.7, §4.9). Grounded in the
//! teacher's `process_media` (orientation + best-available-date EXIF tags,
//! `src/application/processor.rs`) and in `batch_processor.py`'s GPS/Make/
//! Model extraction (tags 306/271/272 and GPS IFD `0x8825`).

use std::io::Cursor;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use exif::{In, Rational, Tag, Value};

use crate::domain::ImageMetadata;

/// Orientation tag value plus the metadata fields this crate's catalogue
/// stores (spec.md §3 `ImageMetadata`). Defaults to orientation 1
/// (identity) and empty metadata when no EXIF segment is present or it
/// fails to parse — EXIF is always best-effort (§4.7).
pub struct ExifData {
    pub orientation: u32,
    pub metadata: ImageMetadata,
}

impl Default for ExifData {
    fn default() -> Self {
        Self {
            orientation: 1,
            metadata: ImageMetadata::default(),
        }
    }
}

pub fn extract(data: &[u8]) -> ExifData {
    let reader = exif::Reader::new();
    let exif = match reader.read_from_container(&mut Cursor::new(data)) {
        Ok(exif) => exif,
        Err(_) => return ExifData::default(),
    };

    let mut orientation = 1u32;
    if let Some(field) = exif.get_field(Tag::Orientation, In::PRIMARY) {
        if let Some(v) = field.value.get_uint(0) {
            orientation = v;
        }
    }

    let mut metadata = ImageMetadata::default();

    for tag in [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime] {
        if let Some(field) = exif.get_field(tag, In::PRIMARY) {
            let raw = field.display_value().to_string();
            if parse_exif_datetime(&raw).is_some() {
                metadata.date_time = Some(raw);
                break;
            }
        }
    }

    if let Some(field) = exif.get_field(Tag::Make, In::PRIMARY) {
        metadata.make = Some(field.display_value().to_string());
    }
    if let Some(field) = exif.get_field(Tag::Model, In::PRIMARY) {
        metadata.model = Some(field.display_value().to_string());
    }

    if let (Some((lat, lat_ref)), Some((lon, lon_ref))) = (
        rational_triplet(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef),
        rational_triplet(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef),
    ) {
        metadata.gps_latitude = Some(dms_to_degrees(&lat, &lat_ref));
        metadata.gps_longitude = Some(dms_to_degrees(&lon, &lon_ref));
    }

    ExifData {
        orientation,
        metadata,
    }
}

fn rational_triplet(exif: &exif::Exif, value_tag: Tag, ref_tag: Tag) -> Option<(Vec<Rational>, String)> {
    let value_field = exif.get_field(value_tag, In::PRIMARY)?;
    let ref_field = exif.get_field(ref_tag, In::PRIMARY)?;

    let triplet = match &value_field.value {
        Value::Rational(v) if v.len() == 3 => v.clone(),
        _ => return None,
    };
    let reference = ref_field.display_value().to_string();
    Some((triplet, reference))
}

/// Degrees/minutes/seconds to signed decimal degrees (spec.md §3). South and
/// West references negate the magnitude, exactly as `batch_processor.py`'s
/// `to_deg` helper does.
fn dms_to_degrees(dms: &[Rational], reference: &str) -> f64 {
    let degrees = dms[0].to_f64();
    let minutes = dms[1].to_f64();
    let seconds = dms[2].to_f64();
    let magnitude = degrees + minutes / 60.0 + seconds / 3600.0;
    if reference.contains('S') || reference.contains('W') {
        -magnitude
    } else {
        magnitude
    }
}

/// Parses the handful of datetime shapes EXIF fields show up in practice
/// (standard `YYYY:MM:DD HH:MM:SS` plus the hyphenated and date-only
/// variants the teacher's `parse_exif_datetime` also tolerates).
pub fn parse_exif_datetime(s: &str) -> Option<DateTime<Utc>> {
    let normalized = s.trim().replace('/', "-");

    if let Ok(dt) = NaiveDateTime::parse_from_str(&normalized, "%Y:%m:%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(&normalized, "%Y:%m:%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(&normalized, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}
