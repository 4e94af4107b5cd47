//! Capture metadata intake and the technical-quality sub-score
//!
//! EXIF decoding itself happens outside the crate. Callers either build a
//! [`CaptureMetadata`] directly or hand over exiftool `-json` output, which is mapped here.
//! [`assess`] turns the parsed fields into the `technical` composite component.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parsed camera, exposure and position data for one capture
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens: Option<String>,
    pub focal_length_mm: Option<f64>,
    /// f-number
    pub aperture: Option<f64>,
    /// Exposure time in seconds
    pub shutter_speed: Option<f64>,
    pub iso: Option<u32>,
    pub gps: Option<GpsPosition>,
    pub capture_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
}

/// Deserialize a value that could be a string or number into Option<String>
fn deserialize_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrNumber;
    impl<'de> de::Visitor<'de> for StringOrNumber {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}

/// One object of exiftool `-json` output. Every tag may arrive as a string or a number
/// depending on whether `-n` was used.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExiftoolRecord {
    #[serde(rename = "SourceFile", deserialize_with = "deserialize_string_or_number")]
    source_file: Option<String>,
    #[serde(rename = "Make", deserialize_with = "deserialize_string_or_number")]
    make: Option<String>,
    #[serde(rename = "Model", deserialize_with = "deserialize_string_or_number")]
    model: Option<String>,
    #[serde(rename = "LensModel", deserialize_with = "deserialize_string_or_number")]
    lens_model: Option<String>,
    #[serde(rename = "FocalLength", deserialize_with = "deserialize_string_or_number")]
    focal_length: Option<String>,
    #[serde(rename = "FNumber", deserialize_with = "deserialize_string_or_number")]
    f_number: Option<String>,
    #[serde(rename = "Aperture", deserialize_with = "deserialize_string_or_number")]
    aperture: Option<String>,
    #[serde(rename = "ExposureTime", deserialize_with = "deserialize_string_or_number")]
    exposure_time: Option<String>,
    #[serde(rename = "ShutterSpeed", deserialize_with = "deserialize_string_or_number")]
    shutter_speed: Option<String>,
    #[serde(rename = "ISO", deserialize_with = "deserialize_string_or_number")]
    iso: Option<String>,
    #[serde(rename = "GPSLatitude", deserialize_with = "deserialize_string_or_number")]
    gps_latitude: Option<String>,
    #[serde(rename = "GPSLatitudeRef", deserialize_with = "deserialize_string_or_number")]
    gps_latitude_ref: Option<String>,
    #[serde(rename = "GPSLongitude", deserialize_with = "deserialize_string_or_number")]
    gps_longitude: Option<String>,
    #[serde(rename = "GPSLongitudeRef", deserialize_with = "deserialize_string_or_number")]
    gps_longitude_ref: Option<String>,
    #[serde(rename = "GPSAltitude", deserialize_with = "deserialize_string_or_number")]
    gps_altitude: Option<String>,
    #[serde(rename = "DateTimeOriginal", deserialize_with = "deserialize_string_or_number")]
    date_time_original: Option<String>,
    #[serde(rename = "SubSecTimeOriginal", deserialize_with = "deserialize_string_or_number")]
    subsec_time_original: Option<String>,
}

impl ExiftoolRecord {
    fn into_metadata(self) -> CaptureMetadata {
        let gps = match (self.gps_latitude.as_deref(), self.gps_longitude.as_deref()) {
            (Some(lat), Some(lon)) => {
                let latitude = parse_coordinate(lat, self.gps_latitude_ref.as_deref());
                let longitude = parse_coordinate(lon, self.gps_longitude_ref.as_deref());
                latitude.zip(longitude).map(|(latitude, longitude)| GpsPosition {
                    latitude,
                    longitude,
                    altitude_m: self.gps_altitude.as_deref().and_then(parse_altitude),
                })
            }
            _ => None,
        };

        CaptureMetadata {
            make: self.make,
            model: self.model,
            lens: self.lens_model,
            focal_length_mm: self.focal_length.as_deref().and_then(leading_number),
            aperture: self
                .f_number
                .or(self.aperture)
                .as_deref()
                .and_then(leading_number),
            shutter_speed: self
                .exposure_time
                .or(self.shutter_speed)
                .as_deref()
                .and_then(parse_shutter_speed),
            iso: self
                .iso
                .as_deref()
                .and_then(leading_number)
                .filter(|iso| *iso > 0.0)
                .map(|iso| iso.round() as u32),
            gps,
            capture_time: parse_capture_time(
                self.date_time_original.as_deref(),
                self.subsec_time_original.as_deref(),
            ),
        }
    }
}

impl CaptureMetadata {
    /// Map one exiftool `-json` object
    pub fn from_exiftool_json(value: &serde_json::Value) -> Result<Self> {
        let record: ExiftoolRecord = serde_json::from_value(value.clone())
            .context("Failed to parse exiftool JSON object")?;
        Ok(record.into_metadata())
    }

    pub fn has_exposure_data(&self) -> bool {
        self.iso.is_some() || self.shutter_speed.is_some() || self.aperture.is_some()
    }
}

/// Parse complete exiftool `-json` output (an array, or a single object) into
/// `(SourceFile, metadata)` pairs. Records without a `SourceFile` get an empty path.
pub fn parse_exiftool_output(json: &str) -> Result<Vec<(PathBuf, CaptureMetadata)>> {
    let value: serde_json::Value = serde_json::from_str(json).with_context(|| {
        let preview: String = json.chars().take(200).collect();
        format!("Failed to parse exiftool JSON output. First bytes: {}", preview)
    })?;

    let objects = match value {
        serde_json::Value::Array(items) => items,
        object @ serde_json::Value::Object(_) => vec![object],
        other => anyhow::bail!("Expected a JSON array or object from exiftool, got {}", other),
    };

    objects
        .into_iter()
        .enumerate()
        .map(|(i, object)| {
            let record: ExiftoolRecord = serde_json::from_value(object)
                .with_context(|| format!("Failed to parse exiftool record {}", i))?;
            let path = PathBuf::from(record.source_file.clone().unwrap_or_default());
            Ok((path, record.into_metadata()))
        })
        .collect()
}

/// First number in a tag value ("24.0 mm", "f/2.8", "400")
fn leading_number(raw: &str) -> Option<f64> {
    let start = raw.find(|c: char| c.is_ascii_digit() || c == '.' || c == '-')?;
    let rest = &raw[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Exposure time in seconds from "1/1000", "0.5" or "2"
fn parse_shutter_speed(raw: &str) -> Option<f64> {
    let raw = raw.trim().trim_end_matches('s').trim();
    let seconds = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (seconds > 0.0).then_some(seconds)
}

/// Decimal degrees from either a signed number or exiftool's
/// `54 deg 59' 22.80" N` form. South and west are negative.
fn parse_coordinate(raw: &str, reference: Option<&str>) -> Option<f64> {
    let parts: Vec<f64> = raw
        .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .take(3)
        .collect();
    let (&degrees, rest) = parts.split_first()?;
    let minutes = rest.first().copied().unwrap_or(0.0);
    let seconds = rest.get(1).copied().unwrap_or(0.0);
    let magnitude = degrees.abs() + minutes / 60.0 + seconds / 3600.0;

    let hemisphere = reference
        .and_then(|r| r.trim().chars().next())
        .or_else(|| raw.trim().chars().last())
        .map(|c| c.to_ascii_uppercase());
    let negative = degrees < 0.0 || matches!(hemisphere, Some('S') | Some('W'));
    Some(if negative { -magnitude } else { magnitude })
}

/// Altitude in metres from "120.5 m Above Sea Level" or a bare number
fn parse_altitude(raw: &str) -> Option<f64> {
    let value = leading_number(raw)?;
    if raw.to_lowercase().contains("below") {
        Some(-value.abs())
    } else {
        Some(value)
    }
}

/// Parse capture time with subsecond precision
fn parse_capture_time(date_time_original: Option<&str>, subsec_time_original: Option<&str>) -> Option<DateTime<Utc>> {
    let date_str = date_time_original?;
    let naive_dt = NaiveDateTime::parse_from_str(date_str.trim(), "%Y:%m:%d %H:%M:%S").ok()?;

    let dt_with_subsec = match subsec_time_original.map(str::trim) {
        Some(subsec) if !subsec.is_empty() && subsec.len() <= 9 => match subsec.parse::<u32>() {
            Ok(subsec_num) => {
                let subsec_nanos = subsec_num * 10u32.pow(9 - subsec.len() as u32);
                naive_dt.with_nanosecond(subsec_nanos).unwrap_or(naive_dt)
            }
            Err(_) => naive_dt,
        },
        _ => naive_dt,
    };

    Some(DateTime::from_naive_utc_and_offset(dt_with_subsec, Utc))
}

/// Technical-quality assessment derived from capture metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalAssessment {
    pub technical_score: f64,
    pub iso_score: Option<f64>,
    pub shutter_score: Option<f64>,
    pub aperture_score: Option<f64>,
    pub gps_score: Option<f64>,
    pub notes: Vec<String>,
    pub capture: Option<CaptureMetadata>,
}

/// Score used when no metadata arrived with the image
pub const NEUTRAL_TECHNICAL_SCORE: f64 = 50.0;

fn iso_score(iso: u32) -> f64 {
    match iso {
        0..=100 => 100.0,
        101..=200 => 90.0,
        201..=400 => 75.0,
        401..=800 => 55.0,
        801..=1600 => 35.0,
        _ => 15.0,
    }
}

/// Faster shutter speeds freeze platform motion
fn shutter_score(seconds: f64) -> f64 {
    if seconds <= 1.0 / 1000.0 {
        100.0
    } else if seconds <= 1.0 / 500.0 {
        90.0
    } else if seconds <= 1.0 / 250.0 {
        75.0
    } else if seconds <= 1.0 / 125.0 {
        55.0
    } else if seconds <= 1.0 / 60.0 {
        35.0
    } else {
        15.0
    }
}

fn aperture_score(f_number: f64) -> f64 {
    if (4.0..=8.0).contains(&f_number) {
        100.0
    } else if (2.8..4.0).contains(&f_number) || (8.0..=11.0).contains(&f_number) {
        80.0
    } else {
        60.0
    }
}

fn gps_score(gps: Option<&GpsPosition>) -> f64 {
    match gps {
        Some(GpsPosition { altitude_m: Some(_), .. }) => 100.0,
        Some(_) => 80.0,
        None => 30.0,
    }
}

/// Score capture settings for photogrammetric use.
///
/// The technical score is the mean of the available ISO, shutter, aperture and GPS
/// sub-scores. Without metadata the score is neutral.
pub fn assess(metadata: Option<&CaptureMetadata>) -> TechnicalAssessment {
    let Some(meta) = metadata else {
        return TechnicalAssessment {
            technical_score: NEUTRAL_TECHNICAL_SCORE,
            iso_score: None,
            shutter_score: None,
            aperture_score: None,
            gps_score: None,
            notes: vec!["No capture metadata available; technical score is neutral".to_string()],
            capture: None,
        };
    };

    let mut notes = Vec::new();
    let iso = meta.iso.map(iso_score);
    let shutter = meta.shutter_speed.map(shutter_score);
    let aperture = meta.aperture.map(aperture_score);
    let gps = gps_score(meta.gps.as_ref());

    if let Some(value) = meta.iso.filter(|&v| v > 800) {
        notes.push(format!("High ISO {} increases sensor noise", value));
    }
    if let Some(seconds) = meta.shutter_speed.filter(|&s| s > 1.0 / 125.0) {
        notes.push(format!("Slow shutter (1/{:.0}s) risks motion blur", 1.0 / seconds));
    }
    match meta.gps {
        None => notes.push("No GPS position; georeferencing needs ground control".to_string()),
        Some(GpsPosition { altitude_m: None, .. }) => notes.push("GPS position has no altitude".to_string()),
        Some(_) => {}
    }
    if !meta.has_exposure_data() {
        notes.push("Exposure settings missing from metadata".to_string());
    }

    let scores: Vec<f64> = [iso, shutter, aperture, Some(gps)].into_iter().flatten().collect();
    let technical_score = scores.iter().sum::<f64>() / scores.len() as f64;

    TechnicalAssessment {
        technical_score,
        iso_score: iso,
        shutter_score: shutter,
        aperture_score: aperture,
        gps_score: Some(gps),
        notes,
        capture: Some(meta.clone()),
    }
}
