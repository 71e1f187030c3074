//! Field-tolerant event normalization.
//!
//! Senders have renamed fields over time. Every logical field is read through an
//! ordered list of accepted names; the first usable value wins. The lists are
//! public so they can be audited and tested without the rest of the engine.

use serde_json::Value;

use crate::geometry::sensor_to_display;
use crate::{NormalizedDetection, RawInspectionEvent, Verdict, UNKNOWN_CAMERA};

/// Default tag label meaning "no detection".
pub const DEFAULT_NO_DETECTION_LABEL: &str = "no_detection";

pub const CAMERA_ID_FIELDS: [&str; 3] = ["camera_id", "cameraId", "image_ref"];
pub const BATCH_ID_FIELDS: [&str; 4] = ["batch_id", "inspection_id", "run_id", "batch"];
pub const VERDICT_FIELDS: [&str; 3] = ["prediction", "result", "status"];
pub const DETECTION_COUNT_FIELDS: [&str; 2] = ["detection_count", "num_detections"];
pub const IMAGE_FIELDS: [&str; 3] = ["image", "image_data", "imageData"];
pub const MODEL_FIELDS: [&str; 2] = ["model", "model_name"];
pub const VERSION_FIELDS: [&str; 2] = ["version", "model_version"];
pub const PROJECT_ID_FIELDS: [&str; 2] = ["project_id", "projectId"];

const TAG_LIST_FIELD: &str = "tags";
const LEGACY_BOX_FIELDS: [&str; 2] = ["bounding_boxes", "boxes"];
const TAG_CORNER_FIELDS: [&str; 2] = ["box", "bbox"];
const LABEL_FIELDS: [&str; 2] = ["label", "class"];
const CONFIDENCE_FIELDS: [&str; 2] = ["confidence", "score"];
const COLOR_FIELD: &str = "color";

/// Camera, verdict and detections extracted from one raw event.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedEvent {
    pub camera_id: String,
    pub verdict: Verdict,
    pub detections: Vec<NormalizedDetection>,
}

#[derive(Clone, Debug)]
pub struct EventNormalizer {
    no_detection_label: String,
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_NO_DETECTION_LABEL)
    }
}

impl EventNormalizer {
    pub fn new(no_detection_label: &str) -> Self {
        Self {
            no_detection_label: no_detection_label.trim().to_lowercase(),
        }
    }

    pub fn normalize(&self, event: &RawInspectionEvent) -> NormalizedEvent {
        NormalizedEvent {
            camera_id: camera_id(event),
            verdict: verdict(event),
            detections: self.detections(event),
        }
    }

    /// Tag list first, then `bounding_boxes`, then `boxes`. Encodings never merge.
    pub fn detections(&self, event: &RawInspectionEvent) -> Vec<NormalizedDetection> {
        if let Some(tags) = non_empty_array(event.get(TAG_LIST_FIELD)) {
            return tags.iter().filter_map(|tag| self.tag_detection(tag)).collect();
        }
        for field in LEGACY_BOX_FIELDS {
            if let Some(boxes) = non_empty_array(event.get(field)) {
                return boxes.iter().filter_map(legacy_detection).collect();
            }
        }
        Vec::new()
    }

    fn tag_detection(&self, tag: &Value) -> Option<NormalizedDetection> {
        let obj = tag.as_object()?;
        let label = first_string(|f| obj.get(f), &LABEL_FIELDS);
        if let Some(label) = &label {
            if label.trim().to_lowercase() == self.no_detection_label {
                return None;
            }
        }
        let corners = first_value(|f| obj.get(f), &TAG_CORNER_FIELDS).and_then(corner_array)?;
        let display = sensor_to_display(corners);
        Some(NormalizedDetection {
            x: display.x,
            y: display.y,
            width: display.width,
            height: display.height,
            label,
            confidence: first_number(|f| obj.get(f), &CONFIDENCE_FIELDS),
            color: obj.get(COLOR_FIELD).filter(|v| !v.is_null()).cloned(),
        })
    }
}

/// `camera_id` → `cameraId` → `image_ref` → `"Unknown"`.
pub fn camera_id(event: &RawInspectionEvent) -> String {
    first_string(|f| event.get(f), &CAMERA_ID_FIELDS).unwrap_or_else(|| UNKNOWN_CAMERA.to_string())
}

/// Explicit sender batch identifier, if any.
pub fn explicit_batch_id(event: &RawInspectionEvent) -> Option<String> {
    first_string(|f| event.get(f), &BATCH_ID_FIELDS)
}

/// Explicit verdict fields first, then the detection count, else `Unknown`.
pub fn verdict(event: &RawInspectionEvent) -> Verdict {
    if let Some(label) = first_string(|f| event.get(f), &VERDICT_FIELDS) {
        return Verdict::from_label(&label);
    }
    match detection_count(event) {
        Some(count) if count > 0.0 => Verdict::Fail,
        Some(_) => Verdict::Pass,
        None => Verdict::Unknown,
    }
}

pub fn detection_count(event: &RawInspectionEvent) -> Option<f64> {
    first_number(|f| event.get(f), &DETECTION_COUNT_FIELDS)
}

pub fn image_data(event: &RawInspectionEvent) -> Option<String> {
    first_string(|f| event.get(f), &IMAGE_FIELDS)
}

pub fn model(event: &RawInspectionEvent) -> Option<String> {
    first_string(|f| event.get(f), &MODEL_FIELDS)
}

pub fn version(event: &RawInspectionEvent) -> Option<String> {
    first_string(|f| event.get(f), &VERSION_FIELDS)
}

pub fn project_id(event: &RawInspectionEvent) -> Option<String> {
    first_string(|f| event.get(f), &PROJECT_ID_FIELDS)
}

fn legacy_detection(entry: &Value) -> Option<NormalizedDetection> {
    let obj = entry.as_object()?;
    let num = |field: &str| obj.get(field).and_then(Value::as_f64);
    let span = |size: &str, lo: &[&str; 2], hi: &[&str; 2]| {
        num(size)
            .or_else(|| Some(num(hi[0])? - num(lo[0])?))
            .or_else(|| Some(num(hi[1])? - num(lo[1])?))
            .unwrap_or(0.0)
    };
    Some(NormalizedDetection {
        x: num("x").or_else(|| num("x1")).or_else(|| num("left")).unwrap_or(0.0),
        y: num("y").or_else(|| num("y1")).or_else(|| num("top")).unwrap_or(0.0),
        width: span("width", &["x1", "left"], &["x2", "right"]),
        height: span("height", &["y1", "top"], &["y2", "bottom"]),
        label: first_string(|f| obj.get(f), &LABEL_FIELDS),
        confidence: first_number(|f| obj.get(f), &CONFIDENCE_FIELDS),
        color: obj.get(COLOR_FIELD).filter(|v| !v.is_null()).cloned(),
    })
}

fn corner_array(value: &Value) -> Option<[f64; 4]> {
    let items = value.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut out = [0.0; 4];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.as_f64()?;
    }
    Some(out)
}

fn non_empty_array(value: Option<&Value>) -> Option<&Vec<Value>> {
    value.and_then(Value::as_array).filter(|items| !items.is_empty())
}

fn first_value<'a, F>(lookup: F, fields: &[&str]) -> Option<&'a Value>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    fields
        .iter()
        .filter_map(|field| lookup(field))
        .find(|value| !value.is_null())
}

/// First field holding a non-empty string (or a number, rendered as text).
fn first_string<'a, F>(lookup: F, fields: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    fields.iter().find_map(|field| match lookup(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_number<'a, F>(lookup: F, fields: &[&str]) -> Option<f64>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    fields.iter().find_map(|field| lookup(field)?.as_f64())
}
