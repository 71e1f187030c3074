//! Inspection Batch Aggregator
//!
//! This crate rebuilds complete inspection cycles ("batches") from a stream of
//! per-camera inspection events that arrive out of order, with no end-of-batch
//! marker from the sender.
//!
//! # Architecture
//!
//! The aggregation engine holds four invariants:
//!
//! 1. **One Contribution Per Camera**: the first event for a camera wins inside a batch.
//! 2. **Dense Boxing**: ROI box numbers are `1..=N` in camera arrival order.
//! 3. **Emit Once**: every in-flight batch is finalized and delivered at most once.
//! 4. **Derived Status**: a batch verdict is a pure function of its ROI verdicts.
//!
//! # Module Structure
//!
//! - `normalize`: field-tolerant extraction of camera, verdict and detections
//! - `geometry`: sensor-to-display box transform
//! - `resolver`: batch key resolution with timing fallback
//! - `accumulator`: in-flight batches, dedup and debounce timers
//! - `finalize`: immutable batch construction
//! - `engine`: single-owner runtime thread and completion sinks
//! - `history`: bounded completion history
//! - `transport`: MQTT plumbing and payload decoding
//! - Core types: RawInspectionEvent, Verdict, FinalizedBatch, RoiResult

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod accumulator;
pub mod config;
pub mod engine;
pub mod finalize;
pub mod geometry;
pub mod history;
pub mod normalize;
pub mod resolver;
pub mod transport;

pub use accumulator::{BatchAccumulator, ContributionStatus, IngestOutcome};
pub use config::AggregatorConfig;
pub use engine::{BatchEngine, Clock, CompletionSink, EngineHandle, EventIngestor, SystemClock};
pub use finalize::finalize_batch;
pub use geometry::{sensor_to_display, DisplayBox};
pub use history::{BatchHistory, Selection};
pub use normalize::{EventNormalizer, NormalizedEvent};
pub use resolver::BatchKeyResolver;

/// Debounce window shared by batch completion and fallback lineage grouping.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// Camera identity used when an event carries none.
pub const UNKNOWN_CAMERA: &str = "Unknown";

pub(crate) fn now_ms() -> Result<u64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    u64::try_from(elapsed.as_millis()).map_err(|_| anyhow!("system clock out of range"))
}

pub(crate) fn duration_ms(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

// -------------------- Raw Events --------------------

/// One camera's raw inspection record for one cycle.
///
/// The sender controls the shape; the engine only probes named fields.
#[derive(Clone, Debug, PartialEq)]
pub struct RawInspectionEvent {
    fields: Map<String, Value>,
}

impl RawInspectionEvent {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(anyhow!(
                "inspection event must be a JSON object, got {}",
                json_kind(&other)
            )),
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| anyhow!("inspection event parse error: {}", e))?;
        Self::from_value(value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<Map<String, Value>> for RawInspectionEvent {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// -------------------- Verdicts --------------------

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    #[default]
    Unknown,
}

impl Verdict {
    /// Case-insensitive parse; anything other than pass/fail is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_uppercase().as_str() {
            "PASS" => Verdict::Pass,
            "FAIL" => Verdict::Fail,
            _ => Verdict::Unknown,
        }
    }

    /// FAIL dominates PASS, PASS dominates UNKNOWN.
    pub fn aggregate<I: IntoIterator<Item = Verdict>>(verdicts: I) -> Self {
        let mut overall = Verdict::Unknown;
        for verdict in verdicts {
            match verdict {
                Verdict::Fail => return Verdict::Fail,
                Verdict::Pass => overall = Verdict::Pass,
                Verdict::Unknown => {}
            }
        }
        overall
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
            Verdict::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// -------------------- Finalized Batches --------------------

/// One detection box in display space, normalized to 0..1.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizedDetection {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Value>,
}

/// One camera's result inside a finalized batch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoiResult {
    /// 1-based, assigned in camera arrival order.
    pub box_number: u32,
    pub camera_id: String,
    pub result: Verdict,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    /// Arrival time of this camera's event, milliseconds since epoch.
    pub timestamp: u64,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detections: Vec<NormalizedDetection>,
}

/// A completed inspection cycle. Built once by the finalizer and never mutated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedBatch {
    pub id: String,
    /// Finalization time, milliseconds since epoch.
    pub timestamp: u64,
    pub model: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub overall_status: Verdict,
    pub total_inputs: usize,
    pub rois: Vec<RoiResult>,
}

impl FinalizedBatch {
    pub fn roi_for_camera(&self, camera_id: &str) -> Option<&RoiResult> {
        self.rois.iter().find(|roi| roi.camera_id == camera_id)
    }

    pub fn fail_count(&self) -> usize {
        self.rois
            .iter()
            .filter(|roi| roi.result == Verdict::Fail)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verdict_labels_are_case_normalized() {
        assert_eq!(Verdict::from_label("pass"), Verdict::Pass);
        assert_eq!(Verdict::from_label(" Fail "), Verdict::Fail);
        assert_eq!(Verdict::from_label("NG"), Verdict::Unknown);
        assert_eq!(Verdict::from_label(""), Verdict::Unknown);
    }

    #[test]
    fn fail_dominates_aggregate() {
        use Verdict::*;
        assert_eq!(Verdict::aggregate([Pass, Unknown, Fail, Pass]), Fail);
        assert_eq!(Verdict::aggregate([Unknown, Pass]), Pass);
        assert_eq!(Verdict::aggregate([Unknown, Unknown]), Unknown);
        assert_eq!(Verdict::aggregate(Vec::new()), Unknown);
    }

    #[test]
    fn raw_event_rejects_non_objects() {
        let err = RawInspectionEvent::from_value(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("array"));
        assert!(RawInspectionEvent::from_slice(b"{not json").is_err());
    }

    #[test]
    fn finalized_batch_serializes_camel_case() {
        let batch = FinalizedBatch {
            id: "b-1".to_string(),
            timestamp: 10,
            model: "m".to_string(),
            version: "v".to_string(),
            project_id: None,
            overall_status: Verdict::Pass,
            total_inputs: 0,
            rois: Vec::new(),
        };
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["overallStatus"], "PASS");
        assert_eq!(value["totalInputs"], 0);
        assert!(value.get("projectId").is_none());
    }
}
