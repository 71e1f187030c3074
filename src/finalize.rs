use crate::accumulator::InFlightBatch;
use crate::normalize::{self, EventNormalizer};
use crate::{FinalizedBatch, RoiResult, Verdict};

const UNKNOWN_FIELD: &str = "Unknown";

/// Builds the immutable result of one inspection cycle.
///
/// Batch metadata comes from the first camera to arrive. Cameras keep their
/// arrival order and are numbered from 1. An empty batch yields a well-formed
/// `UNKNOWN` result with no ROIs.
pub fn finalize_batch(
    batch: InFlightBatch,
    normalizer: &EventNormalizer,
    finalized_at_ms: u64,
) -> FinalizedBatch {
    let first = batch.contributions().first().map(|c| &c.event);
    let model = first
        .and_then(normalize::model)
        .unwrap_or_else(|| UNKNOWN_FIELD.to_string());
    let version = first
        .and_then(normalize::version)
        .unwrap_or_else(|| UNKNOWN_FIELD.to_string());
    let project_id = first.and_then(normalize::project_id);

    let rois: Vec<RoiResult> = batch
        .contributions()
        .iter()
        .zip(1u32..)
        .map(|(contribution, box_number)| {
            let normalized = normalizer.normalize(&contribution.event);
            RoiResult {
                box_number,
                camera_id: contribution.camera_id.clone(),
                result: normalized.verdict,
                reason: reason(normalize::detection_count(&contribution.event)),
                image_data: normalize::image_data(&contribution.event),
                timestamp: contribution.received_at_ms,
                batch_id: batch.id().to_string(),
                detections: normalized.detections,
            }
        })
        .collect();

    FinalizedBatch {
        id: batch.id().to_string(),
        timestamp: finalized_at_ms,
        model,
        version,
        project_id,
        overall_status: Verdict::aggregate(rois.iter().map(|roi| roi.result)),
        total_inputs: rois.len(),
        rois,
    }
}

fn reason(detection_count: Option<f64>) -> String {
    match detection_count {
        Some(count) => format!("{} detection(s)", count),
        None => "No data".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawInspectionEvent;
    use serde_json::{json, Value};

    fn batch_of(events: Vec<Value>) -> InFlightBatch {
        let mut batch = InFlightBatch::new("b-7".to_string(), 100);
        for (i, value) in events.into_iter().enumerate() {
            let event = RawInspectionEvent::from_value(value).unwrap();
            let camera = normalize::camera_id(&event);
            batch.contribute(camera, event, 100 + i as u64);
        }
        batch
    }

    #[test]
    fn empty_batch_is_unknown() {
        let out = finalize_batch(batch_of(vec![]), &EventNormalizer::default(), 500);
        assert_eq!(out.overall_status, Verdict::Unknown);
        assert_eq!(out.total_inputs, 0);
        assert!(out.rois.is_empty());
        assert_eq!(out.model, "Unknown");
        assert_eq!(out.version, "Unknown");
        assert_eq!(out.project_id, None);
    }

    #[test]
    fn metadata_from_first_contribution() {
        let out = finalize_batch(
            batch_of(vec![
                json!({"camera_id": "top", "model": "m-1", "version": "3", "project_id": "p-9"}),
                json!({"camera_id": "side", "model": "m-2", "version": "4"}),
            ]),
            &EventNormalizer::default(),
            500,
        );
        assert_eq!(out.model, "m-1");
        assert_eq!(out.version, "3");
        assert_eq!(out.project_id.as_deref(), Some("p-9"));
        assert_eq!(out.timestamp, 500);
    }

    #[test]
    fn box_numbers_are_dense_in_arrival_order() {
        let out = finalize_batch(
            batch_of(vec![
                json!({"camera_id": "c3"}),
                json!({"camera_id": "c1"}),
                json!({"camera_id": "c2"}),
            ]),
            &EventNormalizer::default(),
            500,
        );
        let order: Vec<(u32, &str)> = out
            .rois
            .iter()
            .map(|r| (r.box_number, r.camera_id.as_str()))
            .collect();
        assert_eq!(order, vec![(1, "c3"), (2, "c1"), (3, "c2")]);
        assert!(out.rois.iter().all(|r| r.batch_id == "b-7"));
        assert_eq!(out.rois[1].timestamp, 101);
    }

    #[test]
    fn status_and_reason() {
        let out = finalize_batch(
            batch_of(vec![
                json!({"camera_id": "a", "detection_count": 0}),
                json!({"camera_id": "b", "detection_count": 2, "image": "data:image/jpeg;base64,AAAA"}),
                json!({"camera_id": "c"}),
            ]),
            &EventNormalizer::default(),
            500,
        );
        assert_eq!(out.overall_status, Verdict::Fail);
        assert_eq!(out.fail_count(), 1);
        assert_eq!(out.rois[0].reason, "0 detection(s)");
        assert_eq!(out.rois[1].reason, "2 detection(s)");
        assert_eq!(out.rois[2].reason, "No data");
        assert_eq!(
            out.roi_for_camera("b").and_then(|r| r.image_data.as_deref()),
            Some("data:image/jpeg;base64,AAAA")
        );
    }

    #[test]
    fn pass_without_fail_is_pass() {
        let out = finalize_batch(
            batch_of(vec![
                json!({"camera_id": "a", "result": "pass"}),
                json!({"camera_id": "b", "result": "??"}),
            ]),
            &EventNormalizer::default(),
            500,
        );
        assert_eq!(out.overall_status, Verdict::Pass);
    }
}
