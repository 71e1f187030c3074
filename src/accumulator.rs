//! In-flight batch accumulation.
//!
//! The accumulator owns every open batch and one debounce timer per batch. Time
//! is passed in explicitly (`now_ms`), so the same code runs under the engine
//! thread and under deterministic tests.
//!
//! Lifecycle of a batch:
//! - OPEN: created by the first event for its key, accepts one event per camera.
//!   Every arrival (even a dropped duplicate) pushes its deadline out by the window.
//! - FINALIZING: the deadline passed; the batch is moved out of the live set and
//!   handed to the finalizer. Nothing can reach it afterwards.
//!
//! An event reusing a finalized explicit id opens a new batch under the same key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::finalize::finalize_batch;
use crate::normalize::{self, EventNormalizer};
use crate::resolver::BatchKeyResolver;
use crate::{duration_ms, AggregatorConfig, FinalizedBatch, RawInspectionEvent};

/// One camera's raw event recorded inside an in-flight batch.
#[derive(Clone, Debug)]
pub struct Contribution {
    pub camera_id: String,
    pub event: RawInspectionEvent,
    pub received_at_ms: u64,
}

#[derive(Debug)]
pub struct InFlightBatch {
    id: String,
    created_at_ms: u64,
    contributions: Vec<Contribution>,
    cameras: HashSet<String>,
    timer: Option<TimerHandle>,
}

impl InFlightBatch {
    pub fn new(id: String, created_at_ms: u64) -> Self {
        Self {
            id,
            created_at_ms,
            contributions: Vec::new(),
            cameras: HashSet::new(),
            timer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Contributions in camera arrival order.
    pub fn contributions(&self) -> &[Contribution] {
        &self.contributions
    }

    /// Records `event` for `camera_id` unless that camera already contributed.
    pub fn contribute(
        &mut self,
        camera_id: String,
        event: RawInspectionEvent,
        received_at_ms: u64,
    ) -> bool {
        if !self.cameras.insert(camera_id.clone()) {
            return false;
        }
        self.contributions.push(Contribution {
            camera_id,
            event,
            received_at_ms,
        });
        true
    }
}

// -------------------- Debounce Timers --------------------

/// Handle to one scheduled finalization. Ordered by deadline, then schedule order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle {
    deadline_ms: u64,
    seq: u64,
}

impl TimerHandle {
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }
}

#[derive(Debug, Default)]
struct DebounceTimers {
    queue: BTreeMap<TimerHandle, String>,
    next_seq: u64,
}

impl DebounceTimers {
    fn schedule(&mut self, batch_id: &str, deadline_ms: u64) -> TimerHandle {
        let handle = TimerHandle {
            deadline_ms,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queue.insert(handle, batch_id.to_string());
        handle
    }

    /// No-op for handles that already fired or were cancelled.
    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.queue.remove(&handle).is_some()
    }

    fn next_deadline(&self) -> Option<u64> {
        self.queue.keys().next().map(TimerHandle::deadline_ms)
    }

    fn pop_due(&mut self, now_ms: u64) -> Option<(TimerHandle, String)> {
        let (&handle, _) = self.queue.iter().next()?;
        if handle.deadline_ms > now_ms {
            return None;
        }
        self.queue.remove(&handle).map(|batch_id| (handle, batch_id))
    }
}

// -------------------- Accumulator --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContributionStatus {
    /// First event for this key; a new batch was opened.
    Opened,
    /// Recorded in an existing batch.
    Joined,
    /// The camera already contributed; payload dropped, timer still reset.
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestOutcome {
    pub batch_id: String,
    pub camera_id: String,
    pub status: ContributionStatus,
    pub deadline_ms: u64,
}

pub struct BatchAccumulator {
    window_ms: u64,
    resolver: BatchKeyResolver,
    normalizer: EventNormalizer,
    live: HashMap<String, InFlightBatch>,
    timers: DebounceTimers,
}

impl BatchAccumulator {
    pub fn new(window: Duration, normalizer: EventNormalizer) -> Self {
        Self {
            window_ms: duration_ms(window),
            resolver: BatchKeyResolver::new(window),
            normalizer,
            live: HashMap::new(),
            timers: DebounceTimers::default(),
        }
    }

    pub fn from_config(cfg: &AggregatorConfig) -> Self {
        Self::new(
            cfg.debounce_window,
            EventNormalizer::new(&cfg.no_detection_label),
        )
    }

    pub fn ingest(&mut self, event: RawInspectionEvent, now_ms: u64) -> IngestOutcome {
        let camera_id = normalize::camera_id(&event);
        let batch_id = self.resolver.resolve(&event, now_ms);

        let mut status = ContributionStatus::Joined;
        let batch = self.live.entry(batch_id.clone()).or_insert_with(|| {
            status = ContributionStatus::Opened;
            InFlightBatch::new(batch_id.clone(), now_ms)
        });

        if !batch.contribute(camera_id.clone(), event, now_ms) {
            status = ContributionStatus::Duplicate;
            log::debug!(
                "dropping duplicate camera {} for batch {}",
                camera_id,
                batch_id
            );
        }

        if let Some(previous) = batch.timer.take() {
            self.timers.cancel(previous);
        }
        let deadline_ms = now_ms.saturating_add(self.window_ms);
        batch.timer = Some(self.timers.schedule(&batch_id, deadline_ms));

        IngestOutcome {
            batch_id,
            camera_id,
            status,
            deadline_ms,
        }
    }

    /// Finalizes every batch whose deadline is at or before `now_ms`, in expiry order.
    pub fn expire_due(&mut self, now_ms: u64) -> Vec<FinalizedBatch> {
        let mut finished = Vec::new();
        while let Some((handle, batch_id)) = self.timers.pop_due(now_ms) {
            let current = self.live.get(&batch_id).and_then(|b| b.timer);
            if current != Some(handle) {
                log::debug!("ignoring stale timer for batch {}", batch_id);
                continue;
            }
            if let Some(batch) = self.finalize(&batch_id, now_ms) {
                finished.push(batch);
            }
        }
        finished
    }

    /// Finalizes all live batches immediately, oldest first.
    pub fn flush_all(&mut self, now_ms: u64) -> Vec<FinalizedBatch> {
        let mut ids: Vec<(u64, Option<TimerHandle>, String)> = self
            .live
            .values()
            .map(|b| (b.created_at_ms, b.timer, b.id.clone()))
            .collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|(_, _, id)| self.finalize(&id, now_ms))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, batch_id: &str) -> bool {
        self.live.contains_key(batch_id)
    }

    fn finalize(&mut self, batch_id: &str, now_ms: u64) -> Option<FinalizedBatch> {
        let mut batch = self.live.remove(batch_id)?;
        if let Some(handle) = batch.timer.take() {
            self.timers.cancel(handle);
        }
        if self.resolver.release(batch_id) {
            log::debug!("fallback lineage {} closed", batch_id);
        }
        let finalized = finalize_batch(batch, &self.normalizer, now_ms);
        log::info!(
            "batch {} finalized: status={} inputs={}",
            finalized.id,
            finalized.overall_status,
            finalized.total_inputs
        );
        Some(finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Verdict;
    use serde_json::{json, Value};

    const T0: u64 = 1_700_000_000_000;

    fn ev(value: Value) -> RawInspectionEvent {
        RawInspectionEvent::from_value(value).unwrap()
    }

    fn accumulator() -> BatchAccumulator {
        BatchAccumulator::new(Duration::from_millis(1000), EventNormalizer::default())
    }

    #[test]
    fn duplicate_camera_keeps_first_payload() {
        let mut acc = accumulator();
        let first = acc.ingest(ev(json!({"batch_id": "b1", "camera_id": "c1", "result": "PASS"})), T0);
        let dup = acc.ingest(ev(json!({"batch_id": "b1", "camera_id": "c1", "result": "FAIL"})), T0 + 10);
        assert_eq!(first.status, ContributionStatus::Opened);
        assert_eq!(dup.status, ContributionStatus::Duplicate);

        let out = acc.expire_due(T0 + 10_000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rois.len(), 1);
        assert_eq!(out[0].rois[0].result, Verdict::Pass);
        assert_eq!(out[0].overall_status, Verdict::Pass);
    }

    #[test]
    fn duplicate_still_extends_deadline() {
        let mut acc = accumulator();
        acc.ingest(ev(json!({"batch_id": "b1", "camera_id": "c1"})), T0);
        acc.ingest(ev(json!({"batch_id": "b1", "camera_id": "c1"})), T0 + 800);
        assert!(acc.expire_due(T0 + 1_000).is_empty());
        assert!(acc.expire_due(T0 + 1_799).is_empty());
        assert_eq!(acc.expire_due(T0 + 1_800).len(), 1);
    }

    #[test]
    fn finalizes_exactly_at_window_not_before() {
        let mut acc = accumulator();
        acc.ingest(ev(json!({"batch_id": "b1", "camera_id": "c1"})), T0);
        assert_eq!(acc.next_deadline(), Some(T0 + 1_000));
        assert!(acc.expire_due(T0 + 999).is_empty());
        assert!(acc.is_live("b1"));

        let out = acc.expire_due(T0 + 1_000);
        assert_eq!(out.len(), 1);
        assert!(!acc.is_live("b1"));
        assert_eq!(acc.next_deadline(), None);
        assert!(acc.expire_due(T0 + 5_000).is_empty());
    }

    #[test]
    fn boxes_follow_arrival_order() {
        let mut acc = accumulator();
        for (i, cam) in ["left", "top", "right", "top", "bottom"].iter().enumerate() {
            acc.ingest(ev(json!({"batch_id": "b1", "camera_id": cam})), T0 + i as u64 * 100);
        }
        let out = acc.expire_due(T0 + 2_000);
        let boxes: Vec<(u32, &str)> = out[0]
            .rois
            .iter()
            .map(|r| (r.box_number, r.camera_id.as_str()))
            .collect();
        assert_eq!(boxes, vec![(1, "left"), (2, "top"), (3, "right"), (4, "bottom")]);
        assert_eq!(out[0].total_inputs, 4);
    }

    #[test]
    fn fallback_lineage_groups_bursts() {
        let mut acc = accumulator();
        let a = acc.ingest(ev(json!({"camera_id": "c1"})), T0);
        let b = acc.ingest(ev(json!({"camera_id": "c2"})), T0 + 400);
        let c = acc.ingest(ev(json!({"camera_id": "c3"})), T0 + 900);
        assert_eq!(a.batch_id, b.batch_id);
        assert_eq!(b.batch_id, c.batch_id);

        let first = acc.expire_due(T0 + 1_900);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].total_inputs, 3);

        let d = acc.ingest(ev(json!({"camera_id": "c1"})), T0 + 2_500);
        assert_ne!(d.batch_id, a.batch_id);
        assert_eq!(d.status, ContributionStatus::Opened);
    }

    #[test]
    fn finalizing_fallback_batch_ends_its_lineage() {
        let mut acc = accumulator();
        let a = acc.ingest(ev(json!({"camera_id": "c1"})), T0);
        assert_eq!(a.batch_id, format!("fallback_{}", T0));

        let done = acc.expire_due(T0 + 1_000);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, a.batch_id);

        // same instant, still inside the window of the previous event
        let b = acc.ingest(ev(json!({"camera_id": "c2"})), T0 + 1_000);
        assert_eq!(b.batch_id, format!("fallback_{}", T0 + 1_000));
        assert_eq!(b.status, ContributionStatus::Opened);
    }

    #[test]
    fn explicit_ids_do_not_disturb_fallback_lineage() {
        let mut acc = accumulator();
        let a = acc.ingest(ev(json!({"camera_id": "c1"})), T0);
        acc.ingest(ev(json!({"camera_id": "x", "batch_id": "explicit"})), T0 + 100);
        let b = acc.ingest(ev(json!({"camera_id": "c2"})), T0 + 200);
        assert_eq!(a.batch_id, b.batch_id);
        assert_eq!(acc.live_count(), 2);
    }

    #[test]
    fn overlapping_batches_finalize_in_expiry_order() {
        let mut acc = accumulator();
        acc.ingest(ev(json!({"batch_id": "early", "camera_id": "c1"})), T0);
        acc.ingest(ev(json!({"batch_id": "late", "camera_id": "c1"})), T0 + 100);
        acc.ingest(ev(json!({"batch_id": "early", "camera_id": "c2"})), T0 + 500);

        let out = acc.expire_due(T0 + 5_000);
        let ids: Vec<&str> = out.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["late", "early"]);
    }

    #[test]
    fn reused_explicit_id_opens_new_batch() {
        let mut acc = accumulator();
        acc.ingest(ev(json!({"batch_id": "b1", "camera_id": "c1"})), T0);
        assert_eq!(acc.expire_due(T0 + 1_000).len(), 1);

        let again = acc.ingest(ev(json!({"batch_id": "b1", "camera_id": "c1"})), T0 + 3_000);
        assert_eq!(again.status, ContributionStatus::Opened);
        let out = acc.expire_due(T0 + 4_000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rois[0].timestamp, T0 + 3_000);
    }

    #[test]
    fn flush_all_drains_in_creation_order() {
        let mut acc = accumulator();
        acc.ingest(ev(json!({"batch_id": "second", "camera_id": "c1"})), T0 + 50);
        acc.ingest(ev(json!({"batch_id": "first", "camera_id": "c1"})), T0);
        let out = acc.flush_all(T0 + 60);
        let ids: Vec<&str> = out.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert_eq!(acc.live_count(), 0);
        assert_eq!(acc.next_deadline(), None);
    }

    #[test]
    fn cancelling_fired_timer_is_noop() {
        let mut timers = DebounceTimers::default();
        let handle = timers.schedule("b", 10);
        assert!(timers.pop_due(10).is_some());
        assert!(!timers.cancel(handle));
        assert!(!timers.cancel(handle));
    }
}
