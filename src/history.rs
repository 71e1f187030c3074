//! Bounded history of finalized batches.
//!
//! Consumers downstream of the engine keep the most recent batches for review.
//! When capacity is exceeded the oldest batch is evicted, and any selection that
//! points at it is cleared with it.

use std::collections::VecDeque;

use crate::FinalizedBatch;

/// A batch (and optionally one ROI inside it) picked for review.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub batch_id: String,
    pub box_number: Option<u32>,
}

pub struct BatchHistory {
    batches: VecDeque<FinalizedBatch>,
    capacity: usize,
    selection: Option<Selection>,
}

impl BatchHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            batches: VecDeque::with_capacity(capacity),
            capacity,
            selection: None,
        }
    }

    /// Appends in delivery order. Returns the evicted batch, if any.
    pub fn push(&mut self, batch: FinalizedBatch) -> Option<FinalizedBatch> {
        let evicted = if self.batches.len() >= self.capacity {
            self.batches.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            if self.selection.as_ref().map(|s| s.batch_id.as_str()) == Some(old.id.as_str()) {
                log::debug!("clearing selection on evicted batch {}", old.id);
                self.selection = None;
            }
        }
        self.batches.push_back(batch);
        evicted
    }

    /// Selects a batch held in history. Returns false if it is not present or the
    /// box number does not exist in it.
    pub fn select(&mut self, batch_id: &str, box_number: Option<u32>) -> bool {
        let Some(batch) = self.get(batch_id) else {
            return false;
        };
        if let Some(n) = box_number {
            if !batch.rois.iter().any(|roi| roi.box_number == n) {
                return false;
            }
        }
        self.selection = Some(Selection {
            batch_id: batch_id.to_string(),
            box_number,
        });
        true
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Most recently delivered batches first.
    pub fn latest(&self, count: usize) -> Vec<&FinalizedBatch> {
        self.batches.iter().rev().take(count).collect()
    }

    /// Most recent batch with the given id. Explicit ids can repeat across cycles.
    pub fn get(&self, batch_id: &str) -> Option<&FinalizedBatch> {
        self.batches.iter().rev().find(|b| b.id == batch_id)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
