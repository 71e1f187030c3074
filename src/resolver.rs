//! Batch key resolution.
//!
//! Events carrying an explicit batch identifier are grouped by it. Events without
//! one are grouped by arrival timing: a burst of events with gaps no longer than
//! the window shares one synthetic "fallback lineage" id.

use std::time::Duration;

use crate::normalize::explicit_batch_id;
use crate::{duration_ms, RawInspectionEvent, DEFAULT_DEBOUNCE_MS};

pub const FALLBACK_ID_PREFIX: &str = "fallback_";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct FallbackLineage {
    current_id: Option<String>,
    last_event_ms: u64,
}

/// Resolves the batch key for each event. Owns the fallback lineage state, so
/// independent resolvers never share grouping decisions.
#[derive(Clone, Debug)]
pub struct BatchKeyResolver {
    window_ms: u64,
    lineage: FallbackLineage,
}

impl Default for BatchKeyResolver {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_DEBOUNCE_MS))
    }
}

impl BatchKeyResolver {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: duration_ms(window),
            lineage: FallbackLineage::default(),
        }
    }

    pub fn resolve(&mut self, event: &RawInspectionEvent, now_ms: u64) -> String {
        if let Some(id) = explicit_batch_id(event) {
            return id;
        }

        let elapsed = now_ms.saturating_sub(self.lineage.last_event_ms);
        let id = match &self.lineage.current_id {
            Some(id) if elapsed <= self.window_ms => id.clone(),
            _ => {
                let id = format!("{}{}", FALLBACK_ID_PREFIX, now_ms);
                log::debug!("starting fallback lineage {}", id);
                self.lineage.current_id = Some(id.clone());
                id
            }
        };
        self.lineage.last_event_ms = now_ms;
        id
    }

    /// The fallback id currently accepting events, if any.
    pub fn active_fallback(&self) -> Option<&str> {
        self.lineage.current_id.as_deref()
    }

    /// Ends the lineage if `batch_id` is the active fallback id.
    pub fn release(&mut self, batch_id: &str) -> bool {
        if self.lineage.current_id.as_deref() == Some(batch_id) {
            self.lineage = FallbackLineage::default();
            return true;
        }
        false
    }
}
