//! Inspection payload decoding.
//!
//! A publish carries either one event object or an array of them. Array elements
//! that are not objects are skipped with a warning rather than failing the rest.

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::{json_kind, RawInspectionEvent};

pub fn decode_payload(payload: &[u8]) -> Result<Vec<RawInspectionEvent>> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;
    match value {
        Value::Object(fields) => Ok(vec![RawInspectionEvent::from(fields)]),
        Value::Array(items) => {
            let mut events = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(fields) => events.push(RawInspectionEvent::from(fields)),
                    other => log::warn!(
                        "skipping element {} of event array: expected object, got {}",
                        index,
                        json_kind(&other)
                    ),
                }
            }
            Ok(events)
        }
        other => Err(anyhow!(
            "payload must be an event object or array, got {}",
            json_kind(&other)
        )),
    }
}
