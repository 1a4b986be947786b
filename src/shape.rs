//! Long-form events <-> wide rows.
//!
//! Widening keeps the first non-null value seen for each `(timestamp, variable)`
//! pair, in input order. The event query orders rows by timestamp, variable
//! name and insertion id, so the winner of a duplicate is stable across runs.
//! Nulls and non-finite values never occupy a cell: a pair whose events are
//! all null is absent from the wide row, and a timestamp with no usable event
//! produces no row.

use crate::records::{MeasurementEvent, WideRow};
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_DATETIME_COLUMN: &str = "DATETIME";

pub fn widen(events: &[MeasurementEvent]) -> Vec<WideRow> {
    let mut rows: BTreeMap<DateTime<Utc>, WideRow> = BTreeMap::new();
    let mut discarded = 0usize;

    for event in events {
        let Some(value) = event.value.filter(|v| v.is_finite()) else {
            continue;
        };
        let row = rows
            .entry(event.timestamp)
            .or_insert_with(|| WideRow::new(event.timestamp));
        match row.values.entry(event.variable_name.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Some(value));
                if let Some(source) = event.source.as_ref() {
                    row.sources.insert(event.variable_name.clone(), source.clone());
                }
            }
            Entry::Occupied(_) => discarded += 1,
        }
    }

    if discarded > 0 {
        tracing::debug!(discarded, "dropped duplicate (timestamp, variable) events");
    }

    rows.into_values().collect()
}

/// Flattens wide rows back into events ordered by timestamp then variable.
///
/// Cells that are null or non-finite are dropped, and a column named like
/// `datetime_column` is never treated as a variable. A cell's own provenance
/// wins over `source`.
pub fn narrow(
    rows: &[WideRow],
    datetime_column: &str,
    source: Option<&str>,
) -> Vec<MeasurementEvent> {
    let mut ordered: Vec<&WideRow> = rows.iter().collect();
    ordered.sort_by_key(|row| row.timestamp);

    let mut events = Vec::new();
    for row in ordered {
        for (variable, value) in &row.values {
            if variable == datetime_column {
                continue;
            }
            let Some(value) = value.filter(|v| v.is_finite()) else {
                continue;
            };
            let source = row.source(variable).or(source).map(|s| s.to_string());
            events.push(MeasurementEvent::new(
                row.timestamp,
                variable.clone(),
                Some(value),
                source,
            ));
        }
    }
    events
}

/// Union of the variable columns present in a batch of wide rows.
pub fn columns(rows: &[WideRow]) -> BTreeSet<String> {
    rows.iter().flat_map(|row| row.values.keys().cloned()).collect()
}
