//! Grouped-scan ordering and key-preserving reattachment.
//!
//! Grouped stages never reorder the frame itself. They sort a list of row
//! positions, scan it per driver, and hand back `(position, value)` pairs that
//! are joined onto the original rows here.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::features::FeatureError;
use crate::offer::{OfferEvent, OfferFeatures, OfferFrame};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinStrategy {
    /// Join on original row position. A booking offered to several drivers
    /// repeats its `order_id`, so business keys may repeat here.
    #[default]
    RowIndex,
    /// Strict mode: join on the stage's business key, which must be unique in
    /// the frame.
    UniqueKey,
}

impl JoinStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unique_key" | "key" => Some(Self::UniqueKey),
            "row_index" | "index" => Some(Self::RowIndex),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RowIndex => "row_index",
            Self::UniqueKey => "unique_key",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKey {
    Order,
    OrderDriver,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyValue {
    order_id: String,
    driver_id: Option<String>,
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.driver_id {
            Some(driver_id) => write!(f, "order_id={} driver_id={}", self.order_id, driver_id),
            None => write!(f, "order_id={}", self.order_id),
        }
    }
}

impl JoinKey {
    pub fn key_of(self, event: &OfferEvent) -> KeyValue {
        KeyValue {
            order_id: event.order_id.clone(),
            driver_id: match self {
                Self::Order => None,
                Self::OrderDriver => Some(event.driver_id.clone()),
            },
        }
    }
}

/// Positions of `frame` stable-sorted by (`driver_id`, `event_ts`), null
/// timestamps last within their driver.
pub fn driver_time_order(frame: &OfferFrame) -> Vec<usize> {
    let rows = frame.rows();
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by(|a, b| {
        let (ra, rb) = (&rows[*a], &rows[*b]);
        ra.event
            .driver_id
            .cmp(&rb.event.driver_id)
            .then_with(|| ra.event_ts.is_none().cmp(&rb.event_ts.is_none()))
            .then_with(|| ra.event_ts.cmp(&rb.event_ts))
    });
    order
}

/// Splits sorted positions into consecutive same-driver runs.
pub fn driver_groups<'a>(frame: &OfferFrame, order: &'a [usize]) -> Vec<&'a [usize]> {
    let rows = frame.rows();
    let mut groups = Vec::new();
    let mut start = 0;
    for idx in 1..=order.len() {
        let boundary = idx == order.len()
            || rows[order[idx]].event.driver_id != rows[order[start]].event.driver_id;
        if boundary {
            if start < idx {
                groups.push(&order[start..idx]);
            }
            start = idx;
        }
    }
    groups
}

pub fn ensure_unique_keys(
    frame: &OfferFrame,
    stage: &'static str,
    key: JoinKey,
) -> Result<(), FeatureError> {
    let mut seen = HashSet::with_capacity(frame.len());
    for row in frame.rows() {
        let value = key.key_of(&row.event);
        if !seen.insert(value.clone()) {
            return Err(FeatureError::DuplicateJoinKey {
                stage,
                key: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Writes scanned values back onto the original rows. Every row must receive
/// exactly one value.
pub fn reattach<T: Copy>(
    frame: &mut OfferFrame,
    stage: &'static str,
    key: JoinKey,
    strategy: JoinStrategy,
    scanned: Vec<(usize, T)>,
    apply: impl Fn(&mut OfferFeatures, T),
) -> Result<(), FeatureError> {
    match strategy {
        JoinStrategy::UniqueKey => {
            ensure_unique_keys(frame, stage, key)?;
            let mut by_key: HashMap<KeyValue, T> = HashMap::with_capacity(scanned.len());
            for (position, value) in scanned {
                by_key.insert(key.key_of(&frame.rows()[position].event), value);
            }
            for row in frame.rows_mut() {
                let lookup = key.key_of(&row.event);
                let value = by_key
                    .get(&lookup)
                    .copied()
                    .ok_or_else(|| FeatureError::UnmatchedRow {
                        stage,
                        row_index: row.row_index,
                    })?;
                apply(&mut row.features, value);
            }
        }
        JoinStrategy::RowIndex => {
            let mut by_position: Vec<Option<T>> = vec![None; frame.len()];
            for (position, value) in scanned {
                by_position[position] = Some(value);
            }
            for (row, value) in frame.rows_mut().iter_mut().zip(by_position) {
                let value = value.ok_or(FeatureError::UnmatchedRow {
                    stage,
                    row_index: row.row_index,
                })?;
                apply(&mut row.features, value);
            }
        }
    }
    Ok(())
}
