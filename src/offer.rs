//! Offer event data model: raw tables, typed rows and the working frame.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_time::{format_event_timestamp, parse_event_timestamp, TimeParts};
use crate::features::FeatureError;
use crate::geo::LatLon;

pub const ORDER_ID: &str = "order_id";
pub const DRIVER_ID: &str = "driver_id";
pub const EVENT_TIMESTAMP: &str = "event_timestamp";
pub const PARTICIPANT_STATUS: &str = "participant_status";
pub const IS_COMPLETED: &str = "is_completed";
pub const DRIVER_LATITUDE: &str = "driver_latitude";
pub const DRIVER_LONGITUDE: &str = "driver_longitude";
pub const PICKUP_LATITUDE: &str = "pickup_latitude";
pub const PICKUP_LONGITUDE: &str = "pickup_longitude";
pub const TRIP_DISTANCE: &str = "trip_distance";

pub const REQUIRED_COLUMNS: [&str; 10] = [
    ORDER_ID,
    DRIVER_ID,
    EVENT_TIMESTAMP,
    PARTICIPANT_STATUS,
    IS_COMPLETED,
    DRIVER_LATITUDE,
    DRIVER_LONGITUDE,
    PICKUP_LATITUDE,
    PICKUP_LONGITUDE,
    TRIP_DISTANCE,
];

/// Plain string table exchanged with dataset stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    /// All cells of a named column, `None` when the column is absent.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).map(String::as_str).unwrap_or_default())
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DerivedColumn {
    DriverDistance,
    EventHour,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    IsPeakHour,
    ActualIdleTimeMinutes,
    PickupToTripRatio,
    TotalCommitmentDistance,
    HistoricalBookings,
    PeakDistancePenalty,
}

impl DerivedColumn {
    pub const ALL: [DerivedColumn; 13] = [
        Self::DriverDistance,
        Self::EventHour,
        Self::Year,
        Self::Month,
        Self::Day,
        Self::Hour,
        Self::Minute,
        Self::IsPeakHour,
        Self::ActualIdleTimeMinutes,
        Self::PickupToTripRatio,
        Self::TotalCommitmentDistance,
        Self::HistoricalBookings,
        Self::PeakDistancePenalty,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DriverDistance => "driver_distance",
            Self::EventHour => "event_hour",
            Self::Year => "year",
            Self::Month => "month",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::IsPeakHour => "is_peak_hour",
            Self::ActualIdleTimeMinutes => "actual_idle_time_minutes",
            Self::PickupToTripRatio => "pickup_to_trip_ratio",
            Self::TotalCommitmentDistance => "total_commitment_distance",
            Self::HistoricalBookings => "historical_bookings",
            Self::PeakDistancePenalty => "peak_distance_penalty",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|column| column.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferEvent {
    pub order_id: String,
    pub driver_id: String,
    pub event_timestamp: String,
    pub participant_status: String,
    pub is_completed: bool,
    pub driver: LatLon,
    pub pickup: LatLon,
    pub trip_distance: Option<f64>,
}

impl OfferEvent {
    pub fn is_accepted(&self) -> bool {
        self.participant_status.trim().to_lowercase() == "accepted"
    }
}

/// Derived values for one row. Whether a field is meaningful is tracked by
/// [`OfferFrame::has_column`], not by the value itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferFeatures {
    pub driver_distance: f64,
    pub event_hour: Option<u32>,
    pub time_parts: Option<TimeParts>,
    pub is_peak_hour: bool,
    pub actual_idle_time_minutes: f64,
    pub pickup_to_trip_ratio: f64,
    pub total_commitment_distance: f64,
    pub historical_bookings: f64,
    pub peak_distance_penalty: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfferRow {
    /// Position of the row in the source table.
    pub row_index: usize,
    pub event: OfferEvent,
    pub event_ts: Option<DateTime<Utc>>,
    pub features: OfferFeatures,
    raw: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfferFrame {
    source_headers: Vec<String>,
    rows: Vec<OfferRow>,
    computed: BTreeSet<DerivedColumn>,
}

impl OfferFrame {
    /// Validates the schema and parses every record. Cell-level problems are
    /// recovered (NaN coordinates, absent trip distance, null timestamps);
    /// missing columns and ragged rows are fatal.
    pub fn from_table(table: &Table) -> Result<Self, FeatureError> {
        let mut indices = [0usize; REQUIRED_COLUMNS.len()];
        for (slot, name) in indices.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = table
                .column_index(name)
                .ok_or_else(|| FeatureError::MissingColumn(name.to_string()))?;
        }
        let [order_id, driver_id, event_timestamp, participant_status, is_completed, driver_lat, driver_lon, pickup_lat, pickup_lon, trip_distance] =
            indices;

        let mut rows = Vec::with_capacity(table.len());
        for (row_index, record) in table.rows.iter().enumerate() {
            if record.len() != table.headers.len() {
                return Err(FeatureError::RaggedRow {
                    row_index,
                    found: record.len(),
                    expected: table.headers.len(),
                });
            }

            let event = OfferEvent {
                order_id: record[order_id].trim().to_string(),
                driver_id: record[driver_id].trim().to_string(),
                event_timestamp: record[event_timestamp].clone(),
                participant_status: record[participant_status].clone(),
                is_completed: parse_flag(&record[is_completed]),
                driver: LatLon::new(
                    parse_coordinate(&record[driver_lat]),
                    parse_coordinate(&record[driver_lon]),
                ),
                pickup: LatLon::new(
                    parse_coordinate(&record[pickup_lat]),
                    parse_coordinate(&record[pickup_lon]),
                ),
                trip_distance: parse_optional_f64(&record[trip_distance]),
            };

            rows.push(OfferRow {
                row_index,
                event_ts: parse_event_timestamp(&event.event_timestamp),
                event,
                features: OfferFeatures::default(),
                raw: record.clone(),
            });
        }

        Ok(Self {
            source_headers: table.headers.clone(),
            rows,
            computed: BTreeSet::new(),
        })
    }

    /// Renders source columns plus every computed derived column. Source
    /// columns that share a derived name are replaced, not duplicated.
    pub fn to_table(&self) -> Table {
        let kept: Vec<usize> = self
            .source_headers
            .iter()
            .enumerate()
            .filter(|(_, name)| DerivedColumn::from_name(name).is_none())
            .map(|(idx, _)| idx)
            .collect();
        let ts_idx = self
            .source_headers
            .iter()
            .position(|name| name == EVENT_TIMESTAMP);
        let derived: Vec<DerivedColumn> = DerivedColumn::ALL
            .into_iter()
            .filter(|column| self.computed.contains(column))
            .collect();

        let mut headers: Vec<String> = kept
            .iter()
            .map(|idx| self.source_headers[*idx].clone())
            .collect();
        headers.extend(derived.iter().map(|column| column.as_str().to_string()));

        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut out = Vec::with_capacity(headers.len());
                for idx in &kept {
                    if Some(*idx) == ts_idx {
                        out.push(format_event_timestamp(row.event_ts.as_ref()));
                    } else {
                        out.push(row.raw[*idx].clone());
                    }
                }
                for column in &derived {
                    out.push(render_derived(&row.features, *column));
                }
                out
            })
            .collect();

        Table::new(headers, rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[OfferRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [OfferRow] {
        &mut self.rows
    }

    pub fn has_column(&self, column: DerivedColumn) -> bool {
        self.computed.contains(&column)
    }

    pub fn mark_computed(&mut self, columns: &[DerivedColumn]) {
        self.computed.extend(columns.iter().copied());
    }

    pub fn null_timestamp_count(&self) -> usize {
        self.rows.iter().filter(|row| row.event_ts.is_none()).count()
    }

    pub fn distinct_drivers(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.event.driver_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Re-derives every `event_ts` from the raw text and returns how many
    /// rows did not parse.
    pub fn normalize_timestamps(&mut self) -> usize {
        let mut unparsable = 0;
        for row in &mut self.rows {
            row.event_ts = parse_event_timestamp(&row.event.event_timestamp);
            if row.event_ts.is_none() {
                unparsable += 1;
            }
        }
        unparsable
    }
}

fn render_derived(features: &OfferFeatures, column: DerivedColumn) -> String {
    let parts = features.time_parts.as_ref();
    match column {
        DerivedColumn::DriverDistance => render_f64(features.driver_distance),
        DerivedColumn::EventHour => render_opt(features.event_hour),
        DerivedColumn::Year => render_opt(parts.map(|p| p.year)),
        DerivedColumn::Month => render_opt(parts.map(|p| p.month)),
        DerivedColumn::Day => render_opt(parts.map(|p| p.day)),
        DerivedColumn::Hour => render_opt(parts.map(|p| p.hour)),
        DerivedColumn::Minute => render_opt(parts.map(|p| p.minute)),
        DerivedColumn::IsPeakHour => u8::from(features.is_peak_hour).to_string(),
        DerivedColumn::ActualIdleTimeMinutes => render_f64(features.actual_idle_time_minutes),
        DerivedColumn::PickupToTripRatio => render_f64(features.pickup_to_trip_ratio),
        DerivedColumn::TotalCommitmentDistance => render_f64(features.total_commitment_distance),
        DerivedColumn::HistoricalBookings => render_f64(features.historical_bookings),
        DerivedColumn::PeakDistancePenalty => render_f64(features.peak_distance_penalty),
    }
}

fn render_f64(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

fn render_opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_coordinate(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(f64::NAN)
}

fn parse_optional_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
}

fn parse_flag(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return true;
    }
    trimmed.parse::<f64>().map(|v| v == 1.0).unwrap_or(false)
}
