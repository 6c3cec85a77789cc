//! Offer feature pipeline: per-record transforms, point-in-time driver
//! aggregates, and the ordered stage list that applies them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event_time::{is_peak_hour, robust_hour_of_iso_date, time_parts, PEAK_HOURS_UTC};
use crate::geo::haversine_km;
use crate::join::{driver_groups, driver_time_order, reattach, JoinKey, JoinStrategy};
use crate::offer::{DerivedColumn, OfferFrame};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Keeps `pickup_to_trip_ratio` finite when the trip distance is zero or absent.
pub const RATIO_EPSILON: f64 = 1e-6;

const HISTORICAL_STAGE: &str = "historical_acceptance";
const IDLE_STAGE: &str = "idle_time";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AcceptancePrior {
    /// Mean acceptance over the whole batch, computed once per run.
    DatasetMean,
    Fixed(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub join_strategy: JoinStrategy,
    pub acceptance_prior: AcceptancePrior,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            join_strategy: JoinStrategy::RowIndex,
            acceptance_prior: AcceptancePrior::DatasetMean,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
    I64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTransformReport {
    pub input_rows: u64,
    pub output_rows: u64,
    pub unparsable_timestamps: u64,
    pub distinct_drivers: u64,
    pub acceptance_prior: f64,
    pub stages: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("missing required column: {0}")]
    MissingColumn(String),
    #[error("row {row_index} has {found} cells, expected {expected}")]
    RaggedRow {
        row_index: usize,
        found: usize,
        expected: usize,
    },
    #[error("stage {stage} requires derived column {column} which has not been computed")]
    MissingDerivedColumn {
        stage: &'static str,
        column: &'static str,
    },
    #[error("stage {stage} cannot merge: join key {key} is not unique")]
    DuplicateJoinKey { stage: &'static str, key: String },
    #[error("stage {stage} produced no value for row {row_index}")]
    UnmatchedRow {
        stage: &'static str,
        row_index: usize,
    },
    #[error("stage {stage} broke row invariant: {details}")]
    RowInvariantViolated {
        stage: &'static str,
        details: String,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Run-wide inputs threaded into every stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageContext {
    pub join_strategy: JoinStrategy,
    pub acceptance_prior: f64,
}

pub type StageFn = fn(OfferFrame, &StageContext) -> Result<OfferFrame, FeatureError>;

#[derive(Clone, Copy)]
pub struct Stage {
    pub name: &'static str,
    pub apply: StageFn,
}

pub struct FeaturePipeline {
    stages: Vec<Stage>,
}

impl FeaturePipeline {
    /// The fixed production order. Later stages read columns written by
    /// earlier ones, so this order is part of the contract.
    pub fn standard() -> Self {
        Self {
            stages: vec![
                Stage {
                    name: "driver_distance",
                    apply: |frame, _| Ok(add_driver_distance(frame)),
                },
                Stage {
                    name: "event_hour",
                    apply: |frame, _| Ok(add_event_hour(frame)),
                },
                Stage {
                    name: "time_parts",
                    apply: |frame, _| Ok(add_time_parts(frame)),
                },
                Stage {
                    name: IDLE_STAGE,
                    apply: |frame, ctx| add_idle_time(frame, ctx.join_strategy),
                },
                Stage {
                    name: "profitability_ratios",
                    apply: |frame, _| add_profitability_ratios(frame),
                },
                Stage {
                    name: HISTORICAL_STAGE,
                    apply: |frame, ctx| {
                        add_historical_acceptance(frame, ctx.acceptance_prior, ctx.join_strategy)
                    },
                },
                Stage {
                    name: "peak_distance_penalty",
                    apply: |frame, _| add_peak_distance_penalty(frame),
                },
            ],
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name).collect()
    }

    pub fn run(
        &self,
        frame: OfferFrame,
        cfg: &FeatureConfig,
    ) -> Result<(OfferFrame, FeatureTransformReport), FeatureError> {
        validate_config(cfg)?;

        let input_rows = frame.len();
        // An empty frame never consumes the prior.
        let acceptance_prior = match cfg.acceptance_prior {
            AcceptancePrior::DatasetMean => dataset_acceptance_mean(&frame).unwrap_or(0.0),
            AcceptancePrior::Fixed(value) => value,
        };
        let ctx = StageContext {
            join_strategy: cfg.join_strategy,
            acceptance_prior,
        };

        info!(
            component = "features",
            event = "features.transform.start",
            input_rows,
            join_strategy = cfg.join_strategy.as_str(),
            acceptance_prior,
            stages = ?self.stage_names()
        );

        let unparsable = frame.null_timestamp_count();
        if unparsable > 0 {
            warn!(
                component = "features",
                event = "features.timestamp.unparsable",
                unparsable_rows = unparsable,
                input_rows
            );
        }

        let mut current = frame;
        for stage in &self.stages {
            current = (stage.apply)(current, &ctx)?;
            check_row_invariants(stage.name, input_rows, &current)?;
            debug!(
                component = "features",
                event = "features.stage.finish",
                stage = stage.name,
                rows = current.len()
            );
        }

        let report = FeatureTransformReport {
            input_rows: input_rows as u64,
            output_rows: current.len() as u64,
            unparsable_timestamps: current.null_timestamp_count() as u64,
            distinct_drivers: current.distinct_drivers() as u64,
            acceptance_prior,
            stages: self
                .stage_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        info!(
            component = "features",
            event = "features.transform.finish",
            input_rows = report.input_rows,
            output_rows = report.output_rows,
            distinct_drivers = report.distinct_drivers,
            unparsable_timestamps = report.unparsable_timestamps
        );

        Ok((current, report))
    }
}

pub fn transform_offers(
    frame: OfferFrame,
    cfg: &FeatureConfig,
) -> Result<(OfferFrame, FeatureTransformReport), FeatureError> {
    FeaturePipeline::standard().run(frame, cfg)
}

/// Share of all offers in the frame that were accepted, `None` when empty.
pub fn dataset_acceptance_mean(frame: &OfferFrame) -> Option<f64> {
    if frame.is_empty() {
        return None;
    }
    let accepted = frame
        .rows()
        .iter()
        .filter(|row| row.event.is_accepted())
        .count();
    Some(accepted as f64 / frame.len() as f64)
}

pub fn add_driver_distance(mut frame: OfferFrame) -> OfferFrame {
    for row in frame.rows_mut() {
        row.features.driver_distance = haversine_km(row.event.driver, row.event.pickup);
    }
    frame.mark_computed(&[DerivedColumn::DriverDistance]);
    frame
}

pub fn add_event_hour(mut frame: OfferFrame) -> OfferFrame {
    for row in frame.rows_mut() {
        row.features.event_hour = robust_hour_of_iso_date(&row.event.event_timestamp);
    }
    frame.mark_computed(&[DerivedColumn::EventHour]);
    frame
}

/// Decomposed timestamp parts plus the peak-hour flag.
pub fn add_time_parts(mut frame: OfferFrame) -> OfferFrame {
    frame.normalize_timestamps();
    for row in frame.rows_mut() {
        let parts = row.event_ts.as_ref().map(time_parts);
        row.features.is_peak_hour = is_peak_hour(parts.map(|p| p.hour));
        row.features.time_parts = parts;
    }
    frame.mark_computed(&[
        DerivedColumn::Year,
        DerivedColumn::Month,
        DerivedColumn::Day,
        DerivedColumn::Hour,
        DerivedColumn::Minute,
        DerivedColumn::IsPeakHour,
    ]);
    frame
}

/// Minutes since the driver's last completion strictly before each offer.
///
/// Within a driver's time-ordered offers the completion timestamp is
/// forward-filled and then shifted by one, so an offer never sees its own
/// completion. Offers with no earlier completion, or without a timestamp,
/// get 0.
pub fn add_idle_time(
    mut frame: OfferFrame,
    strategy: JoinStrategy,
) -> Result<OfferFrame, FeatureError> {
    frame.normalize_timestamps();
    let order = driver_time_order(&frame);
    let mut scanned = Vec::with_capacity(frame.len());

    for group in driver_groups(&frame, &order) {
        let mut last_completed: Option<DateTime<Utc>> = None;
        for &position in group {
            let row = &frame.rows()[position];
            let idle_minutes = match (row.event_ts, last_completed) {
                (Some(now), Some(last)) => (now - last).num_milliseconds() as f64 / 60_000.0,
                _ => 0.0,
            };
            scanned.push((position, idle_minutes));
            if row.event.is_completed && row.event_ts.is_some() {
                last_completed = row.event_ts;
            }
        }
    }

    reattach(
        &mut frame,
        IDLE_STAGE,
        JoinKey::Order,
        strategy,
        scanned,
        |features, value| features.actual_idle_time_minutes = value,
    )?;
    frame.mark_computed(&[DerivedColumn::ActualIdleTimeMinutes]);
    Ok(frame)
}

pub fn add_profitability_ratios(mut frame: OfferFrame) -> Result<OfferFrame, FeatureError> {
    require_column(&frame, "profitability_ratios", DerivedColumn::DriverDistance)?;
    for row in frame.rows_mut() {
        let trip = row.event.trip_distance.unwrap_or(0.0);
        let distance = row.features.driver_distance;
        row.features.pickup_to_trip_ratio = distance / (trip + RATIO_EPSILON);
        row.features.total_commitment_distance = distance + trip;
    }
    frame.mark_computed(&[
        DerivedColumn::PickupToTripRatio,
        DerivedColumn::TotalCommitmentDistance,
    ]);
    Ok(frame)
}

/// Point-in-time acceptance rate per driver.
///
/// The value for a driver's n-th offer is accepted/offered over offers
/// 1..n-1 in time order. A first offer has no history and takes `prior`.
pub fn add_historical_acceptance(
    mut frame: OfferFrame,
    prior: f64,
    strategy: JoinStrategy,
) -> Result<OfferFrame, FeatureError> {
    frame.normalize_timestamps();
    let order = driver_time_order(&frame);
    let mut scanned = Vec::with_capacity(frame.len());

    for group in driver_groups(&frame, &order) {
        let mut accepted = 0u64;
        let mut offered = 0u64;
        for &position in group {
            let rate = if offered == 0 {
                prior
            } else {
                accepted as f64 / offered as f64
            };
            scanned.push((position, rate));

            offered += 1;
            if frame.rows()[position].event.is_accepted() {
                accepted += 1;
            }
        }
    }

    reattach(
        &mut frame,
        HISTORICAL_STAGE,
        JoinKey::OrderDriver,
        strategy,
        scanned,
        |features, value| features.historical_bookings = value,
    )?;
    frame.mark_computed(&[DerivedColumn::HistoricalBookings]);
    Ok(frame)
}

pub fn add_peak_distance_penalty(mut frame: OfferFrame) -> Result<OfferFrame, FeatureError> {
    require_column(&frame, "peak_distance_penalty", DerivedColumn::DriverDistance)?;
    require_column(&frame, "peak_distance_penalty", DerivedColumn::IsPeakHour)?;
    for row in frame.rows_mut() {
        let peak = if row.features.is_peak_hour { 1.0 } else { 0.0 };
        row.features.peak_distance_penalty = row.features.driver_distance * peak;
    }
    frame.mark_computed(&[DerivedColumn::PeakDistancePenalty]);
    Ok(frame)
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let columns: Vec<FeatureColumn> = DerivedColumn::ALL
        .into_iter()
        .map(|column| FeatureColumn {
            name: column.as_str().to_string(),
            dtype: match column {
                DerivedColumn::EventHour
                | DerivedColumn::Year
                | DerivedColumn::Month
                | DerivedColumn::Day
                | DerivedColumn::Hour
                | DerivedColumn::Minute
                | DerivedColumn::IsPeakHour => FeatureDType::I64,
                _ => FeatureDType::F64,
            },
        })
        .collect();

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        column_count = columns.len(),
        fingerprint = %fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn validate_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    if let AcceptancePrior::Fixed(value) = cfg.acceptance_prior {
        if !(0.0..=1.0).contains(&value) {
            return Err(FeatureError::InvalidConfig(format!(
                "fixed acceptance prior must be within [0, 1], got {value}"
            )));
        }
    }

    Ok(())
}

fn require_column(
    frame: &OfferFrame,
    stage: &'static str,
    column: DerivedColumn,
) -> Result<(), FeatureError> {
    if frame.has_column(column) {
        Ok(())
    } else {
        Err(FeatureError::MissingDerivedColumn {
            stage,
            column: column.as_str(),
        })
    }
}

fn check_row_invariants(
    stage: &'static str,
    expected_rows: usize,
    frame: &OfferFrame,
) -> Result<(), FeatureError> {
    if frame.len() != expected_rows {
        return Err(FeatureError::RowInvariantViolated {
            stage,
            details: format!("row count changed from {expected_rows} to {}", frame.len()),
        });
    }
    if let Some((position, row)) = frame
        .rows()
        .iter()
        .enumerate()
        .find(|(position, row)| row.row_index != *position)
    {
        return Err(FeatureError::RowInvariantViolated {
            stage,
            details: format!("row {} moved to position {position}", row.row_index),
        });
    }
    Ok(())
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("ratio_epsilon:{RATIO_EPSILON:e};"));
    hasher.update("peak_hours_utc:");
    for hour in PEAK_HOURS_UTC {
        hasher.update(format!("{hour},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        match column.dtype {
            FeatureDType::F64 => hasher.update(":f64;"),
            FeatureDType::I64 => hasher.update(":i64;"),
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::{Table, REQUIRED_COLUMNS};

    fn single_row_frame(ts: &str, trip_distance: &str) -> OfferFrame {
        let headers = REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect();
        let record = [
            "o1",
            "d1",
            ts,
            "accepted",
            "1",
            "0.0",
            "0.0",
            "0.0",
            "0.0",
            trip_distance,
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        OfferFrame::from_table(&Table::new(headers, vec![record])).expect("frame parses")
    }

    #[test]
    fn standard_pipeline_order_is_fixed() {
        assert_eq!(
            FeaturePipeline::standard().stage_names(),
            vec![
                "driver_distance",
                "event_hour",
                "time_parts",
                "idle_time",
                "profitability_ratios",
                "historical_acceptance",
                "peak_distance_penalty",
            ]
        );
    }

    #[test]
    fn interaction_requires_peak_flag() {
        let frame = add_driver_distance(single_row_frame("2024-01-01 08:00:00", ""));
        let err = add_peak_distance_penalty(frame).expect_err("peak flag missing");
        assert!(matches!(
            err,
            FeatureError::MissingDerivedColumn {
                column: "is_peak_hour",
                ..
            }
        ));
    }

    #[test]
    fn ratios_require_distance() {
        let err = add_profitability_ratios(single_row_frame("2024-01-01 08:00:00", "3"))
            .expect_err("distance missing");
        assert!(matches!(
            err,
            FeatureError::MissingDerivedColumn {
                column: "driver_distance",
                ..
            }
        ));
    }

    #[test]
    fn null_timestamp_row_survives_with_neutral_features() {
        let frame = single_row_frame("not-a-time", "");
        let (out, report) = transform_offers(frame, &FeatureConfig::default()).expect("runs");
        let features = &out.rows()[0].features;
        assert_eq!(features.event_hour, None);
        assert_eq!(features.time_parts, None);
        assert!(!features.is_peak_hour);
        assert_eq!(features.actual_idle_time_minutes, 0.0);
        assert_eq!(report.unparsable_timestamps, 1);
        assert_eq!(report.output_rows, 1);
    }

    #[test]
    fn fixed_prior_is_used_for_first_offer() {
        let cfg = FeatureConfig {
            acceptance_prior: AcceptancePrior::Fixed(0.25),
            ..FeatureConfig::default()
        };
        let (out, report) =
            transform_offers(single_row_frame("2024-01-01 08:00:00", ""), &cfg).expect("runs");
        assert_eq!(out.rows()[0].features.historical_bookings, 0.25);
        assert_eq!(report.acceptance_prior, 0.25);
    }

    #[test]
    fn config_validation_rejects_bad_prior_and_version() {
        let frame = single_row_frame("2024-01-01 08:00:00", "");
        let cfg = FeatureConfig {
            acceptance_prior: AcceptancePrior::Fixed(1.5),
            ..FeatureConfig::default()
        };
        assert!(matches!(
            transform_offers(frame.clone(), &cfg),
            Err(FeatureError::InvalidConfig(_))
        ));

        let cfg = FeatureConfig {
            schema_version: FEATURE_SCHEMA_VERSION + 1,
            ..FeatureConfig::default()
        };
        assert!(matches!(
            transform_offers(frame, &cfg),
            Err(FeatureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn schema_lists_every_derived_column_in_order() {
        let schema = build_feature_schema(&FeatureConfig::default());
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        let expected: Vec<&str> = DerivedColumn::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(names, expected);
        assert_eq!(schema.fingerprint.len(), 64);
    }
}
