//! Leakage-safe feature engineering for ride-hailing driver offers.
//!
//! Current implemented scope:
//! - offer table model and tolerant timestamp/coordinate parsing
//! - fixed feature pipeline (distance, time, idle time, ratios, point-in-time
//!   acceptance, peak interaction) with key-preserving merges
//! - CSV/SQLite dataset stores and the batch build runner
//! - classifier boundary with logistic regression, F1 and ROC-AUC

mod build;
mod classifier;
mod env_vars;
mod event_time;
mod features;
mod geo;
mod join;
mod observability;
mod offer;
mod store;

pub use build::{
    build_config_from_env, run_feature_build, BuildConfig, BuildError, FeatureBuildReport,
    StoreKind, DEFAULT_INPUT_DATASET, DEFAULT_OUTPUT_DATASET,
};
pub use classifier::{
    f1_score, feature_matrix, roc_auc_score, target_labels, Classifier, ClassifierConfig,
    ClassifierError, Estimator, LogisticRegression, LogisticRegressionConfig, TableClassifier,
    DECISION_THRESHOLD, F1_SCORE, ROC_AUC,
};
pub use event_time::{
    format_event_timestamp, is_peak_hour, parse_event_timestamp, robust_hour_of_iso_date,
    time_parts, TimeParts, PEAK_HOURS_UTC,
};
pub use features::{
    add_driver_distance, add_event_hour, add_historical_acceptance, add_idle_time,
    add_peak_distance_penalty, add_profitability_ratios, add_time_parts,
    assert_schema_compatible, build_feature_schema, dataset_acceptance_mean, transform_offers,
    AcceptancePrior, FeatureColumn, FeatureConfig, FeatureDType, FeatureError, FeaturePipeline,
    FeatureSchema, FeatureTransformReport, Stage, StageContext, StageFn, FEATURE_SCHEMA_VERSION,
    RATIO_EPSILON,
};
pub use geo::{haversine_km, LatLon, EARTH_RADIUS_KM};
pub use join::{JoinKey, JoinStrategy};
pub use observability::{
    init_logging, log_app_start, log_build_config, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use offer::{
    DerivedColumn, OfferEvent, OfferFeatures, OfferFrame, OfferRow, Table, DRIVER_ID,
    DRIVER_LATITUDE, DRIVER_LONGITUDE, EVENT_TIMESTAMP, IS_COMPLETED, ORDER_ID,
    PARTICIPANT_STATUS, PICKUP_LATITUDE, PICKUP_LONGITUDE, REQUIRED_COLUMNS, TRIP_DISTANCE,
};
pub use store::{CsvDirStore, DatasetStore, InMemoryStore, SqliteStore, StoreError};
