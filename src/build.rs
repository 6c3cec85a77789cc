//! Load → transform → persist for one batch of offer events.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::env_vars::non_empty_var;
use crate::features::{
    build_feature_schema, transform_offers, FeatureConfig, FeatureError, FeatureTransformReport,
};
use crate::join::JoinStrategy;
use crate::offer::OfferFrame;
use crate::store::{CsvDirStore, DatasetStore, SqliteStore, StoreError};

pub const DEFAULT_INPUT_DATASET: &str = "dataset";
pub const DEFAULT_OUTPUT_DATASET: &str = "transformed_dataset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKind {
    Csv,
    Sqlite,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub store_kind: StoreKind,
    pub store_path: PathBuf,
    pub input_dataset: String,
    pub output_dataset: String,
    pub features: FeatureConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            store_kind: StoreKind::Csv,
            store_path: PathBuf::from("data/processed"),
            input_dataset: DEFAULT_INPUT_DATASET.to_string(),
            output_dataset: DEFAULT_OUTPUT_DATASET.to_string(),
            features: FeatureConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn open_store(&self) -> Box<dyn DatasetStore> {
        match self.store_kind {
            StoreKind::Csv => Box::new(CsvDirStore::new(self.store_path.clone())),
            StoreKind::Sqlite => Box::new(SqliteStore::new(self.store_path.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_dataset: String,
    pub output_dataset: String,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub transform: FeatureTransformReport,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid build config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

/// Reads `OFFER_*` variables over the defaults. Unset or blank variables keep
/// the default; unrecognized enum spellings are rejected.
pub fn build_config_from_env() -> Result<BuildConfig, BuildError> {
    let mut config = BuildConfig::default();

    if let Some(kind) = non_empty_var("OFFER_STORE_KIND") {
        config.store_kind = match kind.to_ascii_lowercase().as_str() {
            "csv" => StoreKind::Csv,
            "sqlite" => StoreKind::Sqlite,
            other => {
                return Err(BuildError::InvalidConfig(format!(
                    "OFFER_STORE_KIND must be csv or sqlite, got {other}"
                )))
            }
        };
    }

    if let Some(path) = non_empty_var("OFFER_STORE_PATH") {
        config.store_path = PathBuf::from(path);
    }

    if let Some(name) = non_empty_var("OFFER_INPUT_DATASET") {
        config.input_dataset = name;
    }

    if let Some(name) = non_empty_var("OFFER_OUTPUT_DATASET") {
        config.output_dataset = name;
    }

    if let Some(raw) = non_empty_var("OFFER_JOIN_STRATEGY") {
        config.features.join_strategy = JoinStrategy::parse(&raw).ok_or_else(|| {
            BuildError::InvalidConfig(format!(
                "OFFER_JOIN_STRATEGY must be unique_key or row_index, got {raw}"
            ))
        })?;
    }

    Ok(config)
}

/// Runs the full pipeline. The output dataset is written only after every
/// stage has succeeded.
pub fn run_feature_build(
    store: &dyn DatasetStore,
    cfg: &BuildConfig,
) -> Result<FeatureBuildReport, BuildError> {
    if cfg.input_dataset == cfg.output_dataset {
        return Err(BuildError::InvalidConfig(
            "input and output dataset names must differ".to_string(),
        ));
    }

    info!(
        component = "build",
        event = "build.start",
        input_dataset = %cfg.input_dataset,
        output_dataset = %cfg.output_dataset
    );

    let result = transform_dataset(store, cfg);
    match &result {
        Ok(report) => info!(
            component = "build",
            event = "build.finish",
            rows = report.transform.output_rows,
            schema_fingerprint = %report.schema_fingerprint
        ),
        Err(err) => error!(
            component = "build",
            event = "build.error",
            error = %err
        ),
    }
    result
}

fn transform_dataset(
    store: &dyn DatasetStore,
    cfg: &BuildConfig,
) -> Result<FeatureBuildReport, BuildError> {
    let input = store.get(&cfg.input_dataset)?;
    let frame = OfferFrame::from_table(&input)?;
    let (transformed, transform) = transform_offers(frame, &cfg.features)?;
    let schema = build_feature_schema(&cfg.features);

    store.put(&cfg.output_dataset, &transformed.to_table())?;

    Ok(FeatureBuildReport {
        input_dataset: cfg.input_dataset.clone(),
        output_dataset: cfg.output_dataset.clone(),
        schema_version: schema.version,
        schema_fingerprint: schema.fingerprint,
        transform,
    })
}
