//! Logging setup for `build_features` and the run-level events emitted before
//! the pipeline starts.

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::build::BuildConfig;
use crate::env_vars::{non_empty_var, parse_bool};
use crate::features::AcceptancePrior;

const LOG_FILTER_VAR: &str = "OFFER_LOG_LEVEL";
const LOG_FORMAT_VAR: &str = "OFFER_LOG_FORMAT";
const LOG_TARGET_VAR: &str = "OFFER_LOG_TARGET";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    #[default]
    Pretty,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string, e.g. `info` or `offer_features=debug`.
    pub filter: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::default(),
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("invalid OFFER_LOG_LEVEL filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Unknown format or target spellings keep the default. The filter string is
/// only checked by [`init_logging`].
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        filter: non_empty_var(LOG_FILTER_VAR).unwrap_or(defaults.filter),
        format: non_empty_var(LOG_FORMAT_VAR)
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or(defaults.format),
        include_target: non_empty_var(LOG_TARGET_VAR)
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(defaults.include_target),
    }
}

/// Installs the global subscriber. A filter that does not parse is an error
/// rather than a silent fallback, so a typo in `OFFER_LOG_LEVEL` stops the run.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let filter = parse_filter(&config.filter)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }
    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = "build_features",
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_filter = %config.filter,
        log_format = config.format.as_str(),
        include_target = config.include_target
    );
}

/// Records the fully resolved build settings, defaults included.
pub fn log_build_config(cfg: &BuildConfig) {
    info!(
        component = "build_features",
        event = "build.config",
        store_kind = cfg.store_kind.as_str(),
        store_path = %cfg.store_path.display(),
        input_dataset = %cfg.input_dataset,
        output_dataset = %cfg.output_dataset,
        join_strategy = cfg.features.join_strategy.as_str(),
        acceptance_prior = %describe_prior(cfg.features.acceptance_prior),
        schema_version = cfg.features.schema_version
    );
}

fn parse_filter(directives: &str) -> Result<EnvFilter, LoggingInitError> {
    EnvFilter::try_new(directives).map_err(|err| LoggingInitError::InvalidFilter {
        filter: directives.to_string(),
        reason: err.to_string(),
    })
}

fn describe_prior(prior: AcceptancePrior) -> String {
    match prior {
        AcceptancePrior::DatasetMean => "dataset_mean".to_string(),
        AcceptancePrior::Fixed(value) => format!("fixed:{value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_vars::testing::with_env_vars;

    #[test]
    fn unset_env_gives_defaults() {
        let cfg = with_env_vars(
            &[
                (LOG_FILTER_VAR, None),
                (LOG_FORMAT_VAR, None),
                (LOG_TARGET_VAR, None),
            ],
            logging_config_from_env,
        );
        assert_eq!(cfg, LoggingConfig::default());
        assert_eq!(cfg.format, LogFormat::Pretty);
    }

    #[test]
    fn env_overrides_filter_format_and_target() {
        let cfg = with_env_vars(
            &[
                (LOG_FILTER_VAR, Some(" offer_features=debug ")),
                (LOG_FORMAT_VAR, Some("JSON")),
                (LOG_TARGET_VAR, Some("off")),
            ],
            logging_config_from_env,
        );
        assert_eq!(cfg.filter, "offer_features=debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn unknown_format_and_target_keep_defaults() {
        let cfg = with_env_vars(
            &[
                (LOG_FILTER_VAR, Some("   ")),
                (LOG_FORMAT_VAR, Some("yaml")),
                (LOG_TARGET_VAR, Some("maybe")),
            ],
            logging_config_from_env,
        );
        assert_eq!(cfg, LoggingConfig::default());
    }

    #[test]
    fn malformed_filter_is_rejected_before_install() {
        let cfg = LoggingConfig {
            filter: "offer_features=loud".to_string(),
            ..LoggingConfig::default()
        };
        let err = init_logging(&cfg).expect_err("bad level directive");
        match err {
            LoggingInitError::InvalidFilter { filter, .. } => {
                assert_eq!(filter, "offer_features=loud");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse_filter("offer_features=debug,warn").is_ok());
    }

    #[test]
    fn prior_descriptions_are_stable() {
        assert_eq!(describe_prior(AcceptancePrior::DatasetMean), "dataset_mean");
        assert_eq!(describe_prior(AcceptancePrior::Fixed(0.25)), "fixed:0.25");
    }

    #[test]
    fn format_names_round_trip() {
        for format in [LogFormat::Json, LogFormat::Pretty] {
            assert_eq!(LogFormat::parse(format.as_str()), Some(format));
        }
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Pretty));
    }
}
