use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use offer_features::{
    log_app_start, log_build_config, run_feature_build, transform_offers, BuildConfig,
    FeatureConfig, InMemoryStore, LoggingConfig, OfferFrame, StoreKind, Table, REQUIRED_COLUMNS,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn offers_table(timestamps: &[&str]) -> Table {
    let headers = REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect();
    let rows = timestamps
        .iter()
        .enumerate()
        .map(|(idx, ts)| {
            vec![
                format!("order-{idx}"),
                "driver-1".to_string(),
                ts.to_string(),
                if idx % 2 == 0 { "accepted" } else { "rejected" }.to_string(),
                "1".to_string(),
                "-1.2921".to_string(),
                "36.8219".to_string(),
                "-1.3000".to_string(),
                "36.8000".to_string(),
                "4.5".to_string(),
            ]
        })
        .collect();
    Table::new(headers, rows)
}

#[test]
fn transform_logs_start_finish_and_stage_events() {
    let table = offers_table(&["2024-01-01 08:00:00", "2024-01-01 09:00:00"]);
    let logs = capture_logs(Level::DEBUG, || {
        let frame = OfferFrame::from_table(&table).expect("frame parses");
        transform_offers(frame, &FeatureConfig::default()).expect("transform succeeds");
    });

    assert!(logs.contains("\"event\":\"features.transform.start\""));
    assert!(logs.contains("\"event\":\"features.stage.finish\""));
    assert!(logs.contains("\"stage\":\"historical_acceptance\""));
    assert!(logs.contains("\"event\":\"features.transform.finish\""));
    assert!(!logs.contains("features.timestamp.unparsable"));
}

#[test]
fn transform_warns_once_about_unparsable_timestamps() {
    let table = offers_table(&["not a time", "2024-01-01 09:00:00", "also bad"]);
    let logs = capture_logs(Level::INFO, || {
        let frame = OfferFrame::from_table(&table).expect("frame parses");
        transform_offers(frame, &FeatureConfig::default()).expect("transform succeeds");
    });

    assert_eq!(logs.matches("features.timestamp.unparsable").count(), 1);
    assert!(logs.contains("\"unparsable_rows\":2"));
    assert!(logs.contains("\"level\":\"WARN\""));
}

#[test]
fn build_runner_logs_success_and_failure() {
    let ok_store = InMemoryStore::with_dataset(
        "dataset",
        offers_table(&["2024-01-01 08:00:00", "2024-01-01 09:00:00"]),
    );
    let ok_logs = capture_logs(Level::INFO, || {
        run_feature_build(&ok_store, &BuildConfig::default()).expect("build succeeds");
    });
    assert!(ok_logs.contains("\"event\":\"build.start\""));
    assert!(ok_logs.contains("\"event\":\"build.finish\""));
    assert!(ok_logs.contains("\"schema_fingerprint\""));

    let empty_store = InMemoryStore::new();
    let err_logs = capture_logs(Level::INFO, || {
        run_feature_build(&empty_store, &BuildConfig::default())
            .expect_err("missing input dataset should fail");
    });
    assert!(err_logs.contains("\"event\":\"build.error\""));
    assert!(err_logs.contains("dataset not found: dataset"));
}

#[test]
fn startup_helpers_report_resolved_settings() {
    let cfg = BuildConfig {
        store_kind: StoreKind::Sqlite,
        store_path: PathBuf::from("/tmp/offers.sqlite"),
        ..BuildConfig::default()
    };
    let logs = capture_logs(Level::INFO, || {
        log_app_start(&LoggingConfig::default());
        log_build_config(&cfg);
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"component\":\"build_features\""));
    assert!(logs.contains("\"log_format\":\"pretty\""));
    assert!(logs.contains("\"event\":\"build.config\""));
    assert!(logs.contains("\"store_kind\":\"sqlite\""));
    assert!(logs.contains("\"join_strategy\":\"row_index\""));
    assert!(logs.contains("\"acceptance_prior\":\"dataset_mean\""));
    assert!(logs.contains("\"output_dataset\":\"transformed_dataset\""));
}
