use offer_features::{
    build_config_from_env, init_logging, log_app_start, log_build_config,
    logging_config_from_env, run_feature_build,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let cfg = build_config_from_env()?;
    log_build_config(&cfg);

    let store = cfg.open_store();
    let report = run_feature_build(store.as_ref(), &cfg)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
