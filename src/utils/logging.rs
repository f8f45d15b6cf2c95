use env_logger::{Builder, Target};
use log::{info, LevelFilter};

const LOG_ERROR_LEVEL_MOD: &[&str] = &[
    "reqwest::async_impl::client",
    "reqwest::connect",
    "hyper_util::client",
];

fn parse_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

/// Initializes stdout logging. The level spec comes from the CLI argument,
/// then `EPG_VIEWER_LOG`, default `info`; `module=level` pairs separated by
/// commas scope the filter per module.
pub fn init_logger(user_log_level: Option<&String>) {
    let level_spec = user_log_level
        .cloned()
        .or_else(|| std::env::var("EPG_VIEWER_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    let mut log_builder = Builder::from_default_env();
    log_builder.target(Target::Stdout);

    for part in level_spec.split(',') {
        match part.split_once('=') {
            Some((module, level)) => {
                log_builder.filter_module(module.trim(), parse_level(level));
            }
            None => {
                log_builder.filter_level(parse_level(part));
            }
        }
    }
    for module in LOG_ERROR_LEVEL_MOD {
        log_builder.filter_module(module, LevelFilter::Error);
    }
    log_builder.init();
    info!("Log level {level_spec}");
}
