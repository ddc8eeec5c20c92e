use std::{env, io::Stderr};
use tracing_subscriber::{fmt::Layer, prelude::*, EnvFilter};

/// Initializes a new tracing configuration.
///
/// - `rust_log`: Used to set the RUST_LOG environment variable if it is not provided. You can set the default log level (e.g. `warn`),
///   but you can also configure module-specific log levels using comma-separated entries formatted like `path::to::module=log_level`, e.g.
///   `warn,hshstack::consul=debug`
///
/// Logs are written to stderr so that command output piped from stdout stays clean.
/// Setting `JSON_LOGS` switches to one JSON object per event.
pub fn init_tracing(rust_log: &str) {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", rust_log);
    }

    let json_logs = env::var_os("JSON_LOGS").is_some();

    // Conditionally output logs as JSON
    if json_logs {
        let layer = Layer::new()
            .with_writer(std::io::stderr as fn() -> Stderr)
            .with_target(true)
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .with_filter(EnvFilter::from_default_env());

        tracing_subscriber::registry().with(layer).init();
    } else {
        let layer = Layer::new()
            .with_writer(std::io::stderr as fn() -> Stderr)
            .with_target(true)
            .with_filter(EnvFilter::from_default_env());

        tracing_subscriber::registry().with(layer).init();
    }
}

/// Logs the final state of a long running external step, such as a playbook run.
pub fn log_step_result<T, E>(step_name: &str, result: &Result<T, E>)
where
    E: std::fmt::Display,
{
    match result {
        Ok(_) => tracing::info!("Step '{}' completed successfully", step_name),
        Err(e) => tracing::error!("Failure in '{}' step: {}", step_name, e),
    }
}
