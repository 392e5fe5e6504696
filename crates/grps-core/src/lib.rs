//! Serving runtime core for grps: configuration, wire messages, the tensor
//! bridge, inferer/converter contracts, per-request context, dynamic batching,
//! the sequential pipeline executor and the in-process metrics aggregator.
//!
//! The HTTP/gRPC surfaces live in `grps-server`; this crate is transport
//! agnostic.

pub mod batcher;
pub mod context;
pub mod conf;
pub mod converter;
pub mod dag;
pub mod error;
pub mod executor;
pub mod message;
pub mod model_infer;
pub mod monitor;
pub mod tensor;

/// Server version, dumped into the `VERSION` file at bootstrap.
pub const GRPS_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Root path shared by every HTTP endpoint.
pub const URL_ROOT_PATH: &str = "/grps/v1";

/// Fixed relative configuration paths.
pub const INFERENCE_CONF_PATH: &str = "conf/inference.yml";
pub const SERVER_CONF_PATH: &str = "conf/server.yml";

/// Log file names under the configured log directory.
pub const SERVER_LOG_NAME: &str = "grps_server.log";
pub const USR_LOG_NAME: &str = "grps_usr.log";
pub const MONITOR_LOG_NAME: &str = "grps_monitor.log";

pub const MIB: u64 = 1024 * 1024;

// Built-in metric names.
pub const QPS: &str = "*qps";
pub const REQ_FAIL_RATE: &str = "*fail_rate(%)";
pub const REQ_LATENCY_AVG: &str = "*latency_avg(ms)";
pub const REQ_LATENCY_MAX: &str = "*latency_max(ms)";
pub const REQ_LATENCY_CDF: &str = "*latency_cdf(ms)";
pub const GPU_OOM_COUNT: &str = "*gpu_oom_count";
pub const CPU_USAGE_AVG: &str = "*cpu_usage(%)";
pub const MEM_USAGE_AVG: &str = "*mem_usage(%)";

/// Log an event from user-authored inferer/converter code. Events with the
/// `usr` target are routed to `grps_usr.log` instead of `grps_server.log`.
#[macro_export]
macro_rules! usr_info {
    ($($arg:tt)*) => { tracing::info!(target: "usr", $($arg)*) };
}

#[macro_export]
macro_rules! usr_warn {
    ($($arg:tt)*) => { tracing::warn!(target: "usr", $($arg)*) };
}

#[macro_export]
macro_rules! usr_error {
    ($($arg:tt)*) => { tracing::error!(target: "usr", $($arg)*) };
}
