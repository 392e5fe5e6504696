//! Two daily-rotated text logs with bounded backups.
//!
//! `grps_server.log` carries framework events; `grps_usr.log` carries events
//! from user-authored inferer/converter code, selected by the `usr` tracing
//! target (see the `usr_info!`/`usr_warn!`/`usr_error!` macros in
//! `grps-core`). Appends are non-blocking and thread-safe; each line carries
//! timestamp, thread id, source location and level.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use grps_core::conf::LogConf;
use grps_core::{SERVER_LOG_NAME, USR_LOG_NAME};

fn appender(log: &LogConf, name: &str) -> Result<RollingFileAppender> {
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name)
        .max_log_files(log.log_backup_count as usize)
        .build(&log.log_dir)?)
}

/// Install the process-wide logger. The returned guards flush the
/// non-blocking writers on drop; keep them alive for the process lifetime.
pub fn init(log: &LogConf) -> Result<Vec<WorkerGuard>> {
    let (server_writer, server_guard) = tracing_appender::non_blocking(appender(log, SERVER_LOG_NAME)?);
    let (usr_writer, usr_guard) = tracing_appender::non_blocking(appender(log, USR_LOG_NAME)?);

    let server_layer = fmt::layer()
        .with_writer(server_writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter::filter_fn(|meta| meta.target() != "usr"));
    let usr_layer = fmt::layer()
        .with_writer(usr_writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter::filter_fn(|meta| meta.target() == "usr"));

    tracing_subscriber::registry()
        .with(filter::LevelFilter::INFO)
        .with(server_layer)
        .with(usr_layer)
        .try_init()?;

    tracing::info!(
        "Daily logger initialized, sys_log_path: {}/{SERVER_LOG_NAME}, usr_log_path: \
         {}/{USR_LOG_NAME}, log_backup_count: {}.",
        log.log_dir,
        log.log_dir,
        log.log_backup_count
    );
    Ok(vec![server_guard, usr_guard])
}
