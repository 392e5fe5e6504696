//! Process bootstrap: compose configuration, logging, monitoring, the
//! executor and both transports, then block until a transport terminates.
//!
//! A deployment with customized inferers or converters embeds `grps-server`
//! as a library and passes its own populated [`Registry`] to `serve`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use salvo::prelude::*;

use grps_core::conf::Conf;
use grps_core::executor::{Executor, Registry};
use grps_core::monitor::system::SystemMonitor;
use grps_core::monitor::Monitor;
use grps_core::{
    CPU_USAGE_AVG, GRPS_VERSION, MEM_USAGE_AVG, QPS, REQ_FAIL_RATE, REQ_LATENCY_AVG,
    REQ_LATENCY_CDF, REQ_LATENCY_MAX,
};
use grps_server::{api, logging, rpc, AppState};

/// Host sampling interval in seconds.
const STAT_STEP: u64 = 1;

#[tokio::main]
async fn main() {
    let registry = Registry::new();
    if let Err(err) = serve(registry).await {
        tracing::error!("Start server failed: {err:#}");
        eprintln!("Start server failed: {err:#}");
        std::process::exit(1);
    }
}

async fn serve(registry: Registry) -> Result<()> {
    std::fs::write("PID", std::process::id().to_string()).context("dump PID")?;
    std::fs::write("VERSION", GRPS_VERSION).context("dump VERSION")?;

    let conf = Arc::new(Conf::load("conf")?);
    let _log_guards = logging::init(&conf.server.log)?;

    let monitor = Monitor::start(Some(PathBuf::from(&conf.server.log.log_dir)));
    monitor.inc(QPS, 0.0);
    monitor.avg(REQ_FAIL_RATE, 0.0);
    monitor.cdf(REQ_LATENCY_CDF, 0.0);
    monitor.avg(REQ_LATENCY_AVG, 0.0);
    monitor.max(REQ_LATENCY_MAX, 0.0);
    monitor.avg(CPU_USAGE_AVG, 0.0);
    monitor.avg(MEM_USAGE_AVG, 0.0);
    tracing::info!("Start global monitor success.");

    SystemMonitor::new(monitor.clone(), conf.server.gpu.clone(), STAT_STEP).start()?;

    let executor = Arc::new(Executor::new(&conf, &registry)?);
    let state = AppState::new(conf.clone(), executor, monitor);

    let host = &conf.server.interface.host;
    let http_addr: SocketAddr = format!("{host}:{}", conf.framework.http_port())
        .parse()
        .context("http bind address")?;
    let router = api::build_router(state.clone());
    let acceptor = TcpListener::new(http_addr)
        .try_bind()
        .await
        .with_context(|| format!("bind http on {http_addr}"))?;
    tracing::info!(
        "Start grps http service, version: {GRPS_VERSION}, port: {}, max_connections: {}, \
         max_concurrency: {}.",
        conf.framework.http_port(),
        conf.max_connections(),
        conf.max_concurrency()
    );
    let http = Server::new(acceptor).serve(router);

    match conf.framework.rpc_port() {
        Some(rpc_port) => {
            let rpc_addr: SocketAddr = format!("{host}:{rpc_port}")
                .parse()
                .context("rpc bind address")?;
            tracing::info!(
                "Start grps grpc service, version: {GRPS_VERSION}, port: {rpc_port}, \
                 max_connections: {}, max_concurrency: {}.",
                conf.max_connections(),
                conf.max_concurrency()
            );
            let rpc = tonic::transport::Server::builder()
                .concurrency_limit_per_connection(conf.max_connections())
                .add_service(rpc::GrpsServiceImpl::server(state))
                .serve(rpc_addr);
            tokio::select! {
                _ = http => {
                    tracing::info!("Grps http server terminated.");
                    Ok(())
                }
                result = rpc => {
                    result.context("grpc server")?;
                    tracing::info!("Grps grpc server terminated.");
                    Ok(())
                }
            }
        }
        None => {
            http.await;
            tracing::info!("Grps http server terminated.");
            Ok(())
        }
    }
}
