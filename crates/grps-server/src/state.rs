//! State shared by the HTTP and RPC surfaces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use grps_core::conf::Conf;
use grps_core::error::GrpsError;
use grps_core::executor::Executor;
use grps_core::monitor::Monitor;
use grps_core::{
    GPU_OOM_COUNT, QPS, REQ_FAIL_RATE, REQ_LATENCY_AVG, REQ_LATENCY_CDF, REQ_LATENCY_MAX,
};

pub struct AppState {
    pub conf: Arc<Conf>,
    pub executor: Arc<Executor>,
    pub monitor: Arc<Monitor>,
    /// Readiness latch driven by online/offline, probed by readiness checks.
    health: AtomicBool,
    /// Transport admission: refuse past `max_connections`.
    pub connections: Arc<Semaphore>,
    /// Bounded predict worker pool, sized `max_concurrency`.
    pub predict_pool: Arc<Semaphore>,
}

impl AppState {
    pub fn new(conf: Arc<Conf>, executor: Arc<Executor>, monitor: Arc<Monitor>) -> Arc<AppState> {
        let connections = Arc::new(Semaphore::new(conf.max_connections()));
        let predict_pool = Arc::new(Semaphore::new(conf.max_concurrency()));
        Arc::new(AppState {
            conf,
            executor,
            monitor,
            health: AtomicBool::new(false),
            connections,
            predict_pool,
        })
    }

    pub fn set_health(&self, healthy: bool) {
        self.health.store(healthy, Ordering::Release);
    }

    pub fn healthy(&self) -> bool {
        self.health.load(Ordering::Acquire)
    }

    pub fn count_request(&self) {
        self.monitor.inc(QPS, 1.0);
    }

    pub fn observe_latency(&self, begin: Instant) {
        let latency_ms = begin.elapsed().as_secs_f64() * 1e3;
        self.monitor.avg(REQ_LATENCY_AVG, latency_ms);
        self.monitor.max(REQ_LATENCY_MAX, latency_ms);
        self.monitor.cdf(REQ_LATENCY_CDF, latency_ms);
    }

    pub fn record_success(&self) {
        self.monitor.avg(REQ_FAIL_RATE, 0.0);
    }

    pub fn record_failure(&self, err: &GrpsError) {
        self.monitor.avg(REQ_FAIL_RATE, 100.0);
        if err.oom_like() {
            self.monitor.inc(GPU_OOM_COUNT, 1.0);
        }
    }

    /// `/metadata/server` payload: both configuration texts, verbatim.
    pub fn server_metadata(&self) -> String {
        format!("{}\n{}", self.conf.inference_text, self.conf.server_text)
    }

    /// `/metadata/model` payload: the named model's descriptor as YAML.
    pub fn model_metadata(&self, name: &str) -> Option<String> {
        self.conf
            .model_by_name(name)
            .and_then(|model| serde_yaml::to_string(model).ok())
    }
}
