//! Host/GPU sampler feeding the metrics aggregator, plus the optional GPU
//! memory limit and GC cadence.
//!
//! CPU time and RSS come from `/proc`; per-device GPU utilization and memory
//! come from NVML behind the `gpu-monitor` feature. When the configured
//! memory manager type is `none`, sampling still runs but no limit or GC is
//! installed.

use std::sync::Arc;
use std::time::Duration;

use crate::conf::GpuConf;
use crate::error::GrpsError;
use crate::monitor::Monitor;
use crate::{CPU_USAGE_AVG, MEM_USAGE_AVG, MIB};

/// Per-process GPU memory cap and GC hooks. The system monitor task is the
/// only GC caller.
pub trait GpuMemManager: Send + Sync {
    fn set_mem_limit(&self, limit_mib: i64) -> Result<(), GrpsError>;
    fn gc(&self) -> Result<(), GrpsError>;
}

/// Build the manager for the configured type. `none` installs nothing.
pub fn gpu_mem_manager(conf: &GpuConf) -> Result<Option<Arc<dyn GpuMemManager>>, GrpsError> {
    match conf.mem_manager_type.as_str() {
        "none" => Ok(None),
        #[cfg(feature = "torch")]
        "torch" => Ok(Some(Arc::new(torch_mgr::TorchGpuMemManager::new(
            conf.devices.clone(),
        )))),
        #[cfg(feature = "tensorflow")]
        "tensorflow" => Ok(Some(Arc::new(tf_mgr::TfGpuMemManager::new(
            conf.devices.clone(),
        )))),
        other => Err(GrpsError::ModelLoad(format!(
            "gpu memory manager type {other:?} requires the matching backend feature at build \
             time"
        ))),
    }
}

/// Validated `CUDA_VISIBLE_DEVICES` remap: logical index -> physical index.
#[derive(Debug, Default, Clone)]
pub struct DeviceRemap(Option<Vec<u32>>);

impl DeviceRemap {
    pub fn from_env() -> Result<DeviceRemap, GrpsError> {
        match std::env::var("CUDA_VISIBLE_DEVICES") {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(DeviceRemap(None)),
        }
    }

    pub fn parse(value: &str) -> Result<DeviceRemap, GrpsError> {
        let re = regex::Regex::new(r"^\d+(,\d+)*$").expect("static regex");
        if !re.is_match(value) {
            return Err(GrpsError::internal(format!(
                "Invalid CUDA_VISIBLE_DEVICES: {value}"
            )));
        }
        let indices = value
            .split(',')
            .map(|part| part.parse::<u32>().map_err(GrpsError::internal))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DeviceRemap(Some(indices)))
    }

    /// Physical device index for a configured logical index.
    pub fn physical(&self, logical: u32) -> u32 {
        match &self.0 {
            Some(map) => map.get(logical as usize).copied().unwrap_or(logical),
            None => logical,
        }
    }
}

/// Total jiffies across all CPUs, from the first line of `/proc/stat`.
/// Guest time is already folded into user/nice.
fn total_cpu_time() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let first = stat.lines().next()?;
    let fields: Vec<u64> = first
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|f| f.parse().ok())
        .collect();
    (fields.len() == 8).then(|| fields.iter().sum())
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct ProcSample {
    utime: u64,
    stime: u64,
    rss_kib: u64,
}

fn pid_sample() -> Option<ProcSample> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // fields after the parenthesized comm, which may itself contain spaces
    let rest = &stat[stat.rfind(')')? + 2..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime = fields.get(11)?.parse().ok()?;
    let stime = fields.get(12)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok()?;
    let page_kib = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64 / 1024;
    Some(ProcSample {
        utime,
        stime,
        rss_kib: rss_pages * page_kib,
    })
}

fn mem_total_kib() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(feature = "gpu-monitor")]
mod gpu {
    use super::DeviceRemap;
    use crate::MIB;

    pub struct GpuSampler {
        nvml: nvml_wrapper::Nvml,
        remap: DeviceRemap,
    }

    impl GpuSampler {
        pub fn new(remap: DeviceRemap) -> Option<Self> {
            match nvml_wrapper::Nvml::init() {
                Ok(nvml) => Some(Self { nvml, remap }),
                Err(err) => {
                    tracing::error!("NVML init failed, gpu sampling disabled: {err}");
                    None
                }
            }
        }

        pub fn usage(&self, logical: u32) -> f64 {
            let physical = self.remap.physical(logical);
            self.nvml
                .device_by_index(physical)
                .and_then(|device| device.utilization_rates())
                .map(|rates| rates.gpu as f64)
                .unwrap_or(0.0)
        }

        pub fn mem_usage_mib(&self, logical: u32) -> f64 {
            let physical = self.remap.physical(logical);
            self.nvml
                .device_by_index(physical)
                .and_then(|device| device.memory_info())
                .map(|info| info.used as f64 / MIB as f64)
                .unwrap_or(0.0)
        }
    }
}

/// Periodic host/GPU sampler. One task per process, started at bootstrap.
pub struct SystemMonitor {
    monitor: Arc<Monitor>,
    gpu_conf: Option<GpuConf>,
    stat_step: u64,
}

impl SystemMonitor {
    pub fn new(monitor: Arc<Monitor>, gpu_conf: Option<GpuConf>, stat_step: u64) -> Self {
        Self {
            monitor,
            gpu_conf,
            stat_step: stat_step.max(1),
        }
    }

    /// Install the GPU limit when configured, then start the sampler task.
    pub fn start(self) -> Result<(), GrpsError> {
        let mut manager: Option<Arc<dyn GpuMemManager>> = None;
        let mut gc_interval: u64 = 0;

        if let Some(gpu) = &self.gpu_conf {
            // fail fast on a malformed CUDA_VISIBLE_DEVICES
            let _remap = DeviceRemap::from_env()?;
            manager = gpu_mem_manager(gpu)?;
            if let Some(manager) = &manager {
                if gpu.mem_limit_mib != -1 {
                    manager.set_mem_limit(gpu.mem_limit_mib)?;
                }
                if gpu.mem_gc_enable {
                    gc_interval = gpu.mem_gc_interval as u64;
                }
                tracing::info!(
                    "Gpu memory monitor init, stat_step: {}, gc_interval: {gc_interval}, \
                     mem_limit_mib: {}, gpu_mem_manager_type: {}.",
                    self.stat_step,
                    gpu.mem_limit_mib,
                    gpu.mem_manager_type
                );
            }
        }

        tracing::info!("Start system monitor.");
        tokio::spawn(self.run(manager, gc_interval));
        Ok(())
    }

    async fn run(self, manager: Option<Arc<dyn GpuMemManager>>, gc_interval: u64) {
        let monitor = self.monitor;
        #[cfg(feature = "gpu-monitor")]
        let gpu_sampler = match &self.gpu_conf {
            Some(_) => DeviceRemap::from_env()
                .ok()
                .and_then(gpu::GpuSampler::new),
            None => None,
        };

        let mut ticker = tokio::time::interval(Duration::from_secs(self.stat_step));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut prev_total = total_cpu_time();
        let mut prev_proc = pid_sample();
        let mut step: u64 = 0;
        tracing::info!("System monitor started.");

        loop {
            ticker.tick().await;
            step += 1;

            let curr_total = total_cpu_time();
            let curr_proc = pid_sample();
            if let (Some(prev_t), Some(curr_t), Some(prev_p), Some(curr_p)) =
                (prev_total, curr_total, prev_proc, curr_proc)
            {
                let total_delta = curr_t.saturating_sub(prev_t);
                if total_delta > 0 {
                    let proc_delta =
                        (curr_p.utime + curr_p.stime).saturating_sub(prev_p.utime + prev_p.stime);
                    let cores = std::thread::available_parallelism()
                        .map(|n| n.get() as f64)
                        .unwrap_or(1.0);
                    let cpu_usage = proc_delta as f64 / total_delta as f64 * cores * 100.0;
                    monitor.avg(CPU_USAGE_AVG, cpu_usage);
                }
                if let Some(total_kib) = mem_total_kib() {
                    monitor.avg(MEM_USAGE_AVG, curr_p.rss_kib as f64 / total_kib as f64 * 100.0);
                }
            }
            prev_total = curr_total;
            prev_proc = curr_proc;

            if let Some(gpu) = &self.gpu_conf {
                #[cfg(feature = "gpu-monitor")]
                if let Some(sampler) = &gpu_sampler {
                    for &device in &gpu.devices {
                        let device = device as u32;
                        monitor.avg(&format!("*gpu{device}_usage(%)"), sampler.usage(device));
                        monitor.avg(
                            &format!("*gpu{device}_mem_usage(MIB)"),
                            sampler.mem_usage_mib(device),
                        );
                    }
                }
                #[cfg(not(feature = "gpu-monitor"))]
                let _ = gpu;

                if let Some(manager) = &manager {
                    if gc_interval > 0 && step % gc_interval == 0 {
                        if let Err(err) = manager.gc() {
                            tracing::error!("gpu memory gc failed: {err}");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(feature = "torch")]
mod torch_mgr {
    use super::GpuMemManager;
    use crate::error::GrpsError;
    use crate::MIB;

    pub struct TorchGpuMemManager {
        devices: Vec<i64>,
    }

    impl TorchGpuMemManager {
        pub fn new(devices: Vec<i64>) -> Self {
            Self { devices }
        }
    }

    impl GpuMemManager for TorchGpuMemManager {
        fn set_mem_limit(&self, limit_mib: i64) -> Result<(), GrpsError> {
            for &device in &self.devices {
                let total = tch::Cuda::total_memory(device) as f64;
                let fraction = ((limit_mib as f64 * MIB as f64) / total).min(1.0);
                tch::Cuda::set_per_process_memory_fraction(fraction, device)
                    .map_err(GrpsError::internal)?;
            }
            Ok(())
        }

        fn gc(&self) -> Result<(), GrpsError> {
            tch::Cuda::empty_cache().map_err(GrpsError::internal)
        }
    }
}

#[cfg(feature = "tensorflow")]
mod tf_mgr {
    use super::GpuMemManager;
    use crate::error::GrpsError;

    pub struct TfGpuMemManager {
        devices: Vec<i64>,
    }

    impl TfGpuMemManager {
        pub fn new(devices: Vec<i64>) -> Self {
            Self { devices }
        }
    }

    impl GpuMemManager for TfGpuMemManager {
        fn set_mem_limit(&self, limit_mib: i64) -> Result<(), GrpsError> {
            // The TF C API fixes per-device limits at session creation; the
            // inferer reads this configuration when it builds its session.
            tracing::info!(
                "tensorflow gpu memory limit {limit_mib} MiB requested for devices {:?}",
                self.devices
            );
            Ok(())
        }

        fn gc(&self) -> Result<(), GrpsError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_remap_parses_and_maps() {
        let remap = DeviceRemap::parse("2,0,1").unwrap();
        assert_eq!(remap.physical(0), 2);
        assert_eq!(remap.physical(1), 0);
        assert_eq!(remap.physical(2), 1);
        // out of range falls through to identity
        assert_eq!(remap.physical(5), 5);
    }

    #[test]
    fn device_remap_rejects_garbage() {
        assert!(DeviceRemap::parse("a,b").is_err());
        assert!(DeviceRemap::parse("0,").is_err());
        assert!(DeviceRemap::parse("").is_err());
    }

    #[test]
    fn proc_sampling_works_on_linux() {
        assert!(total_cpu_time().unwrap_or(0) > 0);
        let sample = pid_sample().expect("self stat readable");
        assert!(sample.rss_kib > 0);
        assert!(mem_total_kib().unwrap_or(0) > 0);
    }

    #[test]
    fn none_manager_installs_nothing() {
        let conf = GpuConf {
            mem_manager_type: "none".into(),
            mem_limit_mib: -1,
            mem_gc_enable: false,
            mem_gc_interval: 1,
            devices: vec![0],
        };
        assert!(gpu_mem_manager(&conf).unwrap().is_none());
    }
}
