//! In-process metrics aggregator.
//!
//! Time-bucketed rings per metric name at four granularities: second (61
//! slots), minute (60), hour (24), day (30). Five aggregation kinds: `avg`,
//! `max`, `min`, `inc` and `cdf`. Producers push through a bounded queue and
//! never block; a single aggregator task owns the rings. Every second the
//! rings advance one slot, and the elapsed minute/hour/day is rolled up by
//! arithmetic mean at each boundary.
//!
//! Avg second buckets hold `(sum, count)` pairs so the mean survives rollup;
//! min buckets start at a sentinel and read as 0 while untouched; cdf keeps
//! raw samples for the current second only.

pub mod system;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use itertools::Itertools;

use crate::MONITOR_LOG_NAME;

/// Metric queue depth; producers drop (with a log line) when it is full.
const PIECE_QUEUE_DEPTH: usize = 1000;

/// Smoothing window over second slots when reading second-level series.
const LAST_NS: usize = 1;

const SECOND_SLOTS: usize = 61;
const MINUTE_SLOTS: usize = 60;
const HOUR_SLOTS: usize = 24;
const DAY_SLOTS: usize = 30;

const MIN_SENTINEL: f64 = f64::MAX;

/// Percentile ladder reported for cdf metrics.
pub const CDF_PERCENTILES: [f64; 20] = [
    10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 91.0, 92.0, 93.0, 94.0, 95.0, 96.0,
    97.0, 98.0, 99.0, 99.9, 99.99,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggType {
    Avg,
    Max,
    Min,
    Inc,
    Cdf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

/// One ring of buckets at a single granularity. Only the second-level ring
/// receives `put`; coarser rings receive rollups.
#[derive(Debug, Clone)]
enum Ring {
    Scalar { data: Vec<f64>, default: f64 },
    AvgPairs { data: Vec<(f64, u64)> },
    Samples { data: Vec<Vec<f64>> },
}

#[derive(Debug, Clone)]
struct History {
    unit: TimeUnit,
    agg: AggType,
    ring: Ring,
}

impl History {
    fn new(unit: TimeUnit, agg: AggType) -> Self {
        let slots = match (agg, unit) {
            (AggType::Cdf, _) => LAST_NS + 1,
            (_, TimeUnit::Second) => SECOND_SLOTS + LAST_NS,
            (_, TimeUnit::Minute) => MINUTE_SLOTS,
            (_, TimeUnit::Hour) => HOUR_SLOTS,
            (_, TimeUnit::Day) => DAY_SLOTS,
        };
        let ring = match (agg, unit) {
            (AggType::Cdf, _) => Ring::Samples {
                data: vec![Vec::new(); slots],
            },
            (AggType::Avg, TimeUnit::Second) => Ring::AvgPairs {
                data: vec![(0.0, 0); slots],
            },
            (AggType::Min, _) => Ring::Scalar {
                data: vec![MIN_SENTINEL; slots],
                default: MIN_SENTINEL,
            },
            _ => Ring::Scalar {
                data: vec![0.0; slots],
                default: 0.0,
            },
        };
        Self { unit, agg, ring }
    }

    /// Advance one slot: discard position 0, open a fresh bucket at the end.
    fn update(&mut self) {
        match &mut self.ring {
            Ring::Scalar { data, default } => {
                data.remove(0);
                data.push(*default);
            }
            Ring::AvgPairs { data } => {
                data.remove(0);
                data.push((0.0, 0));
            }
            Ring::Samples { data } => {
                data.remove(0);
                data.push(Vec::new());
            }
        }
    }

    /// Record into the current bucket. Second-level only.
    fn put(&mut self, value: f64) {
        match (&mut self.ring, self.agg) {
            (Ring::AvgPairs { data }, AggType::Avg) => {
                let last = data.last_mut().expect("ring is never empty");
                last.0 += value;
                last.1 += 1;
            }
            (Ring::Samples { data }, AggType::Cdf) => {
                data.last_mut().expect("ring is never empty").push(value);
            }
            (Ring::Scalar { data, .. }, AggType::Max) => {
                let last = data.last_mut().expect("ring is never empty");
                *last = last.max(value);
            }
            (Ring::Scalar { data, .. }, AggType::Min) => {
                let last = data.last_mut().expect("ring is never empty");
                *last = last.min(value);
            }
            (Ring::Scalar { data, .. }, AggType::Inc) => {
                *data.last_mut().expect("ring is never empty") += value;
            }
            _ => {}
        }
    }

    /// Roll the finer ring's closed buckets into this ring's current bucket
    /// by arithmetic mean.
    fn merge_pairs(&mut self, finer: &[(f64, u64)]) {
        if finer.is_empty() {
            return;
        }
        let sum: f64 = finer
            .iter()
            .map(|&(sum, count)| if count != 0 { sum / count as f64 } else { 0.0 })
            .sum();
        self.set_last(sum / finer.len() as f64);
    }

    fn merge_scalars(&mut self, finer: &[f64], finer_default: f64) {
        if finer.is_empty() {
            return;
        }
        let sum: f64 = finer
            .iter()
            .filter(|&&value| value != finer_default)
            .sum();
        self.set_last(sum / finer.len() as f64);
    }

    fn set_last(&mut self, value: f64) {
        if let Ring::Scalar { data, .. } = &mut self.ring {
            *data.last_mut().expect("ring is never empty") = value;
        }
    }

    /// The closed-bucket series at this granularity.
    fn read(&self) -> Vec<f64> {
        match (&self.ring, self.unit) {
            (Ring::AvgPairs { data }, _) => {
                let closed = &data[..data.len() - 1];
                (LAST_NS..closed.len())
                    .map(|i| {
                        let window = &closed[i + 1 - LAST_NS..=i];
                        let sum: f64 = window.iter().map(|&(s, _)| s).sum();
                        let count: u64 = window.iter().map(|&(_, c)| c).sum();
                        if count == 0 {
                            0.0
                        } else {
                            sum / count as f64
                        }
                    })
                    .collect()
            }
            (Ring::Scalar { data, default }, TimeUnit::Second) => {
                let closed = &data[..data.len() - 1];
                (LAST_NS..closed.len())
                    .map(|i| {
                        let window = &closed[i + 1 - LAST_NS..=i];
                        match self.agg {
                            AggType::Max => window.iter().copied().fold(f64::MIN, f64::max),
                            AggType::Min => {
                                let min = window.iter().copied().fold(f64::MAX, f64::min);
                                if min == *default {
                                    0.0
                                } else {
                                    min
                                }
                            }
                            _ => window.iter().sum::<f64>() / LAST_NS as f64,
                        }
                    })
                    .collect()
            }
            (Ring::Scalar { data, default }, _) => data
                .iter()
                .map(|&value| if value == *default { 0.0 } else { value })
                .collect(),
            (Ring::Samples { .. }, _) => Vec::new(),
        }
    }

    /// Percentile points over the closed second's samples.
    fn read_cdf(&self) -> Vec<(f64, f64)> {
        let Ring::Samples { data } = &self.ring else {
            return Vec::new();
        };
        let samples: Vec<f64> = data[..data.len() - 1]
            .iter()
            .flatten()
            .copied()
            .collect();
        if samples.is_empty() {
            return CDF_PERCENTILES.iter().map(|&p| (p, 0.0)).collect();
        }
        let sorted: Vec<f64> = samples
            .into_iter()
            .sorted_by(|a, b| a.partial_cmp(b).expect("metric values are finite"))
            .collect();
        let len = sorted.len();
        CDF_PERCENTILES
            .iter()
            .map(|&percent| {
                let index = ((len as f64 * percent / 100.0) as isize - 1)
                    .clamp(0, len as isize - 1) as usize;
                (percent, sorted[index])
            })
            .collect()
    }
}

/// What `read` returns for one metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsRead {
    /// `day ++ hour ++ minute ++ second` series.
    Trend(Vec<f64>),
    /// `(percentile, value)` points.
    Cdf(Vec<(f64, f64)>),
}

/// All four rings of one metric plus the rollup counter.
#[derive(Debug, Clone)]
pub struct MetricsCompose {
    agg: AggType,
    second: History,
    minute: History,
    hour: History,
    day: History,
    update_cnt: u64,
}

const MINUTE_UPDATE_CNT: u64 = 60;
const HOUR_UPDATE_CNT: u64 = 60 * 60;
const DAY_UPDATE_CNT: u64 = 24 * 60 * 60;

impl MetricsCompose {
    pub fn new(agg: AggType) -> Self {
        Self {
            agg,
            second: History::new(TimeUnit::Second, agg),
            minute: History::new(TimeUnit::Minute, agg),
            hour: History::new(TimeUnit::Hour, agg),
            day: History::new(TimeUnit::Day, agg),
            update_cnt: 0,
        }
    }

    pub fn agg(&self) -> AggType {
        self.agg
    }

    pub fn put(&mut self, value: f64) {
        self.second.put(value);
    }

    /// Once-per-second tick: advance the second ring, cascade rollups at the
    /// minute, hour and day boundaries.
    pub fn update(&mut self) {
        self.update_cnt += 1;

        self.second.update();
        if self.agg == AggType::Cdf {
            return;
        }

        if self.update_cnt % MINUTE_UPDATE_CNT == 0 {
            self.minute.update();
            match &self.second.ring {
                Ring::AvgPairs { data } => {
                    let closed = data[LAST_NS..data.len() - 1].to_vec();
                    self.minute.merge_pairs(&closed);
                }
                Ring::Scalar { data, default } => {
                    let (closed, default) = (data[LAST_NS..data.len() - 1].to_vec(), *default);
                    self.minute.merge_scalars(&closed, default);
                }
                Ring::Samples { .. } => {}
            }
        }
        if self.update_cnt % HOUR_UPDATE_CNT == 0 {
            self.hour.update();
            if let Ring::Scalar { data, default } = &self.minute.ring {
                let (data, default) = (data.clone(), *default);
                self.hour.merge_scalars(&data, default);
            }
        }
        if self.update_cnt == DAY_UPDATE_CNT {
            self.day.update();
            if let Ring::Scalar { data, default } = &self.hour.ring {
                let (data, default) = (data.clone(), *default);
                self.day.merge_scalars(&data, default);
            }
            self.update_cnt = 0;
        }
    }

    pub fn read(&self) -> MetricsRead {
        if self.agg == AggType::Cdf {
            return MetricsRead::Cdf(self.second.read_cdf());
        }
        let mut series = Vec::new();
        series.extend(self.day.read());
        series.extend(self.hour.read());
        series.extend(self.minute.read());
        series.extend(self.second.read());
        MetricsRead::Trend(series)
    }

    /// Most recent closed second, for the dumper.
    pub fn last_second(&self) -> MetricsRead {
        if self.agg == AggType::Cdf {
            return MetricsRead::Cdf(self.second.read_cdf());
        }
        MetricsRead::Trend(vec![self.second.read().last().copied().unwrap_or(0.0)])
    }
}

struct Piece {
    name: String,
    agg: AggType,
    value: f64,
}

type ComposeMap = HashMap<String, MetricsCompose>;

/// Process-wide metric sink. `put` calls are cheap and lock-free for the
/// caller; one aggregator task applies them and drives the per-second tick.
pub struct Monitor {
    tx: flume::Sender<Piece>,
    composes: Arc<Mutex<ComposeMap>>,
}

impl Monitor {
    /// Start the aggregator and, when a log dir is given, the once-per-second
    /// dumper that rewrites `grps_monitor.log`.
    pub fn start(log_dir: Option<PathBuf>) -> Arc<Monitor> {
        let (tx, rx) = flume::bounded::<Piece>(PIECE_QUEUE_DEPTH);
        let composes: Arc<Mutex<ComposeMap>> = Arc::default();

        let agg_composes = composes.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    piece = rx.recv_async() => match piece {
                        Ok(piece) => apply(&agg_composes, piece),
                        Err(_) => break,
                    },
                    _ = ticker.tick() => {
                        // Everything queued before this tick lands in the
                        // bucket the tick closes.
                        while let Ok(piece) = rx.try_recv() {
                            apply(&agg_composes, piece);
                        }
                        let mut composes = agg_composes.lock().expect("monitor lock poisoned");
                        for compose in composes.values_mut() {
                            compose.update();
                        }
                    }
                }
            }
        });

        if let Some(dir) = log_dir {
            let dump_composes = composes.clone();
            tokio::spawn(async move {
                let path = dir.join(MONITOR_LOG_NAME);
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let snapshot = dump(&dump_composes);
                    if let Err(err) = tokio::fs::write(&path, snapshot).await {
                        tracing::error!("dump metrics to {} failed: {err}", path.display());
                    }
                }
            });
        }

        Arc::new(Monitor { tx, composes })
    }

    fn put(&self, name: &str, agg: AggType, value: f64) {
        let piece = Piece {
            name: name.to_owned(),
            agg,
            value,
        };
        if self.tx.try_send(piece).is_err() {
            tracing::error!("Metrics queue is full.");
        }
    }

    pub fn avg(&self, name: &str, value: f64) {
        self.put(name, AggType::Avg, value);
    }

    pub fn max(&self, name: &str, value: f64) {
        self.put(name, AggType::Max, value);
    }

    pub fn min(&self, name: &str, value: f64) {
        self.put(name, AggType::Min, value);
    }

    pub fn inc(&self, name: &str, value: f64) {
        self.put(name, AggType::Inc, value);
    }

    pub fn cdf(&self, name: &str, value: f64) {
        self.put(name, AggType::Cdf, value);
    }

    pub fn read(&self, name: &str) -> Option<MetricsRead> {
        self.composes
            .lock()
            .expect("monitor lock poisoned")
            .get(name)
            .map(MetricsCompose::read)
    }

    pub fn read_all(&self) -> Vec<(String, MetricsRead)> {
        let composes = self.composes.lock().expect("monitor lock poisoned");
        composes
            .iter()
            .map(|(name, compose)| (name.clone(), compose.read()))
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect()
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.composes
            .lock()
            .expect("monitor lock poisoned")
            .keys()
            .cloned()
            .sorted()
            .collect()
    }
}

fn apply(composes: &Arc<Mutex<ComposeMap>>, piece: Piece) {
    let mut composes = composes.lock().expect("monitor lock poisoned");
    let compose = composes
        .entry(piece.name.clone())
        .or_insert_with(|| MetricsCompose::new(piece.agg));
    if compose.agg() != piece.agg {
        tracing::error!(
            "agg_type not match for {}, new: {:?}, old: {:?}.",
            piece.name,
            piece.agg,
            compose.agg()
        );
        return;
    }
    compose.put(piece.value);
}

/// Flat `metric : value` snapshot of the most recent second. Cdf metrics dump
/// their 80/90/99/99.9/99.99 points.
fn dump(composes: &Arc<Mutex<ComposeMap>>) -> String {
    let composes = composes.lock().expect("monitor lock poisoned");
    let mut out = String::new();
    for (name, compose) in composes.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
        match compose.last_second() {
            MetricsRead::Cdf(points) => {
                for (suffix, index) in [("80", 7), ("90", 8), ("99", 17), ("999", 18), ("9999", 19)]
                {
                    let value = points.get(index).map(|&(_, v)| v).unwrap_or(0.0);
                    out.push_str(&format!("{name}_{suffix} : {value:.2}\n"));
                }
            }
            MetricsRead::Trend(values) => {
                out.push_str(&format!(
                    "{name} : {:.2}\n",
                    values.last().copied().unwrap_or(0.0)
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_bucket_reports_arithmetic_mean() {
        let mut compose = MetricsCompose::new(AggType::Avg);
        compose.put(10.0);
        compose.put(20.0);
        compose.put(60.0);
        compose.update();
        let MetricsRead::Trend(series) = compose.read() else {
            panic!("avg reads a trend")
        };
        assert_eq!(*series.last().unwrap(), 30.0);
    }

    #[test]
    fn inc_accumulates_within_a_bucket() {
        let mut compose = MetricsCompose::new(AggType::Inc);
        compose.put(1.0);
        compose.put(1.0);
        compose.put(3.0);
        compose.update();
        let MetricsRead::Trend(series) = compose.read() else {
            panic!()
        };
        assert_eq!(*series.last().unwrap(), 5.0);
    }

    #[test]
    fn min_reports_zero_when_untouched() {
        let mut compose = MetricsCompose::new(AggType::Min);
        compose.update();
        let MetricsRead::Trend(series) = compose.read() else {
            panic!()
        };
        assert!(series.iter().all(|&v| v == 0.0));

        compose.put(7.0);
        compose.put(3.0);
        compose.update();
        let MetricsRead::Trend(series) = compose.read() else {
            panic!()
        };
        assert_eq!(*series.last().unwrap(), 3.0);
    }

    #[test]
    fn max_tracks_largest_value() {
        let mut compose = MetricsCompose::new(AggType::Max);
        compose.put(3.0);
        compose.put(9.0);
        compose.put(4.0);
        compose.update();
        let MetricsRead::Trend(series) = compose.read() else {
            panic!()
        };
        assert_eq!(*series.last().unwrap(), 9.0);
    }

    #[test]
    fn trend_series_has_all_four_granularities() {
        let compose = MetricsCompose::new(AggType::Avg);
        let MetricsRead::Trend(series) = compose.read() else {
            panic!()
        };
        assert_eq!(series.len(), DAY_SLOTS + HOUR_SLOTS + MINUTE_SLOTS + 60);
    }

    #[test]
    fn minute_rollup_is_mean_of_second_buckets() {
        let mut compose = MetricsCompose::new(AggType::Avg);
        // one closed second bucket with mean 30, then 59 empty seconds
        compose.put(10.0);
        compose.put(50.0);
        for _ in 0..60 {
            compose.update();
        }
        let MetricsRead::Trend(series) = compose.read() else {
            panic!()
        };
        let minute_series = &series[DAY_SLOTS + HOUR_SLOTS..DAY_SLOTS + HOUR_SLOTS + MINUTE_SLOTS];
        // 60 second-buckets, one holding mean 30, rolled up by mean
        assert!((minute_series.last().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn cdf_percentiles_are_monotonic() {
        let mut compose = MetricsCompose::new(AggType::Cdf);
        for v in 1..=100 {
            compose.put(v as f64);
        }
        compose.update();
        let MetricsRead::Cdf(points) = compose.read() else {
            panic!()
        };
        assert_eq!(points.len(), CDF_PERCENTILES.len());
        let p = |target: f64| {
            points
                .iter()
                .find(|&&(percent, _)| percent == target)
                .unwrap()
                .1
        };
        assert!(p(99.0) >= p(95.0));
        assert!(p(95.0) >= p(50.0));
        assert!(p(50.0) >= p(10.0));
        assert_eq!(p(50.0), 50.0);
        assert_eq!(p(99.0), 99.0);
    }

    #[test]
    fn cdf_without_samples_reads_zeros() {
        let mut compose = MetricsCompose::new(AggType::Cdf);
        compose.update();
        let MetricsRead::Cdf(points) = compose.read() else {
            panic!()
        };
        assert!(points.iter().all(|&(_, v)| v == 0.0));
    }

    #[test]
    fn cdf_keeps_raw_samples_for_current_second_only() {
        let mut compose = MetricsCompose::new(AggType::Cdf);
        compose.put(5.0);
        compose.update();
        // sample visible for the closed second
        let MetricsRead::Cdf(points) = compose.read() else {
            panic!()
        };
        assert_eq!(points[0].1, 5.0);
        // after another tick the sample has aged out
        compose.update();
        let MetricsRead::Cdf(points) = compose.read() else {
            panic!()
        };
        assert!(points.iter().all(|&(_, v)| v == 0.0));
    }

    #[tokio::test]
    async fn monitor_applies_queued_pieces_on_tick() {
        let monitor = Monitor::start(None);
        monitor.inc(crate::QPS, 1.0);
        monitor.avg(crate::REQ_LATENCY_AVG, 12.0);
        // give the aggregator a tick to apply and close the bucket
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let Some(MetricsRead::Trend(series)) = monitor.read(crate::QPS) else {
            panic!("qps missing")
        };
        assert_eq!(*series.last().unwrap(), 1.0);
        assert!(monitor.read("missing").is_none());
    }

    #[test]
    fn dump_format_is_flat_name_value() {
        let composes: Arc<Mutex<ComposeMap>> = Arc::default();
        {
            let mut map = composes.lock().unwrap();
            let mut qps = MetricsCompose::new(AggType::Inc);
            qps.put(3.0);
            qps.update();
            map.insert("*qps".into(), qps);
        }
        let text = dump(&composes);
        assert_eq!(text, "*qps : 3.00\n");
    }
}
