//! Dynamic batching: coalesce concurrent single-item requests into batched
//! inferer invocations.
//!
//! One batcher per batched model. A scheduler task drains the shared queue:
//! it blocks for the first task, drains whatever is already queued, then
//! waits for more until either `max_batch_size` is reached or an absolute
//! deadline `batch_timeout_us` from batch start elapses. Assembled batches
//! run on a worker pool bounded by the server `max_concurrency`.
//!
//! One bad request fails its whole batch: user code rejects unsuitable
//! inputs per-context in preprocess. A failing batch never stops the
//! scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::context::GrpsContext;
use crate::converter::{Converter, InferPayload};
use crate::error::GrpsError;
use crate::message::GrpsMessage;
use crate::model_infer::ModelInferer;

struct Task {
    inp: GrpsMessage,
    ctx: Arc<GrpsContext>,
}

struct Shared {
    name: String,
    converter: Option<Arc<dyn Converter>>,
    inferer: Arc<dyn ModelInferer>,
    workers: Arc<Semaphore>,
}

pub struct DynamicBatcher {
    shared: Arc<Shared>,
    queue_tx: flume::Sender<Task>,
    stop_tx: flume::Sender<()>,
    running: Arc<AtomicBool>,
}

impl DynamicBatcher {
    /// Create the batcher and start its scheduler task.
    pub fn start(
        name: impl Into<String>,
        max_batch_size: usize,
        batch_timeout_us: u64,
        converter: Option<Arc<dyn Converter>>,
        inferer: Arc<dyn ModelInferer>,
        max_concurrency: usize,
    ) -> Arc<DynamicBatcher> {
        let name = name.into();
        let (queue_tx, queue_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(Shared {
            name: name.clone(),
            converter,
            inferer,
            workers: Arc::new(Semaphore::new(max_concurrency)),
        });

        tracing::info!(
            "DynamicBatcher({name}) init, max_batch_size: {max_batch_size}, \
             batch_timeout_us: {batch_timeout_us}"
        );

        let batcher = Arc::new(DynamicBatcher {
            shared: shared.clone(),
            queue_tx,
            stop_tx,
            running: running.clone(),
        });
        tokio::spawn(schedule(
            shared,
            queue_rx,
            stop_rx,
            running,
            max_batch_size,
            Duration::from_micros(batch_timeout_us),
        ));
        batcher
    }

    /// Enqueue one request and wait for its batch to complete. The output is
    /// `None` when the request finished through a streaming final frame.
    pub async fn infer(
        &self,
        inp: GrpsMessage,
        ctx: Arc<GrpsContext>,
    ) -> Result<Option<GrpsMessage>, GrpsError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(GrpsError::internal(format!(
                "DynamicBatcher({}) is stopped",
                self.shared.name
            )));
        }
        let (done_tx, done_rx) = flume::bounded(1);
        ctx.set_batcher_done(done_tx);
        self.queue_tx
            .send(Task {
                inp,
                ctx: ctx.clone(),
            })
            .map_err(|_| {
                GrpsError::internal(format!("DynamicBatcher({}) is stopped", self.shared.name))
            })?;

        let out = done_rx.recv_async().await.map_err(|_| {
            GrpsError::internal(format!(
                "DynamicBatcher({}) dropped the request",
                self.shared.name
            ))
        })?;
        if ctx.has_err() {
            return Err(GrpsError::Internal(ctx.err_msg()));
        }
        Ok(out)
    }

    /// Cooperative stop: wakes the scheduler, which fails any queued tasks.
    pub fn stop(&self) {
        tracing::info!("DynamicBatcher({}) stop", self.shared.name);
        self.running.store(false, Ordering::Release);
        let _ = self.stop_tx.try_send(());
    }
}

impl Drop for DynamicBatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn schedule(
    shared: Arc<Shared>,
    queue_rx: flume::Receiver<Task>,
    stop_rx: flume::Receiver<()>,
    running: Arc<AtomicBool>,
    max_batch_size: usize,
    batch_timeout: Duration,
) {
    loop {
        let first = tokio::select! {
            task = queue_rx.recv_async() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
            _ = stop_rx.recv_async() => break,
        };

        let mut tasks = vec![first];
        while tasks.len() < max_batch_size {
            match queue_rx.try_recv() {
                Ok(task) => tasks.push(task),
                Err(_) => break,
            }
        }

        // One deadline per batch; arrivals after it wait for the next batch.
        let deadline = Instant::now() + batch_timeout;
        while tasks.len() < max_batch_size {
            let task = tokio::select! {
                task = queue_rx.recv_async() => task,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = stop_rx.recv_async() => {
                    running.store(false, Ordering::Release);
                    break;
                }
            };
            match task {
                Ok(task) => {
                    tasks.push(task);
                    while tasks.len() < max_batch_size {
                        match queue_rx.try_recv() {
                            Ok(task) => tasks.push(task),
                            Err(_) => break,
                        }
                    }
                }
                Err(_) => break,
            }
        }

        let permit = match shared.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            process_batch(&shared, tasks).await;
            drop(permit);
        });

        if !running.load(Ordering::Acquire) {
            break;
        }
    }

    // Unblock every caller still queued.
    running.store(false, Ordering::Release);
    while let Ok(task) = queue_rx.try_recv() {
        task.ctx
            .set_err_msg(format!("DynamicBatcher({}) stopped", shared.name));
        task.ctx.notify_batcher(None);
    }
}

fn all_err(ctxs: &[Arc<GrpsContext>]) -> bool {
    ctxs.iter().all(|ctx| ctx.has_err())
}

/// Notify every future when the whole batch has already failed through
/// per-context errors.
fn check_and_notify(ctxs: &[Arc<GrpsContext>]) -> bool {
    if all_err(ctxs) {
        for ctx in ctxs {
            ctx.notify_batcher(None);
        }
        return true;
    }
    false
}

async fn process_batch(shared: &Shared, tasks: Vec<Task>) {
    let ctxs: Vec<Arc<GrpsContext>> = tasks.iter().map(|t| t.ctx.clone()).collect();
    let inps: Vec<GrpsMessage> = tasks.into_iter().map(|t| t.inp).collect();

    let result = run_batch(shared, &inps, &ctxs).await;
    match result {
        Ok(None) => {}
        Ok(Some(outs)) => {
            for (ctx, out) in ctxs.iter().zip(outs) {
                ctx.notify_batcher(Some(out));
            }
        }
        Err(err) => {
            tracing::error!(
                "DynamicBatcher({}) batch inference process failed, error: {err}",
                shared.name
            );
            for ctx in &ctxs {
                ctx.set_err_msg(err.to_string());
                ctx.notify_batcher(None);
            }
        }
    }
}

/// `Ok(None)` means every context already carries an error and futures were
/// notified by the short-circuit check.
async fn run_batch(
    shared: &Shared,
    inps: &[GrpsMessage],
    ctxs: &[Arc<GrpsContext>],
) -> Result<Option<Vec<GrpsMessage>>, GrpsError> {
    let begin = Instant::now();
    match &shared.converter {
        None => {
            let infer_out = shared
                .inferer
                .batch_infer(InferPayload::Messages(inps.to_vec()), ctxs)
                .await?;
            if check_and_notify(ctxs) {
                return Ok(None);
            }
            let outs = infer_out.into_messages()?;
            if outs.len() != inps.len() {
                return Err(GrpsError::internal(format!(
                    "batch_infer returned {} outputs for {} inputs",
                    outs.len(),
                    inps.len()
                )));
            }
            tracing::info!(
                "DynamicBatcher({}), batch_size: {}, model_infer time: {} us",
                shared.name,
                inps.len(),
                begin.elapsed().as_micros()
            );
            Ok(Some(outs))
        }
        Some(converter) => {
            let infer_input = converter.batch_preprocess(inps, ctxs).await?;
            if check_and_notify(ctxs) {
                return Ok(None);
            }
            let preprocess_time = Instant::now();

            let infer_out = shared.inferer.batch_infer(infer_input, ctxs).await?;
            if check_and_notify(ctxs) {
                return Ok(None);
            }
            let infer_time = Instant::now();

            let outs = converter.batch_postprocess(infer_out, ctxs).await?;
            if check_and_notify(ctxs) {
                return Ok(None);
            }
            tracing::info!(
                "DynamicBatcher({}), batch_size: {}, preprocess time: {} us, model_infer time: \
                 {} us, postprocess time: {} us",
                shared.name,
                inps.len(),
                (preprocess_time - begin).as_micros(),
                (infer_time - preprocess_time).as_micros(),
                infer_time.elapsed().as_micros()
            );
            Ok(Some(outs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use crate::conf::Device;
    use crate::model_infer::InfererArgs;

    /// Echoes each message back and records observed batch sizes.
    struct RecordingInferer {
        batch_sizes: Mutex<Vec<usize>>,
        delay: Duration,
    }

    impl RecordingInferer {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                batch_sizes: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn sizes(&self) -> Vec<usize> {
            self.batch_sizes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelInferer for RecordingInferer {
        fn init(
            &mut self,
            _path: &str,
            _device: Option<Device>,
            _args: &InfererArgs,
        ) -> Result<(), GrpsError> {
            Ok(())
        }

        fn load(&mut self) -> Result<(), GrpsError> {
            Ok(())
        }

        async fn infer(
            &self,
            inp: InferPayload,
            _ctx: &Arc<GrpsContext>,
        ) -> Result<InferPayload, GrpsError> {
            Ok(inp)
        }

        async fn batch_infer(
            &self,
            inp: InferPayload,
            _ctxs: &[Arc<GrpsContext>],
        ) -> Result<InferPayload, GrpsError> {
            let msgs = inp.into_messages()?;
            self.batch_sizes.lock().unwrap().push(msgs.len());
            tokio::time::sleep(self.delay).await;
            Ok(InferPayload::Messages(msgs))
        }
    }

    /// Fails the whole batch whenever any request carries the poison marker.
    struct PoisonInferer;

    #[async_trait]
    impl ModelInferer for PoisonInferer {
        fn init(
            &mut self,
            _path: &str,
            _device: Option<Device>,
            _args: &InfererArgs,
        ) -> Result<(), GrpsError> {
            Ok(())
        }

        fn load(&mut self) -> Result<(), GrpsError> {
            Ok(())
        }

        async fn infer(
            &self,
            inp: InferPayload,
            _ctx: &Arc<GrpsContext>,
        ) -> Result<InferPayload, GrpsError> {
            Ok(inp)
        }

        async fn batch_infer(
            &self,
            inp: InferPayload,
            _ctxs: &[Arc<GrpsContext>],
        ) -> Result<InferPayload, GrpsError> {
            let msgs = inp.into_messages()?;
            if msgs.iter().any(|m| m.str_data == "poison") {
                return Err(GrpsError::internal("poisoned batch"));
            }
            Ok(InferPayload::Messages(msgs))
        }
    }

    async fn fire(
        batcher: &Arc<DynamicBatcher>,
        count: usize,
    ) -> Vec<Result<Option<GrpsMessage>, GrpsError>> {
        let handles: Vec<_> = (0..count)
            .map(|i| {
                let batcher = batcher.clone();
                tokio::spawn(async move {
                    let ctx = Arc::new(GrpsContext::new());
                    batcher
                        .infer(GrpsMessage::from_str_data(format!("req-{i}")), ctx)
                        .await
                })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn concurrent_requests_form_one_batch() {
        let inferer = RecordingInferer::new(Duration::from_millis(5));
        let batcher = DynamicBatcher::start("m-1", 8, 10_000, None, inferer.clone(), 4);

        let results = fire(&batcher, 5).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(inferer.sizes(), vec![5]);
    }

    #[tokio::test]
    async fn batches_never_exceed_max_batch_size() {
        let inferer = RecordingInferer::new(Duration::from_millis(5));
        let batcher = DynamicBatcher::start("m-1", 8, 10_000, None, inferer.clone(), 4);

        let results = fire(&batcher, 20).await;
        assert!(results.iter().all(|r| r.is_ok()));
        let sizes = inferer.sizes();
        assert_eq!(sizes.iter().sum::<usize>(), 20);
        assert!(sizes.iter().all(|&s| s <= 8), "sizes: {sizes:?}");
    }

    #[tokio::test]
    async fn timeout_flushes_a_short_batch() {
        let inferer = RecordingInferer::new(Duration::ZERO);
        let batcher = DynamicBatcher::start("m-1", 8, 5_000, None, inferer.clone(), 4);

        let results = fire(&batcher, 3).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(inferer.sizes().iter().sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn outputs_match_request_order() {
        let inferer = RecordingInferer::new(Duration::ZERO);
        let batcher = DynamicBatcher::start("m-1", 8, 5_000, None, inferer, 4);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let batcher = batcher.clone();
                tokio::spawn(async move {
                    let ctx = Arc::new(GrpsContext::new());
                    let out = batcher
                        .infer(GrpsMessage::from_str_data(format!("req-{i}")), ctx)
                        .await
                        .unwrap()
                        .unwrap();
                    (i, out.str_data)
                })
            })
            .collect();
        for handle in handles {
            let (i, text) = handle.await.unwrap();
            assert_eq!(text, format!("req-{i}"));
        }
    }

    #[tokio::test]
    async fn one_bad_request_fails_the_batch_but_not_the_next() {
        let batcher = DynamicBatcher::start("m-1", 8, 5_000, None, Arc::new(PoisonInferer), 4);

        let good = {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                let ctx = Arc::new(GrpsContext::new());
                batcher
                    .infer(GrpsMessage::from_str_data("fine"), ctx.clone())
                    .await
            })
        };
        let bad = {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                let ctx = Arc::new(GrpsContext::new());
                batcher
                    .infer(GrpsMessage::from_str_data("poison"), ctx.clone())
                    .await
            })
        };
        // Shared fate: both requests in the poisoned batch fail.
        assert!(good.await.unwrap().is_err());
        assert!(bad.await.unwrap().is_err());

        // A subsequent clean batch succeeds.
        let ctx = Arc::new(GrpsContext::new());
        let out = batcher
            .infer(GrpsMessage::from_str_data("recovered"), ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.str_data, "recovered");
    }

    #[tokio::test]
    async fn stop_unblocks_pending_callers() {
        // Long timeout keeps the request waiting inside batch assembly.
        let inferer = RecordingInferer::new(Duration::ZERO);
        let batcher = DynamicBatcher::start("m-1", 8, 1_000_000, None, inferer, 1);

        let ctx = Arc::new(GrpsContext::new());
        let pending = {
            let batcher = batcher.clone();
            let ctx = ctx.clone();
            tokio::spawn(
                async move { batcher.infer(GrpsMessage::from_str_data("late"), ctx).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        batcher.stop();
        // Caller resolves rather than hanging; a stopped batcher either
        // reports the stop through the context error or completes the batch
        // that was already in flight.
        let _ = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("caller must unblock after stop")
            .unwrap();
    }
}
