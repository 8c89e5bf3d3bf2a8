//! A fixed-size pool of detection workers.
//!
//! Every worker is a named thread (`worker-{index}`) that owns exactly one [`Detector`] for its
//! whole lifetime. Detectors are created *on* the worker thread by a shared factory, so they do
//! not have to be [`Send`].
//!
//! Workers pull [`Job`]s from the shared input queue, run detection and publish a
//! [`DetectionResult`] for every frame they manage to process. They exit when the input queue is
//! closed and drained, or when the pool is stopped.

use std::{
    any::Any,
    convert::Infallible,
    fmt, iter,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context};
use crossbeam::{
    channel::{self, Receiver, Sender, TryRecvError},
    select,
};

use crate::{
    config::{FailurePolicy, OverlayTarget, PipelineConfig},
    detector::{DetectionResult, Detector},
    drop::defer,
    image::Frame,
    queue::{InputReceiver, ResultSender},
    timer::{FpsCounter, ThroughputTracker, Timer},
};

/// A frame waiting to be processed, tagged with its capture sequence number.
#[derive(Debug, Clone)]
pub struct Job {
    seq: u64,
    frame: Frame,
}

impl Job {
    pub fn new(seq: u64, frame: Frame) -> Self {
        Self { seq, frame }
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }
}

/// Creates a connected [`StopHandle`] and [`StopToken`].
///
/// Any number of tokens can be obtained by cloning. They all observe the same stop request.
pub fn stop_signal() -> (StopHandle, StopToken) {
    // Nothing is ever sent; dropping the sender is the broadcast.
    let (sender, recv) = channel::bounded(0);
    (
        StopHandle {
            sender: Some(sender),
        },
        StopToken { recv },
    )
}

/// Requests that all connected [`StopToken`]s observe a stop.
pub struct StopHandle {
    sender: Option<Sender<Infallible>>,
}

impl StopHandle {
    /// Requests the stop. Idempotent.
    pub fn stop(&mut self) {
        self.sender.take();
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.is_none()
    }
}

/// Observes a stop request made through the connected [`StopHandle`].
///
/// Dropping the [`StopHandle`] also counts as a stop request.
#[derive(Clone)]
pub struct StopToken {
    recv: Receiver<Infallible>,
}

impl StopToken {
    /// Returns whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        matches!(self.recv.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Blocks until a stop is requested or `timeout` expires. Returns whether a stop was
    /// requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.recv.recv_timeout(timeout).is_err() && self.is_stopped()
    }

    /// Returns the underlying channel, for use in [`crossbeam::select!`].
    pub(crate) fn as_receiver(&self) -> &Receiver<Infallible> {
        &self.recv
    }
}

/// Lifecycle state of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// The worker is processing frames or waiting for one.
    Running = 0,
    /// A stop was requested, but the worker has not exited yet (eg. because it is still inside
    /// [`Detector::detect`]).
    StopRequested = 1,
    /// The worker thread has exited (or is about to).
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::StopRequested,
            _ => Self::Stopped,
        }
    }
}

/// Statistics of a single worker, returned when the pool is joined.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    index: usize,
    throughput: ThroughputTracker,
    failed: u64,
    discarded: u64,
    panicked: bool,
}

impl WorkerReport {
    fn new(index: usize) -> Self {
        Self {
            index,
            throughput: ThroughputTracker::new(format!("worker-{index}")),
            failed: 0,
            discarded: 0,
            panicked: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the number of frames that were processed successfully.
    pub fn frames(&self) -> u64 {
        self.throughput.frames()
    }

    /// Returns the number of frames that were skipped because detection failed.
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Returns the number of frames that were dequeued after a stop request and dropped.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn elapsed(&self) -> Duration {
        self.throughput.elapsed()
    }

    /// Returns the average number of frames processed per second.
    pub fn rate(&self) -> f64 {
        self.throughput.rate()
    }

    /// Returns whether the worker was terminated by a panic.
    ///
    /// Panics inside [`Detector::detect`] are caught and counted as failures. This only reports
    /// panics that escaped from elsewhere in the worker loop. The statistics of a worker that
    /// panicked are lost and reported as 0.
    pub fn panicked(&self) -> bool {
        self.panicked
    }
}

impl fmt::Display for WorkerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} failed, {} discarded)",
            self.throughput, self.failed, self.discarded
        )?;
        if self.panicked {
            f.write_str(" [panicked]")?;
        }
        Ok(())
    }
}

struct WorkerHandle {
    index: usize,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<WorkerReport>>,
}

/// Settings every worker needs.
#[derive(Clone, Copy)]
struct WorkerSettings {
    failure_policy: FailurePolicy,
    attach_frame: bool,
}

/// A running pool of detection workers.
///
/// Dropping the pool stops and joins all workers.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    stop: StopHandle,
}

impl WorkerPool {
    /// Spawns `config.get_pool_size()` workers and waits until each of them has created its
    /// detector.
    ///
    /// `factory` is called exactly once per worker, on that worker's thread, with the worker's
    /// index. If any call fails (or panics), all workers are stopped again and the error is
    /// returned.
    pub fn start<D, F>(
        config: &PipelineConfig,
        input: InputReceiver<Job>,
        results: ResultSender<DetectionResult>,
        factory: F,
    ) -> anyhow::Result<Self>
    where
        D: Detector + 'static,
        F: Fn(usize) -> anyhow::Result<D> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let (stop, token) = stop_signal();
        let settings = WorkerSettings {
            failure_policy: config.get_failure_policy(),
            attach_frame: config.get_overlay() == OverlayTarget::SourceFrame,
        };

        let mut pool = Self {
            workers: Vec::with_capacity(config.get_pool_size()),
            stop,
        };
        let mut ready = Vec::with_capacity(config.get_pool_size());

        for index in 0..config.get_pool_size() {
            let state = Arc::new(AtomicU8::new(WorkerState::Running as u8));
            let (ready_tx, ready_rx) = channel::bounded(1);
            let factory = factory.clone();
            let input = input.clone();
            let results = results.clone();
            let token = token.clone();
            let thread_state = state.clone();

            let spawned = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    log::trace!("worker {index} starting");
                    let _guard = defer(move || {
                        thread_state.store(WorkerState::Stopped as u8, Ordering::Release);
                        log::trace!("worker {index} exiting");
                    });

                    let detector = match factory(index) {
                        Ok(detector) => {
                            ready_tx.send(Ok(())).ok();
                            detector
                        }
                        Err(e) => {
                            ready_tx.send(Err(e)).ok();
                            return WorkerReport::new(index);
                        }
                    };
                    drop(ready_tx);

                    run_worker(index, detector, settings, &input, &results, &token)
                });

            match spawned {
                Ok(thread) => {
                    pool.workers.push(WorkerHandle {
                        index,
                        state,
                        thread: Some(thread),
                    });
                    ready.push(ready_rx);
                }
                Err(e) => {
                    // `pool` is dropped here, which stops and joins the workers spawned so far.
                    return Err(e).with_context(|| format!("failed to spawn worker {index}"));
                }
            }
        }

        for (index, ready) in ready.into_iter().enumerate() {
            let outcome = ready
                .recv()
                .unwrap_or_else(|_| Err(anyhow!("worker panicked during startup")));
            if let Err(e) = outcome {
                return Err(e.context(format!("failed to create detector for worker {index}")));
            }
        }

        log::debug!("started {} workers", pool.workers.len());
        Ok(pool)
    }

    /// Returns the number of workers the pool was started with.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Returns the current state of every worker, ordered by worker index.
    pub fn states(&self) -> Vec<WorkerState> {
        self.workers
            .iter()
            .map(|w| WorkerState::from_u8(w.state.load(Ordering::Acquire)))
            .collect()
    }

    /// Returns the number of workers that have not exited yet.
    pub fn live_workers(&self) -> usize {
        self.states()
            .into_iter()
            .filter(|&s| s != WorkerState::Stopped)
            .count()
    }

    /// Asks all workers to exit as soon as possible.
    ///
    /// Detection calls that are already running are allowed to finish, but their results are
    /// still published. Frames dequeued afterwards are discarded.
    pub fn request_stop(&mut self) {
        for worker in &self.workers {
            worker
                .state
                .compare_exchange(
                    WorkerState::Running as u8,
                    WorkerState::StopRequested as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .ok();
        }
        self.stop.stop();
    }

    /// Waits for every worker to exit and returns their reports.
    ///
    /// This does not request a stop by itself: workers exit once the input queue is closed and
    /// empty, or after [`WorkerPool::request_stop`].
    pub fn join(mut self) -> Vec<WorkerReport> {
        self.join_impl()
    }

    fn join_impl(&mut self) -> Vec<WorkerReport> {
        let mut reports = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            let Some(thread) = worker.thread.take() else {
                continue;
            };
            match thread.join() {
                Ok(report) => {
                    log::debug!("{report}");
                    reports.push(report);
                }
                Err(payload) => {
                    log::error!(
                        "worker {} panicked: {}",
                        worker.index,
                        panic_message(&*payload)
                    );
                    let mut report = WorkerReport::new(worker.index);
                    report.panicked = true;
                    reports.push(report);
                }
            }
        }
        reports
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.workers.iter().any(|w| w.thread.is_some()) {
            self.request_stop();
            self.join_impl();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

fn run_worker<D: Detector>(
    index: usize,
    mut detector: D,
    settings: WorkerSettings,
    input: &InputReceiver<Job>,
    results: &ResultSender<DetectionResult>,
    stop: &StopToken,
) -> WorkerReport {
    let mut report = WorkerReport::new(index);
    let mut fps = FpsCounter::new(format!("worker-{index}"));
    let t_detect = Timer::new("detect");
    let attempts = match settings.failure_policy {
        FailurePolicy::Skip => 1,
        FailurePolicy::RetryOnce => 2,
    };

    report.throughput.start();
    loop {
        let job = select! {
            recv(stop.as_receiver()) -> _ => break,
            recv(input.as_crossbeam()) -> msg => match msg {
                Ok(job) => job,
                Err(_) => {
                    log::trace!("worker {index}: input closed");
                    break;
                }
            },
        };

        if stop.is_stopped() {
            log::debug!("worker {index}: discarding frame {} after stop", job.seq);
            report.discarded += 1;
            break;
        }

        let Job { seq, frame } = job;
        let converted = frame.to_layout(detector.input_layout());
        let mut detections = None;
        for attempt in 1..=attempts {
            let outcome = t_detect.time(|| {
                panic::catch_unwind(AssertUnwindSafe(|| detector.detect(&converted)))
                    .unwrap_or_else(|payload| {
                        let msg = panic_message(&*payload);
                        log::error!("worker {index}: detector panicked on frame {seq}: {msg}");
                        Err(anyhow!("detector panicked: {msg}"))
                    })
            });
            match outcome {
                Ok(dets) => {
                    detections = Some(dets);
                    break;
                }
                Err(e) if attempt < attempts => {
                    log::warn!("worker {index}: detection failed on frame {seq}, retrying: {e:#}");
                }
                Err(e) => {
                    log::error!("worker {index}: skipping frame {seq}: {e:#}");
                }
            }
        }
        let Some(detections) = detections else {
            report.failed += 1;
            continue;
        };

        let frame = settings.attach_frame.then_some(frame);
        if results
            .send(DetectionResult::new(seq, index, detections, frame))
            .is_err()
        {
            log::debug!("worker {index}: result queue closed");
            break;
        }
        report.throughput.update();
        fps.tick_with(iter::once(&t_detect).chain(detector.timers()));
    }
    report.throughput.stop();

    report
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use std::time::Instant;

    use anyhow::bail;

    use super::*;
    use crate::{
        detector::Detections,
        image::Resolution,
        queue::{input_queue, result_queue, ResultReceiver},
    };

    /// Fails on every frame whose sequence number is stored in its first byte and listed in
    /// `fail_on`.
    struct Flaky {
        calls: Arc<AtomicUsize>,
        fail_on: Vec<u8>,
        failures_left: Arc<Mutex<usize>>,
    }

    impl Detector for Flaky {
        fn detect(&mut self, frame: &Frame) -> anyhow::Result<Detections> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut left = self.failures_left.lock().unwrap();
            if self.fail_on.contains(&frame.data()[0]) && *left > 0 {
                *left -= 1;
                bail!("flaky failure");
            }
            Ok(Detections::new())
        }
    }

    struct Slow(Duration);

    impl Detector for Slow {
        fn detect(&mut self, _: &Frame) -> anyhow::Result<Detections> {
            thread::sleep(self.0);
            Ok(Detections::new())
        }
    }

    fn tagged_frame(tag: u8) -> Frame {
        let res = Resolution::new(2, 2);
        let mut data = vec![0; 12];
        data[0] = tag;
        Frame::new(res, crate::image::PixelLayout::Rgb8, data).unwrap()
    }

    fn collect(recv: &ResultReceiver<DetectionResult>) -> Vec<u64> {
        let mut seqs = recv.drain().iter().map(|r| r.seq()).collect::<Vec<_>>();
        seqs.sort_unstable();
        seqs
    }

    fn run_flaky(policy: FailurePolicy, failures: usize) -> (Vec<u64>, Vec<WorkerReport>, usize) {
        let config = PipelineConfig::default()
            .pool_size(1)
            .failure_policy(policy);
        let (sender, input) = input_queue(4);
        let (results, recv) = result_queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let failures_left = Arc::new(Mutex::new(failures));

        let pool = WorkerPool::start(&config, input, results, {
            let calls = calls.clone();
            move |_| {
                Ok(Flaky {
                    calls: calls.clone(),
                    fail_on: vec![2],
                    failures_left: failures_left.clone(),
                })
            }
        })
        .unwrap();

        for seq in 0..5u8 {
            sender.send(Job::new(seq.into(), tagged_frame(seq))).unwrap();
        }
        drop(sender);
        let reports = pool.join();
        (collect(&recv), reports, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn failing_frame_is_skipped() {
        let (seqs, reports, calls) = run_flaky(FailurePolicy::Skip, usize::MAX);
        assert_eq!(seqs, [0, 1, 3, 4]);
        assert_eq!(calls, 5);
        assert_eq!(reports[0].frames(), 4);
        assert_eq!(reports[0].failed(), 1);
        assert!(!reports[0].panicked());
    }

    #[test]
    fn retry_invokes_detector_twice() {
        // Fails twice: skipped after the retry.
        let (seqs, reports, calls) = run_flaky(FailurePolicy::RetryOnce, usize::MAX);
        assert_eq!(seqs, [0, 1, 3, 4]);
        assert_eq!(calls, 6);
        assert_eq!(reports[0].failed(), 1);

        // Fails once: the retry succeeds.
        let (seqs, reports, calls) = run_flaky(FailurePolicy::RetryOnce, 1);
        assert_eq!(seqs, [0, 1, 2, 3, 4]);
        assert_eq!(calls, 6);
        assert_eq!(reports[0].failed(), 0);
    }

    #[test]
    fn factory_runs_once_per_worker_thread() {
        let config = PipelineConfig::default().pool_size(4);
        let (_sender, input) = input_queue::<Job>(1);
        let (results, _recv) = result_queue();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let pool = WorkerPool::start(&config, input, results, {
            let seen = seen.clone();
            move |index| {
                let name = thread::current().name().map(String::from);
                seen.lock().unwrap().push((index, name));
                Ok(Slow(Duration::ZERO))
            }
        })
        .unwrap();
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.live_workers(), 4);
        drop(pool);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        let expected = (0..4)
            .map(|i| (i, Some(format!("worker-{i}"))))
            .collect::<Vec<_>>();
        assert_eq!(seen, expected);
    }

    #[test]
    fn factory_error_fails_start() {
        let config = PipelineConfig::default().pool_size(3);
        let (_sender, input) = input_queue::<Job>(1);
        let (results, _recv) = result_queue();

        let result = WorkerPool::start(&config, input, results, |index| {
            if index == 1 {
                bail!("no model");
            }
            Ok(Slow(Duration::ZERO))
        });
        let err = result.err().unwrap();
        let msg = format!("{err:#}");
        assert!(msg.contains("worker 1"), "{msg}");
        assert!(msg.contains("no model"), "{msg}");
    }

    #[test]
    fn factory_panic_fails_start() {
        let config = PipelineConfig::default().pool_size(1);
        let (_sender, input) = input_queue::<Job>(1);
        let (results, _recv) = result_queue();

        let result = WorkerPool::start(&config, input, results, |_| -> anyhow::Result<Slow> {
            panic!("factory exploded");
        });
        assert!(result.is_err());
    }

    #[test]
    fn stop_reaches_stopped_and_discards() {
        let config = PipelineConfig::default().pool_size(2);
        let (sender, input) = input_queue(8);
        let (results, recv) = result_queue();
        let mut pool = WorkerPool::start(&config, input, results, |_| {
            Ok(Slow(Duration::from_millis(100)))
        })
        .unwrap();

        for seq in 0..8 {
            sender.send(Job::new(seq, tagged_frame(0))).unwrap();
        }
        // Let both workers pick up a frame.
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        pool.request_stop();
        assert!(pool
            .states()
            .iter()
            .all(|&s| s == WorkerState::StopRequested || s == WorkerState::Stopped));

        // In-flight detections finish, then the workers exit.
        while pool.live_workers() > 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.states(), [WorkerState::Stopped; 2]);

        let reports = pool.join();
        let processed: u64 = reports.iter().map(|r| r.frames()).sum();
        assert_eq!(processed, 2);
        assert_eq!(recv.drain().len(), 2);
        // Most of the queue was never processed.
        assert!(sender.len() + reports.iter().map(|r| r.discarded() as usize).sum::<usize>() >= 5);
    }

    #[test]
    fn detector_panic_is_contained() {
        struct PanicOnTag0;
        impl Detector for PanicOnTag0 {
            fn detect(&mut self, frame: &Frame) -> anyhow::Result<Detections> {
                if frame.data()[0] == 0 {
                    panic!("detector exploded");
                }
                thread::sleep(Duration::from_millis(2));
                Ok(Detections::new())
            }
        }

        let config = PipelineConfig::default().pool_size(2);
        let (sender, input) = input_queue(4);
        let (results, recv) = result_queue();
        let pool = WorkerPool::start(&config, input, results, |_| Ok(PanicOnTag0)).unwrap();

        for seq in 0..50u8 {
            sender.send(Job::new(seq.into(), tagged_frame(seq))).unwrap();
        }
        // Both workers survive the panic and keep taking frames.
        assert_eq!(pool.live_workers(), 2);
        drop(sender);

        let reports = pool.join();
        assert_eq!(collect(&recv), (1..50).collect::<Vec<_>>());
        assert!(reports.iter().all(|r| !r.panicked()));
        assert_eq!(reports.iter().map(|r| r.failed()).sum::<u64>(), 1);
        assert_eq!(reports.iter().map(|r| r.frames()).sum::<u64>(), 49);
    }

    #[test]
    fn panicking_worker_is_reported() {
        struct Bomb;
        impl Detector for Bomb {
            fn input_layout(&self) -> crate::image::PixelLayout {
                panic!("layout query exploded");
            }
            fn detect(&mut self, _: &Frame) -> anyhow::Result<Detections> {
                Ok(Detections::new())
            }
        }

        let config = PipelineConfig::default().pool_size(1);
        let (sender, input) = input_queue(1);
        let (results, _recv) = result_queue();
        let pool = WorkerPool::start(&config, input, results, |_| Ok(Bomb)).unwrap();

        sender.send(Job::new(0, tagged_frame(0))).unwrap();
        let start = Instant::now();
        while pool.live_workers() > 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
        let reports = pool.join();
        assert!(reports[0].panicked());

        // Nobody is left to receive.
        assert!(sender.send(Job::new(1, tagged_frame(1))).is_err());
    }

    #[test]
    fn detector_timers_are_polled() {
        struct Timed {
            t_stage: Timer,
            polls: Arc<AtomicUsize>,
        }
        impl Detector for Timed {
            fn detect(&mut self, _: &Frame) -> anyhow::Result<Detections> {
                self.t_stage.time(|| Ok(Detections::new()))
            }
            fn timers(&self) -> Vec<&Timer> {
                self.polls.fetch_add(1, Ordering::SeqCst);
                vec![&self.t_stage]
            }
        }

        let config = PipelineConfig::default().pool_size(1);
        let (sender, input) = input_queue(4);
        let (results, recv) = result_queue();
        let polls = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(&config, input, results, {
            let polls = polls.clone();
            move |_| {
                Ok(Timed {
                    t_stage: Timer::new("stage"),
                    polls: polls.clone(),
                })
            }
        })
        .unwrap();

        for seq in 0..3 {
            sender.send(Job::new(seq, tagged_frame(0))).unwrap();
        }
        drop(sender);
        pool.join();
        assert_eq!(recv.drain().len(), 3);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stop_signal_broadcasts() {
        let (mut handle, token) = stop_signal();
        let other = token.clone();
        assert!(!token.is_stopped());
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        handle.stop();
        assert!(handle.is_stopped());
        assert!(token.is_stopped());
        assert!(other.wait_timeout(Duration::from_secs(10)));
    }
}
