//! The queues and the worker pool, wired together.

use std::{error::Error, fmt, time::Duration};

use crate::{
    config::PipelineConfig,
    detector::{DetectionResult, Detector},
    image::Frame,
    pool::{Job, WorkerPool, WorkerReport},
    queue::{input_queue, result_queue, InputSender, ResultReceiver},
};

/// Error returned by [`Pipeline::submit`] when no worker is left to accept frames.
///
/// Hands back the frame that could not be submitted.
pub struct PipelineClosed(pub Frame);

impl PipelineClosed {
    pub fn into_frame(self) -> Frame {
        self.0
    }
}

impl fmt::Debug for PipelineClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PipelineClosed(..)")
    }
}

impl fmt::Display for PipelineClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("all detection workers have exited")
    }
}

impl Error for PipelineClosed {}

/// What is left after a [`Pipeline`] has been shut down.
#[derive(Debug)]
pub struct Shutdown {
    /// Results that were published but not yet consumed, in the order they were published.
    pub pending: Vec<DetectionResult>,
    /// One report per worker, ordered by worker index.
    pub workers: Vec<WorkerReport>,
}

/// A running detection pipeline: a bounded input queue feeding a [`WorkerPool`] that publishes
/// into an unbounded result queue.
///
/// Every submitted frame is assigned a sequence number, starting at 0.
pub struct Pipeline {
    input: InputSender<Job>,
    results: ResultReceiver<DetectionResult>,
    pool: WorkerPool,
    next_seq: u64,
}

impl Pipeline {
    /// Validates `config` and starts the worker pool.
    ///
    /// See [`WorkerPool::start`] for how `factory` is used.
    pub fn start<D, F>(config: &PipelineConfig, factory: F) -> anyhow::Result<Self>
    where
        D: Detector + 'static,
        F: Fn(usize) -> anyhow::Result<D> + Send + Sync + 'static,
    {
        config.validate()?;

        let (input, input_recv) = input_queue(config.get_queue_capacity());
        let (result_sender, results) = result_queue();
        let pool = WorkerPool::start(config, input_recv, result_sender, factory)?;

        Ok(Self {
            input,
            results,
            pool,
            next_seq: 0,
        })
    }

    /// Enqueues a frame for detection and returns its sequence number.
    ///
    /// Blocks while the input queue is full. Fails only if every worker has exited.
    pub fn submit(&mut self, frame: Frame) -> Result<u64, PipelineClosed> {
        let seq = self.next_seq;
        match self.input.send(Job::new(seq, frame)) {
            Ok(()) => {
                self.next_seq += 1;
                Ok(seq)
            }
            Err(e) => Err(PipelineClosed(e.into_inner().into_frame())),
        }
    }

    /// Returns the number of frames submitted so far.
    pub fn submitted(&self) -> u64 {
        self.next_seq
    }

    /// Returns the number of frames waiting for a worker.
    pub fn queued(&self) -> usize {
        self.input.len()
    }

    /// Returns a finished result if one is available. Never blocks.
    pub fn try_result(&self) -> Option<DetectionResult> {
        self.results.try_recv()
    }

    /// Waits up to `timeout` for a result.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DetectionResult> {
        self.results.recv_timeout(timeout)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Closes the input queue and waits until the workers have processed every frame still in
    /// it.
    pub fn finish(self) -> Shutdown {
        let Self {
            input,
            results,
            pool,
            ..
        } = self;
        drop(input);
        let workers = pool.join();
        Shutdown {
            pending: results.drain(),
            workers,
        }
    }

    /// Stops the workers without processing the frames still in the input queue.
    ///
    /// Detections already in progress finish and their results are returned in
    /// [`Shutdown::pending`].
    pub fn stop(self) -> Shutdown {
        let Self {
            input,
            results,
            mut pool,
            ..
        } = self;
        pool.request_stop();
        drop(input);
        let workers = pool.join();
        Shutdown {
            pending: results.drain(),
            workers,
        }
    }
}
