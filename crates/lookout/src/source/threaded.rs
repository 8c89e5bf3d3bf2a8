//! Reading a [`FrameSource`] on a background thread.

use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context};
use crossbeam::{
    channel::{self, Receiver},
    select,
};

use crate::{
    drop::defer,
    image::Frame,
    pool::{stop_signal, StopHandle, StopToken},
    timer::FpsCounter,
};

use super::FrameSource;

type Item = anyhow::Result<Option<Frame>>;

/// A [`FrameSource`] that reads another source on a dedicated thread.
///
/// The reader thread stays at most one frame ahead: it blocks until the previous frame has been
/// taken by [`FrameSource::read`]. This lets device latency (waiting for the next camera frame,
/// decoding) overlap with the caller's work.
pub struct ThreadedSource {
    frames: Receiver<Item>,
    stop: StopHandle,
    thread: Option<JoinHandle<()>>,
    done: bool,
}

impl ThreadedSource {
    /// Spawns a thread named `name` that opens the source by calling `open` and then reads it.
    ///
    /// The source is created on the reader thread, so it does not have to be [`Send`]. Errors
    /// returned by `open` are returned from this function.
    pub fn spawn<S, F>(name: &str, open: F) -> anyhow::Result<Self>
    where
        S: FrameSource,
        F: FnOnce() -> anyhow::Result<S> + Send + 'static,
    {
        let (frame_tx, frames) = channel::bounded(1);
        let (ready_tx, ready_rx) = channel::bounded(1);
        let (stop, token) = stop_signal();

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::trace!("{thread_name} reader starting");
                let _guard = defer(|| log::trace!("{thread_name} reader exiting"));

                let source = match open() {
                    Ok(source) => {
                        ready_tx.send(Ok(())).ok();
                        source
                    }
                    Err(e) => {
                        ready_tx.send(Err(e)).ok();
                        return;
                    }
                };
                drop(ready_tx);

                read_loop(&thread_name, source, &frame_tx, &token);
            })
            .with_context(|| format!("failed to spawn {name} reader thread"))?;

        let mut this = Self {
            frames,
            stop,
            thread: Some(thread),
            done: false,
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(this),
            Ok(Err(e)) => {
                this.stop();
                Err(e)
            }
            Err(_) => {
                this.stop();
                Err(anyhow!("{name} reader thread panicked while opening the source"))
            }
        }
    }
}

fn read_loop<S: FrameSource>(
    name: &str,
    mut source: S,
    frames: &channel::Sender<Item>,
    stop: &StopToken,
) {
    let mut fps = FpsCounter::new(name);
    loop {
        let item = source.read();
        let last = !matches!(item, Ok(Some(_)));
        select! {
            send(frames, item) -> res => if res.is_err() {
                break;
            },
            recv(stop.as_receiver()) -> _ => break,
        }
        if last {
            break;
        }
        fps.tick_with(source.timers());
    }
    source.stop();
}

impl FrameSource for ThreadedSource {
    fn read(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        match self.frames.recv() {
            Ok(item) => {
                if !matches!(item, Ok(Some(_))) {
                    self.done = true;
                }
                item
            }
            Err(_) => {
                self.done = true;
                Err(anyhow!("frame reader thread exited unexpectedly"))
            }
        }
    }

    /// Stops and joins the reader thread.
    ///
    /// If the reader is blocked inside the wrapped source, this waits until that call returns.
    fn stop(&mut self) {
        self.done = true;
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("frame reader thread panicked");
            }
        }
    }
}

impl Drop for ThreadedSource {
    fn drop(&mut self) {
        FrameSource::stop(self);
    }
}
