//! Performance measurement tools.

use std::{
    cell::Cell,
    fmt::{self, Arguments},
    mem,
    sync::Mutex,
    time::{Duration, Instant},
};

const EMA_ALPHA: f32 = 0.3;

/// A timer that can measure and average the time an operation takes.
///
/// Collected timings are averaged and reset when the timer is displayed using `{}`
/// ([`std::fmt::Display`]).
pub struct Timer {
    name: &'static str,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Exponential moving average of the recorded durations, in seconds.
    avg: Option<f32>,
    /// The number of time measurements that contributed to the current `avg`.
    count: usize,
}

impl Timer {
    /// Creates a new timer.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
        }
    }

    /// Invokes a closure, measuring and recording the time it takes.
    pub fn time<T>(&self, timee: impl FnOnce() -> T) -> T {
        let _guard = self.start();
        timee()
    }

    /// Starts timing an operation using a drop guard.
    ///
    /// When the returned [`TimerGuard`] is dropped, the time between the call to `start` and the
    /// drop is measured and recorded.
    pub fn start(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    fn stop(&self, start: Instant) {
        let secs = start.elapsed().as_secs_f32();
        let mut state = self.state.lock().unwrap();
        state.avg = Some(match state.avg {
            Some(prev) => EMA_ALPHA * secs + (1.0 - EMA_ALPHA) * prev,
            None => secs,
        });
        state.count += 1;
    }
}

/// Displays the average recorded time and resets it.
impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut state = self.state.lock().unwrap();
        let State { avg, count } = mem::take(&mut *state);
        let avg_ms = avg.unwrap_or(0.0) * 1000.0;

        write!(f, "{}: {count}x{avg_ms:.01}ms", self.name)
    }
}

/// Cloning a timer resets its collected timings.
impl Clone for Timer {
    fn clone(&self) -> Self {
        Self::new(self.name)
    }
}

/// Guard returned by [`Timer::start`]. Stops timing the operation when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    timer: &'a Timer,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.stop(self.start);
    }
}

/// Logs frames per second with optional extra data.
pub struct FpsCounter {
    name: String,
    frames: u32,
    start: Instant,
}

impl FpsCounter {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            frames: 0,
            start: Instant::now(),
        }
    }

    /// Advances the frame counter by 1 and logs FPS if one second has passed.
    pub fn tick(&mut self) {
        self.tick_impl(format_args!(""));
    }

    /// Advances the frame counter by 1 and logs FPS and `extra` data if one second has passed.
    pub fn tick_with<D: fmt::Display, I: IntoIterator<Item = D>>(&mut self, extra: I) {
        struct DisplayExtra<D: fmt::Display, I: Iterator<Item = D>>(Cell<Option<I>>);

        impl<D: fmt::Display, I: Iterator<Item = D>> fmt::Display for DisplayExtra<D, I> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let Some(mut iter) = self.0.take() else {
                    return Ok(());
                };
                if let Some(first) = iter.next() {
                    write!(f, " ({first}")?;
                    for item in iter {
                        write!(f, ", {item}")?;
                    }
                    f.write_str(")")?;
                }
                Ok(())
            }
        }

        self.tick_impl(format_args!(
            "{}",
            DisplayExtra(Cell::new(Some(extra.into_iter())))
        ));
    }

    fn tick_impl(&mut self, args: Arguments<'_>) {
        self.frames += 1;
        if self.start.elapsed() > Duration::from_secs(1) {
            log::debug!("{}: {} FPS{}", self.name, self.frames, args);

            self.frames = 0;
            self.start = Instant::now();
        }
    }
}

/// Counts frames over a time span and computes their average rate.
///
/// Unlike [`FpsCounter`], which reports a sliding window, this measures the whole span between
/// [`ThroughputTracker::start`] and [`ThroughputTracker::stop`]. It has a single owner; counting
/// is a plain increment.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    name: String,
    frames: u64,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl ThroughputTracker {
    /// Creates a tracker that has not been started yet.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            frames: 0,
            start: None,
            end: None,
        }
    }

    /// Records the start time and resets the frame counter.
    ///
    /// Calling this again restarts the measurement.
    pub fn start(&mut self) -> &mut Self {
        self.frames = 0;
        self.start = Some(Instant::now());
        self.end = None;
        self
    }

    /// Counts one frame.
    #[inline]
    pub fn update(&mut self) {
        self.frames += 1;
    }

    /// Freezes the elapsed time (and therefore the rate).
    ///
    /// Stopping a tracker that was never started, or that is already stopped, does nothing.
    pub fn stop(&mut self) {
        if self.start.is_some() && self.end.is_none() {
            self.end = Some(Instant::now());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of frames counted since the last [`ThroughputTracker::start`].
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Returns the time since the tracker was started, up to when it was stopped.
    ///
    /// Returns zero if the tracker has not been started.
    pub fn elapsed(&self) -> Duration {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            (None, _) => Duration::ZERO,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// Returns the average number of frames per second.
    ///
    /// Returns 0.0 if no time has elapsed.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed_secs();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for ThroughputTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} frames in {:.2}s ({:.2} FPS)",
            self.name,
            self.frames,
            self.elapsed_secs(),
            self.rate(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn unstarted_tracker() {
        let mut tracker = ThroughputTracker::new("idle");
        tracker.update();
        assert_eq!(tracker.elapsed(), Duration::ZERO);
        assert_eq!(tracker.rate(), 0.0);
        tracker.stop();
        assert_eq!(tracker.elapsed(), Duration::ZERO);
    }

    #[test]
    fn rate_is_frames_over_elapsed() {
        let mut tracker = ThroughputTracker::new("test");
        tracker.start();
        for _ in 0..20 {
            tracker.update();
            thread::sleep(Duration::from_millis(10));
        }
        tracker.stop();

        assert_eq!(tracker.frames(), 20);
        let secs = tracker.elapsed_secs();
        assert!(secs >= 0.2, "{secs}");
        assert_relative_eq!(tracker.rate(), 20.0 / secs, max_relative = 1e-9);
        // 20 frames at a little over 10ms each.
        assert!(tracker.rate() <= 100.0);
        assert!(tracker.rate() > 20.0);
    }

    #[test]
    fn stop_freezes_elapsed() {
        let mut tracker = ThroughputTracker::new("frozen");
        tracker.start();
        tracker.update();
        thread::sleep(Duration::from_millis(5));
        tracker.stop();

        let elapsed = tracker.elapsed();
        let rate = tracker.rate();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(tracker.elapsed(), elapsed);
        assert_eq!(tracker.rate(), rate);

        // Stopping twice keeps the first end time.
        tracker.stop();
        assert_eq!(tracker.elapsed(), elapsed);
    }

    #[test]
    fn restart_resets_counter() {
        let mut tracker = ThroughputTracker::new("again");
        tracker.start().update();
        tracker.stop();
        tracker.start();
        assert_eq!(tracker.frames(), 0);
        assert!(tracker.to_string().starts_with("again: 0 frames in "));
    }

    #[test]
    fn timer_display_resets() {
        let timer = Timer::new("op");
        timer.time(|| thread::sleep(Duration::from_millis(2)));
        timer.time(|| ());
        let shown = timer.to_string();
        assert!(shown.starts_with("op: 2x"), "{shown}");
        assert_eq!(timer.to_string(), "op: 0x0.0ms");
    }
}
