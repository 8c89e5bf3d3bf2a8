//! The two queues connecting the capture loop and the worker pool.
//!
//! - The *input queue* ([`input_queue`]) is bounded. Sending into a full queue blocks, which is how
//!   a slow worker pool throttles capture. Nothing is ever dropped.
//! - The *result queue* ([`result_queue`]) is unbounded. Workers never block when publishing a
//!   result, and the consumer polls it without blocking.
//!
//! Both are FIFO and wrap [`crossbeam::channel`]s. They are generic so their properties can be
//! tested independently of frames and detectors.

use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, SendError, TryRecvError};

/// Creates a bounded FIFO queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is 0. A zero-capacity channel would turn every send into a rendezvous,
/// which is not a queue.
pub fn input_queue<T>(capacity: usize) -> (InputSender<T>, InputReceiver<T>) {
    assert!(capacity > 0, "input queue capacity must be at least 1");
    let (sender, recv) = channel::bounded(capacity);
    (
        InputSender {
            inner: sender,
            capacity,
        },
        InputReceiver { inner: recv },
    )
}

/// The producing half of the input queue.
pub struct InputSender<T> {
    inner: channel::Sender<T>,
    capacity: usize,
}

impl<T> InputSender<T> {
    /// Appends `value` to the queue, blocking while the queue is full.
    ///
    /// Fails only if every [`InputReceiver`] has been dropped, handing `value` back.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.inner.send(value)
    }

    /// Returns the fixed capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of items currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns `true` if a [`InputSender::send`] would block right now.
    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }
}

/// The consuming half of the input queue.
///
/// Cloning the receiver lets several workers share the queue. Every item is delivered to exactly
/// one of them.
pub struct InputReceiver<T> {
    inner: channel::Receiver<T>,
}

impl<T> Clone for InputReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> InputReceiver<T> {
    /// Removes the oldest item from the queue, blocking while the queue is empty.
    ///
    /// Returns `None` once the [`InputSender`] is gone and the queue has been drained.
    pub fn recv(&self) -> Option<T> {
        self.inner.recv().ok()
    }

    pub(crate) fn as_crossbeam(&self) -> &channel::Receiver<T> {
        &self.inner
    }
}

/// Creates an unbounded FIFO queue.
pub fn result_queue<T>() -> (ResultSender<T>, ResultReceiver<T>) {
    let (sender, recv) = channel::unbounded();
    (ResultSender { inner: sender }, ResultReceiver { inner: recv })
}

/// The producing half of the result queue. Cloned into every worker.
pub struct ResultSender<T> {
    inner: channel::Sender<T>,
}

impl<T> Clone for ResultSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ResultSender<T> {
    /// Appends `value` to the queue. Never blocks.
    ///
    /// Fails only if the [`ResultReceiver`] has been dropped. If that happens, the caller should
    /// exit.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.inner.send(value)
    }
}

/// The consuming half of the result queue.
pub struct ResultReceiver<T> {
    inner: channel::Receiver<T>,
}

impl<T> ResultReceiver<T> {
    /// Returns the oldest queued item, or `None` if the queue is currently empty.
    ///
    /// This never blocks.
    pub fn try_recv(&self) -> Option<T> {
        match self.inner.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for an item.
    ///
    /// Returns `None` on timeout, or immediately once the queue is empty and all senders are gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.inner.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Removes and returns everything that is currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.inner.try_iter().collect()
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn full_queue_blocks_the_next_send() {
        for capacity in 1..=4 {
            let (sender, recv) = input_queue(capacity);
            let sent = Arc::new(AtomicUsize::new(0));

            let producer = thread::spawn({
                let sent = sent.clone();
                move || {
                    for i in 0..=capacity {
                        sender.send(i).unwrap();
                        sent.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });

            // Give the producer ample time to run into the full queue.
            thread::sleep(Duration::from_millis(100));
            assert_eq!(
                sent.load(Ordering::SeqCst),
                capacity,
                "send #{} did not block with capacity {capacity}",
                capacity + 1,
            );

            assert_eq!(recv.recv(), Some(0));
            producer.join().unwrap();
            assert_eq!(sent.load(Ordering::SeqCst), capacity + 1);
        }
    }

    #[test]
    fn blocked_send_resumes_after_delayed_consumer() {
        let (sender, recv) = input_queue(2);
        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            let mut items = Vec::new();
            while let Some(item) = recv.recv() {
                items.push(item);
            }
            items
        });

        let start = Instant::now();
        for i in 0..3 {
            sender.send(i).unwrap();
        }
        // The third send had to wait for the consumer to wake up.
        assert!(start.elapsed() >= Duration::from_millis(100));
        drop(sender);

        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn input_queue_is_fifo() {
        let (sender, recv) = input_queue(16);
        for i in 0..16 {
            sender.send(i).unwrap();
        }
        assert!(sender.is_full());
        assert_eq!(sender.len(), 16);
        assert_eq!(sender.capacity(), 16);
        drop(sender);

        let received = std::iter::from_fn(|| recv.recv()).collect::<Vec<_>>();
        assert_eq!(received, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn handles_clone_without_cloneable_items() {
        struct Opaque(u32);

        let (sender, recv) = input_queue(2);
        let worker = recv.clone();
        sender.send(Opaque(1)).unwrap();
        assert_eq!(worker.recv().map(|o| o.0), Some(1));

        let (results, collected) = result_queue();
        let other = results.clone();
        results.send(Opaque(2)).unwrap();
        other.send(Opaque(3)).unwrap();
        let seen = collected.drain().into_iter().map(|o| o.0).collect::<Vec<_>>();
        assert_eq!(seen, [2, 3]);
    }

    #[test]
    fn recv_ends_when_sender_is_gone() {
        let (sender, recv) = input_queue::<u8>(1);
        let other = recv.clone();
        drop(sender);
        assert_eq!(recv.recv(), None);
        assert_eq!(other.recv(), None);
    }

    #[test]
    fn send_fails_without_receivers() {
        let (sender, recv) = input_queue(1);
        drop(recv);
        assert_eq!(sender.send(7).unwrap_err().into_inner(), 7);
    }

    #[test]
    #[should_panic(expected = "at least 1")]
    fn zero_capacity_is_rejected() {
        input_queue::<()>(0);
    }

    #[test]
    fn result_queue_never_blocks() {
        let (sender, recv) = result_queue();
        assert_eq!(recv.try_recv(), None::<usize>);

        let start = Instant::now();
        for i in 0..100_000 {
            sender.send(i).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(recv.len(), 100_000);

        assert_eq!(recv.try_recv(), Some(0));
        assert_eq!(recv.try_recv(), Some(1));
        let rest = recv.drain();
        assert_eq!(rest.len(), 99_998);
        assert_eq!(rest.first(), Some(&2));
        assert!(recv.is_empty());
    }

    #[test]
    fn recv_timeout_returns_none_when_idle() {
        let (sender, recv) = result_queue::<()>();
        let start = Instant::now();
        assert_eq!(recv.recv_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));

        drop(sender);
        assert_eq!(recv.recv_timeout(Duration::from_secs(10)), None);
    }
}
