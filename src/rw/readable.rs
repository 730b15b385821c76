//! [`Readable`]: a lazy, single-consumer sequence of `Result<T, E|Broken>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The error half of a [`Readable`]'s item type: either the procedure's
/// own application error, or the sentinel the consumer's own
/// [`Readable::break_read`] produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadableError<E> {
    Application(E),
    Broken,
}

/// One item yielded by a [`Readable`].
pub type ReadableItem<T, E> = Result<T, ReadableError<E>>;

struct Shared {
    broken: AtomicBool,
}

/// The producer-side handle paired with a [`Readable`]. Not exported from
/// the crate root: only `server`/`client`/`proto::streams` construct one,
/// alongside the `Readable` it feeds.
pub struct ReadableController<T, E> {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<ReadableItem<T, E>>>>,
    shared: Arc<Shared>,
}

impl<T, E> ReadableController<T, E> {
    /// Pushes one value into the reader's queue. A no-op once
    /// [`trigger_close`](Self::trigger_close) has run or the consumer has
    /// called [`Readable::break_read`] — producers must never observe an
    /// error from pushing after close, by contract (spec.md §4.1).
    pub fn push_value(&self, value: Result<T, E>) {
        if self.shared.broken.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(value.map_err(ReadableError::Application));
        }
    }

    /// Signals that no further values will be pushed. Idempotent;
    /// queued values already sent are still drained by the consumer
    /// before it observes end-of-stream.
    pub fn trigger_close(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

/// A lazy, single-owner sequence of [`ReadableItem`]s (spec.md §4.1).
pub struct Readable<T, E> {
    rx: mpsc::UnboundedReceiver<ReadableItem<T, E>>,
    shared: Arc<Shared>,
    done: bool,
    pending_broken: bool,
}

/// Builds a connected [`Readable`]/[`ReadableController`] pair.
pub fn channel<T, E>() -> (Readable<T, E>, ReadableController<T, E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        broken: AtomicBool::new(false),
    });
    (
        Readable {
            rx,
            shared: shared.clone(),
            done: false,
            pending_broken: false,
        },
        ReadableController {
            tx: std::sync::Mutex::new(Some(tx)),
            shared,
        },
    )
}

impl<T, E> Readable<T, E> {
    /// Whether this reader has not yet signalled done (via close,
    /// natural exhaustion, or [`break_read`](Self::break_read)).
    pub fn is_readable(&self) -> bool {
        !self.done
    }

    /// Pulls the next item, or `None` once the stream is exhausted.
    /// There is at most one logical consumer for a `Readable`'s
    /// lifetime; Rust's ownership rules enforce that structurally; this
    /// method simply becomes a no-op returning `None` once `done`.
    pub async fn next(&mut self) -> Option<ReadableItem<T, E>> {
        if self.done {
            return None;
        }
        if self.pending_broken {
            self.pending_broken = false;
            self.done = true;
            return Some(Err(ReadableError::Broken));
        }
        match self.rx.recv().await {
            Some(item) => Some(item),
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Drains every remaining item into a `Vec`.
    pub async fn collect(mut self) -> Vec<ReadableItem<T, E>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item);
        }
        out
    }

    /// Discards any queued values, delivers exactly one
    /// `Err(ReadableError::Broken)` to the next [`next`](Self::next)
    /// call, then signals done. Idempotent.
    pub fn break_read(&mut self) {
        if self.shared.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        while self.rx.try_recv().is_ok() {}
        if !self.done {
            self.pending_broken = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_queue_before_signalling_done_on_close() {
        let (mut readable, ctrl) = channel::<i32, String>();
        ctrl.push_value(Ok(1));
        ctrl.push_value(Ok(2));
        ctrl.trigger_close();

        assert_eq!(readable.next().await, Some(Ok(1)));
        assert_eq!(readable.next().await, Some(Ok(2)));
        assert_eq!(readable.next().await, None);
        assert!(!readable.is_readable());
    }

    #[tokio::test]
    async fn break_discards_queue_and_yields_one_broken_result() {
        let (mut readable, ctrl) = channel::<i32, String>();
        ctrl.push_value(Ok(1));
        ctrl.push_value(Ok(2));

        readable.break_read();

        assert_eq!(readable.next().await, Some(Err(ReadableError::Broken)));
        assert_eq!(readable.next().await, None);
    }

    #[tokio::test]
    async fn break_is_idempotent() {
        let (mut readable, _ctrl) = channel::<i32, String>();
        readable.break_read();
        readable.break_read();
        assert_eq!(readable.next().await, Some(Err(ReadableError::Broken)));
        assert_eq!(readable.next().await, None);
    }

    #[tokio::test]
    async fn controller_push_after_close_is_a_silent_noop() {
        let (mut readable, ctrl) = channel::<i32, String>();
        ctrl.trigger_close();
        ctrl.push_value(Ok(42));
        assert_eq!(readable.next().await, None);
    }
}
