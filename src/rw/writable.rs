//! [`Writable`]: a single-owner sink that forwards writes to a
//! session-bound send function and fires a close callback exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("write after close")]
    Closed,
    #[error("value failed its declared schema: {0}")]
    SchemaInvalid(String),
}

type SendFn<T> = Box<dyn Fn(T) -> Result<(), WriteError> + Send + Sync>;
type CloseFn = Box<dyn FnOnce() + Send>;

/// A single-owner writable half-stream. Constructed by `proto::streams`
/// with a `send_fn` that stamps the owning `streamId` and hands the
/// value to the session's send path.
pub struct Writable<T> {
    send_fn: SendFn<T>,
    on_close: Mutex<Option<CloseFn>>,
    closed: AtomicBool,
}

impl<T> Writable<T> {
    pub fn new(
        send_fn: impl Fn(T) -> Result<(), WriteError> + Send + Sync + 'static,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Writable {
            send_fn: Box::new(send_fn),
            on_close: Mutex::new(Some(Box::new(on_close))),
            closed: AtomicBool::new(false),
        }
    }

    /// Writes a value. Fails loudly (returns `Err`) once closed, rather
    /// than silently dropping.
    pub fn write(&self, value: T) -> Result<(), WriteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::Closed);
        }
        (self.send_fn)(value)
    }

    /// Closes the writer. Idempotent; the close callback fires exactly
    /// once, on the call that actually transitions `closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = self.on_close.lock().unwrap().take() {
            cb();
        }
    }

    pub fn is_writable(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn write_after_close_fails() {
        let w = Writable::new(|_: i32| Ok(()), || {});
        w.close();
        assert_eq!(w.write(1), Err(WriteError::Closed));
        assert!(!w.is_writable());
    }

    #[test]
    fn close_fires_callback_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let w = Writable::new(|_: i32| Ok(()), move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        w.close();
        w.close();
        w.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writes_before_close_are_forwarded() {
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received2 = received.clone();
        let w = Writable::new(
            move |v: i32| {
                received2.lock().unwrap().push(v);
                Ok(())
            },
            || {},
        );
        w.write(1).unwrap();
        w.write(2).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![1, 2]);
    }
}
