//! Cancellable handle to the result of an asynchronous Dht operation.

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::DhtError;

/// Result of a Dht operation.
pub type DhtResult<T> = Result<T, DhtError>;

type Listener<T> = Box<dyn FnOnce(&DhtResult<T>) + Send>;

enum FutureState<T> {
    Pending(Vec<Listener<T>>),
    Done(DhtResult<T>),
}

/// Handle to an outstanding Dht operation.
///
/// A future completes exactly once, with a value, an error, or by being
/// cancelled. Listeners fire at most once; a listener added after completion
/// is called immediately on the calling thread.
///
/// Clones share the same state.
pub struct DhtFuture<T> {
    inner: Arc<Mutex<FutureState<T>>>,
}

impl<T> Clone for DhtFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for DhtFuture<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            FutureState::Pending(_) => "pending",
            FutureState::Done(Ok(_)) => "done",
            FutureState::Done(Err(DhtError::Cancelled)) => "cancelled",
            FutureState::Done(Err(_)) => "failed",
        };

        write!(f, "DhtFuture({})", state)
    }
}

impl<T: Clone + Send + 'static> DhtFuture<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FutureState::Pending(vec![]))),
        }
    }

    /// Returns a future that is already completed.
    pub(crate) fn completed(result: DhtResult<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FutureState::Done(result))),
        }
    }

    // === Getters ===

    /// Returns `true` once the future reached its terminal state.
    pub fn is_done(&self) -> bool {
        matches!(&*self.lock(), FutureState::Done(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.lock(), FutureState::Done(Err(DhtError::Cancelled)))
    }

    /// Returns the result if the future is done, without blocking.
    pub fn try_result(&self) -> Option<DhtResult<T>> {
        match &*self.lock() {
            FutureState::Done(result) => Some(result.clone()),
            FutureState::Pending(_) => None,
        }
    }

    // === Public Methods ===

    /// Cancel the operation. Returns `false` if it was already done.
    ///
    /// The operation stops issuing new requests; responses to requests
    /// already sent are ignored.
    pub fn cancel(&self) -> bool {
        self.complete(Err(DhtError::Cancelled))
    }

    /// Call `listener` with the result once the future is done.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&DhtResult<T>) + Send + 'static,
    {
        let result = {
            let mut state = self.lock();

            match &mut *state {
                FutureState::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                FutureState::Done(result) => result.clone(),
            }
        };

        listener(&result);
    }

    /// Block until the operation is done.
    pub fn wait(&self) -> DhtResult<T> {
        self.receiver().recv().unwrap_or(Err(DhtError::Closed))
    }

    /// Block until the operation is done, or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DhtResult<T>> {
        self.receiver().recv_timeout(timeout).ok()
    }

    #[cfg(feature = "async")]
    /// Wait for the operation to be done without blocking the executor.
    pub async fn wait_async(&self) -> DhtResult<T> {
        self.receiver()
            .recv_async()
            .await
            .unwrap_or(Err(DhtError::Closed))
    }

    // === Crate Methods ===

    pub(crate) fn set_value(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub(crate) fn set_error(&self, error: DhtError) -> bool {
        self.complete(Err(error))
    }

    // === Private Methods ===

    fn complete(&self, result: DhtResult<T>) -> bool {
        let listeners = {
            let mut state = self.lock();

            match std::mem::replace(&mut *state, FutureState::Done(result.clone())) {
                FutureState::Pending(listeners) => listeners,
                done => {
                    *state = done;
                    return false;
                }
            }
        };

        for listener in listeners {
            listener(&result);
        }

        true
    }

    fn receiver(&self) -> flume::Receiver<DhtResult<T>> {
        let (sender, receiver) = flume::bounded(1);

        self.add_listener(move |result| {
            let _ = sender.send(result.clone());
        });

        receiver
    }
}

impl<T> DhtFuture<T> {
    fn lock(&self) -> MutexGuard<'_, FutureState<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn single_terminal_transition() {
        let future = DhtFuture::<u32>::new();

        assert!(future.set_value(1));
        assert!(!future.set_value(2));
        assert!(!future.set_error(DhtError::NoContacts));
        assert!(!future.cancel());

        assert_eq!(future.try_result(), Some(Ok(1)));
        assert!(!future.is_cancelled());
    }

    #[test]
    fn cancel_after_done_does_not_refire_listeners() {
        let future = DhtFuture::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        future.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        future.set_value(7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(!future.cancel());
        assert!(!future.cancel());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(future.wait(), Ok(7));
    }

    #[test]
    fn late_listener_fires_synchronously_once() {
        let future = DhtFuture::<u32>::new();
        future.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        future.add_listener(move |result| {
            assert_eq!(result, &Err(DhtError::Cancelled));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(future.is_cancelled());
    }

    #[test]
    fn wait_across_threads() {
        let future = DhtFuture::<String>::new();

        let clone = future.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            clone.set_value("done".to_string());
        });

        assert_eq!(future.wait(), Ok("done".to_string()));
    }

    #[test]
    fn wait_timeout() {
        let future = DhtFuture::<u32>::new();

        assert!(future.wait_timeout(Duration::from_millis(10)).is_none());
        assert!(!future.is_done());
    }
}
