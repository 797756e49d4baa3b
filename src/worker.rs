// Background polling threads with an immediately-cancellable delay.
//
// The delay between ticks waits on a condition variable, so `stop()` wakes
// the thread right away instead of at the next tick boundary.

use log::{debug, error};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared cancellation flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *lock(flag) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep for `timeout` or until cancelled. Returns `true` if cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let guard = lock(flag);
        let (guard, _) = wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// A named thread running `tick` every `interval` until stopped. The first
/// tick comes one interval after spawning.
pub struct Worker {
    name: String,
    token: CancelToken,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn the loop. A tick that panics is logged and the loop carries on
    /// at the next interval.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut(&CancelToken) + Send + 'static,
    {
        let token = CancelToken::new();
        let thread_token = token.clone();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("{} started ({}ms interval)", thread_name, interval.as_millis());
                while !thread_token.sleep(interval) {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| tick(&thread_token)));
                    if let Err(payload) = result {
                        error!("{} tick panicked: {}", thread_name, panic_message(&*payload));
                    }
                }
                debug!("{} stopped", thread_name);
            })?;

        Ok(Self {
            name: name.to_string(),
            token,
            handle,
        })
    }

    /// Cancel and wait for the thread to exit. Safe to call from the worker
    /// thread itself, in which case it only cancels.
    pub fn stop(self) {
        self.token.cancel();
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            error!("{} exited with a panic", self.name);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
