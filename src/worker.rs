//! Background threads with cooperative shutdown and bounded joins.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handed to the worker body; observes the stop request.
#[derive(Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
}

impl Shutdown {
    #[inline]
    pub fn is_requested(&self) -> bool {
        // a dropped sender counts as a stop request as well
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleeps for `timeout` unless stopped earlier. Returns `true` when stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

pub struct Worker {
    name: String,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Shutdown) + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            body(Shutdown { rx: stop_rx });
            let _ = done_tx.send(());
        })?;

        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Requests shutdown and waits up to `timeout` for the body to return.
    /// Returns `false` if the thread had to be detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }

        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    tracing::error!(worker = %self.name, "Worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not stop in time, detaching"
                );
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn stop_interrupts_wait() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();

        let mut worker = Worker::spawn("ticker", move |shutdown| {
            while !shutdown.wait(Duration::from_secs(60)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        assert!(worker.stop(Duration::from_secs(5)));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert!(worker.is_finished());
    }

    #[test]
    fn stuck_worker_is_detached() {
        let (release_tx, release_rx) = bounded::<()>(1);

        let mut worker = Worker::spawn("stuck", move |_shutdown| {
            let _ = release_rx.recv();
        })
        .unwrap();

        assert!(!worker.stop(Duration::from_millis(20)));
        release_tx.send(()).unwrap();
    }
}
