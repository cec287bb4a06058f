// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Background threads with cooperative shutdown.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// Handed to a worker body; tells it when to stop.
pub(crate) struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    /// Sleep for `period`. Returns false as soon as a stop is requested.
    pub(crate) fn wait(&self, period: Duration) -> bool {
        matches!(self.rx.recv_timeout(period), Err(RecvTimeoutError::Timeout))
    }
}

/// A named thread that runs until its stop channel disconnects.
pub(crate) struct Worker {
    name: &'static str,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let (stop, rx) = crossbeam_channel::bounded(0);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(StopSignal { rx }))?;
        Ok(Self { name, stop, handle })
    }

    /// Signal the worker and wait for it to exit.
    pub(crate) fn stop(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            tracing::error!(worker = self.name, "worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn stop_interrupts_long_wait() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let worker = Worker::spawn("test-worker", move |stop| {
            while stop.wait(Duration::from_secs(30)) {
                t.fetch_add(1, Ordering::Relaxed);
            }
        })
        .expect("spawn");

        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ticks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn worker_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let worker = Worker::spawn("test-ticker", move |stop| {
            while stop.wait(Duration::from_millis(1)) {
                t.fetch_add(1, Ordering::Relaxed);
            }
        })
        .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
        assert!(ticks.load(Ordering::Relaxed) >= 3);
    }
}
