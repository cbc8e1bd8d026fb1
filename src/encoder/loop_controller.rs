// SPDX-License-Identifier: GPL-3.0-only

//! The poll/deliver thread pair every `HardwareEncoder` runs: one thread
//! polls the V4L2 M2M device for dequeued input/output buffers, the other
//! drains the resulting payload queue to the consumer callback. Both threads
//! share the same start/flag/join shape, so it lives here once instead of
//! being duplicated in `hardware.rs`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Returned by a loop body to control whether the worker keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    Continue,
    Stop,
}

/// Which half of an encoder's poll/deliver pair a [`WorkerLoop`] drives.
/// A `HardwareEncoder` only ever spawns one of each, so the role (and its
/// thread name, for logging) is a fixed enum rather than a free-form `&str`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderRole {
    Poll,
    Deliver,
}

impl EncoderRole {
    fn thread_name(self) -> &'static str {
        match self {
            EncoderRole::Poll => "encoder-poll",
            EncoderRole::Deliver => "encoder-deliver",
        }
    }
}

/// Owns one background thread running `loop_body` until it returns
/// [`LoopStep::Stop`] or the owner calls [`WorkerLoop::stop`]. Dropping an
/// still-running `WorkerLoop` stops and joins it, so `HardwareEncoder::drop`
/// never has to remember the order by hand.
pub struct WorkerLoop {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    role: EncoderRole,
}

impl WorkerLoop {
    pub fn start<F>(role: EncoderRole, mut loop_body: F) -> Self
    where
        F: FnMut() -> LoopStep + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_thread = Arc::clone(&stop_signal);
        let name = role.thread_name();

        info!(name, "starting worker loop");

        let thread_handle = thread::spawn(move || {
            debug!(name, "worker loop thread started");
            loop {
                if stop_signal_thread.load(Ordering::SeqCst) {
                    debug!(name, "stop signal observed");
                    break;
                }
                match loop_body() {
                    LoopStep::Continue => {}
                    LoopStep::Stop => {
                        debug!(name, "loop body requested stop");
                        break;
                    }
                }
            }
            info!(name, "worker loop thread exiting");
        });

        WorkerLoop { thread_handle: Some(thread_handle), stop_signal, role }
    }

    /// Signals the thread to stop at its next iteration boundary and joins
    /// it. Safe to call more than once; a second call is a no-op.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.join();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                warn!(name = self.role.thread_name(), "worker loop thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn loop_runs_until_it_requests_stop() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_loop = Arc::clone(&counter);

        let mut worker = WorkerLoop::start(EncoderRole::Poll, move || {
            let count = counter_loop.fetch_add(1, Ordering::SeqCst);
            if count >= 10 { LoopStep::Stop } else { LoopStep::Continue }
        });

        worker.join();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn external_stop_signal_halts_the_loop() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_loop = Arc::clone(&counter);

        let mut worker = WorkerLoop::start(EncoderRole::Deliver, move || {
            counter_loop.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            LoopStep::Continue
        });

        thread::sleep(Duration::from_millis(50));
        worker.stop();
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn drop_stops_a_still_running_loop() {
        let worker = WorkerLoop::start(EncoderRole::Poll, || {
            thread::sleep(Duration::from_millis(100));
            LoopStep::Continue
        });
        drop(worker);
    }

    #[test]
    fn each_role_reports_its_own_thread_name() {
        assert_eq!(EncoderRole::Poll.thread_name(), "encoder-poll");
        assert_eq!(EncoderRole::Deliver.thread_name(), "encoder-deliver");
    }
}
