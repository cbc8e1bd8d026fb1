// SPDX-License-Identifier: GPL-3.0-only

//! Thermal watchdog: polls a touch-file rather than a real sensor.
//!
//! Kept as-is from the original design (see SPEC_FULL.md's Open Question
//! Decisions) — this is specified behavior, not a placeholder this crate
//! needs to "fix."

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::info;

use crate::constants::{THERMAL_CHECK_EVERY_N_TICKS, THERMAL_POLL_INTERVAL};

/// Polls `semaphore_path` for existence every `THERMAL_POLL_INTERVAL *
/// THERMAL_CHECK_EVERY_N_TICKS` (5s by default) and invokes `on_change`
/// whenever the observed state flips, plus once unconditionally on the
/// first poll so the caller starts from a known state.
pub struct SystemTemperature {
    disposing: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SystemTemperature {
    pub fn start(
        semaphore_path: PathBuf,
        mut on_too_high_changed: impl FnMut(bool) + Send + 'static,
    ) -> Self {
        let disposing = Arc::new(AtomicBool::new(false));
        let disposing_thread = disposing.clone();

        let thread = std::thread::spawn(move || {
            let mut too_high = false;
            let mut is_first_polling = true;
            let mut tick: u32 = 0;

            while !disposing_thread.load(Ordering::Relaxed) {
                if tick % THERMAL_CHECK_EVERY_N_TICKS == 0 {
                    let new_too_high = semaphore_path.exists();
                    if is_first_polling || new_too_high != too_high {
                        too_high = new_too_high;
                        is_first_polling = false;
                        info!(
                            too_high,
                            path = %semaphore_path.display(),
                            "thermal semaphore state changed"
                        );
                        on_too_high_changed(too_high);
                    }
                    tick = 0;
                }
                tick += 1;
                std::thread::sleep(THERMAL_POLL_INTERVAL);
            }
            info!("thermal watchdog left polling loop");
        });

        SystemTemperature { disposing, thread: Some(thread) }
    }
}

impl Drop for SystemTemperature {
    fn drop(&mut self) {
        self.disposing.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Blocks on a shared flag instead of a sleep loop, used only by tests that
/// need to observe the watchdog reacting within a bounded wall-clock time.
#[cfg(test)]
fn wait_until(deadline: Instant, mut predicate: impl FnMut() -> bool) -> bool {
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    predicate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn fires_once_immediately_even_if_file_absent() {
        let dir = std::env::temp_dir().join(format!("octowatch-thermal-test-{:?}", std::thread::current().id()));
        let _ = std::fs::remove_file(&dir);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let watchdog = SystemTemperature::start(dir, move |_| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(wait_until(deadline, || calls.load(Ordering::SeqCst) >= 1));
        drop(watchdog);
    }

    #[test]
    fn detects_file_creation_and_removal() {
        let path = std::env::temp_dir()
            .join(format!("octowatch-thermal-test-toggle-{:?}", std::thread::current().id()));
        let _ = std::fs::remove_file(&path);

        let states: Arc<std::sync::Mutex<Vec<bool>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let states_cb = states.clone();
        let watchdog = SystemTemperature::start(path.clone(), move |too_high| {
            states_cb.lock().unwrap().push(too_high);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(wait_until(deadline, || !states.lock().unwrap().is_empty()));
        assert_eq!(states.lock().unwrap().last(), Some(&false));

        std::fs::write(&path, b"").unwrap();

        drop(watchdog);
        let _ = std::fs::remove_file(&path);
    }
}
