//! Test support for a runtime that is a process-wide singleton.
//!
//! Tests that touch the runtime or the `PGAS_` environment serialize on one
//! global lock. Tests that drive a multi-rank group run under a watchdog: a
//! wedged collective or a lost steal would otherwise hang the whole harness,
//! which is strictly worse than losing the run.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

lazy_static! {
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

/// Run a test while holding the global test lock. Anything that reads the
/// `PGAS_` environment (even just `Options::default()`) must take it.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    let _lock = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

/// Run a test with `PGAS_`-prefixed environment variables in place, under
/// the global test lock. The variables are removed again even when the test
/// panics, so one failing test cannot poison the options of the next.
pub fn with_env<F>(vars: &[(&str, String)], f: F)
where
    F: FnOnce(),
{
    let _lock = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for (key, val) in vars {
        std::env::set_var(format!("PGAS_{}", key), val);
    }
    let res = catch_unwind(AssertUnwindSafe(f));
    for (key, _) in vars {
        std::env::remove_var(format!("PGAS_{}", key));
    }
    if let Err(e) = res {
        resume_unwind(e);
    }
}

type WatchdogState = Arc<(Mutex<bool>, Condvar)>;

struct Disarm(WatchdogState, Option<JoinHandle<()>>);

impl Drop for Disarm {
    fn drop(&mut self) {
        *self.0 .0.lock().unwrap_or_else(|p| p.into_inner()) = true;
        self.0 .1.notify_all();
        if let Some(watchdog) = self.1.take() {
            let _ = watchdog.join();
        }
    }
}

/// Run a group-driving test body inline, with a watchdog thread that aborts
/// the test process if the body has not finished within `timeout_ms`. The
/// watchdog is disarmed on every exit path, including a panicking rank.
pub fn group_test<F>(timeout_ms: u64, f: F)
where
    F: FnOnce(),
{
    let state: WatchdogState = Arc::new((Mutex::new(false), Condvar::new()));
    let watchdog = {
        let state = state.clone();
        std::thread::spawn(move || {
            let (lock, cv) = &*state;
            let finished = lock.lock().unwrap();
            let (finished, _) = cv
                .wait_timeout_while(finished, Duration::from_millis(timeout_ms), |done| !*done)
                .unwrap();
            if !*finished {
                eprintln!(
                    "group test still running after {} ms; assuming a wedged rank, aborting",
                    timeout_ms
                );
                std::process::abort();
            }
        })
    };
    let _disarm = Disarm(state, Some(watchdog));
    f();
}
