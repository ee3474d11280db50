//! The runtime's log sink. Records are tagged with the worker rank they were
//! emitted from; once coherence traces start interleaving across ranks, the
//! rank is the only context that makes them readable.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::env;

use crate::sched::Worker;

struct RankLogger;

impl Log for RankLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match Worker::try_current() {
            Some(worker) => println!(
                "[rank {}][{}:{}] {}",
                worker.index,
                record.level(),
                record.target(),
                record.args()
            ),
            // before init completes, or on a thread the runtime does not own
            None => println!(
                "[rank -][{}:{}] {}",
                record.level(),
                record.target(),
                record.args()
            ),
        }
    }

    fn flush(&self) {}
}

static LOGGER: RankLogger = RankLogger;

/// Install the rank-tagged logger. `RUST_LOG` selects the level (default
/// `warn`); if the embedding application installed its own logger first,
/// that one wins and the error is ignored by the caller.
pub fn init() -> Result<(), SetLoggerError> {
    let level = env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Warn);
    log::set_max_level(level);
    log::set_logger(&LOGGER)
}
