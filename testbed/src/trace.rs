//! Diagnostic output for the harness.

use log::{LevelFilter, Metadata, Record};

struct StdoutTrace;

impl log::Log for StdoutTrace {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        println!("[{:<5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static TRACE: StdoutTrace = StdoutTrace;

/// Install the stdout sink as the global logger.
///
/// Idempotent: a second call (another test in the same process) only updates
/// the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&TRACE);
    log::set_max_level(level);
}
