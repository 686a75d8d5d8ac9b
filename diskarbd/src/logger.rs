use flexi_logger::{DeferredNow, FileSpec, Logger, LoggerHandle, WriteMode};
use log::Record;
use std::io::Write;
use std::thread;

/// Initializes the logger with custom formatting.
///
/// Debug mode (`-d`) additionally mirrors log lines to stderr so a
/// foreground run is visible without tailing the log directory.
pub fn init_logger(debug: bool) -> Result<LoggerHandle, Box<dyn std::error::Error>> {
    let spec = if debug { "diskarbd=debug" } else { "diskarbd=info" };
    let mut logger = Logger::try_with_str(spec)?
        .log_to_file(FileSpec::default().directory("logs").suppress_timestamp())
        .write_mode(WriteMode::BufferAndFlush)
        .format(log_format);

    logger = if debug {
        logger.duplicate_to_stderr(flexi_logger::Duplicate::All)
    } else {
        logger.append()
    };

    Ok(logger.start()?)
}

/// Custom log line format: includes timestamp, level, source file/line, thread name, and message.
fn log_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} [{:<5}] [{}:{}] [{}] {}",
        now.format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.file().unwrap_or("<unknown>"),
        record.line().unwrap_or(0),
        thread::current().name().unwrap_or("<unnamed>"),
        &record.args()
    )
}
