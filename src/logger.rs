//! Structured log sink interface, grounded on the teacher's `logger::Logger`/`LogLevel`.
//!
//! The executor owns one `Box<dyn Logger>` and streams every Terraform child-process line
//! through it at the context's requested `LogLevel`, so a host application can route logs
//! anywhere (stdout, a collector, a test buffer) without the engine knowing about it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Error
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        };
        f.write_str(s)
    }
}

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn clone_dyn(&self) -> Box<dyn Logger>;
}

impl Clone for Box<dyn Logger> {
    fn clone(&self) -> Self {
        self.clone_dyn()
    }
}

/// Forwards every line to `tracing`, matching the severity levels to the teacher's
/// `StdIoLogger` mapping.
#[derive(Clone, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => trace!("{message}"),
            LogLevel::Debug => debug!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
            LogLevel::Off => {}
        }
    }

    fn clone_dyn(&self) -> Box<dyn Logger> {
        Box::new(self.clone())
    }
}

/// Streams a Terraform child process's stdout/stderr into a `Logger` at the level requested by
/// the invocation context. stderr lines are always logged at `Error` severity regardless of the
/// configured level; `LogLevel::Off` suppresses all forwarding.
pub struct ProcessLogForwarder<'a> {
    logger: &'a dyn Logger,
    level: LogLevel,
}

impl<'a> ProcessLogForwarder<'a> {
    pub fn new(logger: &'a dyn Logger, level: LogLevel) -> Self {
        ProcessLogForwarder { logger, level }
    }

    pub fn forward_stdout(&self, line: &str) {
        if self.level == LogLevel::Off {
            return;
        }
        self.logger.log(self.level, line);
    }

    pub fn forward_stderr(&self, line: &str) {
        if self.level == LogLevel::Off {
            return;
        }
        self.logger.log(LogLevel::Error, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingLogger {
        lines: Arc<Mutex<Vec<(LogLevel, String)>>>,
    }

    impl Logger for RecordingLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }

        fn clone_dyn(&self) -> Box<dyn Logger> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn stderr_lines_are_always_logged_at_error() {
        let logger = RecordingLogger::default();
        let forwarder = ProcessLogForwarder::new(&logger, LogLevel::Trace);
        forwarder.forward_stderr("boom");
        assert_eq!(logger.lines.lock().unwrap()[0], (LogLevel::Error, "boom".to_string()));
    }

    #[test]
    fn off_suppresses_all_forwarding() {
        let logger = RecordingLogger::default();
        let forwarder = ProcessLogForwarder::new(&logger, LogLevel::Off);
        forwarder.forward_stdout("hello");
        forwarder.forward_stderr("boom");
        assert!(logger.lines.lock().unwrap().is_empty());
    }
}
