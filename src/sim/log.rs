use crate::eventq::Cycle;

#[derive(PartialEq, PartialOrd, Debug, Default)]
pub enum LogLevel {
    #[default]
    None,
    Info,
    Debug,
}

impl LogLevel {
    fn as_str(&self) -> &str {
        match self {
            LogLevel::None => "NONE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

pub fn to_loglevel(ulevel: u64) -> LogLevel {
    match ulevel {
        0 => LogLevel::None,
        1 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

/// Component-level trace logger, cycle-stamped.  Distinct from the `log`
/// crate machinery so per-network instances can be silenced independently,
/// e.g. in tests.
pub struct Logger {
    level: LogLevel,
}

impl Logger {
    pub fn new(ulevel: u64) -> Self {
        let level = to_loglevel(ulevel);
        Logger { level }
    }

    pub fn silent() -> Self {
        Logger {
            level: LogLevel::None,
        }
    }

    pub fn log(&self, level: LogLevel, cycle: Cycle, args: std::fmt::Arguments<'_>) {
        if level > self.level {
            return;
        }
        println!("[{:>8}] [{}] {}", cycle, level.as_str(), args);
    }
}

#[macro_export]
macro_rules! log {
    // usage: log!(logger, level, now, "a {} event", "clock")
    ($logger:expr, $level:expr, $cycle:expr, $($arg:tt)+) => {{
        $logger.log($level, $cycle, format_args!($($arg)+));
    }};
}
#[macro_export]
macro_rules! info {
    ($logger:expr, $cycle:expr, $($arg:tt)+) => ( $crate::log!($logger, $crate::sim::log::LogLevel::Info, $cycle, $($arg)+); )
}
#[macro_export]
macro_rules! debug {
    ($logger:expr, $cycle:expr, $($arg:tt)+) => ( $crate::log!($logger, $crate::sim::log::LogLevel::Debug, $cycle, $($arg)+); )
}
