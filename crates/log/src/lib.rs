//! Process-wide leveled logging to stderr, as text or one JSON object per line.
//!
//! Call [`init`] once at startup, then log through the `log_*!` macros.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    /// Maps the importer's numeric `--verbose` setting onto a level.
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => Self::Warn,
            1 => Self::Info,
            2 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static JSON: AtomicBool = AtomicBool::new(false);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);

pub fn init(config: LogConfig) {
    MAX_LEVEL.store(config.level as u8, Ordering::Relaxed);
    JSON.store(config.format == Format::Json, Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

/// Where a log line came from.
#[derive(Clone, Copy, Debug)]
pub struct Origin {
    pub target: &'static str,
    pub file: &'static str,
    pub line: u32,
}

pub fn log(level: Level, origin: Origin, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let format = if JSON.load(Ordering::Relaxed) {
        Format::Json
    } else {
        Format::Text
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let stamp = TIMESTAMPS.load(Ordering::Relaxed).then_some(now);
    let line = render(format, level, origin, stamp, args);
    let _ = writeln!(io::stderr().lock(), "{line}");
}

/// Renders one line without the trailing newline. JSON lines always carry
/// `ts_ms`; text lines only when `stamp` is set.
fn render(
    format: Format,
    level: Level,
    origin: Origin,
    stamp: Option<Duration>,
    args: fmt::Arguments<'_>,
) -> String {
    match format {
        Format::Text => match stamp {
            Some(now) => format!(
                "{}.{:03}Z {} {}: {args}",
                format_unix_secs(now.as_secs()).replace(' ', "T"),
                now.subsec_millis(),
                level.as_str(),
                origin.target
            ),
            None => format!("{} {}: {args}", level.as_str(), origin.target),
        },
        Format::Json => {
            let ts_ms = stamp
                .map(|now| u64::try_from(now.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default();
            json!({
                "ts_ms": ts_ms,
                "level": level.as_str(),
                "target": origin.target,
                "file": origin.file,
                "line": origin.line,
                "msg": args.to_string(),
            })
            .to_string()
        }
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log(
                $level,
                $crate::Origin { target: module_path!(), file: file!(), line: line!() },
                format_args!($($arg)*),
            );
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Trace, $($arg)*) };
}

const SECS_PER_DAY: u64 = 86_400;

/// Formats unix seconds as `YYYY-MM-DD HH:MM:SS` UTC.
pub fn format_unix_secs(unix_seconds: u64) -> String {
    let (year, month, day) = date_of_day(unix_seconds / SECS_PER_DAY);
    let second_of_day = unix_seconds % SECS_PER_DAY;
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}",
        second_of_day / 3600,
        second_of_day / 60 % 60,
        second_of_day % 60
    )
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Gregorian date of a day count since 1970-01-01.
fn date_of_day(mut days: u64) -> (u64, u64, u64) {
    let mut year = 1970;
    loop {
        let year_len = if is_leap(year) { 366 } else { 365 };
        if days < year_len {
            break;
        }
        days -= year_len;
        year += 1;
    }
    let february = if is_leap(year) { 29 } else { 28 };
    let month_lengths = [31, february, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 1;
    for length in month_lengths {
        if days < length {
            break;
        }
        days -= length;
        month += 1;
    }
    (year, month, days + 1)
}
