//! Process-wide logger shared by the scanner, mempool and node crates.
//!
//! Records go to stderr as text or JSON lines. Per-target overrides let a
//! single pipeline run at `debug` while the rest of the process stays at
//! `info`, and the capture ring keeps recent records around for tests and
//! status reporting.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
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
        let lowered = raw.trim().to_ascii_lowercase();
        let level = match lowered.as_str() {
            "error" | "err" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return None,
        };
        Some(level)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Error,
            2 => Self::Warn,
            4 => Self::Debug,
            5 => Self::Trace,
            _ => Self::Info,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Module-prefix override, e.g. `chainscan_scanner=debug`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetLevel {
    pub prefix: String,
    pub level: Level,
}

impl TargetLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, level) = raw.split_once('=')?;
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return None;
        }
        Some(Self {
            prefix: prefix.replace('-', "_"),
            level: Level::parse(level)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    pub targets: Vec<TargetLevel>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            targets: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Record {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub msg: String,
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static GLOBAL_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static STDERR: AtomicBool = AtomicBool::new(true);
static TARGETS: OnceLock<RwLock<Vec<TargetLevel>>> = OnceLock::new();

static CAPTURE_ON: AtomicBool = AtomicBool::new(false);
static CAPTURE_CAP: AtomicUsize = AtomicUsize::new(0);
static CAPTURE: OnceLock<Mutex<VecDeque<Record>>> = OnceLock::new();

fn targets() -> &'static RwLock<Vec<TargetLevel>> {
    TARGETS.get_or_init(|| RwLock::new(Vec::new()))
}

pub fn init(config: LogConfig) {
    let mut overrides = config.targets;
    // Longest prefix first so the most specific override wins.
    overrides.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    let max = overrides
        .iter()
        .map(|target| target.level)
        .fold(config.level, Level::max);
    if let Ok(mut guard) = targets().write() {
        *guard = overrides;
    }
    GLOBAL_LEVEL.store(config.level as u8, Ordering::Relaxed);
    MAX_LEVEL.store(max as u8, Ordering::Relaxed);
    FORMAT.store(config.format as u8, Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn set_stderr_enabled(enabled: bool) {
    STDERR.store(enabled, Ordering::Relaxed);
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        CAPTURE_ON.store(false, Ordering::Relaxed);
        return;
    }
    CAPTURE_CAP.store(capacity, Ordering::Relaxed);
    CAPTURE.get_or_init(|| Mutex::new(VecDeque::new()));
    CAPTURE_ON.store(true, Ordering::Relaxed);
}

pub fn clear_capture() {
    if let Some(ring) = CAPTURE.get() {
        if let Ok(mut guard) = ring.lock() {
            guard.clear();
        }
    }
}

/// Most recent `limit` captured records, oldest first.
pub fn capture_snapshot(limit: usize) -> Vec<Record> {
    let Some(ring) = CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = ring.lock() else {
        return Vec::new();
    };
    let skip = guard.len().saturating_sub(limit);
    guard.iter().skip(skip).cloned().collect()
}

/// Cheap pre-check used by the macros before any formatting happens.
pub fn may_log(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

pub fn enabled(level: Level, target: &str) -> bool {
    if !may_log(level) {
        return false;
    }
    if let Ok(guard) = targets().read() {
        if let Some(rule) = guard
            .iter()
            .find(|rule| target.starts_with(rule.prefix.as_str()))
        {
            return level <= rule.level;
        }
    }
    level as u8 <= GLOBAL_LEVEL.load(Ordering::Relaxed)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level, target) {
        return;
    }

    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms = u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX);
    let msg = args.to_string();

    if STDERR.load(Ordering::Relaxed) {
        let mut out = io::stderr().lock();
        if FORMAT.load(Ordering::Relaxed) == Format::Json as u8 {
            let value = json!({
                "ts_ms": ts_ms,
                "level": level.as_str(),
                "target": target,
                "file": file,
                "line": line,
                "msg": msg,
            });
            let _ = writeln!(out, "{value}");
        } else {
            if TIMESTAMPS.load(Ordering::Relaxed) {
                let _ = write!(out, "{} ", Rfc3339(since_epoch));
            }
            let _ = writeln!(out, "{:<5} {target}: {msg}", level.as_str());
        }
    }

    if CAPTURE_ON.load(Ordering::Relaxed) {
        push_capture(Record {
            ts_ms,
            level,
            target,
            file,
            line,
            msg,
        });
    }
}

fn push_capture(record: Record) {
    let Some(ring) = CAPTURE.get() else {
        return;
    };
    let Ok(mut guard) = ring.lock() else {
        return;
    };
    let cap = CAPTURE_CAP.load(Ordering::Relaxed).max(1);
    while guard.len() >= cap {
        guard.pop_front();
    }
    guard.push_back(record);
}

pub fn current_level() -> Level {
    Level::from_u8(GLOBAL_LEVEL.load(Ordering::Relaxed))
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::may_log($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
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

struct Rfc3339(Duration);

impl fmt::Display for Rfc3339 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let (year, month, day) = date_from_unix_days((secs / 86_400) as i64);
        let rem = secs % 86_400;
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            rem / 3600,
            (rem / 60) % 60,
            rem % 60,
            self.0.subsec_millis()
        )
    }
}

// Proleptic Gregorian date for a day count since 1970-01-01, using
// 400-year eras starting on March 1st.
fn date_from_unix_days(days: i64) -> (i64, u32, u32) {
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097);
    let year_of_era =
        (day_of_era - day_of_era / 1_460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * month_index + 2) / 5 + 1) as u32;
    let month = if month_index < 10 {
        month_index + 3
    } else {
        month_index - 9
    } as u32;
    let year = year_of_era + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
