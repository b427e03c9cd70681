use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logging setup, parsed from the environment into typed fields up front
/// so a bad `LOG_LEVEL` or `LOG_ROLLING` falls back at load time, not in
/// the middle of `init`.
///
/// Recognized variables: LOG_LEVEL, LOG_FILE_DIR, LOG_FILE_PREFIX,
/// LOG_ROLLING (`daily`, `hourly`, `minutely`), LOG_MAX_FILES.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: Level,
    pub dir: Option<PathBuf>,
    pub prefix: String,
    pub rotation: Rotation,
    pub max_files: usize,
}

impl LogOptions {
    pub fn from_env() -> Self {
        let level = std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|raw| Level::from_str(&raw).ok())
            .unwrap_or(Level::INFO);
        let rotation = match std::env::var("LOG_ROLLING").ok().as_deref() {
            Some("hourly") => Rotation::HOURLY,
            Some("minutely") => Rotation::MINUTELY,
            _ => Rotation::DAILY,
        };

        Self {
            level,
            dir: std::env::var("LOG_FILE_DIR").ok().map(PathBuf::from),
            prefix: std::env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| "modelrt".to_string()),
            rotation,
            max_files: std::env::var("LOG_MAX_FILES")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(3),
        }
    }

    /// Install the global subscriber. With a file dir the returned guard
    /// must stay alive for the process lifetime, or buffered lines are
    /// lost.
    pub fn init(self) -> anyhow::Result<Option<WorkerGuard>> {
        let Some(dir) = self.dir else {
            let _ = tracing_subscriber::fmt()
                .with_max_level(self.level)
                .try_init();
            return Ok(None);
        };

        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(self.rotation)
            .max_log_files(self.max_files)
            .filename_prefix(&self.prefix)
            .build(&dir)
            .with_context(|| format!("failed to create rolling appender in {}", dir.display()))?;

        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = tracing_subscriber::fmt()
            .with_max_level(self.level)
            .with_writer(writer)
            .try_init();

        tracing::info!("logging to {} (prefix {})", dir.display(), self.prefix);
        Ok(Some(guard))
    }
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            dir: None,
            prefix: "modelrt".to_string(),
            rotation: Rotation::DAILY,
            max_files: 3,
        }
    }
}

/// Lock-free per-call-site log limiter.
///
/// The mesh retry loop can fail every second for hours; one line per
/// interval with a suppressed count is all the signal that deserves.
/// A CAS on the next-emission timestamp elects the one caller that logs;
/// everyone else bumps the suppressed counter.
pub struct Throttle {
    started: Instant,
    interval_ms: u64,
    next_at_ms: AtomicU64,
    suppressed: AtomicU64,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            next_at_ms: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// `Some(suppressed)` when the caller won the right to emit.
    pub fn poll(&self) -> Option<u64> {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let due_at = self.next_at_ms.load(Ordering::Acquire);
        if now_ms < due_at {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let next = now_ms + self.interval_ms;
        match self
            .next_at_ms
            .compare_exchange(due_at, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => Some(self.suppressed.swap(0, Ordering::Relaxed)),
            Err(_) => {
                // someone else emitted this interval
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

/// Rate-limited `tracing::warn!`, one throttle per call site.
#[macro_export]
macro_rules! warn_throttled {
    ($interval:expr, $($arg:tt)*) => {{
        static _THROTTLE: std::sync::OnceLock<$crate::utils::logger::Throttle> =
            std::sync::OnceLock::new();
        let throttle = _THROTTLE.get_or_init(|| $crate::utils::logger::Throttle::new($interval));
        if let Some(_suppressed) = throttle.poll() {
            if _suppressed > 0 {
                tracing::warn!(suppressed = _suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_emits_then_suppresses() {
        let throttle = Throttle::new(Duration::from_secs(60));
        assert_eq!(throttle.poll(), Some(0));
        assert_eq!(throttle.poll(), None);
        assert_eq!(throttle.poll(), None);
    }

    #[test]
    fn zero_interval_never_suppresses() {
        let throttle = Throttle::new(Duration::ZERO);
        assert_eq!(throttle.poll(), Some(0));
        assert!(throttle.poll().is_some());
    }
}
