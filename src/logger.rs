//! Logging setup for applications built on apex-calib
//!
//! The library only emits `tracing` events. Solver iteration tables and
//! problem layouts go to DEBUG, outlier rounds and final fit quality to INFO.
//! This module installs a subscriber that prints them as
//!
//! ```text
//! [INFO  12:04:31.207 calibration] Outlier round 1: marked 3 board corners, ...
//! [DEBUG 12:04:31.209 levenberg_marquardt.rs:712]   3  1.234560e2  ...
//! ```
//!
//! with the level colored when the writer supports ANSI escapes.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Install the subscriber at INFO, overridable through `RUST_LOG`.
///
/// # Example
/// ```no_run
/// use apex_calib::init_logger;
///
/// init_logger();
/// tracing::info!("Calibration started");
/// ```
///
/// ```bash
/// RUST_LOG=apex_calib::optimizer=debug cargo run
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the subscriber with `default_level` where `RUST_LOG` is silent.
///
/// Panics if a global subscriber is already set.
pub fn init_logger_with_level(default_level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .event_format(CalibFormatter)
        .init();
}

/// Like [`init_logger_with_level`], writing through the test harness and
/// returning `false` if a subscriber is already installed.
pub fn try_init_logger_with_level(default_level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .event_format(CalibFormatter)
        .with_test_writer()
        .try_init()
        .is_ok()
}

fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

/// Where an event came from: `file:line` for DEBUG and TRACE, otherwise the
/// target with the crate prefix dropped
fn origin(metadata: &tracing::Metadata<'_>) -> String {
    let detailed = matches!(*metadata.level(), Level::DEBUG | Level::TRACE);
    if detailed && let Some(file) = metadata.file() {
        let name = file.rsplit(['/', '\\']).next().unwrap_or(file);
        return match metadata.line() {
            Some(line) => format!("{name}:{line}"),
            None => name.to_string(),
        };
    }
    let target = metadata.target();
    target
        .strip_prefix("apex_calib::")
        .unwrap_or(target)
        .to_string()
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[34m",
        Level::TRACE => "\x1b[35m",
    }
}

struct CalibFormatter;

impl<S, N> FormatEvent<S, N> for CalibFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = metadata.level();
        if writer.has_ansi_escapes() {
            write!(writer, "[{}{:<5}\x1b[0m ", level_color(level), level.as_str())?;
        } else {
            write!(writer, "[{:<5} ", level.as_str())?;
        }
        write!(
            writer,
            "{} {}] ",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            origin(metadata)
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
