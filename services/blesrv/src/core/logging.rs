//! Logging setup for the bridge service
//!
//! Console output uses `timestamp [LEVEL] message`. A daily rolling file can
//! be added; its writer guard must be kept alive for the process lifetime.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{BleSrvError, ErrorExt, Result};

/// Log file name prefix inside the log directory
const LOG_FILE_PREFIX: &str = "blesrv.log";

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `2026-01-02T03:04:05.123456Z [INFO] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
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
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Logging options resolved from CLI and configuration
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: String,
    pub ansi: bool,
    /// Directory for the daily log file; `None` logs to the console only
    pub file_dir: Option<String>,
}

/// Filter directive: `RUST_LOG` wins, otherwise `info,blesrv=<level>`
pub fn filter_directive(rust_log: Option<&str>, level: &str) -> String {
    match rust_log.map(str::trim) {
        Some(spec) if !spec.is_empty() => spec.to_string(),
        _ => format!("info,blesrv={},voltage_ble={}", level, level),
    }
}

/// Install the global subscriber. Returns the file writer guard when file
/// output is enabled.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(std::env::var("RUST_LOG").ok().as_deref(), &options.level);
    let filter = EnvFilter::try_new(&directive)
        .config_error(&format!("invalid log filter '{directive}'"))?;

    let console_layer = fmt::layer()
        .with_ansi(options.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, guard) = match &options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(Path::new(dir))
                .config_error(&format!("cannot create log directory '{dir}'"))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed();
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| BleSrvError::internal(format!("logging already initialized: {e}")))?;

    tracing::info!("[Logging] initialized with filter '{}'", directive);
    Ok(guard)
}
