//! Logging bootstrap for bridgesrv
//!
//! One `tracing` subscriber with up to three outputs:
//! - console, `timestamp [LEVEL] message`
//! - optional daily rolling file (plain or JSON)
//! - optional log mirror, a broadcast of formatted lines that a TCP log
//!   server can stream to remote clients

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::Writer,
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Request queued`
pub struct BracketedLevelFormat;

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
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Global guards for keeping non-blocking file writers alive
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Default capacity of the log mirror channel (lines)
pub const DEFAULT_MIRROR_CAPACITY: usize = 256;

// ============================================================================
// Log mirror
// ============================================================================

/// Broadcast of formatted log lines
///
/// Every subscriber gets its own receiver; lagging receivers lose lines
/// instead of slowing down the logger.
#[derive(Clone, Debug)]
pub struct LogBroadcast {
    tx: broadcast::Sender<Bytes>,
}

impl LogBroadcast {
    /// Create a mirror buffering up to `capacity` lines per receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a new receiver
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Send one line to every receiver, returns how many got it
    pub fn publish(&self, line: Bytes) -> usize {
        self.tx.send(line).unwrap_or(0)
    }

    /// Number of attached receivers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LogBroadcast {
    fn default() -> Self {
        Self::new(DEFAULT_MIRROR_CAPACITY)
    }
}

/// Per-event writer handed out by [`LogBroadcast`]
///
/// Buffers the formatted event and publishes it as one line on flush/drop.
pub struct BroadcastWriter {
    tx: broadcast::Sender<Bytes>,
    buf: Vec<u8>,
}

impl BroadcastWriter {
    fn publish(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = Bytes::from(std::mem::take(&mut self.buf));
        // No receivers attached is not an error for a mirror
        let _ = self.tx.send(line);
    }
}

impl Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for BroadcastWriter {
    fn drop(&mut self) {
        self.publish();
    }
}

impl<'a> MakeWriter<'a> for LogBroadcast {
    type Writer = BroadcastWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BroadcastWriter {
            tx: self.tx.clone(),
            buf: Vec::new(),
        }
    }
}

// ============================================================================
// Subscriber setup
// ============================================================================

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as log file prefix and filter target
    pub service_name: String,
    /// Level applied to the service crates when `RUST_LOG` is not set
    pub level: Level,
    /// Directory for the daily rolling file, `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Write the file output as JSON lines
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
    /// Optional log mirror
    pub mirror: Option<LogBroadcast>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: Level::INFO,
            log_dir: None,
            enable_json: false,
            ansi: true,
            mirror: None,
        }
    }
}

/// Parse a level name, falling back to INFO for unknown values
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Filter directive used when `RUST_LOG` is not set
///
/// Dependencies stay at INFO; the service and shared crates follow `level`.
pub fn default_directive(service_name: &str, level: Level) -> String {
    let target = service_name.replace('-', "_");
    let level = level.as_str().to_lowercase();
    format!("info,{target}={level},common={level}")
}

fn build_filter(config: &LogConfig) -> anyhow::Result<EnvFilter> {
    if let Ok(env_str) = std::env::var("RUST_LOG") {
        if !env_str.is_empty() {
            return Ok(EnvFilter::try_new(env_str)?);
        }
    }
    Ok(EnvFilter::try_new(default_directive(
        &config.service_name,
        config.level,
    ))?)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();

    layers.push(
        fmt::layer()
            .with_ansi(config.ansi)
            .event_format(BracketedLevelFormat)
            .boxed(),
    );

    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
        let appender =
            tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
        match guards.lock() {
            Ok(mut guards) => guards.push(guard),
            Err(poisoned) => poisoned.into_inner().push(guard),
        }

        let file_layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        layers.push(file_layer);
    }

    if let Some(mirror) = config.mirror.clone() {
        layers.push(
            fmt::layer()
                .with_writer(mirror)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    tracing::debug!(
        "Logging: {} @ {:?} (json: {}, mirror: {})",
        config.service_name,
        config.log_dir,
        config.enable_json,
        config.mirror.is_some()
    );

    Ok(())
}

/// Console-only initialization
pub fn init(service_name: &str, level: &str) -> anyhow::Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.to_string(),
        level: parse_level(level),
        ..Default::default()
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(
            default_directive("bridgesrv", Level::DEBUG),
            "info,bridgesrv=debug,common=debug"
        );
        assert_eq!(
            default_directive("my-bridge", Level::WARN),
            "info,my_bridge=warn,common=warn"
        );
    }

    #[test]
    fn test_broadcast_writer_publishes_one_line_per_event() {
        let mirror = LogBroadcast::new(8);
        let mut rx = mirror.subscribe();

        {
            let mut writer = mirror.make_writer();
            writer.write_all(b"2025-01-01T00:00:00Z ").unwrap();
            writer.write_all(b"[INFO] hello\n").unwrap();
        }

        let line = rx.try_recv().unwrap();
        assert_eq!(&line[..], b"2025-01-01T00:00:00Z [INFO] hello\n");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_without_receivers_is_silent() {
        let mirror = LogBroadcast::default();
        assert_eq!(mirror.receiver_count(), 0);
        let mut writer = mirror.make_writer();
        writer.write_all(b"dropped\n").unwrap();
        writer.flush().unwrap();
    }

    #[test]
    fn test_empty_writer_publishes_nothing() {
        let mirror = LogBroadcast::new(4);
        let mut rx = mirror.subscribe();
        drop(mirror.make_writer());
        assert!(rx.try_recv().is_err());
    }
}
