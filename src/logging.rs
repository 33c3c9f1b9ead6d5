use env_logger::Builder;
use log::{Level, LevelFilter, Record};
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1B[31m", // Red
        Level::Warn => "\x1B[33m",  // Yellow
        Level::Info => "\x1B[32m",  // Green
        Level::Debug => "\x1B[36m", // Cyan
        Level::Trace => "\x1B[35m", // Magenta
    }
}

fn write_record(buf: &mut impl Write, record: &Record, colored: bool) -> io::Result<()> {
    let level = record.level();
    let timestamp = humantime::format_rfc3339_millis(SystemTime::now());
    if colored {
        write!(buf, "{}{:>5}\x1B[0m", level_color(level), level)?;
    } else {
        write!(buf, "{:>5}", level)?;
    }
    write!(buf, " [{}] {}", timestamp, record.args())?;

    // Source location only at debug and below.
    if level >= Level::Debug {
        write!(
            buf,
            " - {}:{}",
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0)
        )?;
    }
    writeln!(buf)
}

/// Installs the global logger: `info` by default, `RUST_LOG` overrides.
pub fn setup_logging() {
    let colored = atty::is(atty::Stream::Stderr);
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_env("RUST_LOG")
        .format(move |buf, record| write_record(buf, record, colored))
        .init();
}

#[macro_export]
macro_rules! log_request {
    ($peer:expr, $request:expr) => {
        log::info!(
            "→ {} {} {} {}",
            $peer,
            $request.method,
            $request.target,
            $request.version
        )
    };
}

#[macro_export]
macro_rules! log_response {
    ($status:expr, $duration:expr, $body_bytes:expr) => {
        log::info!(
            "← {} {} ({:?}) - {} bytes",
            $status.code(),
            $status.reason(),
            $duration,
            $body_bytes
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($error:expr, $context:expr) => {
        log::error!("❌ {} - {}", $context, $error)
    };
}

/// Types that describe themselves in log lines.
pub trait Loggable {
    fn log_description(&self) -> String;
}

impl Loggable for str {
    fn log_description(&self) -> String {
        self.to_string()
    }
}

impl Loggable for Path {
    fn log_description(&self) -> String {
        self.display().to_string()
    }
}

pub trait LoggingExt: Loggable {
    /// Runs `f`, logging start and completion at trace and failure at error.
    fn log_operation<F, T, E>(&self, operation: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::fmt::Display;
}

impl<S: ?Sized + Loggable> LoggingExt for S {
    fn log_operation<F, T, E>(&self, operation: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::fmt::Display,
    {
        log::trace!("Starting {} on {}", operation, self.log_description());
        match f() {
            Ok(result) => {
                log::trace!("Completed {} on {}", operation, self.log_description());
                Ok(result)
            }
            Err(e) => {
                log::error!("Failed {} on {}: {}", operation, self.log_description(), e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::RecordBuilder;

    #[test]
    fn plain_info_line() {
        let mut buf = Vec::new();
        let record = RecordBuilder::new()
            .level(Level::Info)
            .args(format_args!("hello"))
            .file(Some("src/server.rs"))
            .line(Some(7))
            .build();
        write_record(&mut buf, &record, false).unwrap();
        let line = String::from_utf8(buf).unwrap();
        assert!(line.starts_with(" INFO ["));
        assert!(line.ends_with("] hello\n"));
    }

    #[test]
    fn debug_lines_carry_location() {
        let mut buf = Vec::new();
        let record = RecordBuilder::new()
            .level(Level::Debug)
            .args(format_args!("detail"))
            .file(Some("src/server.rs"))
            .line(Some(7))
            .build();
        write_record(&mut buf, &record, true).unwrap();
        let line = String::from_utf8(buf).unwrap();
        assert!(line.starts_with("\x1B[36mDEBUG\x1B[0m ["));
        assert!(line.ends_with("detail - src/server.rs:7\n"));
    }

    #[test]
    fn log_operation_passes_results_through() {
        let ok: Result<u8, String> = "op".log_operation("test", || Ok(3));
        assert_eq!(ok, Ok(3));
        let err: Result<u8, String> = Path::new("/tmp").log_operation("test", || Err("no".into()));
        assert_eq!(err, Err("no".to_string()));
    }
}
