//! Process-wide tracing setup for brewline.
//!
//! `[general]` in the config picks the level, the format and an optional log
//! file; the command line only decides how far to move away from that level.
//! Output always goes to stderr so query commands keep stdout for JSON.
//!
//! ```ignore
//! use brewline_core::logging::{Verbosity, init_logging};
//!
//! init_logging(&config, Verbosity::from_flags(cli.verbose, true))?;
//! ```
//!
//! Events use these field names so JSON logs can be joined up:
//! `actor` (DID), `uri`, `record_type` (NSID), `endpoint` and `cursor`
//! (stream position in microseconds).

use std::io::{self, IsTerminal};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{Config, LogFormat};

/// Crates whose events follow the configured level; everything else is
/// held at `warn` unless tracing everything.
const OWN_TARGETS: [&str; 2] = ["brewline", "brewline_core"];

/// How far the command line moves logging away from `general.log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Warnings only: one-shot query commands.
    Quiet,
    /// Whatever `general.log_level` says.
    Configured,
    Debug,
    /// Trace for brewline, debug for its dependencies.
    Trace,
}

impl Verbosity {
    /// Map a `-v` count. Without flags, long-running commands log at the
    /// configured level and one-shot commands stay quiet.
    #[must_use]
    pub const fn from_flags(verbose: u8, long_running: bool) -> Self {
        match verbose {
            0 if long_running => Self::Configured,
            0 => Self::Quiet,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    ///
    /// A configured level that is already a directive (`target=level` or a
    /// list) is taken as written.
    #[must_use]
    pub fn directive(self, configured: &str) -> String {
        let scoped = |level: &str, rest: &str| {
            let own: Vec<String> = OWN_TARGETS.iter().map(|t| format!("{t}={level}")).collect();
            format!("{rest},{}", own.join(","))
        };
        match self {
            Self::Quiet => "warn".to_string(),
            Self::Configured if configured.contains(['=', ',']) => configured.to_string(),
            Self::Configured => scoped(configured.trim(), "warn"),
            Self::Debug => scoped("debug", "warn"),
            Self::Trace => scoped("trace", "debug"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to install log subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

type Sink = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// One formatted output. JSON events are flattened so correlation fields sit
/// at the top level next to `timestamp`.
fn sink<W>(format: LogFormat, writer: W, ansi: bool) -> Sink
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_target(true);
    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer
            .json()
            .with_timer(SystemTime)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber: stderr plus `general.log_file` when set.
///
/// `RUST_LOG` replaces the computed directive. Fails if a subscriber is
/// already installed.
pub fn init_logging(config: &Config, verbosity: Verbosity) -> Result<(), LogError> {
    let directive = verbosity.directive(&config.general.log_level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));
    let format = config.general.log_format;
    let log_file = config.log_file();

    let mut sinks = vec![sink(format, io::stderr, io::stderr().is_terminal())];
    if let Some(path) = &log_file {
        sinks.push(sink(format, Arc::new(open_log_file(path)?), false));
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(sinks)
        .try_init()?;

    tracing::debug!(%directive, log_format = %format, log_file = ?log_file, "logging ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Captures formatted output in memory.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(format: LogFormat, directive: &str, emit: impl FnOnce()) -> String {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(directive))
            .with(vec![sink(format, captured.clone(), false)]);
        tracing::subscriber::with_default(subscriber, emit);
        captured.text()
    }

    #[test]
    fn verbosity_follows_command_kind() {
        assert_eq!(Verbosity::from_flags(0, true), Verbosity::Configured);
        assert_eq!(Verbosity::from_flags(0, false), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(1, false), Verbosity::Debug);
        assert_eq!(Verbosity::from_flags(3, true), Verbosity::Trace);
    }

    #[test]
    fn directives_scope_levels_to_brewline() {
        assert_eq!(Verbosity::Quiet.directive("debug"), "warn");
        assert_eq!(
            Verbosity::Configured.directive("info"),
            "warn,brewline=info,brewline_core=info"
        );
        assert_eq!(
            Verbosity::Trace.directive("info"),
            "debug,brewline=trace,brewline_core=trace"
        );
        assert_eq!(
            Verbosity::Configured.directive("brewline_core::connector=trace"),
            "brewline_core::connector=trace"
        );
        for verbosity in [Verbosity::Quiet, Verbosity::Configured, Verbosity::Debug] {
            assert!(EnvFilter::try_new(verbosity.directive("info")).is_ok());
        }
    }

    #[test]
    fn json_logs_carry_correlation_fields() {
        let output = capture(LogFormat::Json, "info", || {
            tracing::info!(actor = "did:plc:abc", cursor = 1_700_000u64, "event indexed");
        });
        let line = output.lines().find(|line| !line.trim().is_empty()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();

        assert!(parsed.get("timestamp").is_some());
        assert_eq!(parsed["actor"], "did:plc:abc");
        assert_eq!(parsed["cursor"].as_u64(), Some(1_700_000));
        assert_eq!(parsed["message"], "event indexed");
    }

    #[test]
    fn quiet_pretty_logs_drop_info() {
        let output = capture(LogFormat::Pretty, &Verbosity::Quiet.directive("info"), || {
            tracing::info!("frame routed");
            tracing::warn!(endpoint = "wss://a.example", "firehose disconnected");
        });
        assert!(!output.contains("frame routed"));
        assert!(output.contains("firehose disconnected"));
        assert!(!output.contains('\u{1b}'), "file-style output must not carry ANSI codes");
    }

    #[cfg(unix)]
    #[test]
    fn log_file_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("brewline.log");
        drop(open_log_file(&path).unwrap());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
