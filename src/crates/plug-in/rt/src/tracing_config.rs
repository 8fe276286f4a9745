//! Tracing configuration for the host and plug-in binaries
//!
//! Logs go to the systemd journal when the process runs as a journald
//! service and to stderr otherwise.

use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default log level filter (e.g., "info,plug_in_rt=debug")
    pub default_log_level: String,

    /// Whether to force stderr output (overrides journal detection)
    pub force_stderr: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_log_level: "info,plug_in_rt=debug".to_string(),
            force_stderr: false,
        }
    }
}

impl TracingConfig {
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.default_log_level = level.into();
        self
    }

    pub fn with_force_stderr(mut self, force: bool) -> Self {
        self.force_stderr = force;
        self
    }
}

/// Output destination for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Journal,
    Stderr,
}

impl LogOutput {
    /// systemd sets JOURNAL_STREAM for services whose stderr is the journal
    pub fn detect() -> Self {
        if std::env::var_os("JOURNAL_STREAM").is_some() {
            LogOutput::Journal
        } else {
            LogOutput::Stderr
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            LogOutput::Journal => "systemd journal",
            LogOutput::Stderr => "stderr",
        }
    }
}

/// Install the global subscriber.
///
/// Falls back to stderr when the journal socket cannot be reached. Calling
/// this twice leaves the first subscriber in place.
pub fn initialize_tracing(config: TracingConfig) {
    let mut output = if config.force_stderr {
        LogOutput::Stderr
    } else {
        LogOutput::detect()
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let journald_layer = match output {
        LogOutput::Journal => match tracing_journald::layer() {
            Ok(layer) => Some(layer),
            Err(e) => {
                eprintln!("cannot connect to journald ({}), logging to stderr", e);
                output = LogOutput::Stderr;
                None
            }
        },
        LogOutput::Stderr => None,
    };

    let result = match journald_layer {
        Some(layer) => registry.with(layer).try_init(),
        None => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_ansi(false);
            registry.with(fmt_layer).try_init()
        }
    };

    if result.is_ok() {
        tracing::debug!(output = ?output, "tracing initialized, logs to {}", output.description());
    }
}
