use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "postpilot.logs.jsonl";
const DEFAULT_FILTER: &str = "info";

/// Where log lines go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogOutput {
    Disabled,
    /// Compact human-readable lines on stderr. Stdout is left to command output.
    Stderr,
    /// One JSON object per line, appended to `dir/file_name`.
    JsonFile { dir: PathBuf, file_name: String },
}

/// Logging setup resolved from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directives, e.g. `info` or `postpilot_core=debug`.
    pub filter: String,
    pub output: LogOutput,
}

impl LogSettings {
    /// Reads:
    /// - `POSTPILOT_OBSERVABILITY`: `0`/`false`/`off` disables logging.
    /// - `POSTPILOT_LOG_LEVEL`, then `RUST_LOG`: filter directives (default `info`).
    /// - `POSTPILOT_JSON_LOG_PATH`: switch to JSONL output in that file.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("POSTPILOT_OBSERVABILITY")
            .and_then(|v| parse_flag(&v))
            .unwrap_or(true);

        // An unparsable override falls through to the next source.
        let filter = ["POSTPILOT_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(&lookup)
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty() && EnvFilter::try_new(v).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let output = if !enabled {
            LogOutput::Disabled
        } else {
            match lookup("POSTPILOT_JSON_LOG_PATH").filter(|p| !p.trim().is_empty()) {
                Some(raw) => json_file_output(Path::new(raw.trim())),
                None => LogOutput::Stderr,
            }
        };
        Self { filter, output }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn json_file_output(path: &Path) -> LogOutput {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    LogOutput::JsonFile { dir, file_name }
}

/// Installs the process-wide tracing subscriber from the environment.
///
/// Later calls, and calls after another subscriber was installed, are no-ops.
pub fn init_observability() {
    init_observability_with(LogSettings::from_env());
}

/// Same as `init_observability` with explicit settings.
pub fn init_observability_with(settings: LogSettings) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::new(&settings.filter);
        match settings.output {
            LogOutput::Disabled => {}
            LogOutput::Stderr => {
                let layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init();
            }
            LogOutput::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(&dir);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(false)
                    .with_writer(tracing_appender::rolling::never(dir, file_name));
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init();
            }
        }
    });
}
