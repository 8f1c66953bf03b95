//! Tracing setup shared by the token media binaries
//!
//! Output goes to the console, a daily rotating file, or both, as text or
//! one JSON object per event. Every knob can be overridden with a `LOG_*`
//! environment variable (see [`LogConfig::merge_env`]).
//!
//! Log with fields, not formatted messages:
//!
//! ```rust,ignore
//! info!(token = %token, media_type = %media_type, "Media cached");
//! warn!(error = %e, url = %url, "Download failed");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tokenmedia_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::for_service("tokenmedia-server").merge_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("started");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Dependencies that are chatty at debug level
const QUIET_DEPENDENCIES: &[&str] = &[
    "aws_smithy_runtime=info",
    "aws_config=info",
    "hyper=info",
    "hyper_util=info",
    "reqwest=info",
    "h2=info",
    "sqlx=info",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            other => Err(anyhow!("LOG_OUTPUT must be console, file or both, got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// For log collectors
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("LOG_FORMAT must be text or json, got '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Only read when `output` includes a file
    pub log_dir: PathBuf,
    /// Rotated files are named `<prefix>.<date>`
    pub log_file_prefix: String,
    /// Comma separated directives applied after `level`, e.g. `sqlx=warn`
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "tokenmedia".to_string(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    /// Defaults for a named binary: file prefix, debug for its own crate and request spans
    pub fn for_service(name: &str) -> Self {
        Self::builder()
            .log_file_prefix(name)
            .filter_directives(format!("{}=debug,tower_http=debug", name.replace('-', "_")))
            .build()
    }

    /// Defaults overlaid with the environment
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Overlay `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_FILTER` and the `LOG_INCLUDE_*` flags.
    pub fn merge_env(self) -> Result<Self> {
        self.merge_from(|key| std::env::var(key).ok())
    }

    fn merge_from(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(level) = var("LOG_LEVEL") {
            self.level = parse_level(&level)?;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = var("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = var("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        self.include_location = flag(var("LOG_INCLUDE_LOCATION"), self.include_location);
        self.include_thread_ids = flag(var("LOG_INCLUDE_THREAD_IDS"), self.include_thread_ids);
        self.include_targets = flag(var("LOG_INCLUDE_TARGETS"), self.include_targets);

        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let configured = self.filter_directives.as_deref().unwrap_or_default();
        let directives = QUIET_DEPENDENCIES
            .iter()
            .copied()
            .chain(configured.split(','))
            .map(str::trim)
            .filter(|d| !d.is_empty());

        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());
        for directive in directives {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Invalid log filter directive '{directive}'"))?,
            );
        }
        Ok(filter)
    }
}

fn parse_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "warning" => Ok(Level::WARN),
        other => Level::from_str(other).map_err(|_| anyhow!("Invalid LOG_LEVEL '{raw}'")),
    }
}

/// Unset or unparseable values keep the current setting
fn flag(raw: Option<String>, current: bool) -> bool {
    match raw.as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => current,
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: Level) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Install the global subscriber; errors if one is already set.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);

    if config.output.console() {
        layers.push(event_layer(config, std::io::stdout, true));
    }
    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.log_dir.display())
        })?;
        let rolling = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(rolling);
        // Flushes on drop; the subscriber lives until exit
        std::mem::forget(guard);
        layers.push(event_layer(config, writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter()?)
        .try_init()
        .context("A global tracing subscriber is already installed")
}

fn event_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_service_defaults() {
        let config = LogConfig::for_service("tokenmedia-server");
        assert_eq!(config.log_file_prefix, "tokenmedia-server");
        assert_eq!(config.filter_directives.as_deref(), Some("tokenmedia_server=debug,tower_http=debug"));
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_environment_overrides() {
        let config = LogConfig::for_service("tokenmedia-server")
            .merge_from(env(&[
                ("LOG_LEVEL", "Warning"),
                ("LOG_OUTPUT", "all"),
                ("LOG_FORMAT", "json"),
                ("LOG_DIR", "/var/log/tokenmedia"),
                ("LOG_INCLUDE_TARGETS", "false"),
                ("LOG_INCLUDE_LOCATION", "maybe"),
            ]))
            .unwrap();

        assert_eq!(config.level, Level::WARN);
        assert!(config.output.console() && config.output.file());
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/tokenmedia"));
        assert!(!config.include_targets);
        assert!(!config.include_location);
        assert_eq!(config.log_file_prefix, "tokenmedia-server");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(LogConfig::default().merge_from(env(&[("LOG_LEVEL", "loud")])).is_err());
        assert!(LogConfig::default().merge_from(env(&[("LOG_OUTPUT", "syslog")])).is_err());

        let broken = LogConfig::builder().filter_directives("sqlx=verbose").build();
        assert!(broken.env_filter().is_err());
    }
}
