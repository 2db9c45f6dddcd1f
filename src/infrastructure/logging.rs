//! tracing subscriber setup for the CLI
//!
//! 콘솔과 파일 두 출력 중 설정된 것만 붙인다. 시간은 KST 로 찍고, 직전 실행의
//! 로그 파일은 시작할 때 타임스탬프 이름으로 옮긴 뒤 오래된 파일을 지운다.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Subscriber, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;
use crate::infrastructure::config::ConfigManager;

pub const LOG_FILE_NAME: &str = "matter-certis.log";

/// Dependency targets that stay at WARN unless the base level is TRACE
const QUIET_TARGETS: &[&str] = &["sqlx::query", "sqlx::sqlite", "h2", "runtime"];

lazy_static! {
    // non_blocking writer 는 guard 가 drop 되면 flush 를 멈춘다
    static ref FILE_GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());
}

fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix())
}

struct KstTimer;

impl FormatTime for KstTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Utc::now().with_timezone(&kst());
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f %Z"))
    }
}

/// `<data dir>/logs`, or `./logs` when the platform has no data directory
pub fn get_log_directory() -> PathBuf {
    match ConfigManager::get_app_data_dir() {
        Ok(dir) => dir.join("logs"),
        Err(_) => PathBuf::from("logs"),
    }
}

pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default(), &get_log_directory())
}

/// `RUST_LOG` takes precedence over the settings file.
///
/// ```bash
/// RUST_LOG="debug,sqlx::query=debug" matter-certis crawl
/// ```
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }

    let base = EnvFilter::try_new(&config.level)
        .with_context(|| format!("'{}' is not a usable log level", config.level))?;
    if config.level.eq_ignore_ascii_case("trace") {
        return Ok(base);
    }

    let mut targets: Vec<(&String, &String)> = config.module_filters.iter().collect();
    targets.sort();
    let mut directives = QUIET_TARGETS
        .iter()
        .map(|target| format!("{target}=warn"))
        .chain(targets.into_iter().map(|(target, level)| format!("{target}={level}")));

    directives.try_fold(base, |filter, directive| {
        let parsed = directive
            .parse()
            .with_context(|| format!("Bad filter directive '{directive}'"))?;
        Ok(filter.add_directive(parsed))
    })
}

fn file_layer<S>(config: &LoggingConfig, log_dir: &Path) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    if let Ok(mut guards) = FILE_GUARDS.lock() {
        guards.push(guard);
    }

    let layer = fmt::Layer::new().with_writer(writer).with_timer(KstTimer).with_ansi(false);
    if config.json_format {
        layer
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        layer.with_target(false).boxed()
    }
}

/// Installs the global subscriber. Fails if both outputs are disabled or a
/// subscriber is already installed.
pub fn init_logging_with_config(config: &LoggingConfig, log_dir: &Path) -> Result<()> {
    if !config.file_output && !config.console_output {
        bail!("Both console and file logging are disabled");
    }

    let mut removed = 0;
    if config.file_output {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Could not create {}", log_dir.display()))?;
        rotate_existing_log_file(log_dir, LOG_FILE_NAME, Utc::now())?;
        if config.auto_cleanup_logs {
            removed = cleanup_old_logs(log_dir, config)?;
        }
    }

    let file = config.file_output.then(|| file_layer(config, log_dir));
    let console = config
        .console_output
        .then(|| fmt::Layer::new().with_timer(KstTimer).with_target(false));

    Registry::default()
        .with(build_env_filter(config)?)
        .with(file)
        .with(console)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    info!("📝 Logging at '{}' (json files: {})", config.level, config.json_format);
    if config.file_output {
        info!("📁 Writing {} in {} ({} old files removed)", LOG_FILE_NAME, log_dir.display(), removed);
    }
    Ok(())
}

/// Moves `log_file_name` aside as `{stem}.{YYYYmmddTHHMMSS}.log`, stamped
/// with the file's modification time in KST.
fn rotate_existing_log_file(
    log_dir: &Path,
    log_file_name: &str,
    fallback_time: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    let current = log_dir.join(log_file_name);
    if !current.exists() {
        return Ok(None);
    }

    let stamp: DateTime<Utc> = std::fs::metadata(&current)
        .and_then(|meta| meta.modified())
        .map_or(fallback_time, Into::into);
    let stem = log_file_name.strip_suffix(".log").unwrap_or(log_file_name);
    let rotated = log_dir.join(format!(
        "{stem}.{}.log",
        stamp.with_timezone(&kst()).format("%Y%m%dT%H%M%S")
    ));

    std::fs::rename(&current, &rotated)
        .with_context(|| format!("Could not move {} aside", current.display()))?;
    Ok(Some(rotated))
}

/// Deletes `*.log` files beyond the retention count, oldest first.
fn cleanup_old_logs(log_dir: &Path, config: &LoggingConfig) -> Result<usize> {
    let mut logs = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) {
            logs.push((modified, path));
        }
    }
    logs.sort_by(|a, b| b.0.cmp(&a.0));

    let retain = if config.keep_only_latest { 1 } else { config.max_files as usize };
    let mut removed = 0;
    for (_, path) in logs.into_iter().skip(retain) {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Could not delete {}: {}", path.display(), e);
        } else {
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn log_system_info() {
    info!(
        "🖥️ matter-certis {} on {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_writes_to_both_outputs() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console_output && config.file_output);
    }

    #[test]
    fn log_directory_is_named_logs() {
        assert!(get_log_directory().ends_with("logs"));
    }

    #[test]
    fn module_filters_become_directives() {
        let config = LoggingConfig::default();
        assert!(build_env_filter(&config).is_ok());
    }

    #[test]
    fn custom_module_filter_is_accepted() {
        let mut config = LoggingConfig::default();
        config
            .module_filters
            .insert("matter_certis_crawler::application".into(), "debug".into());
        let filter = build_env_filter(&config).unwrap();
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(filter.to_string().to_lowercase().contains("matter_certis_crawler::application=debug"));
        }
    }

    #[test]
    fn invalid_module_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let mut config = LoggingConfig::default();
        config.module_filters.insert("sqlx".into(), "loud".into());
        assert!(build_env_filter(&config).is_err());
    }

    #[test]
    fn rotation_renames_previous_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOG_FILE_NAME), "old").unwrap();

        let rotated = rotate_existing_log_file(dir.path(), LOG_FILE_NAME, Utc::now())
            .unwrap()
            .unwrap();
        assert!(!dir.path().join(LOG_FILE_NAME).exists());
        assert!(rotated.exists());
    }

    #[test]
    fn cleanup_keeps_configured_number_of_files() {
        let dir = TempDir::new().unwrap();
        for i in 0..4 {
            std::fs::write(dir.path().join(format!("a{i}.log")), "x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let config = LoggingConfig {
            max_files: 2,
            ..LoggingConfig::default()
        };
        assert_eq!(cleanup_old_logs(dir.path(), &config).unwrap(), 2);
        assert!(dir.path().join("notes.txt").exists());
    }
}
