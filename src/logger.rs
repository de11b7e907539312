use std::path::Path;

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use vision_broker_config::LogConfig;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("unknown log level `{0}`")]
    Level(String),
    #[error("cannot open log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid logging config: {0}")]
    Config(String),
    #[error(transparent)]
    Init(#[from] log::SetLoggerError),
}

/// Resolve the effective level; `verbose` forces debug.
pub fn level_filter(config: &LogConfig, verbose: bool) -> Result<LevelFilter, LogSetupError> {
    if verbose {
        return Ok(LevelFilter::Debug);
    }
    config
        .level
        .parse()
        .map_err(|_| LogSetupError::Level(config.level.clone()))
}

/// `<dir>/<YYYY-MM-DD-HH_MM>.log`
pub fn log_file_path(dir: &Path) -> std::path::PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    dir.join(format!("{timestamp}.log"))
}

/// Logs go to stderr, and additionally to a timestamped file when
/// `config.dir` is set.
pub fn setup_logging(config: &LogConfig, verbose: bool) -> Result<(), LogSetupError> {
    let level = level_filter(config, verbose)?;

    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(console)));
    let mut root = Root::builder().appender("stderr");

    if let Some(dir) = &config.dir {
        std::fs::create_dir_all(dir)?;
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(log_file_path(dir))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    let config = builder
        .build(root.build(level))
        .map_err(|e| LogSetupError::Config(e.to_string()))?;
    log4rs::init_config(config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        let config = LogConfig {
            level: "warn".into(),
            dir: None,
        };
        assert_eq!(level_filter(&config, false).unwrap(), LevelFilter::Warn);
        assert_eq!(level_filter(&config, true).unwrap(), LevelFilter::Debug);

        let bad = LogConfig {
            level: "chatty".into(),
            dir: None,
        };
        assert!(matches!(
            level_filter(&bad, false),
            Err(LogSetupError::Level(_))
        ));
    }

    #[test]
    fn test_log_file_name_is_timestamped() {
        let path = log_file_path(Path::new("logs"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        // e.g. 2026-10-14-09_30.log
        assert_eq!(name.len(), "2026-10-14-09_30.log".len());
        assert!(name.ends_with(".log"));
        assert!(path.starts_with("logs"));
    }
}
