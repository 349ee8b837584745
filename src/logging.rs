//! log4rs setup for binaries, tests and benchmarks.
use crate::NasError;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

const PATTERN: &str = "{d(%H:%M:%S)} {l} {t} - {m}{n}";

fn config(level: LevelFilter, logfile: Option<&Path>) -> Result<Config, NasError> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let mut builder =
        Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
    let mut root = Root::builder().appender("stdout");
    if let Some(path) = logfile {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{l} - {m}\n")))
            .build(path)?;
        builder = builder.appender(Appender::builder().build("logfile", Box::new(file)));
        root = root.appender("logfile");
    }
    builder
        .build(root.build(level))
        .map_err(|e| NasError::Logging(e.to_string()))
}

/// Installs the global logger, optionally mirrored to `logfile`.
///
/// # Errors
/// If a logger is already installed or the log file cannot be opened.
pub fn init_logging(level: LevelFilter, logfile: Option<&Path>) -> Result<(), NasError> {
    log4rs::init_config(config(level, logfile)?)
        .map(|_| ())
        .map_err(|e| NasError::Logging(e.to_string()))
}
