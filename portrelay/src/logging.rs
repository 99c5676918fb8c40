//! Log sink setup: the `log` facade backed by env_logger, optionally duplicated to a
//! per-day file.

use crate::config::LoggingConfig;
use anyhow::Result;
use chrono::{Local, NaiveDate};
use log::LevelFilter;
use pretty_env_logger::env_logger::{self, Target};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Install the process-wide logger.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let mut builder = env_logger::builder();
    builder.filter_level(level_filter(config, verbose));
    match &config.directory {
        Some(directory) if config.enabled => {
            let file = DailyFile::new(directory)?;
            builder.format_timestamp_secs().target(Target::Pipe(Box::new(Tee { file })));
        }
        _ => {
            builder.format_timestamp(None);
        }
    }
    builder.try_init().map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Effective minimum level. `--verbose` wins over the configured level, `enabled: false` over both.
pub fn level_filter(config: &LoggingConfig, verbose: bool) -> LevelFilter {
    if !config.enabled {
        LevelFilter::Off
    } else if verbose {
        LevelFilter::Trace
    } else {
        config.level.trim().parse().unwrap_or(LevelFilter::Info)
    }
}

/// Appends to `<directory>/portrelay-YYYY-MM-DD.log`, switching files when the local date changes.
pub struct DailyFile {
    directory: PathBuf,
    current: Option<(NaiveDate, File)>,
}

impl DailyFile {
    pub fn new(directory: impl AsRef<Path>) -> std::io::Result<Self> {
        std::fs::create_dir_all(directory.as_ref())?;
        Ok(Self { directory: directory.as_ref().to_path_buf(), current: None })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.directory.join(format!("portrelay-{}.log", date.format("%Y-%m-%d")))
    }

    fn rotate(&mut self, today: NaiveDate) -> std::io::Result<()> {
        if self.current.as_ref().map(|(date, _)| *date) != Some(today) {
            let file = OpenOptions::new().create(true).append(true).open(self.path_for(today))?;
            self.current = Some((today, file));
        }
        Ok(())
    }
}

impl Write for DailyFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rotate(Local::now().date_naive())?;
        match self.current.as_mut() {
            Some((_, file)) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.current.as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

// Writes every line to stderr and to the day's file. A failing file never blocks stderr.
struct Tee {
    file: DailyFile,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        let _ = self.file.write_all(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        self.file.flush()
    }
}
