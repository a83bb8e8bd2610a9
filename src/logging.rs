use anyhow::Result;
use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::Mutex;
use syslog::{Facility, Formatter3164};

type SyslogWriter = syslog::Logger<syslog::LoggerBackend, Formatter3164>;

pub struct LogOptions {
    /// Suppress stdout logging.
    pub quiet: bool,
    /// 0 = info, 1 = debug, 2+ = trace.
    pub verbosity: u8,
    /// Syslog ident.
    pub ident: String,
    /// Keep records in memory for failure notification.
    pub buffered: bool,
}

/// Logger fanning records out to stdout, the local syslog socket and an
/// optional in-memory buffer used to assemble failure mails.
pub struct CliLogger {
    quiet: bool,
    level: LevelFilter,
    syslog: Option<Mutex<SyslogWriter>>,
    buffer: Option<Mutex<Vec<String>>>,
}

impl CliLogger {
    /// Install the logger for the rest of the process lifetime.
    pub fn init(options: &LogOptions) -> Result<&'static CliLogger> {
        let level = match options.verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: options.ident.clone(),
            pid: std::process::id(),
        };

        // a missing syslog socket must not keep backups from running
        let syslog = match syslog::unix(formatter) {
            Ok(writer) => Some(Mutex::new(writer)),
            Err(e) => {
                eprintln!("could not connect to syslog: {}", e);
                None
            }
        };

        let logger: &'static CliLogger = Box::leak(Box::new(CliLogger {
            quiet: options.quiet,
            level,
            syslog,
            buffer: match options.buffered {
                true => Some(Mutex::new(Vec::new())),
                false => None,
            },
        }));

        log::set_logger(logger)?;
        log::set_max_level(level);

        Ok(logger)
    }

    /// All buffered records so far, or `None` when buffering is off or
    /// nothing was logged.
    pub fn buffered(&self) -> Option<String> {
        let buffer = self.buffer.as_ref()?.lock().ok()?;

        match buffer.is_empty() {
            true => None,
            false => Some(buffer.join("\n")),
        }
    }
}

impl Log for CliLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if !self.quiet {
            println!("{} {}", record.level(), record.args());
        }

        if let Some(syslog) = &self.syslog {
            if let Ok(mut writer) = syslog.lock() {
                let message = record.args().to_string();
                let _ = match record.level() {
                    Level::Error => writer.err(message),
                    Level::Warn => writer.warning(message),
                    Level::Info => writer.info(message),
                    Level::Debug | Level::Trace => writer.debug(message),
                };
            }
        }

        if let Some(buffer) = &self.buffer {
            if let Ok(mut buffer) = buffer.lock() {
                buffer.push(format!(
                    "{} {} {}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                ));
            }
        }
    }

    fn flush(&self) {}
}
