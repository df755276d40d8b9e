use std::ffi::CString;
use std::io::IsTerminal;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    Terminal,
    Syslog,
}

/// Syslog only replaces the terminal logger when stderr is not a terminal.
pub fn choose_sink(syslog_requested: bool, stderr_is_terminal: bool) -> Sink {
    if syslog_requested && !stderr_is_terminal {
        Sink::Syslog
    } else {
        Sink::Terminal
    }
}

pub fn stderr_is_terminal() -> bool {
    std::io::stderr().is_terminal()
}

/// Installs the global logger. `ident` names the process in syslog.
pub fn init(ident: &str, verbose: bool, syslog_requested: bool) -> Result<Sink> {
    let (level, filter) = if verbose {
        (LevelFilter::Debug, "debug")
    } else {
        (LevelFilter::Info, "info")
    };
    let sink = choose_sink(syslog_requested, stderr_is_terminal());
    match sink {
        Sink::Terminal => {
            env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(filter),
            )
            .try_init()
            .map_err(|_| Error::Internal("logger already installed"))?;
        }
        Sink::Syslog => Syslog::install(ident, level)?,
    }
    Ok(sink)
}

/// `log` backend writing to the local syslog daemon.
pub struct Syslog {
    level: LevelFilter,
    // openlog keeps the pointer, so the ident lives as long as the logger.
    _ident: CString,
}

impl Syslog {
    pub fn install(ident: &str, level: LevelFilter) -> Result<()> {
        let ident = CString::new(ident)
            .map_err(|_| Error::InvalidSpec(format!("syslog ident {ident:?} contains NUL")))?;
        unsafe {
            libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
        }
        let logger: &'static Syslog = Box::leak(Box::new(Syslog {
            level,
            _ident: ident,
        }));
        log::set_logger(logger).map_err(|_| Error::Internal("logger already installed"))?;
        log::set_max_level(level);
        Ok(())
    }
}

fn priority(level: Level) -> libc::c_int {
    match level {
        Level::Error => libc::LOG_ERR,
        Level::Warn => libc::LOG_WARNING,
        Level::Info => libc::LOG_INFO,
        Level::Debug | Level::Trace => libc::LOG_DEBUG,
    }
}

impl Log for Syslog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let text = format!("{}", record.args()).replace('\0', "");
        let Ok(message) = CString::new(text) else {
            return;
        };
        unsafe {
            libc::syslog(
                priority(record.level()),
                b"%s\0".as_ptr() as *const libc::c_char,
                message.as_ptr(),
            );
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syslog_needs_request_and_no_terminal() {
        assert_eq!(choose_sink(true, false), Sink::Syslog);
        assert_eq!(choose_sink(true, true), Sink::Terminal);
        assert_eq!(choose_sink(false, false), Sink::Terminal);
    }

    #[test]
    fn levels_map_to_priorities() {
        assert_eq!(priority(Level::Error), libc::LOG_ERR);
        assert_eq!(priority(Level::Warn), libc::LOG_WARNING);
        assert_eq!(priority(Level::Trace), libc::LOG_DEBUG);
    }
}
