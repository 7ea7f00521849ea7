use std::{
    fs::File,
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, OnceLock, RwLock,
    },
};

use log::{LevelFilter, Metadata, Record};

use crate::error::prelude::*;

static LOGGER: OnceLock<EngineLogger> = OnceLock::new();

/// Writes `[tag][LEVEL]: message` to stderr, and to an optional log file
/// named by `FORKSERVER_LOG_FILE`.
///
/// The file is opened lazily. [`quiesce`] drops it and keeps it closed until
/// [`resume`], so lines logged around a fork only reach stderr and the fd
/// table never sees a logger-owned descriptor.
pub struct EngineLogger {
    tag: RwLock<String>,
    sink_path: Option<PathBuf>,
    sink: Mutex<Option<File>>,
    quiesced: AtomicBool,
}

impl EngineLogger {
    fn new(tag: &str) -> Self {
        Self {
            tag: RwLock::new(tag.to_string()),
            sink_path: std::env::var_os("FORKSERVER_LOG_FILE").map(PathBuf::from),
            sink: Mutex::new(None),
            quiesced: AtomicBool::new(false),
        }
    }

    /// Installs the process-wide logger. Calling it twice is an error.
    pub fn setup(tag: &str) -> Result {
        let logger = LOGGER.get_or_init(|| Self::new(tag));
        log::set_logger(logger).map_err(|e| anyhow!("Couldn't install logger: {e}"))?;
        log::set_max_level(level_from_env());
        Ok(())
    }

    fn write_sink(&self, line: &str) {
        let Some(path) = &self.sink_path else {
            return;
        };
        if self.quiesced.load(Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if sink.is_none() {
            *sink = File::options().create(true).append(true).open(path).ok();
        }
        if let Some(file) = sink.as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }

    fn quiesce_sink(&self) {
        self.quiesced.store(true, Ordering::SeqCst);
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut file) = sink.take() {
            let _ = file.flush();
        }
    }
}

fn level_from_env() -> LevelFilter {
    let default = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    std::env::var("FORKSERVER_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl log::Log for EngineLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let tag = self.tag.read().unwrap_or_else(|e| e.into_inner());
            let line = format!("[{}][{}]: {}", tag, record.level(), record.args());
            eprintln!("{line}");
            self.write_sink(&line);
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Renames the tag on every following line, e.g. to the specialized process name.
pub fn set_tag(tag: &str) {
    if let Some(logger) = LOGGER.get() {
        *logger.tag.write().unwrap_or_else(|e| e.into_inner()) = tag.to_string();
    }
}

/// Flushes and closes any descriptor the logger holds. Lines logged until
/// [`resume`] go to stderr only.
pub fn quiesce() {
    if let Some(logger) = LOGGER.get() {
        logger.quiesce_sink();
    }
    let _ = std::io::stderr().flush();
}

/// Lets the file sink reopen on the next line.
pub fn resume() {
    if let Some(logger) = LOGGER.get() {
        logger.quiesced.store(false, Ordering::SeqCst);
    }
}

/// Fixed-capacity formatter for use inside signal handlers. Output past the
/// capacity is dropped.
pub struct StackWriter {
    buf: [u8; 256],
    len: usize,
}

impl StackWriter {
    pub const fn new() -> Self {
        Self {
            buf: [0; 256],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Writes the buffer plus a newline to stderr in one `write(2)`.
    pub fn emit(&mut self) {
        if self.len == self.buf.len() {
            self.len -= 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
        unsafe {
            libc::write(libc::STDERR_FILENO, self.buf.as_ptr().cast(), self.len);
        }
    }
}

impl Default for StackWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Write for StackWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Async-signal-safe logging: no allocation, no locks.
#[macro_export]
macro_rules! signal_log {
    ($($arg:tt)*) => {{
        let mut w = $crate::logging::StackWriter::new();
        let _ = core::fmt::Write::write_str(&mut w, "[forkserver][SIGCHLD]: ");
        let _ = core::fmt::Write::write_fmt(&mut w, format_args!($($arg)*));
        w.emit();
    }};
}

#[cfg(test)]
mod tests {
    use core::fmt::Write;

    use log::{Level, Log, Record};

    use super::*;

    fn file_logger(path: PathBuf) -> EngineLogger {
        EngineLogger {
            tag: RwLock::new("test".to_string()),
            sink_path: Some(path),
            sink: Mutex::new(None),
            quiesced: AtomicBool::new(false),
        }
    }

    #[test]
    fn quiesced_logger_keeps_its_file_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        let logger = file_logger(path.clone());

        logger.quiesce_sink();
        logger.log(&Record::builder().args(format_args!("hidden")).level(Level::Warn).build());
        assert!(!path.exists());
        assert!(logger.sink.lock().unwrap().is_none());

        logger.quiesced.store(false, Ordering::SeqCst);
        logger.log(&Record::builder().args(format_args!("shown")).level(Level::Warn).build());
        logger.quiesce_sink();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "[test][WARN]: shown\n");
    }

    #[test]
    fn stack_writer_truncates_instead_of_growing() {
        let mut w = StackWriter::new();
        for _ in 0..100 {
            write!(w, "pid {} ", 12345).unwrap();
        }
        assert_eq!(w.as_bytes().len(), 256);
        assert!(w.as_bytes().starts_with(b"pid 12345 "));
    }
}
