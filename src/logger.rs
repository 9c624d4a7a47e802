use crate::models::LogMessage;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append-only browser log file with a case-insensitive level filter.
pub struct LogWriter {
    file: Mutex<File>,
    levels: HashSet<String>,
    path: PathBuf,
}

impl LogWriter {
    /// Open `path` for appending, creating parent directories as needed.
    /// An empty `levels` list accepts every level.
    pub fn open<S: AsRef<str>>(path: impl AsRef<Path>, levels: &[S]) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let levels = levels
            .iter()
            .map(|level| level.as_ref().to_lowercase())
            .collect();

        Ok(LogWriter {
            file: Mutex::new(file),
            levels,
            path,
        })
    }

    pub fn accepts(&self, level: &str) -> bool {
        self.levels.is_empty() || self.levels.contains(&level.to_lowercase())
    }

    /// Append `msg` if its level passes the filter. Returns whether a line was written.
    pub fn write(&self, msg: &LogMessage) -> io::Result<bool> {
        if !self.accepts(&msg.level) {
            return Ok(false);
        }

        let line = format_line(msg);
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `[ts] [LEVEL] [url] source:line:column: message\n`, dropping the url and
/// location segments when they are empty.
pub fn format_line(msg: &LogMessage) -> String {
    let mut line = format!(
        "[{}] [{}]",
        msg.timestamp.to_log_string(),
        msg.level.to_uppercase()
    );

    if !msg.url.is_empty() {
        line.push_str(" [");
        line.push_str(&msg.url);
        line.push(']');
    }

    if !msg.source.is_empty() {
        line.push(' ');
        line.push_str(&msg.source);
        line.push_str(&format_location(msg.line, msg.column));
    }

    line.push_str(": ");
    line.push_str(&msg.message);
    line.push('\n');
    line
}

fn format_location(line: Option<u32>, column: Option<u32>) -> String {
    match (line.filter(|l| *l > 0), column.filter(|c| *c > 0)) {
        (Some(l), Some(c)) => format!(":{}:{}", l, c),
        (Some(l), None) => format!(":{}", l),
        (None, _) => String::new(),
    }
}
