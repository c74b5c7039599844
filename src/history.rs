//! Human-readable play history, capped to the most recent lines.

use std::path::{Path, PathBuf};

use time::macros::format_description;
use time::OffsetDateTime;
use tracing::error;

pub struct PlayHistory {
    path: Option<PathBuf>,
    length: usize,
}

impl PlayHistory {
    pub fn new(path: Option<PathBuf>, length: usize) -> Self {
        Self { path, length: length.max(1) }
    }

    pub fn disabled() -> Self {
        Self { path: None, length: 1 }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append `message`. Failures are logged and never propagate.
    pub fn record(&self, message: &str) {
        let Some(path) = &self.path else { return };
        let stamp = OffsetDateTime::now_local()
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
            .unwrap_or_default();
        if let Err(e) = append_capped(path, &format!("{stamp} - {message}"), self.length) {
            error!("unable to write play history to {}: {e}", path.display());
        }
    }
}

fn append_capped(path: &Path, line: &str, keep: usize) -> std::io::Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    let mut lines: Vec<&str> = existing.lines().collect();
    lines.push(line);
    let start = lines.len().saturating_sub(keep);
    let mut out = lines[start..].join("\n");
    out.push('\n');
    std::fs::write(path, out)
}
