//! Media lookups: file presence, durations via ffprobe, display-name remapping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, error, warn};

use crate::error::MediaError;

pub trait DurationLookup: Send + Sync {
    /// Duration in seconds.
    fn duration(&self, path: &Path) -> Result<f64, MediaError>;

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Shells out to `ffprobe` and caches results per path.
pub struct FfprobeDurations {
    program: String,
    cache: Mutex<HashMap<PathBuf, f64>>,
}

impl FfprobeDurations {
    pub fn new() -> Self {
        let program = std::env::var("LOOPCAST_FFPROBE").unwrap_or_else(|_| "ffprobe".to_string());
        Self { program, cache: Mutex::new(HashMap::new()) }
    }

    fn probe(&self, path: &Path) -> Result<f64, MediaError> {
        use std::process::Command;

        let out = Command::new(&self.program)
            .arg("-v").arg("error")
            .arg("-show_entries").arg("format=duration")
            .arg("-of").arg("default=noprint_wrappers=1:nokey=1")
            .arg(path)
            .output()
            .map_err(|e| MediaError::Probe { path: path.to_path_buf(), reason: e.to_string() })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(MediaError::Probe {
                path: path.to_path_buf(),
                reason: format!("{} exited with {}: {}", self.program, out.status, stderr.trim()),
            });
        }
        parse_probe_output(&String::from_utf8_lossy(&out.stdout))
            .ok_or_else(|| MediaError::Probe { path: path.to_path_buf(), reason: "no duration reported".into() })
    }
}

impl Default for FfprobeDurations {
    fn default() -> Self {
        Self::new()
    }
}

impl DurationLookup for FfprobeDurations {
    fn duration(&self, path: &Path) -> Result<f64, MediaError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(d) = cache.get(path) {
                return Ok(*d);
            }
        }
        if !path.is_file() {
            return Err(MediaError::NotFound(path.to_path_buf()));
        }
        let secs = self.probe(path)?;
        debug!("probed {}: {secs:.2}s", path.display());
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_path_buf(), secs);
        }
        Ok(secs)
    }
}

fn parse_probe_output(stdout: &str) -> Option<f64> {
    let secs: f64 = stdout.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

/// `{"name without extension": "display name"}` remapping.
#[derive(Debug, Clone, Default)]
pub struct AltNames {
    names: HashMap<String, String>,
}

impl AltNames {
    /// A missing or unreadable file yields an empty map.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                error!("unable to read alternate names file {}: {e}", path.display());
                return Self::default();
            }
        };
        match Self::from_json(&text) {
            Ok(names) => names,
            Err(e) => {
                error!("invalid alternate names file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut names = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            match value {
                serde_json::Value::String(s) => {
                    names.insert(key, s);
                }
                other => warn!("alternate name for {key:?} is not a string ({other}); ignoring"),
            }
        }
        Ok(Self { names })
    }

    pub fn display_name(&self, name: &str) -> String {
        self.names.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
