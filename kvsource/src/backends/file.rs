//! Static file backend.
//!
//! Reads YAML (or JSON) documents and flattens them into path keys:
//!
//! ```yaml
//! db:
//!   host: 10.0.0.3
//!   replicas: [a, b]
//! ```
//!
//! becomes `/db/host = 10.0.0.3`, `/db/replicas/0 = a`, `/db/replicas/1 = b`.
//! Configured directories are walked recursively and only files whose name
//! matches the filter glob are read. Files are re-read on every call, so
//! edits are picked up without restarting.

use async_trait::async_trait;
use regex::Regex;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, instrument};

use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::traits::{key_is_watched, key_under, KvPairs, StopSignal, StoreClient, WatchOutcome};
use crate::watch::{fingerprint, poll_until_changed};

/// Parameters for the file backend.
#[derive(Debug, Clone)]
pub struct FileParams {
    pub files: Vec<PathBuf>,
    pub filter: String,
    pub poll_interval: Duration,
}

/// Serves values parsed from local YAML/JSON files.
#[derive(Debug, Clone)]
pub struct FileStore {
    paths: Vec<PathBuf>,
    filter: Regex,
    poll_interval: Duration,
}

impl FileStore {
    /// Create a file store. Every configured path must exist.
    pub fn new(params: FileParams) -> Result<Self> {
        if params.files.is_empty() {
            return Err(BackendError::MissingField {
                backend: BackendKind::File,
                field: "files",
            });
        }

        for path in &params.files {
            if !path.exists() {
                return Err(BackendError::construction(
                    BackendKind::File,
                    format!("{} does not exist", path.display()),
                ));
            }
        }

        Ok(Self {
            paths: params.files,
            filter: glob_to_regex(&params.filter)?,
            poll_interval: params.poll_interval,
        })
    }

    /// Collect the files to read: plain files as configured, directories
    /// walked for names matching the filter.
    async fn source_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending: Vec<PathBuf> = Vec::new();

        for path in &self.paths {
            if fs::metadata(path).await?.is_dir() {
                pending.push(path.clone());
            } else {
                files.push(path.clone());
            }
        }

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            let mut found = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if self.matches_filter(&path) {
                    found.push(path);
                }
            }
            found.sort();
            files.extend(found);
        }

        Ok(files)
    }

    fn matches_filter(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| self.filter.is_match(name))
            .unwrap_or(false)
    }

    /// Parse every source file into one flat map. Later files win.
    async fn load(&self) -> Result<KvPairs> {
        let mut all = KvPairs::new();

        for path in self.source_files().await? {
            debug!("Reading {:?}", path);
            let content = fs::read_to_string(&path).await?;
            let document: Value = serde_yaml::from_str(&content).map_err(|e| {
                BackendError::decode(BackendKind::File, format!("{}: {}", path.display(), e))
            })?;
            flatten(&document, String::new(), &mut all);
        }

        Ok(all)
    }

    fn select(all: KvPairs, keys: &[String]) -> KvPairs {
        all.into_iter()
            .filter(|(k, _)| keys.iter().any(|key| key_under(k, key)))
            .collect()
    }
}

/// Flatten a YAML document into `/a/b/c` keys.
pub fn flatten(value: &Value, path: String, out: &mut KvPairs) {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let segment = match k {
                    Value::String(s) => s.clone(),
                    other => scalar_to_string(other),
                };
                flatten(v, format!("{}/{}", path, segment), out);
            }
        }
        Value::Sequence(seq) => {
            for (i, v) in seq.iter().enumerate() {
                flatten(v, format!("{}/{}", path, i), out);
            }
        }
        Value::Tagged(tagged) => flatten(&tagged.value, path, out),
        scalar => {
            let key = if path.is_empty() { "/".to_string() } else { path };
            out.insert(key, scalar_to_string(scalar));
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Compile a file-name glob (`*`, `?`, `[...]`) into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '[' => {
                pattern.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    pattern.push('^');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    if c == '\\' {
                        pattern.push('\\');
                    }
                    pattern.push(c);
                }
                pattern.push(']');
            }
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');

    Regex::new(&pattern)
        .map_err(|e| BackendError::InvalidConfig(format!("Invalid file filter '{}': {}", glob, e)))
}

#[async_trait]
impl StoreClient for FileStore {
    #[instrument(skip(self), fields(backend = "file"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        if keys.is_empty() {
            return Ok(KvPairs::new());
        }
        Ok(Self::select(self.load().await?, keys))
    }

    #[instrument(skip(self, stop), fields(backend = "file"))]
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        poll_until_changed(
            move || async move {
                let snapshot: KvPairs = self
                    .load()
                    .await?
                    .into_iter()
                    .filter(|(k, _)| key_under(k, prefix) && key_is_watched(k, keys))
                    .collect();
                Ok(fingerprint(&snapshot))
            },
            wait_index,
            self.poll_interval,
            stop,
        )
        .await
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::File
    }
}
