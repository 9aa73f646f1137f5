use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};

use crate::error::StorageError;

/// Flat key → value mapping persisted as one JSON object.
pub type SettingsDocument = Map<String, Value>;

/// JSON-backed key/value store with explicit load and save points.
///
/// Nothing is written until [`SettingsStore::commit`] is called.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    document: SettingsDocument,
    dirty: bool,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: SettingsDocument::new(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &SettingsDocument {
        &self.document
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Loads the document from disk, falling back to an empty one.
    ///
    /// A missing file is the normal first-run case. An unreadable or
    /// malformed file is logged and replaced in memory only; the file on disk
    /// is left as-is until the next commit.
    pub fn read(&mut self) -> SettingsDocument {
        match self.try_read() {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    cause = %source_of(&err),
                    "settings unreadable; continuing with empty settings"
                );
                self.replace(SettingsDocument::new());
                self.document.clone()
            }
        }
    }

    /// Strict load: only a missing file maps to an empty document.
    pub fn try_read(&mut self) -> Result<SettingsDocument, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no settings file yet");
                self.replace(SettingsDocument::new());
                return Ok(self.document.clone());
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let value: Value = serde_json::from_str(&raw).map_err(|source| StorageError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let Value::Object(document) = value else {
            return Err(StorageError::NotAnObject {
                path: self.path.clone(),
            });
        };

        tracing::debug!(
            path = %self.path.display(),
            keys = document.len(),
            "settings loaded"
        );
        self.replace(document);
        Ok(self.document.clone())
    }

    /// Writes the in-memory document to disk, replacing the previous file.
    pub fn commit(&mut self) -> Result<(), StorageError> {
        let json = to_pretty_json(&self.document).map_err(|source| StorageError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, json.as_bytes()).map_err(|source| StorageError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        tracing::debug!(
            path = %self.path.display(),
            keys = self.document.len(),
            "settings committed"
        );
        Ok(())
    }

    pub fn get_setting(&self, key: &str, default: Value) -> Value {
        self.document.get(key).cloned().unwrap_or(default)
    }

    pub fn set_setting(&mut self, key: impl Into<String>, value: Value) {
        self.document.insert(key.into(), value);
        self.dirty = true;
    }

    /// Removes `key`, returning its previous value.
    pub fn remove_setting(&mut self, key: &str) -> Option<Value> {
        let previous = self.document.remove(key);
        if previous.is_some() {
            self.dirty = true;
        }
        previous
    }

    fn replace(&mut self, document: SettingsDocument) {
        self.document = document;
        self.dirty = false;
    }
}

fn source_of(err: &StorageError) -> String {
    std::error::Error::source(err)
        .map(ToString::to_string)
        .unwrap_or_default()
}

fn to_pretty_json(document: &SettingsDocument) -> serde_json::Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(document, &mut serializer)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(contents)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
