//! Schema-validated, crash-safe JSON persistence.
//!
//! A value's Rust type is its schema: deserialization checks shape, and
//! [`Schema::validate`] checks the invariants serde cannot express. Writes go
//! to a temp file in the target directory and are renamed into place, so a
//! reader sees either the old or the new content, never a torn file.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::error::Category;
use uuid::Uuid;

use super::lock::LockManager;
use crate::{tlog_debug, tlog_trace, Error, Result};

/// A persisted document type.
pub trait Schema: Serialize + DeserializeOwned {
    /// Check invariants beyond the serde shape. The message ends up in
    /// `Error::SchemaViolation`.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl<T: Schema> Schema for Vec<T> {
    fn validate(&self) -> std::result::Result<(), String> {
        self.iter().try_for_each(Schema::validate)
    }
}

/// Atomic JSON reads and writes, plus locked read-modify-write.
#[derive(Debug, Clone, Copy, Default)]
pub struct Store {
    locks: LockManager,
}

impl Store {
    pub fn new(locks: LockManager) -> Self {
        Self { locks }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Read and validate the document at `path`.
    ///
    /// Absent file, malformed JSON and schema violations are reported as
    /// `FileNotFound`, `MalformedJson` and `SchemaViolation` respectively.
    pub fn read_validated<T: Schema>(&self, path: &Path) -> Result<T> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        let value: T = serde_json::from_str(&contents).map_err(|e| classify(path, e))?;
        value.validate().map_err(|message| Error::SchemaViolation {
            path: path.to_path_buf(),
            message,
        })?;
        tlog_trace!("Store::read_validated {}", path.display());
        Ok(value)
    }

    /// Like [`read_validated`](Self::read_validated) but maps an absent file to `None`.
    pub fn read_optional<T: Schema>(&self, path: &Path) -> Result<Option<T>> {
        match self.read_validated(path) {
            Ok(value) => Ok(Some(value)),
            Err(Error::FileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Validate, then atomically replace the document at `path`.
    pub fn write_atomic<T: Schema>(&self, path: &Path, value: &T) -> Result<()> {
        value.validate().map_err(|message| Error::SchemaViolation {
            path: path.to_path_buf(),
            message,
        })?;
        let bytes = serde_json::to_vec_pretty(value)?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let temp_path = temp_path_for(dir, path);
        let written = (|| -> Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, path)?;
            Ok(())
        })();

        if written.is_err() {
            let _ = fs::remove_file(&temp_path);
        } else {
            tlog_trace!("Store::write_atomic {} ({} bytes)", path.display(), bytes.len());
        }
        written
    }

    /// Delete the document at `path`.
    pub fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::FileNotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read every `*.json` document in `dir`, skipping dot-files (locks and
    /// in-flight temp files). A missing directory yields an empty list.
    pub fn list_json<T: Schema>(&self, dir: &Path) -> Result<Vec<T>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            if is_json && !is_hidden {
                paths.push(path);
            }
        }
        paths.sort();

        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            match self.read_validated(&path) {
                Ok(value) => values.push(value),
                // Deleted between read_dir and read.
                Err(Error::FileNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }

    /// Lock, read, mutate in place, write back, unlock.
    ///
    /// Nothing is written when `mutator` fails. The mutator's result is
    /// returned once the lock has been released.
    pub fn locked_update<T, R, F>(
        &self,
        lock_path: &Path,
        file_path: &Path,
        mutator: F,
    ) -> Result<R>
    where
        T: Schema,
        F: FnOnce(&mut T) -> Result<R>,
    {
        self.locks.with_lock(lock_path, || {
            let mut current: T = self.read_validated(file_path)?;
            let out = mutator(&mut current)?;
            self.write_atomic(file_path, &current)?;
            tlog_debug!("Store::locked_update {}", file_path.display());
            Ok(out)
        })
    }

    /// [`locked_update`](Self::locked_update) starting from `default()` when the
    /// file does not exist yet.
    pub fn locked_upsert<T, R, D, F>(
        &self,
        lock_path: &Path,
        file_path: &Path,
        default: D,
        mutator: F,
    ) -> Result<R>
    where
        T: Schema,
        D: FnOnce() -> T,
        F: FnOnce(&mut T) -> Result<R>,
    {
        self.locks.with_lock(lock_path, || {
            let mut current: T = self.read_optional(file_path)?.unwrap_or_else(default);
            let out = mutator(&mut current)?;
            self.write_atomic(file_path, &current)?;
            tlog_debug!("Store::locked_upsert {}", file_path.display());
            Ok(out)
        })
    }
}

fn temp_path_for(dir: &Path, target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("doc");
    dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

fn classify(path: &Path, err: serde_json::Error) -> Error {
    match err.classify() {
        Category::Data => Error::SchemaViolation {
            path: path.to_path_buf(),
            message: err.to_string(),
        },
        Category::Syntax | Category::Eof => Error::MalformedJson {
            path: path.to_path_buf(),
            source: err,
        },
        Category::Io => Error::Json(err),
    }
}
