use crate::attachments::ensure_private_dir;
use crate::errors::{AppError, AppResult};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// A record persisted as one element of a JSON array file.
pub trait StoredRecord: Serialize + Sized {
    const KIND: &'static str;

    /// Re-validates one element read from disk. `None` drops it.
    fn from_stored(value: Value) -> Option<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport<R> {
    pub records: Vec<R>,
    pub dropped: usize,
}

impl<R> LoadReport<R> {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            dropped: 0,
        }
    }
}

/// The whole record set lives in one JSON array; every save rewrites it through a temp file and
/// a rename, so readers see either the previous or the next version of the file.
#[derive(Debug, Clone)]
pub struct JsonArrayStore<R> {
    path: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R: StoredRecord> JsonArrayStore<R> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|value| value.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Never fails: unreadable or malformed files load as an empty set.
    pub fn load(&self) -> LoadReport<R> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return LoadReport::empty(),
            Err(error) => {
                tracing::warn!(path = %self.path.to_string_lossy(), error = %error, "unable to read record file");
                return LoadReport::empty();
            }
        };

        let elements = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Array(elements)) => elements,
            Ok(_) => {
                tracing::warn!(path = %self.path.to_string_lossy(), "record file is not a JSON array");
                return LoadReport::empty();
            }
            Err(error) => {
                tracing::warn!(path = %self.path.to_string_lossy(), error = %error, "skipping malformed record file");
                return LoadReport::empty();
            }
        };

        let total = elements.len();
        let records: Vec<R> = elements.into_iter().filter_map(R::from_stored).collect();
        let dropped = total - records.len();
        if dropped > 0 {
            tracing::warn!(
                path = %self.path.to_string_lossy(),
                kind = R::KIND,
                dropped,
                "dropped invalid records while loading"
            );
        }

        LoadReport { records, dropped }
    }

    pub fn save(&self, records: &[R]) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            ensure_private_dir(parent).map_err(|error| {
                AppError::Persistence(format!("Unable to create data directory: {}", error))
            })?;
        }

        let payload = serde_json::to_vec_pretty(records)
            .map_err(|error| AppError::Persistence(format!("Unable to encode {} records: {}", R::KIND, error)))?;

        let temp_path = self.temp_path();
        if let Err(error) = write_synced(&temp_path, &payload) {
            let _ = fs::remove_file(&temp_path);
            return Err(AppError::Persistence(format!(
                "Unable to write temporary {} file: {}",
                R::KIND,
                error
            )));
        }

        if let Err(error) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(AppError::Persistence(format!("Unable to persist {} file: {}", R::KIND, error)));
        }

        restrict_to_owner(&self.path);
        sync_parent_dir(&self.path);
        tracing::debug!(path = %self.path.to_string_lossy(), count = records.len(), "saved records");
        Ok(())
    }
}

fn write_synced(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // a stale temp file keeps its old mode; tighten it before writing
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(payload)?;
    file.sync_all()
}

fn restrict_to_owner(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %path.to_string_lossy(), error = %error, "unable to restrict record file permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
