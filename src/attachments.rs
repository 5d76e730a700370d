use crate::errors::{AppError, AppResult};
use crate::ids;
use crate::models::Attachment;
use crate::sanitize::sanitize_file_name;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "docx", "pdf", "txt", "md", "xlsx", "xls", "ppt", "pptx", "zip", "php", "js", "css", "html", "py",
];
pub const MAX_TASK_FILES: usize = 1;
pub const MAX_CATEGORY_FILES: usize = 10;

static TASK_STORED_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-f0-9]{24})_[a-f0-9]{12}\.[a-z0-9]+$").expect("valid regex"));
static CATEGORY_STORED_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^cat_([a-f0-9]{24})_[a-f0-9]{12}\.[a-z0-9]+$").expect("valid regex"));

/// Which kind of record owns a stored file. Decides the name prefix and the owner pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Task,
    Category,
}

impl AttachmentKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Task => "",
            Self::Category => "cat_",
        }
    }

    fn pattern(self) -> &'static Regex {
        match self {
            Self::Task => &TASK_STORED_PATTERN,
            Self::Category => &CATEGORY_STORED_PATTERN,
        }
    }

    pub fn is_stored_name(self, stored: &str) -> bool {
        self.pattern().is_match(stored)
    }

    /// True when `stored` is a generated name and embeds `owner_id`.
    pub fn belongs_to(self, stored: &str, owner_id: &str) -> bool {
        self.pattern()
            .captures(stored)
            .and_then(|caps| caps.get(1))
            .is_some_and(|owner| owner.as_str() == owner_id)
    }
}

/// What the transport layer reported for one upload slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Received,
    NoFile,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub status: UploadStatus,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn received(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            status: UploadStatus::Received,
            file_name: file_name.into(),
            bytes,
        }
    }

    pub fn missing() -> Self {
        Self {
            status: UploadStatus::NoFile,
            file_name: String::new(),
            bytes: Vec::new(),
        }
    }

    pub fn failed(file_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Failed(reason.into()),
            file_name: file_name.into(),
            bytes: Vec::new(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.status != UploadStatus::NoFile
    }
}

struct AcceptedUpload<'a> {
    original_name: String,
    extension: String,
    bytes: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
    kind: AttachmentKind,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>, kind: AttachmentKind) -> Self {
        Self { dir: dir.into(), kind }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stores at most `slots_available` uploads for `owner_id`.
    ///
    /// Every upload inside the slot window is validated before anything touches the disk, so a
    /// rejected file aborts the whole call without leaving earlier files behind. Uploads past the
    /// window are ignored.
    pub fn store(&self, uploads: &[Upload], owner_id: &str, slots_available: usize) -> AppResult<Vec<Attachment>> {
        if slots_available == 0 || !ids::is_record_id(owner_id) {
            return Ok(Vec::new());
        }

        let mut accepted = Vec::new();
        for upload in uploads {
            if accepted.len() >= slots_available {
                break;
            }
            match &upload.status {
                UploadStatus::NoFile => continue,
                UploadStatus::Failed(reason) => {
                    return Err(AppError::Upload(format!(
                        "One of the uploaded files failed to upload: {}",
                        reason
                    )));
                }
                UploadStatus::Received => {}
            }

            let original_name = sanitize_file_name(&upload.file_name);
            let extension = allowed_extension(&original_name).ok_or_else(|| {
                AppError::Upload(format!("Unsupported file type: '{}'", original_name))
            })?;
            accepted.push(AcceptedUpload {
                original_name,
                extension,
                bytes: &upload.bytes,
            });
        }

        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        ensure_private_dir(&self.dir).map_err(|error| {
            AppError::Upload(format!("Unable to create upload directory: {}", error))
        })?;

        let mut stored = Vec::with_capacity(accepted.len());
        for upload in accepted {
            let stored_name = format!(
                "{}{}_{}.{}",
                self.kind.prefix(),
                owner_id,
                ids::new_file_suffix(),
                upload.extension
            );
            if let Err(error) = write_private_file(&self.dir.join(&stored_name), upload.bytes) {
                self.delete_all(&stored);
                return Err(AppError::Upload(format!(
                    "Unable to store '{}': {}",
                    upload.original_name, error
                )));
            }
            tracing::debug!(stored = %stored_name, size = upload.bytes.len(), "stored attachment");
            stored.push(Attachment {
                name: upload.original_name,
                stored: stored_name,
                size: upload.bytes.len() as u64,
            });
        }

        Ok(stored)
    }

    /// Best-effort removal. Names outside the generated pattern are never touched.
    pub fn delete(&self, stored: &str) {
        let Some(path) = self.locate(stored) else {
            tracing::warn!(stored = %stored, "refusing to delete attachment with unexpected name");
            return;
        };
        if !path.is_file() {
            return;
        }
        if let Err(error) = fs::remove_file(&path) {
            tracing::warn!(path = %path.to_string_lossy(), error = %error, "failed to delete attachment");
        }
    }

    pub fn delete_all<'a>(&self, attachments: impl IntoIterator<Item = &'a Attachment>) {
        for attachment in attachments {
            self.delete(&attachment.stored);
        }
    }

    pub fn locate(&self, stored: &str) -> Option<PathBuf> {
        if self.kind.is_stored_name(stored) {
            Some(self.dir.join(stored))
        } else {
            None
        }
    }
}

fn allowed_extension(file_name: &str) -> Option<String> {
    if file_name.is_empty() {
        return None;
    }
    let (_, extension) = file_name.rsplit_once('.')?;
    let extension = extension.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&extension.as_str()).then_some(extension)
}

pub(crate) fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    let written = file.write_all(bytes).and_then(|_| file.sync_all());
    if written.is_err() {
        drop(file);
        let _ = fs::remove_file(path);
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "0123456789abcdef01234567";

    fn store(kind: AttachmentKind) -> (tempfile::TempDir, AttachmentStore) {
        let root = tempfile::tempdir().expect("temp dir");
        let store = AttachmentStore::new(root.path().join("uploads"), kind);
        (root, store)
    }

    #[test]
    fn stores_files_under_generated_names() {
        let (_root, store) = store(AttachmentKind::Category);
        let uploads = vec![Upload::received("../notes/Plan.PDF", b"%PDF".to_vec())];

        let stored = store.store(&uploads, OWNER, 10).expect("stored");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Plan.PDF");
        assert_eq!(stored[0].size, 4);
        assert!(stored[0].stored.starts_with(&format!("cat_{}_", OWNER)));
        assert!(stored[0].stored.ends_with(".pdf"));
        assert!(AttachmentKind::Category.belongs_to(&stored[0].stored, OWNER));
        assert_eq!(fs::read(store.dir().join(&stored[0].stored)).expect("read back"), b"%PDF");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.dir().join(&stored[0].stored))
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn extra_uploads_beyond_slots_are_ignored() {
        let (_root, store) = store(AttachmentKind::Category);
        let uploads: Vec<Upload> = (0..5)
            .map(|index| Upload::received(format!("file{}.txt", index), vec![b'x'; index + 1]))
            .chain(std::iter::once(Upload::received("malware.exe", Vec::new())))
            .collect();

        let stored = store.store(&uploads, OWNER, 3).expect("stored");
        assert_eq!(stored.len(), 3);
        assert_eq!(fs::read_dir(store.dir()).expect("dir").count(), 3);
    }

    #[test]
    fn missing_files_do_not_consume_slots() {
        let (_root, store) = store(AttachmentKind::Task);
        let uploads = vec![Upload::missing(), Upload::received("a.md", b"# a".to_vec())];
        let stored = store.store(&uploads, OWNER, 1).expect("stored");
        assert_eq!(stored.len(), 1);
        assert!(AttachmentKind::Task.belongs_to(&stored[0].stored, OWNER));
    }

    #[test]
    fn disallowed_extension_aborts_without_writing() {
        let (_root, store) = store(AttachmentKind::Category);
        let uploads = vec![
            Upload::received("ok.txt", b"fine".to_vec()),
            Upload::received("run.exe", b"MZ".to_vec()),
        ];
        let error = store.store(&uploads, OWNER, 10).expect_err("must reject");
        assert!(matches!(error, AppError::Upload(_)));
        assert!(!store.dir().exists() || fs::read_dir(store.dir()).expect("dir").count() == 0);
    }

    #[test]
    fn transport_failure_aborts() {
        let (_root, store) = store(AttachmentKind::Task);
        let uploads = vec![Upload::failed("big.zip", "exceeds size limit")];
        let error = store.store(&uploads, OWNER, 1).expect_err("must reject");
        assert!(error.to_string().contains("UPLOAD_FAILED"));
    }

    #[test]
    fn delete_refuses_names_outside_pattern() {
        let (root, store) = store(AttachmentKind::Task);
        fs::create_dir_all(store.dir()).expect("dir");
        let outside = root.path().join("secret.txt");
        fs::write(&outside, "keep").expect("write");

        store.delete("../secret.txt");
        assert!(outside.exists());

        let stored = store
            .store(&[Upload::received("x.txt", b"x".to_vec())], OWNER, 1)
            .expect("stored");
        store.delete(&stored[0].stored);
        assert!(!store.dir().join(&stored[0].stored).exists());
        // already gone: still silent
        store.delete(&stored[0].stored);
    }

    #[test]
    fn stored_name_patterns_are_kind_specific() {
        let task_name = format!("{}_0123456789ab.pdf", OWNER);
        let category_name = format!("cat_{}_0123456789ab.pdf", OWNER);
        assert!(AttachmentKind::Task.is_stored_name(&task_name));
        assert!(!AttachmentKind::Task.is_stored_name(&category_name));
        assert!(AttachmentKind::Category.is_stored_name(&category_name));
        assert!(!AttachmentKind::Category.belongs_to(&category_name, "ffffffffffffffffffffffff"));
    }
}
