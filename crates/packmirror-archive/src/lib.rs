//! Archive patcher: replaces the metadata entry inside a downloaded zip
//! with re-pointed manifest text, leaving every other entry untouched.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use packmirror_core::ManifestKind;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

pub const CRATE_NAME: &str = "packmirror-archive";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive is not a readable zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("no `{expected}` entry found in archive")]
    EntryNotFound { expected: String },
}

/// What to do when the archive contains no metadata entry to patch.
/// `Fail` discards the download: an archive whose metadata still points at
/// the origin defeats the mirror. `UploadUnmodified` keeps the original
/// behavior of passing the archive through with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingEntryPolicy {
    #[default]
    Fail,
    UploadUnmodified,
}

/// Temporary local copy of an origin archive. The file is removed when the
/// value drops, which covers every failure path.
#[derive(Debug)]
pub struct DownloadedArchive {
    file: NamedTempFile,
}

impl DownloadedArchive {
    pub fn create() -> Result<Self, ArchiveError> {
        Ok(Self {
            file: NamedTempFile::new()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Archive ready for upload, with its backing temp file kept alive until
/// the upload has consumed it.
#[derive(Debug)]
pub struct PatchedArchive {
    file: NamedTempFile,
    pub entries_patched: usize,
}

impl PatchedArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Rewrite `archive` so that every entry whose base name equals
/// `kind.file_name()` contains `manifest_text`. Non-matching entries are
/// copied raw, compressed bytes and all.
pub fn patch_manifest_entry(
    archive: DownloadedArchive,
    kind: ManifestKind,
    manifest_text: &str,
    policy: MissingEntryPolicy,
) -> Result<PatchedArchive, ArchiveError> {
    let expected = kind.file_name();
    let source = File::open(archive.path())?;
    let mut reader = ZipArchive::new(source)?;

    let output = NamedTempFile::new()?;
    let mut writer = ZipWriter::new(output.reopen()?);
    let mut entries_patched = 0usize;

    for index in 0..reader.len() {
        let entry = reader.by_index_raw(index)?;
        let entry_name = entry.name().to_string();
        let base_name = entry_name.rsplit('/').next().unwrap_or(&entry_name);

        if !entry.is_dir() && base_name == expected {
            let options = SimpleFileOptions::default().compression_method(entry.compression());
            drop(entry);
            writer.start_file(&entry_name, options)?;
            writer.write_all(manifest_text.as_bytes())?;
            entries_patched += 1;
            debug!(entry = %entry_name, "replaced metadata entry");
        } else {
            writer.raw_copy_file(entry)?;
        }
    }
    writer.finish()?;

    if entries_patched == 0 {
        match policy {
            MissingEntryPolicy::Fail => {
                return Err(ArchiveError::EntryNotFound {
                    expected: expected.to_string(),
                });
            }
            MissingEntryPolicy::UploadUnmodified => {
                warn!(expected, "metadata entry missing; uploading archive unmodified");
                return Ok(PatchedArchive {
                    file: archive.file,
                    entries_patched: 0,
                });
            }
        }
    }

    Ok(PatchedArchive {
        file: output,
        entries_patched,
    })
}
