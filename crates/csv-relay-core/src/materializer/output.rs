//! Output artifacts and the registry of open stream handles.

use indexmap::IndexMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::row::{header_line, row_line};
use crate::config::ColumnAlignment;
use crate::error::MessageError;
use crate::message::Record;
use crate::Result;

/// Formats one data row from a record and the artifact's header
pub type RowFormatter = fn(&Record, &[String], ColumnAlignment) -> String;

/// Delete every regular file or symlink with `extension` in `dir`, creating
/// `dir` when it does not exist. Links are removed, never their targets.
/// Returns the number of entries removed.
pub fn cleanup_existing_outputs(dir: &Path, extension: &str) -> Result<usize> {
    std::fs::create_dir_all(dir)?;

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            std::fs::remove_file(&path)?;
            debug!("Removed previous output {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

/// One reconstructed file and its open writer
pub struct OutputArtifact {
    path: PathBuf,
    header: Vec<String>,
    writer: BufWriter<File>,
    rows: u64,
}

impl OutputArtifact {
    /// Create the file and write the header taken from `first`.
    ///
    /// An existing symlink at `path` is refused rather than written through.
    fn create(path: PathBuf, first: &Record) -> std::io::Result<Self> {
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if meta.file_type().is_symlink() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} is a symlink", path.display()),
                ));
            }
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(header_line(first).as_bytes())?;

        Ok(Self {
            path,
            header: first.keys().cloned().collect(),
            writer,
            rows: 0,
        })
    }

    fn append(
        &mut self,
        record: &Record,
        alignment: ColumnAlignment,
        format: RowFormatter,
    ) -> std::io::Result<()> {
        self.writer
            .write_all(format(record, &self.header, alignment).as_bytes())?;
        self.rows += 1;
        Ok(())
    }

    /// Path of the artifact on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column names written as the header
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Data rows written so far
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

/// Per-artifact totals reported when the registry is closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedArtifact {
    pub source: String,
    pub rows: u64,
}

/// Open output artifacts keyed by source name.
///
/// The registry is owned by the materializer loop; handles are created on
/// the first message for a source and live until [`close_all`](Self::close_all).
pub struct OutputRegistry {
    dir: PathBuf,
    alignment: ColumnAlignment,
    format_row: RowFormatter,
    artifacts: IndexMap<String, OutputArtifact>,
}

impl OutputRegistry {
    pub fn new(dir: impl Into<PathBuf>, alignment: ColumnAlignment) -> Self {
        Self {
            dir: dir.into(),
            alignment,
            format_row: row_line,
            artifacts: IndexMap::new(),
        }
    }

    /// Replace the row formatter; the header is always written as-is.
    pub fn with_row_formatter(mut self, format_row: RowFormatter) -> Self {
        self.format_row = format_row;
        self
    }

    /// Append `record` to the artifact for `source`, creating it first if needed.
    pub fn write_record(
        &mut self,
        source: &str,
        record: &Record,
    ) -> std::result::Result<(), MessageError> {
        let write_error = |e: std::io::Error| MessageError::Write {
            source_name: source.to_string(),
            message: e.to_string(),
        };

        if !self.artifacts.contains_key(source) {
            let artifact =
                OutputArtifact::create(self.dir.join(source), record).map_err(write_error)?;
            info!(
                "Created {} with columns {:?}",
                artifact.path().display(),
                artifact.header()
            );
            self.artifacts.insert(source.to_string(), artifact);
        }

        let (alignment, format_row) = (self.alignment, self.format_row);
        match self.artifacts.get_mut(source) {
            Some(artifact) => artifact
                .append(record, alignment, format_row)
                .map_err(write_error),
            None => Ok(()),
        }
    }

    /// Number of artifacts opened so far
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Look up an open artifact
    pub fn get(&self, source: &str) -> Option<&OutputArtifact> {
        self.artifacts.get(source)
    }

    /// Flush and close every handle, in creation order.
    pub fn close_all(&mut self) -> Vec<ClosedArtifact> {
        let mut closed = Vec::with_capacity(self.artifacts.len());
        for (source, mut artifact) in self.artifacts.drain(..) {
            if let Err(e) = artifact.writer.flush() {
                warn!("Failed to flush {}: {}", artifact.path.display(), e);
            }
            debug!("Closed {} ({} rows)", artifact.path.display(), artifact.rows);
            closed.push(ClosedArtifact {
                source,
                rows: artifact.rows,
            });
        }
        closed
    }
}

impl Drop for OutputRegistry {
    fn drop(&mut self) {
        if !self.artifacts.is_empty() {
            self.close_all();
        }
    }
}
