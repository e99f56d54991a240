//! Source discovery and streaming row reads.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::message::Record;
use crate::{Error, Result};

/// List eligible source files in `dir`, sorted by file name.
///
/// A file is eligible when it is a regular file, or a symlink to one, whose
/// extension equals `extension` exactly (case-sensitive). Broken links are
/// skipped.
pub fn discover_sources(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                debug!("Skipping unreadable entry {}: {}", path.display(), e);
                continue;
            }
        }

        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            sources.push(path);
        }
    }

    sources.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    debug!("Discovered {} source files in {}", sources.len(), dir.display());
    Ok(sources)
}

/// Counts quote characters in the bytes the CSV parser has consumed.
///
/// The parser reads ahead of the record it returns, so bytes are held in
/// `pending` until the parser position passes them.
struct QuoteTracker<R> {
    inner: R,
    pending: VecDeque<u8>,
    consumed: u64,
    quotes: u64,
}

impl<R: Read> QuoteTracker<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            consumed: 0,
            quotes: 0,
        }
    }

    /// Account for every byte up to `position` and report whether the quotes
    /// seen so far are balanced.
    fn advance_to(&mut self, position: u64) -> bool {
        while self.consumed < position {
            match self.pending.pop_front() {
                Some(b'"') => self.quotes += 1,
                Some(_) => {}
                None => break,
            }
            self.consumed += 1;
        }
        self.quotes % 2 == 0
    }
}

impl<R: Read> Read for QuoteTracker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pending.extend(&buf[..n]);
        Ok(n)
    }
}

/// Streaming reader yielding one [`Record`] per data row of a CSV file.
pub struct SourceReader {
    file_name: String,
    reader: csv::Reader<QuoteTracker<BufReader<File>>>,
    headers: Vec<String>,
    record: csv::StringRecord,
    line: u64,
}

impl SourceReader {
    /// Open `path` and read its header row.
    pub fn open(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Csv(format!("unusable file name: {}", path.display())))?
            .to_string();

        let file = File::open(path)?;
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(QuoteTracker::new(BufReader::new(file)));

        let mut source = Self {
            file_name,
            reader,
            headers: Vec::new(),
            record: csv::StringRecord::new(),
            line: 1,
        };

        source.headers = source
            .reader
            .headers()?
            .iter()
            .map(|h| h.to_string())
            .collect();
        source.check_quotes()?;

        Ok(source)
    }

    /// File name including extension
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Column names from the header row
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Read the next data row, or `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        self.line = self.record.position().map(|p| p.line()).unwrap_or(self.line);
        self.check_quotes()?;

        let record = self
            .headers
            .iter()
            .zip(self.record.iter())
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        Ok(Some(record))
    }

    fn check_quotes(&mut self) -> Result<()> {
        let position = self.reader.position().byte();
        if self.reader.get_mut().advance_to(position) {
            return Ok(());
        }
        Err(Error::Csv(format!(
            "{}: unbalanced quote in record starting at line {}",
            self.file_name, self.line
        )))
    }
}

impl Iterator for SourceReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
