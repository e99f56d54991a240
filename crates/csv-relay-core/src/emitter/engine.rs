//! Row emitter orchestration.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::publisher::MessagePublisher;
use super::source::{discover_sources, SourceReader};
use crate::config::EmitterOptions;
use crate::message::RelayMessage;
use crate::shutdown::ShutdownCoordinator;
use crate::{Error, Result};

/// Outcome of an emitter run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Eligible files discovered
    pub files_found: usize,
    /// Files whose every row was published
    pub files_succeeded: usize,
    /// Files aborted by a read, parse or publish error
    pub files_failed: usize,
    /// Rows acknowledged by the broker, across all files
    pub rows_published: u64,
    /// The run stopped early on a shutdown request
    pub interrupted: bool,
}

/// Publishes every row of every eligible file in a directory.
pub struct RowEmitter {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
    options: EmitterOptions,
    coordinator: Arc<ShutdownCoordinator>,
}

impl RowEmitter {
    /// Build an emitter. Closing the publisher is registered with the
    /// coordinator and happens once, when the run ends.
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        topic: impl Into<String>,
        options: EmitterOptions,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> Self {
        let closing = Arc::clone(&publisher);
        coordinator.register("broker connection", move || async move {
            closing.close().await;
        });

        Self {
            publisher,
            topic: topic.into(),
            options,
            coordinator,
        }
    }

    /// Emit all files, then run shutdown cleanup.
    pub async fn run(&self) -> Result<EmitReport> {
        let result = self.run_internal().await;
        self.coordinator.run_cleanup().await;

        if let Ok(ref report) = result {
            info!(
                "Emit finished: {} files found, {} succeeded, {} failed, {} rows published",
                report.files_found,
                report.files_succeeded,
                report.files_failed,
                report.rows_published
            );
        }
        result
    }

    async fn run_internal(&self) -> Result<EmitReport> {
        let mut report = EmitReport::default();

        let sources = discover_sources(&self.options.input_dir, &self.options.extension)?;
        report.files_found = sources.len();

        if sources.is_empty() {
            info!(
                "No .{} files found in {}",
                self.options.extension,
                self.options.input_dir.display()
            );
            return Ok(report);
        }

        info!(
            "Found {} .{} files in {}",
            sources.len(),
            self.options.extension,
            self.options.input_dir.display()
        );

        let token = self.coordinator.token();

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                report.interrupted = true;
                return Ok(report);
            }
            prepared = self.publisher.prepare(&self.topic) => prepared?,
        }

        for path in &sources {
            if token.is_cancelled() {
                report.interrupted = true;
                break;
            }

            let mut rows = 0u64;
            let outcome = self.emit_file(path, &token, &mut rows).await;
            report.rows_published += rows;

            match outcome {
                Ok(()) => {
                    info!("Published {} rows from {}", rows, display_name(path));
                    report.files_succeeded += 1;
                }
                Err(Error::Shutdown) => {
                    warn!(
                        "Stopped {} after {} rows on shutdown",
                        display_name(path),
                        rows
                    );
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    error!(
                        "Failed to emit {} after {} rows: {}",
                        display_name(path),
                        rows,
                        e
                    );
                    report.files_failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Publish every row of one file, one acknowledged publish at a time.
    async fn emit_file(&self, path: &Path, token: &CancellationToken, rows: &mut u64) -> Result<()> {
        let mut reader = SourceReader::open(path)?;
        let source = reader.file_name().to_string();
        debug!("Reading {} with columns {:?}", source, reader.headers());

        while let Some(record) = reader.next_record()? {
            let message = RelayMessage::new(&source, record, Utc::now());

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Shutdown),
                receipt = self.publisher.publish(&self.topic, &message) => {
                    let receipt = receipt?;
                    *rows += 1;
                    debug!(
                        "Row {} of {} acknowledged at {}:{}",
                        rows, source, receipt.partition, receipt.offset
                    );
                }
            }
        }

        Ok(())
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
