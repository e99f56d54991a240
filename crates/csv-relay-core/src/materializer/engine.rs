//! Record materializer orchestration.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::output::{cleanup_existing_outputs, ClosedArtifact, OutputRegistry, RowFormatter};
use super::row::row_line;
use super::subscription::{ConsumedMessage, MessageSubscription};
use crate::config::MaterializerOptions;
use crate::error::MessageError;
use crate::message::decode_message;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::Result;

/// Totals reported when the materializer stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeSummary {
    /// Messages handled and written as a row
    pub messages_received: u64,
    /// Messages skipped as malformed or unwritable
    pub messages_skipped: u64,
    /// Output artifacts created, with their row counts
    pub artifacts: Vec<ClosedArtifact>,
    /// Why the run stopped
    pub reason: Option<ShutdownReason>,
}

impl MaterializeSummary {
    /// 0 after a signal, 1 after a fault
    pub fn exit_code(&self) -> i32 {
        self.reason.as_ref().map(|r| r.exit_code()).unwrap_or(0)
    }
}

#[derive(Default)]
struct Counters {
    received: u64,
    skipped: u64,
}

/// Rebuilds one CSV file per source from consumed messages.
pub struct RecordMaterializer {
    subscription: Arc<dyn MessageSubscription>,
    options: MaterializerOptions,
    coordinator: Arc<ShutdownCoordinator>,
    format_row: RowFormatter,
}

impl RecordMaterializer {
    /// Build a materializer. Closing the subscription is registered with the
    /// coordinator and runs after the output handles are closed.
    pub fn new(
        subscription: Arc<dyn MessageSubscription>,
        options: MaterializerOptions,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> Self {
        let closing = Arc::clone(&subscription);
        coordinator.register("broker connection", move || async move {
            closing.close().await;
        });

        Self {
            subscription,
            options,
            coordinator,
            format_row: row_line,
        }
    }

    /// Replace how data rows are formatted before they are written.
    pub fn with_row_formatter(mut self, format_row: RowFormatter) -> Self {
        self.format_row = format_row;
        self
    }

    /// Run until shutdown is triggered by a signal or a fault.
    ///
    /// Errors are returned only for startup failures before any output is
    /// opened; everything later ends in the summary's exit code.
    pub async fn run(&self) -> Result<MaterializeSummary> {
        let removed =
            match cleanup_existing_outputs(&self.options.output_dir, &self.options.extension) {
                Ok(removed) => removed,
                Err(e) => {
                    self.coordinator.run_cleanup().await;
                    return Err(e);
                }
            };
        info!(
            "Removed {} existing .{} files from {}",
            removed,
            self.options.extension,
            self.options.output_dir.display()
        );

        let mut registry =
            OutputRegistry::new(&self.options.output_dir, self.options.column_alignment)
                .with_row_formatter(self.format_row);
        let mut counters = Counters::default();

        self.consume(&mut registry, &mut counters).await;

        // Shutdown order: output handles, then the broker, then the summary
        let artifacts = registry.close_all();
        self.coordinator.run_cleanup().await;

        let summary = MaterializeSummary {
            messages_received: counters.received,
            messages_skipped: counters.skipped,
            artifacts,
            reason: self.coordinator.reason(),
        };
        log_summary(&summary);
        Ok(summary)
    }

    async fn consume(&self, registry: &mut OutputRegistry, counters: &mut Counters) {
        let token = self.coordinator.token();

        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            subscribed = self.subscription.subscribe() => {
                if let Err(e) = subscribed {
                    let reason = format!("subscribe failed: {}", e);
                    self.coordinator.trigger(ShutdownReason::Fault(reason));
                    return;
                }
            }
        }

        info!("Waiting for messages");

        loop {
            let batch = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                polled = self.subscription.poll() => match polled {
                    Ok(batch) => batch,
                    Err(e) => {
                        let reason = format!("consume failed: {}", e);
                        self.coordinator.trigger(ShutdownReason::Fault(reason));
                        return;
                    }
                },
            };

            if batch.is_empty() {
                continue;
            }

            for message in &batch {
                let handled = catch_unwind(AssertUnwindSafe(|| {
                    self.handle_message(registry, counters, message)
                }));
                if handled.is_err() {
                    self.coordinator.trigger(ShutdownReason::Fault(format!(
                        "panic while handling offset {} of partition {}",
                        message.record.offset, message.partition
                    )));
                    return;
                }
            }

            if let Err(e) = self.subscription.commit().await {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }

    /// Write one message as a row, or log and skip it.
    fn handle_message(
        &self,
        registry: &mut OutputRegistry,
        counters: &mut Counters,
        message: &ConsumedMessage,
    ) {
        let written = decode_message(&message.record).and_then(|decoded| {
            registry.write_record(&decoded.source, &decoded.record)?;
            Ok::<_, MessageError>(decoded.source)
        });

        match written {
            Ok(source) => {
                counters.received += 1;
                debug!(
                    "Wrote offset {} of partition {} to {}",
                    message.record.offset, message.partition, source
                );
                if counters.received % self.options.progress_interval.max(1) == 0 {
                    info!("Progress: {} messages received", counters.received);
                }
            }
            Err(e) => {
                counters.skipped += 1;
                warn!(
                    "Skipping message at offset {} of partition {}: {}",
                    message.record.offset, message.partition, e
                );
            }
        }
    }
}

fn log_summary(summary: &MaterializeSummary) {
    match &summary.reason {
        Some(ShutdownReason::Fault(reason)) => error!("Materializer stopped on fault: {}", reason),
        Some(ShutdownReason::Signal(name)) => info!("Materializer stopped by {}", name),
        None => info!("Materializer stopped"),
    }

    info!("Total messages received: {}", summary.messages_received);
    if summary.messages_skipped > 0 {
        warn!("Skipped {} malformed messages", summary.messages_skipped);
    }
    info!("Reconstructed {} files", summary.artifacts.len());
    for artifact in &summary.artifacts {
        info!("  {}: {} rows", artifact.source, artifact.rows);
    }
}
