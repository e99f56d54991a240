//! Test helper utilities.
//!
//! Provides source file fixtures, option builders and runners shared by
//! the unit suites.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use csv_relay_core::emitter::PublishedRecord;
use csv_relay_core::materializer::row::row_line;
use csv_relay_core::message::RecordHeader;
use csv_relay_core::{
    ConsumedMessage, EmitReport, EmitterOptions, KafkaRecord, MaterializeSummary,
    MaterializerOptions, MemoryPublisher, MemorySubscription, MessageSubscription,
    RecordMaterializer, RowEmitter, RowFormatter, ShutdownCoordinator, ShutdownReason,
};

pub const TOPIC: &str = "raw-transactions";

/// Upper bound on any single run; a hang fails the test instead of the suite
pub const RUN_TIMEOUT: Duration = Duration::from_secs(10);

/// Write `contents` to `dir/name` and return the path
pub fn write_source(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("Failed to write source file");
    path
}

/// Read an output artifact as a string
pub fn read_output(dir: &Path, name: &str) -> String {
    std::fs::read_to_string(dir.join(name))
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", name, e))
}

pub fn emitter_options(input_dir: &Path) -> EmitterOptions {
    EmitterOptions {
        input_dir: input_dir.to_path_buf(),
        ..Default::default()
    }
}

pub fn materializer_options(output_dir: &Path) -> MaterializerOptions {
    MaterializerOptions {
        output_dir: output_dir.to_path_buf(),
        ..Default::default()
    }
}

/// Emit every source in `input_dir` through `publisher`.
pub async fn emit_all(publisher: Arc<MemoryPublisher>, input_dir: &Path) -> EmitReport {
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let emitter = RowEmitter::new(publisher, TOPIC, emitter_options(input_dir), coordinator);

    tokio::time::timeout(RUN_TIMEOUT, emitter.run())
        .await
        .expect("Emitter timed out")
        .expect("Emitter failed")
}

/// Materialize until the subscription has handed out everything queued,
/// then stop the run with a signal.
pub async fn materialize_until_idle(
    subscription: Arc<MemorySubscription>,
    options: MaterializerOptions,
) -> MaterializeSummary {
    materialize_with_formatter(subscription, options, row_line).await
}

/// Like [`materialize_until_idle`], formatting data rows with `format_row`.
pub async fn materialize_with_formatter(
    subscription: Arc<MemorySubscription>,
    options: MaterializerOptions,
    format_row: RowFormatter,
) -> MaterializeSummary {
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let handle: Arc<dyn MessageSubscription> = subscription.clone();
    let materializer = RecordMaterializer::new(handle, options, Arc::clone(&coordinator))
        .with_row_formatter(format_row);

    let stop = async {
        while !subscription.is_idle() && !coordinator.is_triggered() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        coordinator.trigger(ShutdownReason::Signal("SIGTERM".to_string()));
    };

    let (summary, _) = tokio::time::timeout(RUN_TIMEOUT, async {
        tokio::join!(materializer.run(), stop)
    })
    .await
    .expect("Materializer timed out");

    summary.expect("Materializer failed to start")
}

/// Materialize everything the publisher accepted.
pub async fn materialize_published(
    published: &[PublishedRecord],
    output_dir: &Path,
) -> MaterializeSummary {
    let subscription = Arc::new(MemorySubscription::from_published(published));
    materialize_until_idle(subscription, materializer_options(output_dir)).await
}

/// A consumed message carrying `payload` with an optional `source` header
pub fn raw_message(offset: i64, source: Option<&str>, payload: Option<&str>) -> ConsumedMessage {
    let headers = source
        .map(|s| {
            vec![RecordHeader {
                key: "source".to_string(),
                value: s.as_bytes().to_vec(),
            }]
        })
        .unwrap_or_default();

    ConsumedMessage {
        partition: 0,
        record: KafkaRecord {
            key: source.map(|s| s.as_bytes().to_vec()),
            value: payload.map(|p| p.as_bytes().to_vec()),
            headers,
            timestamp: 1_709_296_200_000 + offset,
            offset,
        },
    }
}
