//! Row emitter tests over the in-memory publisher.

use std::sync::Arc;
use std::time::Duration;

use csv_relay_core::kafka::partitioner::partition_for_key;
use csv_relay_core::message::{SOURCE_HEADER, TIMESTAMP_HEADER};
use csv_relay_core::{
    decode_message, MemoryPublisher, RowEmitter, ShutdownCoordinator, ShutdownReason,
};
use tempfile::TempDir;

use super::helpers::{emit_all, emitter_options, write_source, RUN_TIMEOUT, TOPIC};

#[tokio::test]
async fn test_emits_every_row_keyed_by_logical_name() {
    let input = TempDir::new().unwrap();
    write_source(
        input.path(),
        "orders.csv",
        "id,amount,currency\n1,12.50,EUR\n2,3.00,USD\n",
    );
    write_source(input.path(), "users.csv", "user,email\nann,ann@example.com\n");

    let publisher = Arc::new(MemoryPublisher::new(1));
    let report = emit_all(Arc::clone(&publisher), input.path()).await;

    assert_eq!(report.files_found, 2);
    assert_eq!(report.files_succeeded, 2);
    assert_eq!(report.files_failed, 0);
    assert_eq!(report.rows_published, 3);
    assert!(!report.interrupted);
    assert!(publisher.is_closed());

    let published = publisher.published();
    let keys: Vec<_> = published
        .iter()
        .map(|p| String::from_utf8(p.record.key.clone().unwrap()).unwrap())
        .collect();
    assert_eq!(keys, vec!["orders", "orders", "users"]);

    let first = &published[0].record;
    assert_eq!(first.header(SOURCE_HEADER), Some(&b"orders.csv"[..]));
    assert!(first.header(TIMESTAMP_HEADER).is_some());

    let decoded = decode_message(first).unwrap();
    let fields: Vec<_> = decoded
        .record
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    assert_eq!(
        fields,
        vec![("id", "1"), ("amount", "12.50"), ("currency", "EUR")]
    );
}

#[tokio::test]
async fn test_only_matching_regular_files_are_emitted() {
    let input = TempDir::new().unwrap();
    write_source(input.path(), "keep.csv", "a\n1\n");
    write_source(input.path(), "upper.CSV", "a\n2\n");
    write_source(input.path(), "notes.txt", "a\n3\n");
    std::fs::create_dir(input.path().join("nested.csv")).unwrap();

    let publisher = Arc::new(MemoryPublisher::new(1));
    let report = emit_all(Arc::clone(&publisher), input.path()).await;

    assert_eq!(report.files_found, 1);
    assert_eq!(report.rows_published, 1);
    assert_eq!(
        publisher.published()[0].record.header(SOURCE_HEADER),
        Some(&b"keep.csv"[..])
    );
}

#[tokio::test]
async fn test_empty_directory_still_closes_publisher() {
    let input = TempDir::new().unwrap();

    let publisher = Arc::new(MemoryPublisher::new(1));
    let report = emit_all(Arc::clone(&publisher), input.path()).await;

    assert_eq!(report.files_found, 0);
    assert_eq!(report.rows_published, 0);
    assert!(publisher.published().is_empty());
    assert!(publisher.is_closed());
}

#[tokio::test]
async fn test_rejected_publish_fails_only_that_file() {
    let input = TempDir::new().unwrap();
    write_source(input.path(), "a.csv", "x\n1\n2\n");
    write_source(input.path(), "b.csv", "x\n3\n");
    write_source(input.path(), "c.csv", "x\n4\n5\n");

    let publisher = Arc::new(MemoryPublisher::new(1));
    publisher.fail_source("b.csv");
    let report = emit_all(Arc::clone(&publisher), input.path()).await;

    assert_eq!(report.files_found, 3);
    assert_eq!(report.files_succeeded, 2);
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.rows_published, 4);

    let sources: Vec<_> = publisher
        .published()
        .iter()
        .map(|p| decode_message(&p.record).unwrap().source)
        .collect();
    assert_eq!(sources, vec!["a.csv", "a.csv", "c.csv", "c.csv"]);
}

#[tokio::test]
async fn test_malformed_file_does_not_stop_the_run() {
    let input = TempDir::new().unwrap();
    write_source(input.path(), "broken.csv", "id,note\n1,\"never closed\n");
    write_source(input.path(), "ragged.csv", "id,note\n1,a\n2\n");
    write_source(input.path(), "valid.csv", "id,note\n1,fine\n");

    let publisher = Arc::new(MemoryPublisher::new(1));
    let report = emit_all(Arc::clone(&publisher), input.path()).await;

    assert_eq!(report.files_found, 3);
    assert_eq!(report.files_succeeded, 1);
    assert_eq!(report.files_failed, 2);

    let valid_rows = publisher
        .published()
        .iter()
        .filter(|p| p.record.header(SOURCE_HEADER) == Some(&b"valid.csv"[..]))
        .count();
    assert_eq!(valid_rows, 1);
}

#[tokio::test]
async fn test_rows_of_a_source_share_one_partition() {
    let input = TempDir::new().unwrap();
    let mut contents = String::from("n\n");
    for i in 0..50 {
        contents.push_str(&format!("{}\n", i));
    }
    write_source(input.path(), "ledger.csv", &contents);

    let publisher = Arc::new(MemoryPublisher::new(8));
    emit_all(Arc::clone(&publisher), input.path()).await;

    let expected = partition_for_key(b"ledger", 8);
    let published = publisher.published();
    assert_eq!(published.len(), 50);
    assert!(published.iter().all(|p| p.partition == expected));

    let offsets: Vec<_> = published.iter().map(|p| p.offset).collect();
    assert_eq!(offsets, (0..50).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_shutdown_before_start_publishes_nothing() {
    let input = TempDir::new().unwrap();
    write_source(input.path(), "orders.csv", "id\n1\n2\n");

    let publisher = Arc::new(MemoryPublisher::new(1));
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let emitter = RowEmitter::new(
        publisher.clone(),
        TOPIC,
        emitter_options(input.path()),
        Arc::clone(&coordinator),
    );

    coordinator.trigger(ShutdownReason::Signal("SIGINT".to_string()));
    let report = emitter.run().await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.files_found, 1);
    assert_eq!(report.rows_published, 0);
    assert!(publisher.published().is_empty());
    assert!(publisher.is_closed());
    assert_eq!(coordinator.exit_code(), 0);
}

#[tokio::test]
async fn test_shutdown_mid_file_drops_in_flight_publish() {
    let input = TempDir::new().unwrap();
    write_source(input.path(), "orders.csv", "id\n1\n2\n3\n4\n5\n");
    write_source(input.path(), "zeta.csv", "id\n9\n");

    let publisher = Arc::new(MemoryPublisher::new(1));
    publisher.stall_after(2);
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let emitter = RowEmitter::new(
        publisher.clone(),
        TOPIC,
        emitter_options(input.path()),
        Arc::clone(&coordinator),
    );

    let signal = async {
        while publisher.published().len() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // Let the third publish reach the stalled broker
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.trigger(ShutdownReason::Signal("SIGTERM".to_string()));
    };

    let (report, _) = tokio::time::timeout(RUN_TIMEOUT, async {
        tokio::join!(emitter.run(), signal)
    })
    .await
    .expect("Emitter timed out");
    let report = report.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.rows_published, 2);
    assert_eq!(report.files_succeeded, 0);
    assert_eq!(report.files_failed, 0);
    assert_eq!(publisher.published().len(), 2);
    assert!(publisher.is_closed());
    assert_eq!(coordinator.exit_code(), 0);
}
