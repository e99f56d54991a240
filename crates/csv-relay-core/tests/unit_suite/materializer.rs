//! Record materializer tests over the in-memory subscription.

use std::sync::Arc;

use csv_relay_core::materializer::row::row_line;
use csv_relay_core::materializer::ClosedArtifact;
use csv_relay_core::{ColumnAlignment, MemorySubscription, Record, ShutdownReason};
use tempfile::TempDir;

use super::helpers::{
    materialize_until_idle, materialize_with_formatter, materializer_options, raw_message,
    read_output,
};

fn artifact(source: &str, rows: u64) -> ClosedArtifact {
    ClosedArtifact {
        source: source.to_string(),
        rows,
    }
}

#[tokio::test]
async fn test_signal_stops_cleanly_and_commits() {
    let output = TempDir::new().unwrap();
    let subscription = Arc::new(MemorySubscription::new(vec![
        raw_message(0, Some("orders.csv"), Some(r#"{"id":"1","total":"9.99"}"#)),
        raw_message(1, Some("orders.csv"), Some(r#"{"id":"2","total":"0.50"}"#)),
    ]));

    let summary =
        materialize_until_idle(Arc::clone(&subscription), materializer_options(output.path()))
            .await;

    assert_eq!(summary.exit_code(), 0);
    assert!(matches!(summary.reason, Some(ShutdownReason::Signal(_))));
    assert_eq!(summary.messages_received, 2);
    assert_eq!(summary.messages_skipped, 0);
    assert_eq!(summary.artifacts, vec![artifact("orders.csv", 2)]);
    assert!(subscription.commits() >= 1);
    assert!(subscription.is_closed());

    assert_eq!(
        read_output(output.path(), "orders.csv"),
        "id,total\n1,9.99\n2,0.50\n"
    );
}

#[tokio::test]
async fn test_broker_fault_exits_nonzero_with_outputs_flushed() {
    let output = TempDir::new().unwrap();
    let subscription = Arc::new(MemorySubscription::new(vec![
        raw_message(0, Some("a.csv"), Some(r#"{"k":"1"}"#)),
        raw_message(1, Some("b.csv"), Some(r#"{"k":"2"}"#)),
        raw_message(2, Some("a.csv"), Some(r#"{"k":"3"}"#)),
    ]));
    subscription.push_fault("connection reset by peer");

    let summary =
        materialize_until_idle(Arc::clone(&subscription), materializer_options(output.path()))
            .await;

    assert_eq!(summary.exit_code(), 1);
    match &summary.reason {
        Some(ShutdownReason::Fault(reason)) => assert!(reason.contains("connection reset")),
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(
        summary.artifacts,
        vec![artifact("a.csv", 2), artifact("b.csv", 1)]
    );
    assert!(subscription.is_closed());

    assert_eq!(read_output(output.path(), "a.csv"), "k\n1\n3\n");
    assert_eq!(read_output(output.path(), "b.csv"), "k\n2\n");
}

#[tokio::test]
async fn test_panic_while_writing_is_a_fault() {
    fn explode_on_boom(record: &Record, header: &[String], alignment: ColumnAlignment) -> String {
        if record.values().any(|v| v == "boom") {
            panic!("row formatter exploded");
        }
        row_line(record, header, alignment)
    }

    let output = TempDir::new().unwrap();
    let subscription = Arc::new(MemorySubscription::new(vec![
        raw_message(0, Some("a.csv"), Some(r#"{"v":"ok"}"#)),
        raw_message(1, Some("a.csv"), Some(r#"{"v":"boom"}"#)),
        raw_message(2, Some("a.csv"), Some(r#"{"v":"never"}"#)),
    ]));

    let summary = materialize_with_formatter(
        Arc::clone(&subscription),
        materializer_options(output.path()),
        explode_on_boom,
    )
    .await;

    assert_eq!(summary.exit_code(), 1);
    match &summary.reason {
        Some(ShutdownReason::Fault(reason)) => assert!(reason.contains("offset 1")),
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(summary.messages_received, 1);
    assert_eq!(summary.artifacts, vec![artifact("a.csv", 1)]);
    assert_eq!(subscription.commits(), 0);
    assert!(subscription.is_closed());

    assert_eq!(read_output(output.path(), "a.csv"), "v\nok\n");
}

#[tokio::test]
async fn test_malformed_messages_are_skipped() {
    let output = TempDir::new().unwrap();
    let subscription = Arc::new(MemorySubscription::new(vec![
        raw_message(0, Some("good.csv"), Some(r#"{"v":"first"}"#)),
        raw_message(1, None, Some(r#"{"v":"no source"}"#)),
        raw_message(2, Some("good.csv"), Some("not json")),
        raw_message(3, Some("good.csv"), None),
        raw_message(4, Some("../escape.csv"), Some(r#"{"v":"x"}"#)),
        raw_message(5, Some("good.csv"), Some("{}")),
        raw_message(6, Some("good.csv"), Some("[1,2]")),
        raw_message(7, Some("good.csv"), Some(r#"{"v":"last"}"#)),
    ]));

    let summary =
        materialize_until_idle(Arc::clone(&subscription), materializer_options(output.path()))
            .await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.messages_received, 2);
    assert_eq!(summary.messages_skipped, 6);
    assert_eq!(summary.artifacts, vec![artifact("good.csv", 2)]);
    assert_eq!(read_output(output.path(), "good.csv"), "v\nfirst\nlast\n");
    assert!(!output.path().parent().unwrap().join("escape.csv").exists());
}

#[tokio::test]
async fn test_startup_replaces_previous_outputs() {
    let output = TempDir::new().unwrap();
    std::fs::write(output.path().join("stale.csv"), "old\n").unwrap();
    std::fs::write(output.path().join("orders.csv"), "old\nrows\n").unwrap();
    std::fs::write(output.path().join("notes.txt"), "keep me").unwrap();

    let subscription = Arc::new(MemorySubscription::new(vec![raw_message(
        0,
        Some("orders.csv"),
        Some(r#"{"id":"1"}"#),
    )]));
    materialize_until_idle(subscription, materializer_options(output.path())).await;

    assert!(!output.path().join("stale.csv").exists());
    assert_eq!(read_output(output.path(), "orders.csv"), "id\n1\n");
    assert_eq!(read_output(output.path(), "notes.txt"), "keep me");
}

#[tokio::test]
async fn test_missing_output_directory_is_created() {
    let root = TempDir::new().unwrap();
    let output = root.path().join("reconstructed");

    let subscription = Arc::new(MemorySubscription::new(vec![raw_message(
        0,
        Some("x.csv"),
        Some(r#"{"a":"b"}"#),
    )]));
    let summary = materialize_until_idle(subscription, materializer_options(&output)).await;

    assert_eq!(summary.messages_received, 1);
    assert_eq!(read_output(&output, "x.csv"), "a\nb\n");
}

#[tokio::test]
async fn test_column_alignment_modes() {
    let messages = || {
        vec![
            raw_message(0, Some("t.csv"), Some(r#"{"id":"1","name":"a"}"#)),
            raw_message(1, Some("t.csv"), Some(r#"{"name":"b","id":"2"}"#)),
            raw_message(2, Some("t.csv"), Some(r#"{"id":"3"}"#)),
        ]
    };

    let positional = TempDir::new().unwrap();
    materialize_until_idle(
        Arc::new(MemorySubscription::new(messages())),
        materializer_options(positional.path()),
    )
    .await;
    assert_eq!(
        read_output(positional.path(), "t.csv"),
        "id,name\n1,a\nb,2\n3\n"
    );

    let by_name = TempDir::new().unwrap();
    let mut options = materializer_options(by_name.path());
    options.column_alignment = ColumnAlignment::ByName;
    materialize_until_idle(Arc::new(MemorySubscription::new(messages())), options).await;
    assert_eq!(
        read_output(by_name.path(), "t.csv"),
        "id,name\n1,a\n2,b\n3,\n"
    );
}

#[tokio::test]
async fn test_non_string_json_values_are_rendered() {
    let output = TempDir::new().unwrap();
    let subscription = Arc::new(MemorySubscription::new(vec![raw_message(
        0,
        Some("mixed.csv"),
        Some(r#"{"count":5,"ratio":0.25,"flag":true,"missing":null}"#),
    )]));

    materialize_until_idle(subscription, materializer_options(output.path())).await;

    assert_eq!(
        read_output(output.path(), "mixed.csv"),
        "count,ratio,flag,missing\n5,0.25,true,\n"
    );
}

#[tokio::test]
async fn test_batches_are_written_in_delivery_order() {
    let output = TempDir::new().unwrap();
    let messages = (0..25)
        .map(|i| raw_message(i, Some("seq.csv"), Some(&format!(r#"{{"n":"{}"}}"#, i))))
        .collect();
    let subscription = Arc::new(MemorySubscription::new(messages).with_batch_size(4));

    let summary =
        materialize_until_idle(Arc::clone(&subscription), materializer_options(output.path()))
            .await;

    assert_eq!(summary.messages_received, 25);
    assert!(subscription.commits() >= 7);

    let expected: String = std::iter::once("n\n".to_string())
        .chain((0..25).map(|i| format!("{}\n", i)))
        .collect();
    assert_eq!(read_output(output.path(), "seq.csv"), expected);
}
