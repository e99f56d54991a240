//! CSV round trip through a real broker.
//!
//! These tests require Docker and are marked with #[ignore].

use std::time::Duration;
use tempfile::TempDir;

use csv_relay_core::kafka::PartitionLeaderRouter;
use csv_relay_core::StartOffset;

use super::common::{
    emit, emitter_options, materialize_until_committed, materializer_options, KafkaTestCluster,
};

const ORDERS: &str = "\
order_id,customer,total
1001,\"Smith, Jane\",19.99
1002,Lee,5.00
1003,\"O\"\"Brien\",42.10
";

const REFUNDS: &str = "\
refund_id,reason
r-1,\"damaged
in transit\"
r-2,late
";

async fn start_cluster() -> KafkaTestCluster {
    let cluster = KafkaTestCluster::start()
        .await
        .expect("Failed to start Kafka");
    cluster
        .wait_for_ready(Duration::from_secs(60))
        .await
        .expect("Kafka not ready");
    cluster
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_emitter_provisions_missing_topic() {
    let cluster = start_cluster().await;
    let input = TempDir::new().unwrap();
    std::fs::write(input.path().join("orders.csv"), ORDERS).unwrap();

    let report = emit(&cluster, "provisioned", emitter_options(input.path(), 4))
        .await
        .expect("Emit failed");
    assert_eq!(report.files_succeeded, 1);
    assert_eq!(report.rows_published, 3);

    let router = PartitionLeaderRouter::new(cluster.kafka_config())
        .await
        .unwrap();
    let metadata = router.refresh_topic("provisioned").await.unwrap();
    assert_eq!(metadata.partition_ids(), vec![0, 1, 2, 3]);

    // A second run reuses the existing topic
    let report = emit(&cluster, "provisioned", emitter_options(input.path(), 4))
        .await
        .expect("Second emit failed");
    assert_eq!(report.rows_published, 3);
    router.disconnect_all().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_files_survive_the_round_trip() {
    let cluster = start_cluster().await;
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    std::fs::write(input.path().join("orders.csv"), ORDERS).unwrap();
    std::fs::write(input.path().join("refunds.csv"), REFUNDS).unwrap();

    let report = emit(&cluster, "round-trip", emitter_options(input.path(), 3))
        .await
        .expect("Emit failed");
    assert_eq!(report.rows_published, 5);

    let summary = materialize_until_committed(
        &cluster,
        "round-trip",
        materializer_options(output.path(), "round-trip-group"),
        5,
        Duration::from_secs(30),
    )
    .await
    .expect("Materialize failed");

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.messages_received, 5);
    assert_eq!(
        std::fs::read_to_string(output.path().join("orders.csv")).unwrap(),
        ORDERS
    );
    assert_eq!(
        std::fs::read_to_string(output.path().join("refunds.csv")).unwrap(),
        REFUNDS
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_committed_start_offset_skips_handled_messages() {
    let cluster = start_cluster().await;
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    std::fs::write(input.path().join("orders.csv"), ORDERS).unwrap();

    emit(&cluster, "resume", emitter_options(input.path(), 1))
        .await
        .expect("Emit failed");

    let mut options = materializer_options(output.path(), "resume-group");
    options.start_offset = StartOffset::Committed;

    let first = materialize_until_committed(
        &cluster,
        "resume",
        options.clone(),
        3,
        Duration::from_secs(30),
    )
    .await
    .expect("First materialize failed");
    assert_eq!(first.messages_received, 3);

    std::fs::remove_file(input.path().join("orders.csv")).unwrap();
    std::fs::write(input.path().join("refunds.csv"), REFUNDS).unwrap();
    emit(&cluster, "resume", emitter_options(input.path(), 1))
        .await
        .expect("Second emit failed");

    let second = materialize_until_committed(
        &cluster,
        "resume",
        options,
        5,
        Duration::from_secs(30),
    )
    .await
    .expect("Second materialize failed");

    assert_eq!(second.messages_received, 2);
    assert!(!output.path().join("orders.csv").exists());
    assert_eq!(
        std::fs::read_to_string(output.path().join("refunds.csv")).unwrap(),
        REFUNDS
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_backlog_larger_than_fetch_size() {
    let cluster = start_cluster().await;
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();

    let mut contents = String::from("id,payload\n");
    for i in 0..3000 {
        contents.push_str(&format!("{},{}\n", i, "x".repeat(40)));
    }
    std::fs::write(input.path().join("backlog.csv"), &contents).unwrap();

    let report = emit(&cluster, "backlog", emitter_options(input.path(), 1))
        .await
        .expect("Emit failed");
    assert_eq!(report.rows_published, 3000);

    // Far smaller than the backlog, so fetches end mid-batch
    let mut options = materializer_options(output.path(), "backlog-group");
    options.fetch_max_bytes = 16 * 1024;

    let summary = materialize_until_committed(
        &cluster,
        "backlog",
        options,
        3000,
        Duration::from_secs(60),
    )
    .await
    .expect("Materialize failed");

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.messages_received, 3000);
    assert_eq!(
        std::fs::read_to_string(output.path().join("backlog.csv")).unwrap(),
        contents
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_batch_larger_than_fetch_size() {
    let cluster = start_cluster().await;
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();

    let contents = format!("id,payload\n1,{}\n", "y".repeat(8 * 1024));
    std::fs::write(input.path().join("wide.csv"), &contents).unwrap();

    emit(&cluster, "wide", emitter_options(input.path(), 1))
        .await
        .expect("Emit failed");

    let mut options = materializer_options(output.path(), "wide-group");
    options.fetch_max_bytes = 1024;

    let summary = materialize_until_committed(
        &cluster,
        "wide",
        options,
        1,
        Duration::from_secs(30),
    )
    .await
    .expect("Materialize failed");

    assert_eq!(summary.messages_received, 1);
    assert_eq!(
        std::fs::read_to_string(output.path().join("wide.csv")).unwrap(),
        contents
    );
}
