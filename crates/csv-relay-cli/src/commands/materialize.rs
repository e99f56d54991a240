use anyhow::Result;
use csv_relay_core::config::MATERIALIZER_CLIENT_ID;
use csv_relay_core::{Config, KafkaSubscription, RecordMaterializer, ShutdownCoordinator};
use std::sync::Arc;
use tracing::info;

/// Run the materializer until a signal or fault and return the exit code.
pub async fn run(config: Config) -> Result<i32> {
    config.validate()?;

    let kafka = config.kafka.for_role(MATERIALIZER_CLIENT_ID);
    info!(
        "Materializing topic {} into {} (group {})",
        config.topic,
        config.materializer.output_dir.display(),
        config.materializer.group_id
    );

    let coordinator = Arc::new(ShutdownCoordinator::new());
    super::watch_signals(Arc::clone(&coordinator));

    let token = coordinator.token();
    let connect =
        KafkaSubscription::connect(&kafka, config.topic.clone(), config.materializer.clone());
    let subscription = tokio::select! {
        _ = token.cancelled() => return Ok(coordinator.exit_code()),
        subscription = connect => subscription?,
    };
    let materializer = RecordMaterializer::new(
        Arc::new(subscription),
        config.materializer.clone(),
        Arc::clone(&coordinator),
    );

    let summary = materializer.run().await?;
    Ok(summary.exit_code())
}
