use anyhow::Result;
use csv_relay_core::config::EMITTER_CLIENT_ID;
use csv_relay_core::{Config, KafkaPublisher, RowEmitter, ShutdownCoordinator};
use std::sync::Arc;
use tracing::info;

/// Run the emitter and return the process exit code.
pub async fn run(config: Config) -> Result<i32> {
    config.validate()?;

    let kafka = config.kafka.for_role(EMITTER_CLIENT_ID);
    info!(
        "Emitting .{} files from {} to topic {}",
        config.emitter.extension,
        config.emitter.input_dir.display(),
        config.topic
    );

    let coordinator = Arc::new(ShutdownCoordinator::new());
    super::watch_signals(Arc::clone(&coordinator));

    let token = coordinator.token();
    let publisher = tokio::select! {
        _ = token.cancelled() => return Ok(coordinator.exit_code()),
        publisher = KafkaPublisher::connect(&kafka, config.emitter.clone()) => publisher?,
    };
    let emitter = RowEmitter::new(
        Arc::new(publisher),
        config.topic.clone(),
        config.emitter.clone(),
        Arc::clone(&coordinator),
    );

    let report = emitter.run().await?;
    if report.interrupted {
        info!("Emit interrupted after {} rows", report.rows_published);
    }

    Ok(coordinator.exit_code())
}
