//! Record materializer: consumed messages in, one CSV file per source out.

pub mod engine;
pub mod output;
pub mod row;
pub mod subscription;

pub use engine::{MaterializeSummary, RecordMaterializer};
pub use output::{
    cleanup_existing_outputs, ClosedArtifact, OutputArtifact, OutputRegistry, RowFormatter,
};
pub use subscription::{
    ConsumedMessage, KafkaSubscription, MemorySubscription, MessageSubscription,
};
