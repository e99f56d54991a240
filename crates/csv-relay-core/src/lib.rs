//! CSV Relay Core Library
//!
//! Streams the rows of local CSV files into a Kafka topic as individually
//! keyed JSON messages, and rebuilds one CSV file per source from the
//! messages consumed back out of that topic.

pub mod config;
pub mod emitter;
pub mod error;
pub mod kafka;
pub mod materializer;
pub mod message;
pub mod retry;
pub mod shutdown;

pub use config::{
    Acks, ColumnAlignment, Config, EmitterOptions, KafkaConfig, MaterializerOptions, RetryConfig,
    StartOffset,
};
pub use emitter::{
    EmitReport, KafkaPublisher, MemoryPublisher, MessagePublisher, PublishReceipt, RowEmitter,
};
pub use error::{Error, KafkaError, MessageError, Result};
pub use materializer::{
    ConsumedMessage, KafkaSubscription, MaterializeSummary, MemorySubscription,
    MessageSubscription, OutputRegistry, RecordMaterializer, RowFormatter,
};
pub use message::{decode_message, logical_name, DecodedMessage, KafkaRecord, Record, RelayMessage};
pub use shutdown::{shutdown_signal, ShutdownCoordinator, ShutdownReason};
