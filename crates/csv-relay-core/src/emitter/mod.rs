//! Row emitter: CSV files in, one keyed message per row out.

pub mod engine;
pub mod publisher;
pub mod source;

pub use engine::{EmitReport, RowEmitter};
pub use publisher::{
    KafkaPublisher, MemoryPublisher, MessagePublisher, PublishReceipt, PublishedRecord,
};
pub use source::{discover_sources, SourceReader};
