//! Kafka protocol client implementation.

mod admin;
mod client;
pub mod consumer_groups;
mod fetch;
mod metadata;
mod partition_router;
pub mod partitioner;
mod produce;

pub use admin::{CreateTopicResult, TopicToCreate};
pub use client::KafkaClient;
pub use consumer_groups::CommittedOffset;
pub use fetch::FetchResponse;
pub use metadata::{BrokerMetadata, PartitionMetadata, TopicMetadata};
pub use partition_router::PartitionLeaderRouter;
pub use produce::{ProduceOptions, ProduceResponse};
