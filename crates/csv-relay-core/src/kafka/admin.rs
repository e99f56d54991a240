//! Kafka Admin API implementation (CreateTopics).

use kafka_protocol::messages::{
    create_topics_request::{CreatableTopic, CreateTopicsRequest},
    ApiKey, CreateTopicsResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, info, warn};

use super::KafkaClient;
use crate::error::KafkaError;
use crate::Result;

/// TOPIC_ALREADY_EXISTS
const TOPIC_ALREADY_EXISTS: i16 = 36;

/// Configuration for a topic to be created
#[derive(Debug, Clone)]
pub struct TopicToCreate {
    /// Topic name
    pub name: String,
    /// Number of partitions
    pub num_partitions: i32,
    /// Replication factor (-1 for broker default)
    pub replication_factor: i16,
}

/// Result of creating a single topic
#[derive(Debug, Clone)]
pub struct CreateTopicResult {
    /// Topic name
    pub name: String,
    /// Error code (0 = success, 36 = TOPIC_ALREADY_EXISTS)
    pub error_code: i16,
    /// Error message (if any)
    pub error_message: Option<String>,
}

impl CreateTopicResult {
    /// Check if the topic was created successfully or already existed
    pub fn is_success_or_exists(&self) -> bool {
        self.error_code == 0 || self.already_exists()
    }

    /// Check if topic already existed
    pub fn already_exists(&self) -> bool {
        self.error_code == TOPIC_ALREADY_EXISTS
    }
}

/// Create topics, treating "already exists" as success.
///
/// Any other per-topic failure is reported as a broker error carrying the
/// first failing code, so transient codes stay retriable.
pub async fn create_topics(
    client: &KafkaClient,
    topics: Vec<TopicToCreate>,
    timeout_ms: i32,
) -> Result<Vec<CreateTopicResult>> {
    if topics.is_empty() {
        return Ok(Vec::new());
    }

    debug!("Creating {} topics", topics.len());

    let creatable_topics: Vec<CreatableTopic> = topics
        .iter()
        .map(|t| {
            CreatableTopic::default()
                .with_name(TopicName(StrBytes::from_string(t.name.clone())))
                .with_num_partitions(t.num_partitions)
                .with_replication_factor(t.replication_factor)
        })
        .collect();

    let request = CreateTopicsRequest::default()
        .with_topics(creatable_topics)
        .with_timeout_ms(timeout_ms)
        .with_validate_only(false);

    let response: CreateTopicsResponse = client.send_request(ApiKey::CreateTopics, request).await?;

    let mut results = Vec::with_capacity(topics.len());

    for topic_result in &response.topics {
        let name = topic_result.name.to_string();
        let error_code = topic_result.error_code;
        let error_message = topic_result.error_message.as_ref().map(|s| s.to_string());

        if error_code == 0 {
            info!("Created topic: {}", name);
        } else if error_code == TOPIC_ALREADY_EXISTS {
            debug!("Topic already exists: {}", name);
        } else {
            warn!(
                "Failed to create topic {}: error_code={}, message={:?}",
                name, error_code, error_message
            );
        }

        results.push(CreateTopicResult {
            name,
            error_code,
            error_message,
        });
    }

    if let Some(failure) = results.iter().find(|r| !r.is_success_or_exists()) {
        return Err(KafkaError::BrokerError {
            code: failure.error_code,
            message: format!(
                "Failed to create topic {}: {}",
                failure.name,
                failure.error_message.as_deref().unwrap_or("no message")
            ),
        }
        .into());
    }

    Ok(results)
}
