//! Kafka Metadata API implementation.

use kafka_protocol::messages::{ApiKey, MetadataRequest, MetadataResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use tracing::debug;

use super::KafkaClient;
use crate::Result;

/// Broker metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerMetadata {
    /// `host:port` address of the broker
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Topic metadata
#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    /// Partition ids in ascending order
    pub fn partition_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.partitions.iter().map(|p| p.partition_id).collect();
        ids.sort_unstable();
        ids
    }

    /// True once the topic has partitions and each has an elected leader
    pub fn is_ready(&self) -> bool {
        !self.partitions.is_empty() && self.partitions.iter().all(|p| p.leader_id >= 0)
    }
}

/// Partition metadata
#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub partition_id: i32,
    pub leader_id: i32,
}

/// Fetch cluster metadata from the broker
pub async fn fetch_metadata(
    client: &KafkaClient,
    topics: Option<&[String]>,
) -> Result<Vec<TopicMetadata>> {
    let request = match topics {
        Some(topic_names) => {
            let topic_list: Vec<_> = topic_names
                .iter()
                .map(|name| {
                    kafka_protocol::messages::metadata_request::MetadataRequestTopic::default()
                        .with_name(Some(TopicName(StrBytes::from_string(name.clone()))))
                })
                .collect();
            MetadataRequest::default()
                .with_topics(Some(topic_list))
                .with_allow_auto_topic_creation(false)
        }
        None => MetadataRequest::default()
            .with_topics(None)
            .with_allow_auto_topic_creation(false),
    };

    let response: MetadataResponse = client.send_request(ApiKey::Metadata, request).await?;

    let brokers: Vec<BrokerMetadata> = response
        .brokers
        .iter()
        .map(|broker| BrokerMetadata {
            node_id: broker.node_id.0,
            host: broker.host.to_string(),
            port: broker.port,
        })
        .collect();

    debug!("Discovered {} brokers", brokers.len());
    client.update_brokers(brokers).await;

    // Topics still electing leaders report an error code and are left out,
    // so callers see them as missing and retry.
    let topics: Vec<TopicMetadata> = response
        .topics
        .iter()
        .filter_map(|topic| {
            if topic.error_code != 0 {
                let name = topic.name.as_ref().map(|n| n.as_str()).unwrap_or("unknown");
                debug!("Topic {} has error code {}", name, topic.error_code);
                return None;
            }

            let name = topic.name.as_ref()?.to_string();

            let partitions: Vec<PartitionMetadata> = topic
                .partitions
                .iter()
                .map(|p| PartitionMetadata {
                    partition_id: p.partition_index,
                    leader_id: p.leader_id.0,
                })
                .collect();

            Some(TopicMetadata { name, partitions })
        })
        .collect();

    debug!("Discovered {} topics", topics.len());
    Ok(topics)
}
