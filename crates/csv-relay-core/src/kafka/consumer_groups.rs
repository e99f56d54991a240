//! Committed offset storage for a consumer group.
//!
//! Offsets are committed outside of group membership: the request keeps the
//! default generation of -1, which the broker accepts for groups with no
//! active members.

use kafka_protocol::messages::{
    ApiKey, FindCoordinatorRequest, FindCoordinatorResponse, GroupId, OffsetCommitRequest,
    OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, warn};

use super::metadata::BrokerMetadata;
use super::KafkaClient;
use crate::error::KafkaError;
use crate::Result;

/// Committed offset for a partition
#[derive(Debug, Clone)]
pub struct CommittedOffset {
    /// Topic name
    pub topic: String,
    /// Partition ID
    pub partition: i32,
    /// Committed offset, -1 if the group has none
    pub offset: i64,
    /// Error code (0 = success)
    pub error_code: i16,
}

/// Fetch committed offsets of `group_id` for the given partitions of `topic`
pub async fn fetch_offsets(
    client: &KafkaClient,
    group_id: &str,
    topic: &str,
    partitions: &[i32],
) -> Result<Vec<CommittedOffset>> {
    let request_topic =
        kafka_protocol::messages::offset_fetch_request::OffsetFetchRequestTopic::default()
            .with_name(TopicName(StrBytes::from_string(topic.to_string())))
            .with_partition_indexes(partitions.to_vec());

    let request = OffsetFetchRequest::default()
        .with_group_id(GroupId(StrBytes::from_string(group_id.to_string())))
        .with_topics(Some(vec![request_topic]));

    let response: OffsetFetchResponse = client.send_request(ApiKey::OffsetFetch, request).await?;

    if response.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: response.error_code,
            message: format!("OffsetFetch failed for group {}", group_id),
        }
        .into());
    }

    let mut offsets = Vec::new();
    for topic in response.topics {
        for partition in topic.partitions {
            offsets.push(CommittedOffset {
                topic: topic.name.to_string(),
                partition: partition.partition_index,
                offset: partition.committed_offset,
                error_code: partition.error_code,
            });
        }
    }

    debug!(
        "Fetched {} committed offsets for group {}",
        offsets.len(),
        group_id
    );
    Ok(offsets)
}

/// Commit `(partition, next_offset)` pairs of `topic` for `group_id`
pub async fn commit_offsets(
    client: &KafkaClient,
    group_id: &str,
    topic: &str,
    offsets: &[(i32, i64)],
) -> Result<()> {
    if offsets.is_empty() {
        return Ok(());
    }

    let partition_data: Vec<_> = offsets
        .iter()
        .map(|(partition, offset)| {
            kafka_protocol::messages::offset_commit_request::OffsetCommitRequestPartition::default()
                .with_partition_index(*partition)
                .with_committed_offset(*offset)
        })
        .collect();

    let request_topic =
        kafka_protocol::messages::offset_commit_request::OffsetCommitRequestTopic::default()
            .with_name(TopicName(StrBytes::from_string(topic.to_string())))
            .with_partitions(partition_data);

    let request = OffsetCommitRequest::default()
        .with_group_id(GroupId(StrBytes::from_string(group_id.to_string())))
        .with_topics(vec![request_topic]);

    let response: OffsetCommitResponse = client.send_request(ApiKey::OffsetCommit, request).await?;

    for topic in response.topics {
        for partition in topic.partitions {
            if partition.error_code != 0 {
                warn!(
                    "Failed to commit offset for {}:{} - error code {}",
                    topic.name.as_str(),
                    partition.partition_index,
                    partition.error_code
                );
                return Err(KafkaError::BrokerError {
                    code: partition.error_code,
                    message: format!(
                        "OffsetCommit error for {}:{}",
                        topic.name.as_str(),
                        partition.partition_index
                    ),
                }
                .into());
            }
        }
    }

    debug!("Committed {} offsets for group {}", offsets.len(), group_id);
    Ok(())
}

/// Locate the broker coordinating `group_id`
pub async fn find_coordinator(client: &KafkaClient, group_id: &str) -> Result<BrokerMetadata> {
    let request = FindCoordinatorRequest::default()
        .with_key(StrBytes::from_string(group_id.to_string()))
        .with_key_type(0); // GROUP

    let response: FindCoordinatorResponse =
        client.send_request(ApiKey::FindCoordinator, request).await?;

    if response.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: response.error_code,
            message: format!("FindCoordinator failed for group {}", group_id),
        }
        .into());
    }

    let coordinator = BrokerMetadata {
        node_id: response.node_id.0,
        host: response.host.to_string(),
        port: response.port,
    };
    debug!(
        "Group {} is coordinated by broker {} at {}",
        group_id,
        coordinator.node_id,
        coordinator.address()
    );
    Ok(coordinator)
}
