//! Partition leader routing for multi-broker Kafka clusters.
//!
//! Fetch, produce and offset lookups must reach the partition leader, and
//! offset commits must reach the group coordinator. The router keeps one
//! connection per broker and re-resolves leadership when a broker answers
//! NOT_LEADER_OR_FOLLOWER.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::error::KafkaError;
use crate::message::KafkaRecord;
use crate::Result;

use super::consumer_groups::{self, CommittedOffset};
use super::metadata::{BrokerMetadata, TopicMetadata};
use super::{
    CreateTopicResult, FetchResponse, KafkaClient, ProduceOptions, ProduceResponse, TopicToCreate,
};

/// NOT_LEADER_OR_FOLLOWER
const NOT_LEADER: i16 = 6;

/// Codes telling the client its cached coordinator is stale
const COORDINATOR_CODES: [i16; 3] = [14, 15, 16];

/// Routes Kafka requests to the correct partition leader broker.
pub struct PartitionLeaderRouter {
    /// Kafka configuration (for creating new connections)
    config: KafkaConfig,

    /// Map of broker_id -> BrokerMetadata (host:port info)
    broker_metadata: Arc<RwLock<HashMap<i32, BrokerMetadata>>>,

    /// Map of (topic, partition) -> leader broker_id
    partition_leaders: Arc<RwLock<HashMap<(String, i32), i32>>>,

    /// Connection pool: broker_id -> KafkaClient
    connections: Arc<RwLock<HashMap<i32, Arc<KafkaClient>>>>,

    /// Connection to the group coordinator, once located
    coordinator: Arc<RwLock<Option<Arc<KafkaClient>>>>,

    /// Bootstrap client for metadata and admin operations
    bootstrap_client: Arc<KafkaClient>,
}

impl PartitionLeaderRouter {
    /// Connect to the bootstrap servers.
    pub async fn new(config: KafkaConfig) -> Result<Self> {
        let bootstrap_client = Arc::new(KafkaClient::new(config.clone()));
        bootstrap_client.connect().await?;

        Ok(Self {
            config,
            broker_metadata: Arc::new(RwLock::new(HashMap::new())),
            partition_leaders: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            coordinator: Arc::new(RwLock::new(None)),
            bootstrap_client,
        })
    }

    /// Refresh metadata for `topic` and update its partition leaders.
    pub async fn refresh_topic(&self, topic: &str) -> Result<TopicMetadata> {
        debug!("Refreshing metadata for topic {}", topic);

        self.bootstrap_client.ensure_connected().await?;
        let metadata = self.bootstrap_client.get_topic_metadata(topic).await?;

        {
            let mut broker_meta = self.broker_metadata.write().await;
            for broker in self.bootstrap_client.brokers().await {
                broker_meta.insert(broker.node_id, broker);
            }
        }

        {
            let mut leaders = self.partition_leaders.write().await;
            leaders.retain(|(t, _), _| t != topic);
            for partition in &metadata.partitions {
                leaders.insert(
                    (metadata.name.clone(), partition.partition_id),
                    partition.leader_id,
                );
                debug!(
                    "Partition {}/{} leader: broker {}",
                    metadata.name, partition.partition_id, partition.leader_id
                );
            }
        }

        info!(
            "Topic {} has {} partitions",
            metadata.name,
            metadata.partitions.len()
        );
        Ok(metadata)
    }

    /// Get the leader broker ID for a partition.
    pub async fn get_leader(&self, topic: &str, partition: i32) -> Result<i32> {
        let leaders = self.partition_leaders.read().await;
        leaders
            .get(&(topic.to_string(), partition))
            .copied()
            .ok_or_else(|| {
                KafkaError::PartitionNotAvailable {
                    topic: topic.to_string(),
                    partition,
                }
                .into()
            })
    }

    /// Get or create a connection to a specific broker.
    async fn get_broker_connection(&self, broker_id: i32) -> Result<Arc<KafkaClient>> {
        let cached = {
            let connections = self.connections.read().await;
            connections.get(&broker_id).cloned()
        };
        if let Some(client) = cached {
            // A failed request drops the socket; reopen it in place
            client.ensure_connected().await?;
            return Ok(client);
        }

        let broker_addr = {
            let brokers = self.broker_metadata.read().await;
            brokers
                .get(&broker_id)
                .map(|b| b.address())
                .ok_or_else(|| KafkaError::Protocol(format!("Unknown broker ID: {}", broker_id)))?
        };

        debug!(
            "Creating new connection to broker {} at {}",
            broker_id, broker_addr
        );

        let client = Arc::new(self.client_for(broker_addr));
        client.connect().await?;

        let mut connections = self.connections.write().await;
        connections.insert(broker_id, Arc::clone(&client));

        Ok(client)
    }

    fn client_for(&self, address: String) -> KafkaClient {
        let mut broker_config = self.config.clone();
        broker_config.bootstrap_servers = vec![address];
        KafkaClient::new(broker_config)
    }

    /// Get a client connected to the partition's leader broker.
    async fn get_leader_client(&self, topic: &str, partition: i32) -> Result<Arc<KafkaClient>> {
        let leader_id = self.get_leader(topic, partition).await?;
        self.get_broker_connection(leader_id).await
    }

    /// Fetch records from a partition, routing to the correct leader.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
        max_wait_ms: i32,
    ) -> Result<FetchResponse> {
        match self
            .fetch_internal(topic, partition, offset, max_bytes, max_wait_ms)
            .await
        {
            Err(e) if is_not_leader_error(&e) => {
                warn!(
                    "NOT_LEADER_OR_FOLLOWER for {}/{} during fetch, refreshing metadata",
                    topic, partition
                );
                self.refresh_topic(topic).await?;
                self.fetch_internal(topic, partition, offset, max_bytes, max_wait_ms)
                    .await
            }
            other => other,
        }
    }

    async fn fetch_internal(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
        max_wait_ms: i32,
    ) -> Result<FetchResponse> {
        let client = self.get_leader_client(topic, partition).await?;
        client
            .fetch(topic, partition, offset, max_bytes, max_wait_ms)
            .await
    }

    /// Get the earliest and latest offsets for a partition.
    pub async fn get_offsets(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        match self.get_offsets_internal(topic, partition).await {
            Err(e) if is_not_leader_error(&e) => {
                warn!(
                    "NOT_LEADER_OR_FOLLOWER for {}/{} during get_offsets, refreshing metadata",
                    topic, partition
                );
                self.refresh_topic(topic).await?;
                self.get_offsets_internal(topic, partition).await
            }
            other => other,
        }
    }

    async fn get_offsets_internal(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        let client = self.get_leader_client(topic, partition).await?;
        client.get_offsets(topic, partition).await
    }

    /// Produce records to a partition, routing to the correct leader.
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        records: Vec<KafkaRecord>,
        options: ProduceOptions,
    ) -> Result<ProduceResponse> {
        match self
            .produce_internal(topic, partition, records.clone(), options)
            .await
        {
            Err(e) if is_not_leader_error(&e) => {
                warn!(
                    "NOT_LEADER_OR_FOLLOWER for {}/{} during produce, refreshing metadata",
                    topic, partition
                );
                self.refresh_topic(topic).await?;
                self.produce_internal(topic, partition, records, options)
                    .await
            }
            other => other,
        }
    }

    async fn produce_internal(
        &self,
        topic: &str,
        partition: i32,
        records: Vec<KafkaRecord>,
        options: ProduceOptions,
    ) -> Result<ProduceResponse> {
        let client = self.get_leader_client(topic, partition).await?;
        client.produce(topic, partition, records, options).await
    }

    /// Create topics through the bootstrap connection.
    pub async fn create_topics(
        &self,
        topics: Vec<TopicToCreate>,
        timeout_ms: i32,
    ) -> Result<Vec<CreateTopicResult>> {
        self.bootstrap_client.ensure_connected().await?;
        self.bootstrap_client.create_topics(topics, timeout_ms).await
    }

    /// Connection to the coordinator of `group_id`, located on first use.
    async fn coordinator_client(&self, group_id: &str) -> Result<Arc<KafkaClient>> {
        let cached = self.coordinator.read().await.clone();
        if let Some(client) = cached {
            client.ensure_connected().await?;
            return Ok(client);
        }

        self.bootstrap_client.ensure_connected().await?;
        let coordinator =
            consumer_groups::find_coordinator(&self.bootstrap_client, group_id).await?;

        let client = Arc::new(self.client_for(coordinator.address()));
        client.connect().await?;

        let mut slot = self.coordinator.write().await;
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Forget the coordinator if the error says it moved.
    async fn check_coordinator(&self, error: &crate::Error) {
        if matches!(error.broker_code(), Some(code) if COORDINATOR_CODES.contains(&code)) {
            debug!("Group coordinator changed, will look it up again");
            let stale = self.coordinator.write().await.take();
            if let Some(client) = stale {
                client.disconnect().await;
            }
        }
    }

    /// Fetch committed offsets of `group_id` for `partitions` of `topic`.
    pub async fn fetch_committed_offsets(
        &self,
        group_id: &str,
        topic: &str,
        partitions: &[i32],
    ) -> Result<Vec<CommittedOffset>> {
        let client = self.coordinator_client(group_id).await?;
        let result = consumer_groups::fetch_offsets(&client, group_id, topic, partitions).await;
        if let Err(ref e) = result {
            self.check_coordinator(e).await;
        }
        result
    }

    /// Commit `(partition, next_offset)` pairs of `topic` for `group_id`.
    pub async fn commit_offsets(
        &self,
        group_id: &str,
        topic: &str,
        offsets: &[(i32, i64)],
    ) -> Result<()> {
        let client = self.coordinator_client(group_id).await?;
        let result = consumer_groups::commit_offsets(&client, group_id, topic, offsets).await;
        if let Err(ref e) = result {
            self.check_coordinator(e).await;
        }
        result
    }

    /// Reopen the bootstrap connection if it was dropped.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.bootstrap_client.ensure_connected().await
    }

    /// Close every connection held by the router. Safe to call more than once.
    pub async fn disconnect_all(&self) {
        let pooled: Vec<Arc<KafkaClient>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, client)| client).collect()
        };
        for client in pooled {
            client.disconnect().await;
        }

        if let Some(client) = self.coordinator.write().await.take() {
            client.disconnect().await;
        }

        self.bootstrap_client.disconnect().await;
        debug!("Closed all broker connections");
    }
}

/// Check if an error is a NOT_LEADER_OR_FOLLOWER error (code 6).
fn is_not_leader_error(error: &crate::Error) -> bool {
    error.broker_code() == Some(NOT_LEADER)
}
