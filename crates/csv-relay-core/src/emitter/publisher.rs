//! Publishing seam between the emitter and the broker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{EmitterOptions, KafkaConfig};
use crate::error::KafkaError;
use crate::kafka::partitioner::partition_for_key;
use crate::kafka::{PartitionLeaderRouter, ProduceOptions, TopicToCreate};
use crate::message::{KafkaRecord, RelayMessage};
use crate::retry::with_retry;
use crate::{Error, Result};

/// Where a published message landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Destination for emitted rows
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Make `topic` ready to receive messages
    async fn prepare(&self, topic: &str) -> Result<()>;

    /// Publish one message and wait for its acknowledgment
    async fn publish(&self, topic: &str, message: &RelayMessage) -> Result<PublishReceipt>;

    /// Release broker connections. Safe to call more than once.
    async fn close(&self);
}

/// Publisher producing to a Kafka cluster.
pub struct KafkaPublisher {
    router: Arc<PartitionLeaderRouter>,
    options: EmitterOptions,
    partition_counts: Mutex<HashMap<String, usize>>,
}

impl KafkaPublisher {
    /// Connect to the cluster, retrying per the emitter's retry policy.
    pub async fn connect(kafka: &KafkaConfig, options: EmitterOptions) -> Result<Self> {
        let router = with_retry(&options.retry, "connect", || {
            PartitionLeaderRouter::new(kafka.clone())
        })
        .await?;
        info!("Connected to Kafka at {}", kafka.bootstrap_servers.join(","));

        Ok(Self {
            router: Arc::new(router),
            options,
            partition_counts: Mutex::new(HashMap::new()),
        })
    }

    async fn provision(&self, topic: &str) -> Result<()> {
        let provisioning = &self.options.create_topic;
        let spec = TopicToCreate {
            name: topic.to_string(),
            num_partitions: provisioning.partitions,
            replication_factor: provisioning.replication_factor,
        };

        with_retry(&self.options.retry, "create topic", || async {
            self.router
                .create_topics(vec![spec.clone()], self.options.produce_timeout_ms)
                .await
        })
        .await?;
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<usize> {
        self.partition_counts
            .lock()
            .get(topic)
            .copied()
            .ok_or_else(|| Error::Kafka(KafkaError::TopicNotExists(topic.to_string())))
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn prepare(&self, topic: &str) -> Result<()> {
        if self.options.create_topic.enabled {
            self.provision(topic).await?;
        }

        // Freshly created topics report no leader until election completes
        let metadata = with_retry(&self.options.retry, "topic metadata", || async {
            let metadata = self.router.refresh_topic(topic).await?;
            if !metadata.is_ready() {
                return Err(Error::Kafka(KafkaError::TopicNotExists(topic.to_string())));
            }
            Ok(metadata)
        })
        .await?;

        debug!(
            "Publishing to {} across {} partitions",
            topic,
            metadata.partitions.len()
        );
        self.partition_counts
            .lock()
            .insert(topic.to_string(), metadata.partitions.len());
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &RelayMessage) -> Result<PublishReceipt> {
        let partition = partition_for_key(message.key.as_bytes(), self.partition_count(topic)?);
        let record = message.to_kafka_record()?;
        let produce_options = ProduceOptions {
            acks: self.options.acks.as_i16(),
            timeout_ms: self.options.produce_timeout_ms,
        };

        let response = with_retry(&self.options.retry, "publish", || async {
            self.router
                .produce(topic, partition, vec![record.clone()], produce_options)
                .await
        })
        .await?;

        Ok(PublishReceipt {
            partition,
            offset: response.base_offset,
        })
    }

    async fn close(&self) {
        self.router.disconnect_all().await;
        debug!("Publisher closed");
    }
}

/// A record accepted by a [`MemoryPublisher`]
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub record: KafkaRecord,
}

/// In-memory publisher for tests and dry runs.
///
/// Partition selection matches [`KafkaPublisher`], and offsets are assigned
/// per partition starting at zero.
pub struct MemoryPublisher {
    partitions: usize,
    published: Mutex<Vec<PublishedRecord>>,
    failing_sources: Mutex<HashSet<String>>,
    prepared: Mutex<HashSet<String>>,
    closed: Mutex<bool>,
    stall_after: Mutex<Option<usize>>,
}

impl MemoryPublisher {
    /// Create a publisher simulating a topic with `partitions` partitions
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            published: Mutex::new(Vec::new()),
            failing_sources: Mutex::new(HashSet::new()),
            prepared: Mutex::new(HashSet::new()),
            closed: Mutex::new(false),
            stall_after: Mutex::new(None),
        }
    }

    /// Accept `count` publishes, then leave every later one pending forever,
    /// as a broker that stops acknowledging would.
    pub fn stall_after(&self, count: usize) {
        *self.stall_after.lock() = Some(count);
    }

    /// Reject every publish for rows of `source`
    pub fn fail_source(&self, source: &str) {
        self.failing_sources.lock().insert(source.to_string());
    }

    /// Everything published so far, in publish order
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.published.lock().clone()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl MessagePublisher for MemoryPublisher {
    async fn prepare(&self, topic: &str) -> Result<()> {
        self.prepared.lock().insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &RelayMessage) -> Result<PublishReceipt> {
        if *self.closed.lock() {
            return Err(Error::Connection("publisher is closed".to_string()));
        }
        if !self.prepared.lock().contains(topic) {
            return Err(Error::Kafka(KafkaError::TopicNotExists(topic.to_string())));
        }
        if self.failing_sources.lock().contains(&message.source) {
            return Err(Error::Kafka(KafkaError::BrokerError {
                code: 10,
                message: format!("rejected row of {}", message.source),
            }));
        }

        let stalled = self
            .stall_after
            .lock()
            .is_some_and(|count| self.published.lock().len() >= count);
        if stalled {
            return futures::future::pending().await;
        }

        let partition = partition_for_key(message.key.as_bytes(), self.partitions);
        let mut record = message.to_kafka_record()?;

        let mut published = self.published.lock();
        let offset = published
            .iter()
            .filter(|p| p.topic == topic && p.partition == partition)
            .count() as i64;
        record.offset = offset;
        published.push(PublishedRecord {
            topic: topic.to_string(),
            partition,
            offset,
            record,
        });

        Ok(PublishReceipt { partition, offset })
    }

    async fn close(&self) {
        *self.closed.lock() = true;
    }
}
