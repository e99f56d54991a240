//! Subscription seam between the broker and the materializer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{KafkaConfig, MaterializerOptions, StartOffset};
use crate::emitter::PublishedRecord;
use crate::error::KafkaError;
use crate::kafka::{PartitionLeaderRouter, TopicMetadata};
use crate::message::KafkaRecord;
use crate::retry::with_retry;
use crate::{Error, Result};

/// OFFSET_OUT_OF_RANGE
const OFFSET_OUT_OF_RANGE: i16 = 1;

/// A record delivered from one partition
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub partition: i32,
    pub record: KafkaRecord,
}

/// Source of consumed messages
#[async_trait]
pub trait MessageSubscription: Send + Sync {
    /// Resolve partitions and their starting offsets
    async fn subscribe(&self) -> Result<()>;

    /// Next batch of messages; empty when nothing arrived within the poll wait
    async fn poll(&self) -> Result<Vec<ConsumedMessage>>;

    /// Record every message delivered so far as handled
    async fn commit(&self) -> Result<()>;

    /// Release broker connections. Safe to call more than once.
    async fn close(&self);
}

#[derive(Default)]
struct SubscriptionState {
    partitions: Vec<i32>,
    positions: HashMap<i32, i64>,
    committed: HashMap<i32, i64>,
    next: usize,
    /// Fetch size in bytes; grows when a single batch does not fit
    fetch_bytes: i32,
}

/// Reads every partition of a topic without joining the consumer group;
/// the group id is used for offset storage only.
pub struct KafkaSubscription {
    router: Arc<PartitionLeaderRouter>,
    topic: String,
    options: MaterializerOptions,
    state: tokio::sync::Mutex<SubscriptionState>,
}

impl KafkaSubscription {
    /// Connect to the cluster, retrying per the materializer's retry policy.
    pub async fn connect(
        kafka: &KafkaConfig,
        topic: impl Into<String>,
        options: MaterializerOptions,
    ) -> Result<Self> {
        let router = with_retry(&options.retry, "connect", || {
            PartitionLeaderRouter::new(kafka.clone())
        })
        .await?;
        info!("Connected to Kafka at {}", kafka.bootstrap_servers.join(","));

        Ok(Self {
            router: Arc::new(router),
            topic: topic.into(),
            options,
            state: tokio::sync::Mutex::new(SubscriptionState::default()),
        })
    }

    /// Wait until the topic exists and every partition has a leader.
    async fn wait_for_topic(&self) -> Result<TopicMetadata> {
        let mut waiting = false;
        loop {
            let attempt = with_retry(&self.options.retry, "topic metadata", || async {
                self.router.ensure_connected().await?;
                self.router.refresh_topic(&self.topic).await
            })
            .await;

            match attempt {
                Ok(metadata) if metadata.is_ready() => return Ok(metadata),
                Ok(_) | Err(Error::Kafka(KafkaError::TopicNotExists(_))) => {
                    if !waiting {
                        info!("Waiting for topic {} to be created", self.topic);
                        waiting = true;
                    }
                    let wait = self.options.fetch_max_wait_ms.max(100) as u64;
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn earliest_offset(&self, partition: i32) -> Result<i64> {
        let (earliest, _) = with_retry(&self.options.retry, "list offsets", || {
            self.router.get_offsets(&self.topic, partition)
        })
        .await?;
        Ok(earliest)
    }

    async fn committed_offsets(&self, partitions: &[i32]) -> Result<HashMap<i32, i64>> {
        let group_id = &self.options.group_id;
        let offsets = with_retry(&self.options.retry, "fetch committed offsets", || {
            self.router
                .fetch_committed_offsets(group_id, &self.topic, partitions)
        })
        .await?;

        Ok(offsets
            .into_iter()
            .filter(|o| o.error_code == 0 && o.offset >= 0)
            .map(|o| (o.partition, o.offset))
            .collect())
    }
}

#[async_trait]
impl MessageSubscription for KafkaSubscription {
    async fn subscribe(&self) -> Result<()> {
        let metadata = self.wait_for_topic().await?;
        let partitions = metadata.partition_ids();

        let committed = match self.options.start_offset {
            StartOffset::Earliest => HashMap::new(),
            StartOffset::Committed => self.committed_offsets(&partitions).await?,
        };

        let mut positions = HashMap::new();
        for &partition in &partitions {
            let position = match committed.get(&partition) {
                Some(&offset) => offset,
                None => self.earliest_offset(partition).await?,
            };
            debug!("Starting {}:{} at offset {}", self.topic, partition, position);
            positions.insert(partition, position);
        }

        info!(
            "Subscribed to {} ({} partitions, start: {:?})",
            self.topic,
            partitions.len(),
            self.options.start_offset
        );

        let mut state = self.state.lock().await;
        state.committed = positions.clone();
        state.positions = positions;
        state.partitions = partitions;
        state.next = 0;
        state.fetch_bytes = self.options.fetch_max_bytes;
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<ConsumedMessage>> {
        let mut state = self.state.lock().await;
        let count = state.partitions.len();
        if count == 0 {
            return Err(Error::Config("poll called before subscribe".to_string()));
        }

        // One pass over all partitions, starting after the last one served
        for _ in 0..count {
            let index = state.next;
            state.next = (index + 1) % count;
            let partition = state.partitions[index];
            let offset = state.positions.get(&partition).copied().unwrap_or(0);

            let fetched = loop {
                let max_bytes = state.fetch_bytes;
                let attempt = with_retry(&self.options.retry, "fetch", || {
                    self.router.fetch(
                        &self.topic,
                        partition,
                        offset,
                        max_bytes,
                        self.options.fetch_max_wait_ms,
                    )
                })
                .await;

                match attempt.as_ref().err().and_then(Error::required_fetch_bytes) {
                    Some(size) => {
                        let grown = grow_fetch_bytes(max_bytes, size);
                        warn!(
                            "Record batch at {}:{} offset {} needs {} bytes, raising fetch size from {} to {}",
                            self.topic, partition, offset, size, max_bytes, grown
                        );
                        state.fetch_bytes = grown;
                    }
                    None => break attempt,
                }
            };

            match fetched {
                Ok(response) => {
                    state.positions.insert(partition, response.next_offset);
                    if !response.records.is_empty() {
                        return Ok(response
                            .records
                            .into_iter()
                            .map(|record| ConsumedMessage { partition, record })
                            .collect());
                    }
                }
                Err(e) if e.broker_code() == Some(OFFSET_OUT_OF_RANGE) => {
                    let earliest = self.earliest_offset(partition).await?;
                    warn!(
                        "Offset {} out of range for {}:{}, resetting to earliest {}",
                        offset, self.topic, partition, earliest
                    );
                    state.positions.insert(partition, earliest);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Vec::new())
    }

    async fn commit(&self) -> Result<()> {
        if !self.options.commit_offsets {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let pending: Vec<(i32, i64)> = state
            .positions
            .iter()
            .filter(|(partition, offset)| state.committed.get(partition) != Some(offset))
            .map(|(&partition, &offset)| (partition, offset))
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        let group_id = &self.options.group_id;
        with_retry(&self.options.retry, "commit offsets", || {
            self.router.commit_offsets(group_id, &self.topic, &pending)
        })
        .await?;

        for (partition, offset) in pending {
            state.committed.insert(partition, offset);
        }
        Ok(())
    }

    async fn close(&self) {
        self.router.disconnect_all().await;
        debug!("Subscription closed");
    }
}

/// Next fetch size after a batch of `required` bytes did not fit in `current`.
fn grow_fetch_bytes(current: i32, required: usize) -> i32 {
    let required = i32::try_from(required).unwrap_or(i32::MAX);
    current.saturating_mul(2).max(required)
}

enum Delivery {
    Message(ConsumedMessage),
    Fault(String),
}

/// In-memory subscription for tests.
///
/// Messages are delivered in insertion order, in batches of `batch_size`.
/// A queued fault is returned as a connection error when it reaches the
/// front of the queue.
pub struct MemorySubscription {
    queue: Mutex<VecDeque<Delivery>>,
    batch_size: usize,
    idle: AtomicBool,
    closed: AtomicBool,
    commits: AtomicUsize,
}

impl MemorySubscription {
    pub fn new(messages: Vec<ConsumedMessage>) -> Self {
        Self {
            queue: Mutex::new(messages.into_iter().map(Delivery::Message).collect()),
            batch_size: 10,
            idle: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
        }
    }

    /// Deliver what a [`MemoryPublisher`](crate::emitter::MemoryPublisher) accepted
    pub fn from_published(published: &[PublishedRecord]) -> Self {
        Self::new(
            published
                .iter()
                .map(|p| ConsumedMessage {
                    partition: p.partition,
                    record: p.record.clone(),
                })
                .collect(),
        )
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Queue another message
    pub fn push(&self, message: ConsumedMessage) {
        self.queue.lock().push_back(Delivery::Message(message));
        self.idle.store(false, Ordering::SeqCst);
    }

    /// Queue a broker failure
    pub fn push_fault(&self, reason: &str) {
        self.queue.lock().push_back(Delivery::Fault(reason.to_string()));
        self.idle.store(false, Ordering::SeqCst);
    }

    /// True once a poll has found the queue empty, so every earlier batch
    /// has been handed out and handled
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Number of commits that had deliveries to record
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSubscription for MemorySubscription {
    async fn subscribe(&self) -> Result<()> {
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<ConsumedMessage>> {
        if self.is_closed() {
            return Err(Error::Connection("subscription is closed".to_string()));
        }

        let batch = {
            let mut queue = self.queue.lock();
            if let Some(Delivery::Fault(_)) = queue.front() {
                if let Some(Delivery::Fault(reason)) = queue.pop_front() {
                    return Err(Error::Connection(reason));
                }
            }

            let mut batch = Vec::new();
            while batch.len() < self.batch_size {
                match queue.front() {
                    Some(Delivery::Message(_)) => {
                        if let Some(Delivery::Message(message)) = queue.pop_front() {
                            batch.push(message);
                        }
                    }
                    _ => break,
                }
            }
            batch
        };

        if batch.is_empty() {
            self.idle.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(batch)
    }

    async fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
