//! Kafka client for protocol-level communication.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::protocol::{Decodable, Encodable};
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::KafkaConfig;
use crate::error::KafkaError;
use crate::message::KafkaRecord;
use crate::Result;

use super::metadata::{BrokerMetadata, TopicMetadata};
use super::{CreateTopicResult, FetchResponse, ProduceResponse, TopicToCreate};

/// Kafka client for protocol-level operations against one broker
pub struct KafkaClient {
    /// Configuration
    config: KafkaConfig,

    /// Connection to the current broker
    connection: Arc<Mutex<Option<BrokerConnection>>>,

    /// Broker metadata cache
    brokers: Arc<Mutex<HashMap<i32, BrokerMetadata>>>,

    /// Correlation ID counter
    correlation_id: AtomicI32,
}

struct BrokerConnection {
    stream: TcpStream,
    server: String,
}

impl KafkaClient {
    /// Create a new Kafka client
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            connection: Arc::new(Mutex::new(None)),
            brokers: Arc::new(Mutex::new(HashMap::new())),
            correlation_id: AtomicI32::new(1),
        }
    }

    /// Configuration this client was built with
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Connect to the first reachable bootstrap server
    pub async fn connect(&self) -> Result<()> {
        for server in &self.config.bootstrap_servers {
            match self.try_connect(server).await {
                Ok(stream) => {
                    let mut conn = self.connection.lock().await;
                    *conn = Some(BrokerConnection {
                        stream,
                        server: server.clone(),
                    });
                    debug!("Connected to Kafka broker: {}", server);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Failed to connect to {}: {}", server, e);
                    continue;
                }
            }
        }

        Err(KafkaError::NoBrokersAvailable.into())
    }

    /// Close the connection, if open. Safe to call more than once.
    pub async fn disconnect(&self) {
        let mut conn = self.connection.lock().await;
        if let Some(mut connection) = conn.take() {
            if let Err(e) = connection.stream.shutdown().await {
                debug!("Error closing connection to {}: {}", connection.server, e);
            }
            debug!("Disconnected from Kafka broker: {}", connection.server);
        }
    }

    /// Whether a connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Reconnect if a previous failure dropped the connection
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        self.connect().await
    }

    async fn try_connect(&self, server: &str) -> Result<TcpStream> {
        let connect_timeout = Duration::from_millis(self.config.connection.connect_timeout_ms);

        let tcp_stream = tokio::time::timeout(connect_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| KafkaError::ConnectionFailed {
                broker: server.to_string(),
                message: format!("connect timed out after {:?}", connect_timeout),
            })?
            .map_err(|e| KafkaError::ConnectionFailed {
                broker: server.to_string(),
                message: e.to_string(),
            })?;

        self.configure_socket(&tcp_stream, server)?;

        Ok(tcp_stream)
    }

    /// Configure TCP socket options (keepalive, nodelay) based on connection config.
    fn configure_socket(&self, stream: &TcpStream, server: &str) -> Result<()> {
        let conn_config = &self.config.connection;
        let sock_ref = SockRef::from(stream);

        if conn_config.tcp_nodelay {
            sock_ref
                .set_nodelay(true)
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Failed to set TCP_NODELAY: {}", e),
                })?;
        }

        if conn_config.tcp_keepalive {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(conn_config.keepalive_time_secs))
                .with_interval(Duration::from_secs(conn_config.keepalive_interval_secs));

            sock_ref
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Failed to set TCP keepalive: {}", e),
                })?;

            debug!(
                "TCP keepalive enabled for {}: time={}s, interval={}s",
                server, conn_config.keepalive_time_secs, conn_config.keepalive_interval_secs
            );
        }

        Ok(())
    }

    /// Get the next correlation ID
    fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and receive a response, bounded by the request timeout.
    ///
    /// A timed-out or failed exchange drops the connection, since the stream
    /// may hold a partial frame; the next call must reconnect.
    pub async fn send_request<Req, Resp>(&self, api_key: ApiKey, request: Req) -> Result<Resp>
    where
        Req: Encodable + Default,
        Resp: Decodable + Default,
    {
        let timeout = Duration::from_millis(self.config.connection.request_timeout_ms);

        let outcome = tokio::time::timeout(timeout, self.exchange(api_key, request)).await;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.disconnect().await;
                Err(e)
            }
            Err(_) => {
                self.disconnect().await;
                Err(KafkaError::Timeout(format!(
                    "{:?} request exceeded {:?}",
                    api_key, timeout
                ))
                .into())
            }
        }
    }

    async fn exchange<Req, Resp>(&self, api_key: ApiKey, request: Req) -> Result<Resp>
    where
        Req: Encodable + Default,
        Resp: Decodable + Default,
    {
        let correlation_id = self.next_correlation_id();
        let api_version = self.get_api_version(api_key);

        let header = RequestHeader::default()
            .with_request_api_key(api_key as i16)
            .with_request_api_version(api_version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(StrBytes::from_string(
                self.config.client_id().to_string(),
            )));

        let header_version = api_key.request_header_version(api_version);
        let mut buf = BytesMut::new();

        // Length prefix, patched once the body is encoded
        buf.put_i32(0);

        header
            .encode(&mut buf, header_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to encode header: {:?}", e)))?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to encode request: {:?}", e)))?;

        let len = (buf.len() - 4) as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        trace!(
            "Sending request: api_key={:?}, api_version={}, correlation_id={}, len={}",
            api_key,
            api_version,
            correlation_id,
            len
        );

        let mut conn = self.connection.lock().await;
        let conn = conn
            .as_mut()
            .ok_or_else(|| KafkaError::Protocol("Not connected".to_string()))?;

        conn.stream
            .write_all(&buf)
            .await
            .map_err(|e| KafkaError::Protocol(format!("Failed to send request: {}", e)))?;

        let mut len_buf = [0u8; 4];
        conn.stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| KafkaError::Protocol(format!("Failed to read response length: {}", e)))?;
        let response_len = i32::from_be_bytes(len_buf) as usize;

        trace!("Receiving response: len={}", response_len);

        let mut response_buf = vec![0u8; response_len];
        conn.stream
            .read_exact(&mut response_buf)
            .await
            .map_err(|e| KafkaError::Protocol(format!("Failed to read response body: {}", e)))?;

        let mut response_bytes = Bytes::from(response_buf);
        let response_header_version = api_key.response_header_version(api_version);
        let response_header = ResponseHeader::decode(&mut response_bytes, response_header_version)
            .map_err(|e| {
                KafkaError::Protocol(format!("Failed to decode response header: {:?}", e))
            })?;

        if response_header.correlation_id != correlation_id {
            return Err(KafkaError::Protocol(format!(
                "Correlation id mismatch: sent {}, received {}",
                correlation_id, response_header.correlation_id
            ))
            .into());
        }

        let response = Resp::decode(&mut response_bytes, api_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to decode response: {:?}", e)))?;

        Ok(response)
    }

    /// Get the API version to use for a given API key
    fn get_api_version(&self, api_key: ApiKey) -> i16 {
        // Versions supported by brokers from 2.4 through 4.x
        match api_key {
            ApiKey::Metadata => 9,
            ApiKey::Fetch => 11,
            ApiKey::Produce => 8,
            ApiKey::ListOffsets => 5,
            ApiKey::CreateTopics => 5,
            ApiKey::OffsetCommit => 2,
            ApiKey::OffsetFetch => 1,
            ApiKey::FindCoordinator => 1,
            _ => 0,
        }
    }

    /// Fetch cluster metadata
    pub async fn fetch_metadata(&self, topics: Option<&[String]>) -> Result<Vec<TopicMetadata>> {
        super::metadata::fetch_metadata(self, topics).await
    }

    /// Get metadata for a specific topic
    pub async fn get_topic_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let topics = self.fetch_metadata(Some(&[topic.to_string()])).await?;
        topics
            .into_iter()
            .find(|t| t.name == topic)
            .ok_or_else(|| KafkaError::TopicNotExists(topic.to_string()).into())
    }

    /// Fetch records from a topic/partition
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
        max_wait_ms: i32,
    ) -> Result<FetchResponse> {
        super::fetch::fetch(self, topic, partition, offset, max_bytes, max_wait_ms).await
    }

    /// Get the earliest and latest offsets for a partition
    pub async fn get_offsets(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        super::fetch::get_offsets(self, topic, partition).await
    }

    /// Produce records to a topic/partition
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        records: Vec<KafkaRecord>,
        options: super::ProduceOptions,
    ) -> Result<ProduceResponse> {
        super::produce::produce(self, topic, partition, records, options).await
    }

    /// Create topics in the Kafka cluster
    pub async fn create_topics(
        &self,
        topics: Vec<TopicToCreate>,
        timeout_ms: i32,
    ) -> Result<Vec<CreateTopicResult>> {
        super::admin::create_topics(self, topics, timeout_ms).await
    }

    /// Update broker cache
    pub async fn update_brokers(&self, brokers: Vec<BrokerMetadata>) {
        let mut cache = self.brokers.lock().await;
        for broker in brokers {
            cache.insert(broker.node_id, broker);
        }
    }

    /// Snapshot of the broker cache
    pub async fn brokers(&self) -> Vec<BrokerMetadata> {
        let cache = self.brokers.lock().await;
        cache.values().cloned().collect()
    }
}
