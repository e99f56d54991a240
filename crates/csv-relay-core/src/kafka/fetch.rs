//! Kafka Fetch and ListOffsets API implementation.

use bytes::Bytes;
use kafka_protocol::messages::{
    ApiKey, BrokerId, FetchRequest, FetchResponse as KafkaFetchResponse, ListOffsetsRequest,
    TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{Record, RecordBatchDecoder};
use tracing::{debug, trace};

use super::KafkaClient;
use crate::error::KafkaError;
use crate::message::{KafkaRecord, RecordHeader};
use crate::Result;

/// ListOffsets timestamp selecting the log start offset
const EARLIEST_TIMESTAMP: i64 = -2;

/// ListOffsets timestamp selecting the log end offset
const LATEST_TIMESTAMP: i64 = -1;

/// Response from a fetch operation
#[derive(Debug)]
pub struct FetchResponse {
    /// Records fetched, at or after the requested offset
    pub records: Vec<KafkaRecord>,
    /// Next offset to fetch
    pub next_offset: i64,
}

/// Fetch records from a topic/partition
pub async fn fetch(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    offset: i64,
    max_bytes: i32,
    max_wait_ms: i32,
) -> Result<FetchResponse> {
    let fetch_partition = kafka_protocol::messages::fetch_request::FetchPartition::default()
        .with_partition(partition)
        .with_fetch_offset(offset)
        .with_partition_max_bytes(max_bytes)
        .with_log_start_offset(-1);

    let fetch_topic = kafka_protocol::messages::fetch_request::FetchTopic::default()
        .with_topic(TopicName(StrBytes::from_string(topic.to_string())))
        .with_partitions(vec![fetch_partition]);

    let request = FetchRequest::default()
        .with_replica_id(BrokerId(-1)) // Client mode
        .with_max_wait_ms(max_wait_ms)
        .with_min_bytes(1)
        .with_max_bytes(max_bytes)
        .with_isolation_level(0) // READ_UNCOMMITTED
        .with_topics(vec![fetch_topic]);

    let response: KafkaFetchResponse = client.send_request(ApiKey::Fetch, request).await?;

    let mut records = Vec::new();
    let mut next_offset = offset;

    for topic_response in &response.responses {
        if topic_response.topic.as_str() != topic {
            continue;
        }

        for partition_response in &topic_response.partitions {
            if partition_response.partition_index != partition {
                continue;
            }

            if partition_response.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition_response.error_code,
                    message: format!(
                        "Fetch error for {}:{}: code {}",
                        topic, partition, partition_response.error_code
                    ),
                }
                .into());
            }

            if let Some(ref records_data) = partition_response.records {
                if !records_data.is_empty() {
                    for record in decode_records(records_data, max_bytes)? {
                        // A batch may start before the requested offset
                        if record.offset < offset {
                            continue;
                        }
                        // Control markers occupy offsets but carry no data
                        next_offset = record.offset + 1;
                        if record.control {
                            continue;
                        }
                        records.push(convert_record(&record));
                    }
                }
            }
        }
    }

    trace!(
        "Fetched {} records from {}:{} starting at offset {}",
        records.len(),
        topic,
        partition,
        offset
    );

    Ok(FetchResponse {
        records,
        next_offset,
    })
}

/// Length of the batch header up to and including the batchLength field
const BATCH_LENGTH_PREFIX: usize = 12;

/// Decode the complete record batches in a fetch response.
///
/// Brokers cut the response at `max_bytes`, so the last batch may be partial.
/// It is dropped and fetched again from the next offset. When not even the
/// first batch is complete, the error carries the size that batch needs.
fn decode_records(data: &Bytes, max_bytes: i32) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while data.len() - pos >= BATCH_LENGTH_PREFIX {
        let length = i32::from_be_bytes([
            data[pos + 8],
            data[pos + 9],
            data[pos + 10],
            data[pos + 11],
        ]);
        if length < 0 {
            return Err(
                KafkaError::Protocol(format!("Negative record batch length {}", length)).into(),
            );
        }
        let size = BATCH_LENGTH_PREFIX + length as usize;
        if size > data.len() - pos {
            if records.is_empty() && pos == 0 {
                return Err(KafkaError::BatchTooLarge { size, max_bytes }.into());
            }
            trace!("Dropping partial record batch of {} bytes", data.len() - pos);
            break;
        }

        let mut buf = data.slice(pos..pos + size);
        let batch = RecordBatchDecoder::decode::<
            _,
            fn(&mut Bytes, kafka_protocol::records::Compression) -> anyhow::Result<Bytes>,
        >(&mut buf)
        .map_err(|e| KafkaError::Protocol(format!("Failed to decode records: {:?}", e)))?;
        records.extend(batch);
        pos += size;
    }

    if pos == 0 && !data.is_empty() {
        // Fewer bytes than a batch header
        return Err(KafkaError::BatchTooLarge {
            size: BATCH_LENGTH_PREFIX,
            max_bytes,
        }
        .into());
    }

    Ok(records)
}

/// Convert a kafka-protocol Record to our KafkaRecord
fn convert_record(record: &Record) -> KafkaRecord {
    let headers: Vec<_> = record
        .headers
        .iter()
        .map(|(key, value)| RecordHeader {
            key: key.to_string(),
            value: value.as_ref().map(|v| v.to_vec()).unwrap_or_default(),
        })
        .collect();

    KafkaRecord {
        key: record.key.as_ref().map(|k| k.to_vec()),
        value: record.value.as_ref().map(|v| v.to_vec()),
        headers,
        timestamp: record.timestamp,
        offset: record.offset,
    }
}

/// Get the earliest and latest offsets for a partition
pub async fn get_offsets(client: &KafkaClient, topic: &str, partition: i32) -> Result<(i64, i64)> {
    let earliest = list_offset(client, topic, partition, EARLIEST_TIMESTAMP).await?;
    let latest = list_offset(client, topic, partition, LATEST_TIMESTAMP).await?;

    debug!(
        "Offsets for {}:{}: earliest={}, latest={}",
        topic, partition, earliest, latest
    );

    Ok((earliest, latest))
}

/// List offset for a specific timestamp
async fn list_offset(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    timestamp: i64,
) -> Result<i64> {
    let list_partition =
        kafka_protocol::messages::list_offsets_request::ListOffsetsPartition::default()
            .with_partition_index(partition)
            .with_timestamp(timestamp);

    let list_topic = kafka_protocol::messages::list_offsets_request::ListOffsetsTopic::default()
        .with_name(TopicName(StrBytes::from_string(topic.to_string())))
        .with_partitions(vec![list_partition]);

    let request = ListOffsetsRequest::default()
        .with_replica_id(BrokerId(-1)) // Client mode
        .with_isolation_level(0) // READ_UNCOMMITTED
        .with_topics(vec![list_topic]);

    let response: kafka_protocol::messages::ListOffsetsResponse =
        client.send_request(ApiKey::ListOffsets, request).await?;

    for topic_response in &response.topics {
        if topic_response.name.as_str() != topic {
            continue;
        }

        for partition_response in &topic_response.partitions {
            if partition_response.partition_index != partition {
                continue;
            }

            if partition_response.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition_response.error_code,
                    message: format!(
                        "ListOffsets error for {}:{}: code {}",
                        topic, partition, partition_response.error_code
                    ),
                }
                .into());
            }

            return Ok(partition_response.offset);
        }
    }

    Err(KafkaError::PartitionNotAvailable {
        topic: topic.to_string(),
        partition,
    }
    .into())
}
