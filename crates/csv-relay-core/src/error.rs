//! Error types for the csv-relay core library.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the csv-relay library.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka protocol error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read error in a source file
    #[error("CSV error: {0}")]
    Csv(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// The run was interrupted by a shutdown request
    #[error("Shutdown requested")]
    Shutdown,
}

/// Kafka-specific errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KafkaError {
    /// Connection failed
    #[error("Failed to connect to broker {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Broker error response
    #[error("Broker returned error code {code}: {message}")]
    BrokerError { code: i16, message: String },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// No available brokers
    #[error("No available brokers")]
    NoBrokersAvailable,

    /// Topic does not exist
    #[error("Topic does not exist: {0}")]
    TopicNotExists(String),

    /// Partition not available
    #[error("Partition {partition} not available for topic {topic}")]
    PartitionNotAvailable { topic: String, partition: i32 },

    /// The next record batch does not fit in the requested fetch size
    #[error("Record batch of {size} bytes exceeds the fetch size of {max_bytes} bytes")]
    BatchTooLarge { size: usize, max_bytes: i32 },
}

/// Reasons a consumed message is skipped instead of materialized.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The `source` header is absent
    #[error("missing 'source' header")]
    MissingSource,

    /// The `source` header is not usable as an output file name
    #[error("invalid source name {0:?}")]
    InvalidSource(String),

    /// The message carries no value
    #[error("message has no payload")]
    EmptyPayload,

    /// The value is not a JSON object of fields
    #[error("payload is not a JSON object: {0}")]
    InvalidPayload(String),

    /// Writing the row to the output artifact failed
    #[error("failed to write row for {source_name}: {message}")]
    Write {
        source_name: String,
        message: String,
    },
}

impl Error {
    /// Broker error code carried by this error, if any.
    pub fn broker_code(&self) -> Option<i16> {
        match self {
            Error::Kafka(KafkaError::BrokerError { code, .. }) => Some(*code),
            _ => None,
        }
    }

    /// Fetch size needed to read the next record batch, if a fetch came back short.
    pub fn required_fetch_bytes(&self) -> Option<usize> {
        match self {
            Error::Kafka(KafkaError::BatchTooLarge { size, .. }) => Some(*size),
            _ => None,
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Kafka(KafkaError::ConnectionFailed { .. })
            | Error::Kafka(KafkaError::Timeout(_))
            | Error::Kafka(KafkaError::NoBrokersAvailable)
            | Error::Kafka(KafkaError::Protocol(_))
            | Error::Kafka(KafkaError::TopicNotExists(_))
            | Error::Kafka(KafkaError::PartitionNotAvailable { .. })
            | Error::Connection(_) => true,
            Error::Kafka(KafkaError::BrokerError { code, .. }) => is_retriable_code(*code),
            _ => false,
        }
    }
}

/// Kafka error codes flagged retriable by the protocol.
fn is_retriable_code(code: i16) -> bool {
    matches!(
        code,
        // CORRUPT_MESSAGE, UNKNOWN_TOPIC_OR_PARTITION, LEADER_NOT_AVAILABLE,
        // NOT_LEADER_OR_FOLLOWER, REQUEST_TIMED_OUT, NETWORK_EXCEPTION,
        // COORDINATOR_LOAD_IN_PROGRESS, COORDINATOR_NOT_AVAILABLE, NOT_COORDINATOR,
        // NOT_ENOUGH_REPLICAS, NOT_ENOUGH_REPLICAS_AFTER_APPEND
        2 | 3 | 5 | 6 | 7 | 13 | 14 | 15 | 16 | 19 | 20
    )
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Csv(err.to_string())
    }
}
