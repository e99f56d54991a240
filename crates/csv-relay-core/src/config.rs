//! Configuration structures for the emitter and materializer.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default topic both roles meet on
pub const DEFAULT_TOPIC: &str = "raw-transactions";

/// Default client id for the emitter role
pub const EMITTER_CLIENT_ID: &str = "csv-producer";

/// Default client id for the materializer role
pub const MATERIALIZER_CLIENT_ID: &str = "csv-consumer";

/// Default consumer group of the materializer
pub const DEFAULT_GROUP_ID: &str = "csv-reconstruction-group";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Kafka cluster configuration
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Topic rows are published to and consumed from
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Emitter-specific options
    #[serde(default)]
    pub emitter: EmitterOptions,

    /// Materializer-specific options
    #[serde(default)]
    pub materializer: MaterializerOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            topic: default_topic(),
            emitter: EmitterOptions::default(),
            materializer: MaterializerOptions::default(),
        }
    }
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

/// Kafka cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,

    /// Client id sent with every request; each role falls back to its own default
    #[serde(default)]
    pub client_id: Option<String>,

    /// TCP connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: None,
            connection: ConnectionConfig::default(),
        }
    }
}

impl KafkaConfig {
    /// Copy of this config with the client id defaulted for a role.
    pub fn for_role(&self, default_client_id: &str) -> Self {
        let mut config = self.clone();
        if config.client_id.is_none() {
            config.client_id = Some(default_client_id.to_string());
        }
        config
    }

    /// Client id to put in request headers
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("csv-relay")
    }
}

fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

/// TCP connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Enable TCP keepalive (default: true)
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,

    /// Keepalive idle time in seconds (default: 60)
    #[serde(default = "default_keepalive_time_secs")]
    pub keepalive_time_secs: u64,

    /// TCP keepalive interval in seconds (default: 20)
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Enable TCP_NODELAY (default: true)
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// Timeout for establishing a TCP connection in milliseconds (default: 10000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for a single request/response round trip in milliseconds (default: 30000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tcp_keepalive: true,
            keepalive_time_secs: default_keepalive_time_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            tcp_nodelay: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_keepalive_time_secs() -> u64 {
    60
}

fn default_keepalive_interval_secs() -> u64 {
    20
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Retry policy for broker operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 100)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds (default: 10000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// Producer acknowledgment mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Wait for the full in-sync replica set
    #[default]
    All,
    /// Wait for the partition leader only
    Leader,
}

impl Acks {
    /// Wire value of the acks field
    pub fn as_i16(self) -> i16 {
        match self {
            Acks::All => -1,
            Acks::Leader => 1,
        }
    }
}

/// Topic provisioning performed by the emitter before publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicProvisioning {
    /// Create the topic when it does not exist (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Partition count for a created topic (default: 1)
    #[serde(default = "default_partitions")]
    pub partitions: i32,

    /// Replication factor for a created topic, -1 for the broker default
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i16,
}

impl Default for TopicProvisioning {
    fn default() -> Self {
        Self {
            enabled: true,
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
        }
    }
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i16 {
    -1
}

/// Emitter-specific options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterOptions {
    /// Directory scanned for source files (default: local-input)
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    /// Extension of eligible source files, without the dot (default: csv)
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Acknowledgment mode for produce requests
    #[serde(default)]
    pub acks: Acks,

    /// Broker-side produce timeout in milliseconds (default: 30000)
    #[serde(default = "default_produce_timeout_ms")]
    pub produce_timeout_ms: i32,

    /// Topic creation settings
    #[serde(default)]
    pub create_topic: TopicProvisioning,

    /// Retry policy for connect and publish
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            extension: default_extension(),
            acks: Acks::default(),
            produce_timeout_ms: default_produce_timeout_ms(),
            create_topic: TopicProvisioning::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("local-input")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("local-output")
}

fn default_extension() -> String {
    "csv".to_string()
}

fn default_produce_timeout_ms() -> i32 {
    30_000
}

/// Where the materializer starts reading each partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// Always replay from the log start offset
    #[default]
    Earliest,
    /// Resume from the group's committed offsets, earliest when none
    Committed,
}

/// How row values are matched to header columns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnAlignment {
    /// Values are written in the record's own field order
    #[default]
    Positional,
    /// Each header column is looked up by field name
    ByName,
}

/// Materializer-specific options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializerOptions {
    /// Directory output artifacts are written to (default: local-output)
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Extension of output artifacts removed on startup (default: csv)
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Consumer group used for offset commits
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Starting offset policy
    #[serde(default)]
    pub start_offset: StartOffset,

    /// Commit consumed offsets to the group (default: true)
    #[serde(default = "default_true")]
    pub commit_offsets: bool,

    /// Log a progress line every N messages (default: 10)
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    /// Column alignment for rows whose fields differ from the header
    #[serde(default)]
    pub column_alignment: ColumnAlignment,

    /// Maximum bytes per fetch (default: 1MB)
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,

    /// Broker long-poll wait when a partition has no new data (default: 500)
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: i32,

    /// Retry policy for connect and fetch
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for MaterializerOptions {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            extension: default_extension(),
            group_id: default_group_id(),
            start_offset: StartOffset::default(),
            commit_offsets: true,
            progress_interval: default_progress_interval(),
            column_alignment: ColumnAlignment::default(),
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_group_id() -> String {
    DEFAULT_GROUP_ID.to_string()
}

fn default_progress_interval() -> u64 {
    10
}

fn default_fetch_max_bytes() -> i32 {
    1024 * 1024
}

fn default_fetch_max_wait_ms() -> i32 {
    500
}

impl Config {
    /// Load a YAML configuration file
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "At least one bootstrap server is required".to_string(),
            ));
        }

        if self.topic.trim().is_empty() {
            return Err(crate::Error::Config("Topic must not be empty".to_string()));
        }

        validate_extension("emitter.extension", &self.emitter.extension)?;
        validate_extension("materializer.extension", &self.materializer.extension)?;
        self.emitter.retry.validate("emitter.retry")?;
        self.materializer.retry.validate("materializer.retry")?;

        if self.emitter.create_topic.partitions <= 0 {
            return Err(crate::Error::Config(
                "emitter.create_topic.partitions must be > 0".to_string(),
            ));
        }

        if self.materializer.progress_interval == 0 {
            return Err(crate::Error::Config(
                "materializer.progress_interval must be > 0".to_string(),
            ));
        }

        if self.materializer.group_id.trim().is_empty() {
            return Err(crate::Error::Config(
                "materializer.group_id must not be empty".to_string(),
            ));
        }

        if self.materializer.fetch_max_bytes <= 0 {
            return Err(crate::Error::Config(
                "materializer.fetch_max_bytes must be > 0".to_string(),
            ));
        }

        // Startup cleanup would delete the emitter's sources
        if self.emitter.extension == self.materializer.extension
            && same_dir(&self.emitter.input_dir, &self.materializer.output_dir)
        {
            return Err(crate::Error::Config(format!(
                "materializer.output_dir must differ from emitter.input_dir ({}) when both use .{} files",
                self.materializer.output_dir.display(),
                self.materializer.extension
            )));
        }

        Ok(())
    }
}

impl RetryConfig {
    fn validate(&self, field: &str) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(crate::Error::Config(format!(
                "{}.max_attempts must be > 0",
                field
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(crate::Error::Config(format!(
                "{}.base_delay_ms ({}) > max_delay_ms ({})",
                field, self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Compare directories by their canonical form when both exist.
fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.components().eq(b.components()),
    }
}

fn validate_extension(field: &str, extension: &str) -> crate::Result<()> {
    if extension.is_empty() || extension.contains('.') || extension.contains('/') {
        return Err(crate::Error::Config(format!(
            "{} must be a bare extension such as 'csv', got {:?}",
            field, extension
        )));
    }
    Ok(())
}
