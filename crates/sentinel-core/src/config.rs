//! Configuration structures for sentinel.
//!
//! Configuration is loaded from a TOML file, then overridden from environment
//! variables, then validated. Validation collects every problem and reports
//! them together.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Schema versions the sink column mapping understands.
pub const SUPPORTED_SCHEMA_VERSIONS: [u32; 2] = [1, 2];

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Source database
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Durable log
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Wide-column sink
    #[serde(default)]
    pub cassandra: CassandraConfig,

    /// Sink selection
    #[serde(default)]
    pub sink: SinkConfig,

    /// Capture behaviour
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Per-event retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Sink circuit breaker
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    /// Per-partition checkpoint storage
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Dead-letter store
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Sync workers
    #[serde(default)]
    pub sync: SyncConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// PostgreSQL source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    #[serde(default = "default_pg_database")]
    pub database: String,

    #[serde(default = "default_pg_user")]
    pub user: String,

    #[serde(default = "default_pg_password")]
    pub password: String,

    /// Logical replication slot (wal2json)
    #[serde(default = "default_replication_slot")]
    pub replication_slot: String,

    /// Publication name
    #[serde(default = "default_publication")]
    pub publication: String,

    /// Create the slot on startup if it does not exist
    #[serde(default = "default_true")]
    pub create_slot: bool,

    /// Maximum changes fetched per poll
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,

    /// Idle wait between empty polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl PostgresConfig {
    /// Connection URL for the source database.
    pub fn connection_string(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            database: default_pg_database(),
            user: default_pg_user(),
            password: default_pg_password(),
            replication_slot: default_replication_slot(),
            publication: default_publication(),
            create_slot: true,
            poll_batch_size: default_poll_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Kafka configuration, shared by the publisher and the partition readers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,

    /// Change event topic
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Start policy for partitions without a checkpoint
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Producer compression codec
    #[serde(default)]
    pub compression: Compression,

    /// Largest serialized event accepted for publishing
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Partition poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            topic: default_topic(),
            consumer_group: default_consumer_group(),
            auto_offset_reset: OffsetReset::default(),
            compression: Compression::default(),
            max_message_bytes: default_max_message_bytes(),
            message_timeout_ms: default_message_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            security: KafkaSecurityConfig::default(),
        }
    }
}

/// Start policy for a partition with no persisted checkpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from the earliest retained offset
    #[default]
    Earliest,
    /// Start from the end of the partition
    Latest,
}

impl std::str::FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(format!(
                "Invalid auto_offset_reset: {}. Must be one of [earliest, latest]",
                other
            )),
        }
    }
}

/// Producer compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    #[default]
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// librdkafka `compression.type` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    pub sasl_username: Option<String>,

    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,

    pub ssl_cert_location: Option<PathBuf>,

    pub ssl_key_location: Option<PathBuf>,
}

/// Cassandra sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CassandraConfig {
    /// Contact points
    #[serde(default = "default_cassandra_hosts")]
    pub hosts: Vec<String>,

    #[serde(default = "default_cassandra_port")]
    pub port: u16,

    #[serde(default = "default_keyspace")]
    pub keyspace: String,

    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Consistency for conditional writes
    #[serde(default)]
    pub consistency: Consistency,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl CassandraConfig {
    /// `host:port` contact points.
    pub fn contact_points(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|h| format!("{}:{}", h, self.port))
            .collect()
    }
}

impl Default for CassandraConfig {
    fn default() -> Self {
        Self {
            hosts: default_cassandra_hosts(),
            port: default_cassandra_port(),
            keyspace: default_keyspace(),
            replication_factor: default_replication_factor(),
            username: None,
            password: None,
            consistency: Consistency::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Write consistency level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    One,
    #[default]
    Quorum,
    LocalQuorum,
    All,
}

/// Which sink implementation to run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
}

/// Sink implementation.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Cassandra-compatible cluster
    #[default]
    Cassandra,
    /// In-process store, for local runs
    Memory,
}

/// Capture configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Logical message prefix used for heartbeats
    #[serde(default = "default_heartbeat_prefix")]
    pub heartbeat_prefix: String,

    /// Heartbeat emission interval
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,

    /// Capture is unhealthy when no heartbeat passes within this window
    #[serde(default = "default_stall_timeout_seconds")]
    pub stall_timeout_seconds: u64,

    /// How often confirmed positions are acknowledged to the source
    #[serde(default = "default_ack_interval_ms")]
    pub ack_interval_ms: u64,

    /// Schema version per qualified table name (default 1)
    #[serde(default)]
    pub schema_versions: BTreeMap<String, u32>,
}

impl CaptureConfig {
    /// Schema version for a qualified table.
    pub fn schema_version_for(&self, table: &str) -> u32 {
        self.schema_versions.get(table).copied().unwrap_or(1)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_seconds)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            heartbeat_prefix: default_heartbeat_prefix(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            stall_timeout_seconds: default_stall_timeout_seconds(),
            ack_interval_ms: default_ack_interval_ms(),
            schema_versions: BTreeMap::new(),
        }
    }
}

/// Per-event retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts per event before dead-lettering
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Add ±25% jitter to delays
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

/// Sink circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Probe interval while open
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl BreakerConfig {
    /// Build a named breaker configuration.
    pub fn to_breaker_config(&self, name: impl Into<String>) -> crate::circuit_breaker::CircuitBreakerConfig {
        crate::circuit_breaker::CircuitBreakerConfig::new(name)
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(Duration::from_millis(self.reset_timeout_ms))
            .with_success_threshold(self.success_threshold)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Checkpoint log configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    /// Root directory; each partition gets `partition-<n>` below it
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Snapshot after this many entries
    #[serde(default = "default_snapshot_interval_entries")]
    pub snapshot_interval_entries: usize,

    /// Snapshot after this many seconds
    #[serde(default = "default_snapshot_interval_seconds")]
    pub snapshot_interval_seconds: u64,

    /// Log files kept per partition
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl CheckpointConfig {
    /// Directory owned by one partition.
    pub fn partition_dir(&self, partition: i32) -> PathBuf {
        self.dir.join(format!("partition-{}", partition))
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            snapshot_interval_entries: default_snapshot_interval_entries(),
            snapshot_interval_seconds: default_snapshot_interval_seconds(),
            max_log_files: default_max_log_files(),
        }
    }
}

/// Dead-letter store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeadLetterConfig {
    #[serde(default = "default_dead_letter_path")]
    pub path: PathBuf,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            path: default_dead_letter_path(),
        }
    }
}

/// Sync worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Partitions handled by this process (empty = all)
    #[serde(default)]
    pub partitions: Vec<i32>,

    /// Grace period for in-flight applies on shutdown
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl SyncConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive for `tracing_subscriber::EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    /// Accepts both tracing names and the `WARNING`/`CRITICAL` spellings.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            other => Err(format!("Invalid log_level: {}", other)),
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions

fn default_true() -> bool {
    true
}
fn default_pg_host() -> String {
    "localhost".into()
}
fn default_pg_port() -> u16 {
    5432
}
fn default_pg_database() -> String {
    "sourcedb".into()
}
fn default_pg_user() -> String {
    "cdcuser".into()
}
fn default_pg_password() -> String {
    "cdcpass".into()
}
fn default_replication_slot() -> String {
    "sentinelsync_slot".into()
}
fn default_publication() -> String {
    "sentinelsync_pub".into()
}
fn default_poll_batch_size() -> usize {
    500
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".into()]
}
fn default_topic() -> String {
    "cdc.events".into()
}
fn default_consumer_group() -> String {
    "sentinelsync-consumer".into()
}
fn default_max_message_bytes() -> usize {
    1_000_000
}
fn default_message_timeout_ms() -> u64 {
    30_000
}
fn default_poll_timeout_ms() -> u64 {
    1_000
}
fn default_session_timeout_ms() -> u32 {
    30_000
}
fn default_cassandra_hosts() -> Vec<String> {
    vec!["localhost".into()]
}
fn default_cassandra_port() -> u16 {
    9042
}
fn default_keyspace() -> String {
    "sinkdb".into()
}
fn default_replication_factor() -> u32 {
    3
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_heartbeat_prefix() -> String {
    "sentinelsync.heartbeat".into()
}
fn default_heartbeat_interval_seconds() -> u64 {
    10
}
fn default_stall_timeout_seconds() -> u64 {
    60
}
fn default_ack_interval_ms() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    2
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}
fn default_snapshot_interval_entries() -> usize {
    10_000
}
fn default_snapshot_interval_seconds() -> u64 {
    300
}
fn default_max_log_files() -> usize {
    10
}
fn default_dead_letter_path() -> PathBuf {
    PathBuf::from("./dead_letters/dead_letters.jsonl")
}
fn default_shutdown_grace_seconds() -> u64 {
    30
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

impl Config {
    /// Load a TOML file, apply environment overrides, and validate.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> crate::Result<()> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable values are collected and reported together.
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();

        fn parse<T: std::str::FromStr>(key: &str, raw: String, errors: &mut Vec<String>) -> Option<T> {
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    errors.push(format!("Invalid value for {}: {}", key, raw));
                    None
                }
            }
        }

        fn list(raw: &str) -> Vec<String> {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }

        if let Some(v) = lookup("POSTGRES_HOST") {
            self.postgres.host = v;
        }
        if let Some(v) = lookup("POSTGRES_PORT") {
            if let Some(port) = parse("POSTGRES_PORT", v, &mut errors) {
                self.postgres.port = port;
            }
        }
        if let Some(v) = lookup("POSTGRES_DB") {
            self.postgres.database = v;
        }
        if let Some(v) = lookup("POSTGRES_USER") {
            self.postgres.user = v;
        }
        if let Some(v) = lookup("POSTGRES_PASSWORD") {
            self.postgres.password = v;
        }
        if let Some(v) = lookup("POSTGRES_REPLICATION_SLOT") {
            self.postgres.replication_slot = v;
        }
        if let Some(v) = lookup("POSTGRES_PUBLICATION") {
            self.postgres.publication = v;
        }

        if let Some(v) = lookup("KAFKA_BOOTSTRAP_SERVERS") {
            self.kafka.bootstrap_servers = list(&v);
        }
        if let Some(v) = lookup("KAFKA_TOPIC") {
            self.kafka.topic = v;
        }
        if let Some(v) = lookup("KAFKA_GROUP_ID") {
            self.kafka.consumer_group = v;
        }
        if let Some(v) = lookup("KAFKA_AUTO_OFFSET_RESET") {
            match v.parse::<OffsetReset>() {
                Ok(reset) => self.kafka.auto_offset_reset = reset,
                Err(e) => errors.push(e),
            }
        }
        if let Some(v) = lookup("KAFKA_SESSION_TIMEOUT_MS") {
            if let Some(ms) = parse("KAFKA_SESSION_TIMEOUT_MS", v, &mut errors) {
                self.kafka.session_timeout_ms = ms;
            }
        }

        if let Some(v) = lookup("CASSANDRA_HOSTS") {
            self.cassandra.hosts = list(&v);
        }
        if let Some(v) = lookup("CASSANDRA_PORT") {
            if let Some(port) = parse("CASSANDRA_PORT", v, &mut errors) {
                self.cassandra.port = port;
            }
        }
        if let Some(v) = lookup("CASSANDRA_KEYSPACE") {
            self.cassandra.keyspace = v;
        }
        if let Some(v) = lookup("CASSANDRA_REPLICATION_FACTOR") {
            if let Some(rf) = parse("CASSANDRA_REPLICATION_FACTOR", v, &mut errors) {
                self.cassandra.replication_factor = rf;
            }
        }
        if let Some(v) = lookup("CASSANDRA_USERNAME") {
            self.cassandra.username = Some(v);
        }
        if let Some(v) = lookup("CASSANDRA_PASSWORD") {
            self.cassandra.password = Some(v);
        }

        if let Some(v) = lookup("LOG_LEVEL") {
            match v.parse::<LogLevel>() {
                Ok(level) => self.monitoring.log_level = level,
                Err(e) => errors.push(e),
            }
        }
        if let Some(v) = lookup("METRICS_PORT") {
            if let Some(port) = parse("METRICS_PORT", v, &mut errors) {
                self.monitoring.metrics_port = port;
            }
        }
        if let Some(v) = lookup("HEALTH_CHECK_PORT") {
            if let Some(port) = parse("HEALTH_CHECK_PORT", v, &mut errors) {
                self.monitoring.health_port = port;
            }
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            if let Some(n) = parse("MAX_RETRIES", v, &mut errors) {
                self.retry.max_attempts = n;
            }
        }
        if let Some(v) = lookup("RETRY_BACKOFF_MS") {
            if let Some(ms) = parse("RETRY_BACKOFF_MS", v, &mut errors) {
                self.retry.base_delay_ms = ms;
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(crate::Error::Config(format!(
                "Invalid environment overrides:\n{}",
                format_errors(&errors)
            )))
        }
    }

    /// Validate the configuration, reporting every problem at once.
    pub fn validate(&self) -> crate::Result<()> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            return Ok(());
        }
        Err(crate::Error::Config(format!(
            "Configuration validation failed:\n{}",
            format_errors(&errors)
        )))
    }

    /// All validation problems.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let pg = &self.postgres;
        if pg.port == 0 {
            errors.push(format!("Invalid PostgreSQL port: {}", pg.port));
        }
        if pg.host.is_empty() {
            errors.push("PostgreSQL host cannot be empty".into());
        }
        if pg.database.is_empty() {
            errors.push("PostgreSQL database cannot be empty".into());
        }
        if pg.user.is_empty() {
            errors.push("PostgreSQL user cannot be empty".into());
        }
        if pg.replication_slot.is_empty() {
            errors.push("PostgreSQL replication slot cannot be empty".into());
        }
        if pg.poll_batch_size == 0 {
            errors.push("PostgreSQL poll_batch_size must be >= 1".into());
        }

        let kafka = &self.kafka;
        if kafka.bootstrap_servers.is_empty() {
            errors.push("Kafka bootstrap servers cannot be empty".into());
        }
        if kafka.topic.is_empty() {
            errors.push("Kafka topic cannot be empty".into());
        }
        if kafka.consumer_group.is_empty() {
            errors.push("Kafka group ID cannot be empty".into());
        }
        if kafka.max_message_bytes == 0 {
            errors.push("Kafka max_message_bytes must be >= 1".into());
        }

        if self.sink.kind == SinkKind::Cassandra {
            let cs = &self.cassandra;
            if cs.hosts.is_empty() {
                errors.push("Cassandra hosts cannot be empty".into());
            }
            if cs.port == 0 {
                errors.push(format!("Invalid Cassandra port: {}", cs.port));
            }
            if cs.keyspace.is_empty() {
                errors.push("Cassandra keyspace cannot be empty".into());
            }
            if cs.replication_factor < 1 {
                errors.push(format!(
                    "Invalid replication factor: {}. Must be >= 1",
                    cs.replication_factor
                ));
            }
        }

        let capture = &self.capture;
        if capture.heartbeat_prefix.is_empty() {
            errors.push("Heartbeat prefix cannot be empty".into());
        }
        if capture.heartbeat_interval_seconds == 0 {
            errors.push("heartbeat_interval_seconds must be >= 1".into());
        }
        if capture.stall_timeout_seconds <= capture.heartbeat_interval_seconds {
            errors.push(format!(
                "stall_timeout_seconds ({}) must exceed heartbeat_interval_seconds ({})",
                capture.stall_timeout_seconds, capture.heartbeat_interval_seconds
            ));
        }
        for (table, version) in &capture.schema_versions {
            if !SUPPORTED_SCHEMA_VERSIONS.contains(version) {
                errors.push(format!(
                    "Unsupported schema version {} for table {}",
                    version, table
                ));
            }
        }

        if self.retry.max_attempts < 1 {
            errors.push("retry.max_attempts must be >= 1".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(format!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }

        if self.circuit_breaker.failure_threshold < 1 {
            errors.push("circuit_breaker.failure_threshold must be >= 1".into());
        }
        if self.circuit_breaker.success_threshold < 1 {
            errors.push("circuit_breaker.success_threshold must be >= 1".into());
        }

        if self.checkpoint.max_log_files < 1 {
            errors.push("checkpoint.max_log_files must be >= 1".into());
        }

        if self.monitoring.metrics_port == 0 {
            errors.push(format!("Invalid metrics_port: {}", self.monitoring.metrics_port));
        }
        if self.monitoring.health_port == 0 {
            errors.push(format!("Invalid health_check_port: {}", self.monitoring.health_port));
        }

        errors
    }
}

fn format_errors(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
