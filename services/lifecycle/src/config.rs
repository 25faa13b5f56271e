use crate::store::MissingRecordPolicy;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the photo lifecycle service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration (postgres backend only)
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Record store configuration
    #[serde(default)]
    pub records: RecordsConfig,
    /// Object store configuration
    #[serde(default)]
    pub objects: ObjectStoreConfig,
    /// Queue identifiers and retry policy
    #[serde(default)]
    pub queues: QueueConfig,
    /// Metadata topic and its subscriptions
    #[serde(default)]
    pub topic: TopicConfig,
    /// Batch consumer tuning
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Outbound mail configuration
    #[serde(default)]
    pub mail: MailConfig,
    /// HTTP ingress configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Which implementation backs the record store and queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Process-local state, lost on restart
    #[default]
    Memory,
    /// Durable tables in PostgreSQL
    Postgres,
}

/// Which implementation backs the object store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectBackend {
    #[default]
    Memory,
    S3,
}

/// Which implementation delivers review notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailBackend {
    /// Log each message instead of sending it
    #[default]
    Log,
    /// Amazon SES (v2 API)
    Ses,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Record store and queue backend
    #[serde(default)]
    pub backend: Backend,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Record store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecordsConfig {
    /// Logical record store (table) name
    #[serde(default = "default_store_name")]
    pub store_name: String,
    /// What attribute merges do when the record does not exist yet
    #[serde(default)]
    pub missing_record_policy: MissingRecordPolicy,
}

/// Object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub backend: ObjectBackend,
    /// Bucket holding uploaded photos
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Queue identifiers and redelivery policy
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue receiving upload notifications
    #[serde(default = "default_upload_queue")]
    pub upload_queue: String,
    /// Dead-letter queue for uploads that exhausted their retries
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
    /// Dead-letter queue shared by the metadata topic subscriptions
    #[serde(default = "default_metadata_dead_letter_queue")]
    pub metadata_dead_letter_queue: String,
    /// Deliveries before a message is dead-lettered
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// How long a received message stays invisible to other consumers
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// How long dead-lettered messages are kept
    #[serde(default = "default_dead_letter_retention_secs")]
    pub dead_letter_retention_secs: u64,
}

/// Metadata topic configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    /// Topic producers publish metadata events and status updates to
    #[serde(default = "default_topic_name")]
    pub name: String,
    /// Subscription queue feeding the metadata applier
    #[serde(default = "default_applier_subscription")]
    pub applier_subscription: String,
    /// Subscription queue feeding the review status updater
    #[serde(default = "default_status_subscription")]
    pub status_subscription: String,
}

/// Batch consumer tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Messages pulled per receive
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Messages of one batch processed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Wait between empty receives in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for a single message in seconds
    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: u64,
    /// Deadline for a whole batch in seconds
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    /// Change records read per poll
    #[serde(default = "default_batch_size")]
    pub change_feed_batch_size: usize,
    /// Wait between empty change-feed polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub change_feed_poll_interval_ms: u64,
    /// Attempts at a change record per poll. A change that keeps failing
    /// on a malformed record is skipped after this many; one failing on an
    /// unavailable backend is retried on the next poll.
    #[serde(default = "default_change_feed_max_attempts")]
    pub change_feed_max_attempts: u32,
    /// Upper bound of the back-off between polls while a change keeps failing
    #[serde(default = "default_change_feed_max_backoff_ms")]
    pub change_feed_max_backoff_ms: u64,
    /// How long a feed instance holds its lease without renewing it
    #[serde(default = "default_change_feed_lease_secs")]
    pub change_feed_lease_secs: u64,
}

/// Outbound mail configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub backend: MailBackend,
    /// From address of review notifications
    #[serde(default = "default_sender")]
    pub sender: String,
    /// Recipient used when the record's name is not an email address
    #[serde(default)]
    pub fallback_recipient: Option<String>,
    /// AWS region of the SES endpoint
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom SES endpoint URL (for LocalStack)
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

/// API configuration for the HTTP ingress
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the HTTP ingress
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "photo-lifecycle".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_store_name() -> String {
    "photos".to_string()
}

fn default_bucket() -> String {
    "photo-uploads".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_queue() -> String {
    "photos.uploads".to_string()
}

fn default_dead_letter_queue() -> String {
    "photos.uploads.invalid".to_string()
}

fn default_metadata_dead_letter_queue() -> String {
    "photos.metadata.dlq".to_string()
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_dead_letter_retention_secs() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_topic_name() -> String {
    "photos.image-events".to_string()
}

fn default_applier_subscription() -> String {
    "photos.image-events.metadata".to_string()
}

fn default_status_subscription() -> String {
    "photos.image-events.status".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_message_timeout_secs() -> u64 {
    10
}

fn default_batch_timeout_secs() -> u64 {
    25
}

fn default_change_feed_max_attempts() -> u32 {
    3
}

fn default_change_feed_max_backoff_ms() -> u64 {
    30_000
}

fn default_change_feed_lease_secs() -> u64 {
    30
}

fn default_sender() -> String {
    "noreply@photos.example.com".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "photo-lifecycle")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/lifecycle").required(false))
            .add_source(config::File::with_name("/etc/photo-lifecycle/lifecycle").required(false))
            // Override with environment variables
            // PHOTOS__MAIL__SENDER -> mail.sender
            .add_source(
                config::Environment::with_prefix("PHOTOS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mail.sender.trim().is_empty() {
            return Err(ConfigError::MissingRequired("mail.sender".to_string()));
        }

        if self.queues.max_receive_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queues.max_receive_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.service.backend == Backend::Postgres && self.database.url.is_none() {
            return Err(ConfigError::MissingRequired(
                "database.url (required for the postgres backend)".to_string(),
            ));
        }

        if self.consumer.batch_size == 0 || self.consumer.change_feed_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "consumer.batch_size".to_string(),
                message: "batch sizes must be positive".to_string(),
            });
        }

        if self.message_timeout() > self.visibility_timeout() {
            return Err(ConfigError::InvalidValue {
                key: "consumer.message_timeout_secs".to_string(),
                message: "must not exceed queues.visibility_timeout_secs".to_string(),
            });
        }

        // messages still in a running batch must not reappear to other consumers
        if self.batch_timeout() > self.visibility_timeout() {
            return Err(ConfigError::InvalidValue {
                key: "consumer.batch_timeout_secs".to_string(),
                message: "must not exceed queues.visibility_timeout_secs".to_string(),
            });
        }

        if self.consumer.change_feed_lease_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "consumer.change_feed_lease_secs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Recipient for notifications whose record carries no email address
    pub fn fallback_recipient(&self) -> &str {
        self.mail
            .fallback_recipient
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(self.mail.sender.as_str())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queues.visibility_timeout_secs)
    }

    pub fn dead_letter_retention(&self) -> Duration {
        Duration::from_secs(self.queues.dead_letter_retention_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer.message_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer.batch_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.consumer.poll_interval_ms)
    }

    pub fn change_feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.consumer.change_feed_poll_interval_ms)
    }

    pub fn change_feed_max_backoff(&self) -> Duration {
        Duration::from_millis(self.consumer.change_feed_max_backoff_ms)
    }

    pub fn change_feed_lease(&self) -> Duration {
        Duration::from_secs(self.consumer.change_feed_lease_secs)
    }
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            backend: Backend::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            store_name: default_store_name(),
            missing_record_policy: MissingRecordPolicy::default(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: ObjectBackend::default(),
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            upload_queue: default_upload_queue(),
            dead_letter_queue: default_dead_letter_queue(),
            metadata_dead_letter_queue: default_metadata_dead_letter_queue(),
            max_receive_count: default_max_receive_count(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            dead_letter_retention_secs: default_dead_letter_retention_secs(),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: default_topic_name(),
            applier_subscription: default_applier_subscription(),
            status_subscription: default_status_subscription(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            message_timeout_secs: default_message_timeout_secs(),
            batch_timeout_secs: default_batch_timeout_secs(),
            change_feed_batch_size: default_batch_size(),
            change_feed_poll_interval_ms: default_poll_interval_ms(),
            change_feed_max_attempts: default_change_feed_max_attempts(),
            change_feed_max_backoff_ms: default_change_feed_max_backoff_ms(),
            change_feed_lease_secs: default_change_feed_lease_secs(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            backend: MailBackend::default(),
            sender: default_sender(),
            fallback_recipient: None,
            region: default_region(),
            endpoint_url: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.queues.max_receive_count, 3);
        assert_eq!(config.visibility_timeout(), Duration::from_secs(30));
        assert_eq!(config.dead_letter_retention(), Duration::from_secs(604_800));
        assert_eq!(config.service.backend, Backend::Memory);
        assert_eq!(
            config.records.missing_record_policy,
            MissingRecordPolicy::Skip
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fallback_recipient_defaults_to_sender() {
        let mut config = Config::default();
        assert_eq!(config.fallback_recipient(), config.mail.sender);

        config.mail.fallback_recipient = Some("review@photos.example.com".to_string());
        assert_eq!(config.fallback_recipient(), "review@photos.example.com");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.service.backend = Backend::Postgres;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        let mut config = Config::default();
        config.queues.max_receive_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.consumer.message_timeout_secs = 60;
        assert!(config.validate().is_err());

        // a batch outliving the visibility timeout would be redelivered mid-flight
        let mut config = Config::default();
        config.consumer.batch_timeout_secs = 31;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "consumer.batch_timeout_secs"
        ));
        config.consumer.batch_timeout_secs = 30;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.consumer.change_feed_lease_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_timeouts() {
        let mut database = DatabaseConfig::default();
        assert_eq!(database.connect_timeout(), Duration::from_secs(30));
        assert_eq!(database.idle_timeout(), Duration::from_secs(600));

        database.connect_timeout_secs = 5;
        assert_eq!(database.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_from_sources() {
        let config: Config = config::Config::builder()
            .set_override("mail.sender", "photos@example.com")
            .unwrap()
            .set_override("records.missing_record_policy", "create")
            .unwrap()
            .set_override("service.backend", "postgres")
            .unwrap()
            .set_override("mail.backend", "ses")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.mail.sender, "photos@example.com");
        assert_eq!(
            config.records.missing_record_policy,
            MissingRecordPolicy::Create
        );
        assert_eq!(config.service.backend, Backend::Postgres);
        assert_eq!(config.mail.backend, MailBackend::Ses);
        assert_eq!(config.mail.region, "us-east-1");
        assert_eq!(config.queues.upload_queue, "photos.uploads");
    }
}
