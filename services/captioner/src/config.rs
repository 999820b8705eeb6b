//! Configuration for the caption worker.
//!
//! Storage, database and model sections share their types with the gallery
//! service so both processes read the same bucket and table the same way.

use gallery_service::config::{DatabaseConfig, GeminiConfig, S3Config, ServiceConfig};
use rdkafka::config::ClientConfig;
use serde::Deserialize;

/// Main configuration for the caption worker
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration (image bytes are read from here)
    pub s3: S3Config,
    /// Database configuration (captions are written here)
    pub database: DatabaseConfig,
    /// Caption model configuration
    pub gemini: GeminiConfig,
    /// Kafka consumer configuration
    pub kafka: ConsumerConfig,
}

/// Kafka consumer configuration for upload events
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Topic carrying image-uploaded events
    #[serde(default = "default_upload_topic")]
    pub upload_topic: String,
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Client ID reported to the brokers
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Maximum poll interval in milliseconds. Must exceed one model call.
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
}

fn default_upload_topic() -> String {
    "gallery.images.uploaded".to_string()
}

fn default_group_id() -> String {
    "caption-worker".to_string()
}

fn default_client_id() -> String {
    "caption-worker".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_max_poll_interval_ms() -> u64 {
    300000
}

impl WorkerConfig {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "caption-worker")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9091)?
            .add_source(config::File::with_name("config/captioner").required(false))
            .add_source(
                config::File::with_name("/etc/caption-gallery/captioner").required(false),
            )
            // CAPTIONER__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("CAPTIONER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WorkerConfig = config.try_deserialize()?;
        config.kafka.validate()?;
        Ok(config)
    }
}

impl ConsumerConfig {
    /// Build an rdkafka consumer config with manual offset commits
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("group.id", &self.group_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string());

        if self.ssl_enabled {
            config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = self.ssl_ca_location {
                config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) = (&self.sasl_username, &self.sasl_password)
        {
            config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bootstrap_servers.is_empty() {
            anyhow::bail!("kafka.bootstrap_servers must not be empty");
        }
        if self.group_id.is_empty() {
            anyhow::bail!("kafka.group_id must not be empty");
        }
        if self.upload_topic.is_empty() {
            anyhow::bail!("kafka.upload_topic must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_config() -> ConsumerConfig {
        serde_json::from_str(r#"{"bootstrap_servers":"localhost:9092"}"#).unwrap()
    }

    #[test]
    fn test_consumer_defaults() {
        let config = consumer_config();
        assert_eq!(config.upload_topic, "gallery.images.uploaded");
        assert_eq!(config.group_id, "caption-worker");
        assert_eq!(config.session_timeout_ms, 30000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_config_build() {
        let client = consumer_config().build_consumer_config();

        assert_eq!(client.get("group.id"), Some("caption-worker"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("session.timeout.ms"), Some("30000"));
        assert_eq!(client.get("security.protocol"), None);
    }

    #[test]
    fn test_sasl_settings() {
        let mut config = consumer_config();
        config.ssl_enabled = true;
        config.sasl_username = Some("worker".to_string());
        config.sasl_password = Some("secret".to_string());

        let client = config.build_consumer_config();
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.username"), Some("worker"));
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let mut config = consumer_config();
        config.group_id.clear();
        assert!(config.validate().is_err());
    }
}
