use std::str::FromStr;
use std::time;

use common_s3::S3Config;
use envconfig::Envconfig;
use thiserror::Error;

use crate::accumulator::BatchPolicy;
use crate::ingestion::IngestionConfig;
use crate::kafka::types::{OffsetReset, StartOffsets, StartPosition};
use crate::sink::{ParquetCompression, RetryPolicy, SinkConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "event-archiver")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    /// earliest or latest, for partitions without a committed position
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    /// `N` or `partition:offset,...`; switches from subscribe to assign mode
    pub kafka_consumer_start_offsets: Option<String>,

    /// Must exceed the longest possible flush, the loop does not poll meanwhile
    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,

    #[envconfig(from = "POLL_TIMEOUT_MS", default = "1000")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(default = "100")]
    pub max_batch_size: usize,

    #[envconfig(from = "MAX_BATCH_AGE_MS", default = "60000")]
    pub max_batch_age: EnvMsDuration,

    #[envconfig(from = "FLUSH_CHECK_INTERVAL_MS", default = "1000")]
    pub flush_check_interval: EnvMsDuration,

    pub s3_bucket: String,

    #[envconfig(default = "")]
    pub s3_key_prefix: String,

    #[envconfig(default = "us-east-1")]
    pub s3_region: String,

    pub s3_endpoint: Option<String>,

    pub s3_access_key_id: Option<String>,

    pub s3_secret_access_key: Option<String>,

    #[envconfig(default = "true")]
    pub s3_force_path_style: bool,

    #[envconfig(from = "S3_TIMEOUT_MS", default = "30000")]
    pub s3_timeout: EnvMsDuration,

    #[envconfig(default = "snappy")]
    pub parquet_compression: ParquetCompression,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(default = "30")]
    pub liveness_deadline_secs: u64,

    /// text or json
    #[envconfig(default = "text")]
    pub log_format: String,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "SINK_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,

    #[envconfig(from = "SINK_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "SINK_INITIAL_INTERVAL_MS", default = "500")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "SINK_MAXIMUM_INTERVAL_MS", default = "30000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
    #[error("KAFKA_CONSUMER_OFFSET_RESET: {0}")]
    InvalidOffsetReset(String),
    #[error("KAFKA_CONSUMER_START_OFFSETS: {0}")]
    InvalidStartOffsets(String),
    #[error("S3_BUCKET must not be empty")]
    MissingBucket,
    #[error("S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together")]
    PartialCredentials,
    #[error("LOG_FORMAT must be text or json, got '{0}'")]
    InvalidLogFormat(String),
    #[error("KAFKA_MAX_POLL_INTERVAL_MS ({poll_interval_ms}) must exceed the longest flush ({flush_ms}ms)")]
    PollIntervalTooShort { poll_interval_ms: u32, flush_ms: u128 },
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::MustBePositive("MAX_BATCH_SIZE"));
        }
        if self.max_batch_age.0.is_zero() {
            return Err(ConfigError::MustBePositive("MAX_BATCH_AGE_MS"));
        }
        if self.flush_check_interval.0.is_zero() {
            return Err(ConfigError::MustBePositive("FLUSH_CHECK_INTERVAL_MS"));
        }
        if self.poll_timeout.0.is_zero() {
            return Err(ConfigError::MustBePositive("POLL_TIMEOUT_MS"));
        }
        if self.s3_timeout.0.is_zero() {
            return Err(ConfigError::MustBePositive("S3_TIMEOUT_MS"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(ConfigError::MustBePositive("SINK_MAX_ATTEMPTS"));
        }
        if self.retry_policy.backoff_coefficient == 0 {
            return Err(ConfigError::MustBePositive("SINK_BACKOFF_COEFFICIENT"));
        }
        if self.s3_bucket.trim().is_empty() {
            return Err(ConfigError::MissingBucket);
        }
        if self.s3_access_key_id.is_some() != self.s3_secret_access_key.is_some() {
            return Err(ConfigError::PartialCredentials);
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(ConfigError::InvalidLogFormat(self.log_format.clone()));
        }
        let flush = self.retry_policy().worst_case_duration(self.s3_timeout.0);
        if flush.as_millis() >= u128::from(self.kafka_max_poll_interval_ms) {
            return Err(ConfigError::PollIntervalTooShort {
                poll_interval_ms: self.kafka_max_poll_interval_ms,
                flush_ms: flush.as_millis(),
            });
        }
        self.start_position()?;
        Ok(())
    }

    pub fn start_position(&self) -> Result<StartPosition, ConfigError> {
        let reset = OffsetReset::from_str(&self.kafka_consumer_offset_reset)
            .map_err(ConfigError::InvalidOffsetReset)?;

        match self.kafka_consumer_start_offsets.as_deref() {
            Some(offsets) if !offsets.trim().is_empty() => offsets
                .parse::<StartOffsets>()
                .map(StartPosition::Assign)
                .map_err(ConfigError::InvalidStartOffsets),
            _ => Ok(StartPosition::Subscribe(reset)),
        }
    }

    pub fn offset_reset(&self) -> OffsetReset {
        OffsetReset::from_str(&self.kafka_consumer_offset_reset).unwrap_or_default()
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_batch_size: self.max_batch_size,
            max_batch_age: self.max_batch_age.0,
        }
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            batch_policy: self.batch_policy(),
            poll_timeout: self.poll_timeout.0,
            flush_check_interval: self.flush_check_interval.0,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_policy.max_attempts,
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
            self.retry_policy.maximum_interval.0,
        )
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            bucket: self.s3_bucket.clone(),
            key_prefix: self.s3_key_prefix.clone(),
            compression: self.parquet_compression,
            retry_policy: self.retry_policy(),
            attempt_timeout: self.s3_timeout.0,
        }
    }

    pub fn s3_config(&self) -> S3Config {
        S3Config {
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone().filter(|e| !e.is_empty()),
            access_key_id: self.s3_access_key_id.clone(),
            secret_access_key: self.s3_secret_access_key.clone(),
            force_path_style: self.s3_force_path_style,
            attempt_timeout: self.s3_timeout.0,
        }
    }

    pub fn shutdown_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn liveness_deadline(&self) -> time::Duration {
        time::Duration::from_secs(self.liveness_deadline_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
