//! AWS Kinesis partition adapter.
//!
//! Reads the first shard of a stream. Resolving a start time asks for an
//! `AT_TIMESTAMP` shard iterator; each fetch is one `GetRecords` call and the
//! returned `NextShardIterator` becomes the next position.

use aws_config::BehaviorVersion;
use aws_sdk_kinesis::Client;
use aws_sdk_kinesis::config::{Credentials, Region};
use aws_sdk_kinesis::error::DisplayErrorContext;
use aws_sdk_kinesis::primitives::DateTime as AwsDateTime;
use aws_sdk_kinesis::types::ShardIteratorType;
use chrono::{DateTime, Utc};

use super::{Batch, Partition, PartitionRecord, Position};
use crate::{Error, Result};

/// Configuration for the Kinesis partition.
#[derive(Debug, Clone)]
pub struct KinesisConfig {
    pub stream_name: String,

    pub region: String,

    /// Static credentials. When either is missing the default AWS provider
    /// chain is used.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,

    /// Maximum records per `GetRecords` call (`None` = service default).
    pub batch_limit: Option<i32>,
}

impl Default for KinesisConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            batch_limit: None,
        }
    }
}

/// The first shard of a Kinesis stream.
pub struct KinesisPartition {
    config: KinesisConfig,
    client: Client,
}

impl KinesisPartition {
    /// Build a client for the configured stream. No requests are made yet.
    pub async fn connect(config: KinesisConfig) -> Result<Self> {
        if config.stream_name.is_empty() {
            return Err(Error::Config("stream name is required".to_string()));
        }

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "sightline",
            ));
        }

        let sdk_config = loader.load().await;
        tracing::info!(
            stream = %config.stream_name,
            region = %config.region,
            "initialized Kinesis client"
        );

        Ok(Self {
            client: Client::new(&sdk_config),
            config,
        })
    }

    async fn first_shard_id(&self) -> Result<String> {
        let output = self
            .client
            .list_shards()
            .stream_name(&self.config.stream_name)
            .send()
            .await
            .map_err(|e| {
                Error::Initialization(format!(
                    "cannot describe stream {}: {}",
                    self.config.stream_name,
                    DisplayErrorContext(&e)
                ))
            })?;

        output
            .shards()
            .first()
            .map(|shard| shard.shard_id().to_string())
            .ok_or_else(|| {
                Error::Initialization(format!("stream {} has no shards", self.config.stream_name))
            })
    }
}

impl Partition for KinesisPartition {
    fn name(&self) -> &str {
        &self.config.stream_name
    }

    async fn resolve(&self, at: DateTime<Utc>) -> Result<Position> {
        let shard_id = self.first_shard_id().await?;

        let output = self
            .client
            .get_shard_iterator()
            .stream_name(&self.config.stream_name)
            .shard_id(&shard_id)
            .shard_iterator_type(ShardIteratorType::AtTimestamp)
            .timestamp(AwsDateTime::from_millis(at.timestamp_millis()))
            .send()
            .await
            .map_err(|e| {
                Error::Initialization(format!(
                    "cannot get iterator for shard {shard_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let iterator = output.shard_iterator().ok_or_else(|| {
            Error::Initialization(format!("no iterator returned for shard {shard_id}"))
        })?;

        tracing::info!(shard_id = %shard_id, start = %at, "resolved shard iterator");
        Ok(Position::new(iterator))
    }

    async fn fetch(&self, position: &Position) -> Result<Batch> {
        let output = self
            .client
            .get_records()
            .shard_iterator(position.as_str())
            .set_limit(self.config.batch_limit)
            .send()
            .await
            .map_err(|e| Error::Fetch(DisplayErrorContext(&e).to_string()))?;

        let next = output
            .next_shard_iterator()
            .ok_or_else(|| Error::Fetch("shard is closed".to_string()))?;

        if let Some(behind) = output.millis_behind_latest() {
            metrics::gauge!("ingest_millis_behind_latest").set(behind as f64);
        }

        let records = output
            .records()
            .iter()
            .map(|record| PartitionRecord {
                sequence_number: record.sequence_number().to_string(),
                data: record.data().as_ref().to_vec(),
                arrival: record
                    .approximate_arrival_timestamp()
                    .and_then(|t| t.to_millis().ok())
                    .and_then(DateTime::from_timestamp_millis),
            })
            .collect();

        Ok(Batch {
            records,
            next_position: Position::new(next),
        })
    }
}
