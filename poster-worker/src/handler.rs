//! One invocation of the pipeline: authenticate and load the schema, decode, route, deliver.
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use poster_common::kinesis::RawRecord;
use poster_common::record::DecodedRecord;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::{Config, ConfigError, DecodeFailurePolicy};
use crate::decoder::decode;
use crate::delivery::{build_http_client, DeliveryClient};
use crate::error::BatchError;
use crate::router::{Operation, RouteTable};
use crate::schema::SchemaCache;
use crate::token::{KmsDecrypter, OAuthCredentials, Plaintext, SecretDecrypter, TokenCache};

const SOURCE_TAG: &str = "nyplSource";
const TYPE_TAG: &str = "nyplType";

/// Static fields stamped onto every record that is delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordTags {
    pub source: Option<String>,
    pub record_type: Option<String>,
}

impl RecordTags {
    fn apply(&self, record: &mut DecodedRecord) {
        if let Some(source) = &self.source {
            record.insert(SOURCE_TAG, Value::String(source.clone()));
        }
        if let Some(record_type) = &self.record_type {
            record.insert(TYPE_TAG, Value::String(record_type.clone()));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliverySummary {
    pub operation: Operation,
    pub endpoint: String,
    pub records: usize,
    pub attempts: u32,
}

/// Counts for one successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub received: usize,
    pub decoded: usize,
    pub skipped: usize,
    pub suppressed: usize,
    pub deliveries: Vec<DeliverySummary>,
}

pub struct BatchHandler {
    tokens: Arc<TokenCache>,
    schemas: SchemaCache,
    router: RouteTable,
    delivery: DeliveryClient,
    decode_failure_policy: DecodeFailurePolicy,
    tags: RecordTags,
}

impl BatchHandler {
    pub fn new(
        tokens: Arc<TokenCache>,
        schemas: SchemaCache,
        router: RouteTable,
        delivery: DeliveryClient,
        decode_failure_policy: DecodeFailurePolicy,
        tags: RecordTags,
    ) -> Self {
        Self {
            tokens,
            schemas,
            router,
            delivery,
            decode_failure_policy,
            tags,
        }
    }

    /// Wire up the caches and clients described by `config`. The token cache is shared with the
    /// delivery client so a 401 can clear it.
    pub async fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let http_client = build_http_client(config.request_timeout.0)?;

        let decrypter: Arc<dyn SecretDecrypter> = if *config.oauth_credentials_encrypted {
            Arc::new(KmsDecrypter::from_env().await)
        } else {
            Arc::new(Plaintext)
        };

        let tokens = Arc::new(TokenCache::new(
            http_client.clone(),
            OAuthCredentials {
                key: config.oauth_key.as_str().to_owned(),
                secret: config.oauth_secret.as_str().to_owned(),
                url: config.oauth_url.clone(),
            },
            decrypter,
        ));
        let schemas = SchemaCache::new(http_client.clone(), config.schema_url.clone());
        let delivery = DeliveryClient::new(http_client, config.retry_policy(), tokens.clone());

        let tags = RecordTags {
            source: config.record_source.as_ref().map(|s| s.as_str().to_owned()),
            record_type: config.record_type.as_ref().map(|s| s.as_str().to_owned()),
        };

        Ok(Self::new(
            tokens,
            schemas,
            config.route_table()?,
            delivery,
            config.decode_failure_policy,
            tags,
        ))
    }

    /// Run one batch through the pipeline.
    ///
    /// Auth, schema and (under the abort policy) decode failures end the invocation before any
    /// delivery is attempted. Otherwise every batch is delivered and the first failure, in batch
    /// order, is returned.
    pub async fn handle_batch(&self, raw_records: Vec<RawRecord>) -> Result<BatchOutcome, BatchError> {
        let start = Instant::now();

        let result = self.process(raw_records).await;

        let status = match &result {
            Ok(outcome) => {
                info!(
                    received = outcome.received,
                    decoded = outcome.decoded,
                    skipped = outcome.skipped,
                    suppressed = outcome.suppressed,
                    deliveries = outcome.deliveries.len(),
                    "batch processed"
                );
                "success"
            }
            Err(error) => {
                error!(stage = error.stage(), %error, "batch failed");
                error.stage()
            }
        };

        metrics::counter!("poster_batches_total", "status" => status).increment(1);
        metrics::histogram!("poster_batch_duration_seconds", "status" => status)
            .record(start.elapsed().as_secs_f64());

        result
    }

    async fn process(&self, raw_records: Vec<RawRecord>) -> Result<BatchOutcome, BatchError> {
        let received = raw_records.len();
        if received == 0 {
            debug!("empty batch, nothing to do");
            return Ok(BatchOutcome::default());
        }

        let (token, schema) = tokio::join!(self.tokens.get_token(), self.schemas.get_schema());
        let token = token?;
        let schema = schema?;

        let mut decoded = Vec::with_capacity(received);
        let mut skipped = 0;

        for raw in &raw_records {
            match decode(raw, &schema) {
                Ok(record) => decoded.push(record),
                Err(error) => match self.decode_failure_policy {
                    DecodeFailurePolicy::Abort => return Err(error.into()),
                    DecodeFailurePolicy::Skip => {
                        error!(
                            stage = "decode",
                            sequence_number = %raw.sequence_number,
                            partition_key = %raw.partition_key,
                            %error,
                            "skipping undecodable record"
                        );
                        metrics::counter!("poster_records_total", "decision" => "skip").increment(1);
                        skipped += 1;
                    }
                },
            }
        }
        let decoded_count = decoded.len();

        let mut partition = self.router.partition(decoded);

        for record in &partition.suppressed {
            debug!(
                record_id = record.id().as_deref().unwrap_or("unknown"),
                "suppressing record"
            );
        }
        metrics::counter!("poster_records_total", "decision" => "suppress")
            .increment(partition.suppressed.len() as u64);

        for batch in &mut partition.batches {
            let decision = match batch.operation {
                Operation::Upsert => "forward",
                Operation::Delete => "delete",
            };
            metrics::counter!("poster_records_total", "decision" => decision)
                .increment(batch.records.len() as u64);

            for record in &mut batch.records {
                self.tags.apply(record);
            }
        }

        let results = join_all(
            partition
                .batches
                .iter()
                .map(|batch| self.delivery.deliver(batch, token.clone())),
        )
        .await;

        let mut deliveries = Vec::with_capacity(results.len());
        for (batch, result) in partition.batches.iter().zip(results) {
            let result = result?;
            deliveries.push(DeliverySummary {
                operation: batch.operation,
                endpoint: batch.endpoint.clone(),
                records: batch.records.len(),
                attempts: result.attempts,
            });
        }

        Ok(BatchOutcome {
            received,
            decoded: decoded_count,
            skipped,
            suppressed: partition.suppressed.len(),
            deliveries,
        })
    }
}
