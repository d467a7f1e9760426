//! # Kinesis
//!
//! Envelope types for the batches a Kinesis trigger hands us, and for the fixture files
//! `kinesify` produces. Only the `kinesis` section is required to process a record; the rest of
//! the envelope is carried through for logging.
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

pub const KINESIS_SCHEMA_VERSION: &str = "1.0";
pub const EVENT_SOURCE: &str = "aws:kinesis";
pub const EVENT_VERSION: &str = "1.0";
pub const EVENT_NAME: &str = "aws:kinesis:record";

/// A batch of stream records, as delivered to one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "Records")]
    pub records: Vec<StreamRecord>,
}

impl StreamEvent {
    /// Consume the event, keeping only the raw records we need to decode.
    pub fn into_raw_records(self) -> Vec<RawRecord> {
        self.records.into_iter().map(|r| r.kinesis).collect()
    }
}

/// A single stream record envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub kinesis: RawRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_version: Option<String>,
    #[serde(rename = "eventID", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_identity_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,
    #[serde(
        rename = "eventSourceARN",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub event_source_arn: Option<String>,
}

impl StreamRecord {
    /// Wrap a `RawRecord` in the envelope a Kinesis trigger would produce for it.
    pub fn wrap(raw: RawRecord, region: &str, stream_arn: &str, identity_arn: &str) -> Self {
        let event_id = format!("shardId-000000000000:{}", raw.sequence_number);

        Self {
            kinesis: raw,
            event_source: Some(EVENT_SOURCE.to_owned()),
            event_version: Some(EVENT_VERSION.to_owned()),
            event_id: Some(event_id),
            event_name: Some(EVENT_NAME.to_owned()),
            invoke_identity_arn: Some(identity_arn.to_owned()),
            aws_region: Some(region.to_owned()),
            event_source_arn: Some(stream_arn.to_owned()),
        }
    }
}

/// An opaque, base64 wrapped payload plus the stream metadata it arrived with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinesis_schema_version: Option<String>,
    pub partition_key: String,
    pub sequence_number: String,
    /// Base64 encoded binary payload.
    pub data: String,
    /// Seconds since the epoch.
    pub approximate_arrival_timestamp: f64,
}

impl RawRecord {
    pub fn new(
        partition_key: &str,
        sequence_number: &str,
        payload: &[u8],
        approximate_arrival_timestamp: f64,
    ) -> Self {
        Self {
            kinesis_schema_version: Some(KINESIS_SCHEMA_VERSION.to_owned()),
            partition_key: partition_key.to_owned(),
            sequence_number: sequence_number.to_owned(),
            data: STANDARD.encode(payload),
            approximate_arrival_timestamp,
        }
    }

    /// Decode the base64 wrapper, returning the binary payload.
    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.data.trim())
    }
}
