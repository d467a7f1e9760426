use http::StatusCode;
use poster_common::avro::AvroError;
use thiserror::Error;

/// Enumeration of errors that can occur while obtaining a bearer token.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("failed to decrypt oauth credentials: {0}")]
    Decrypt(String),
    #[error("invalid oauth token url: {0}")]
    ParseUrlError(#[from] url::ParseError),
    #[error("oauth token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("oauth token request was rejected with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("oauth token response has no access token")]
    MissingAccessToken,
}

/// Enumeration of errors that can occur while loading the decode schema.
#[derive(Error, Debug)]
pub enum SchemaLoadError {
    #[error("schema request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("schema registry responded with {status}: {body}")]
    BadResponse { status: StatusCode, body: String },
    #[error("schema registry response is not a valid envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("schema registry response has no data.schema field")]
    MissingSchema,
    #[error(transparent)]
    InvalidSchema(#[from] AvroError),
}

/// Enumeration of errors that can occur while decoding a single stream record.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record {sequence_number} from partition {partition_key} is not valid base64: {error}")]
    Base64 {
        sequence_number: String,
        partition_key: String,
        error: base64::DecodeError,
    },
    #[error("record {sequence_number} from partition {partition_key} does not decode: {error}")]
    Payload {
        sequence_number: String,
        partition_key: String,
        error: AvroError,
    },
}

/// The destination rejected a batch as malformed. Never retried.
#[derive(Error, Debug)]
#[error("{endpoint} rejected the batch with {status}: {body}")]
pub struct ValidationError {
    pub endpoint: String,
    pub status: StatusCode,
    pub body: String,
}

/// Enumeration of terminal delivery failures.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to serialize batch for {endpoint}: {error}")]
    Serialize {
        endpoint: String,
        error: serde_json::Error,
    },
    #[error("request to {endpoint} failed without a response: {error}")]
    Transport {
        endpoint: String,
        error: reqwest::Error,
    },
    #[error("{endpoint} still responded with {status} after {attempts} attempts")]
    RetriesExhausted {
        endpoint: String,
        status: StatusCode,
        attempts: u32,
    },
    #[error("failed to re-authenticate after a 401 from {endpoint}: {error}")]
    Reauthenticate { endpoint: String, error: AuthError },
}

/// Either way a single `DeliveryClient::deliver` call can fail.
#[derive(Error, Debug)]
pub enum DeliveryFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Enumeration of errors that fail a whole invocation.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    SchemaLoad(#[from] SchemaLoadError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl From<DeliveryFailure> for BatchError {
    fn from(failure: DeliveryFailure) -> Self {
        match failure {
            DeliveryFailure::Validation(e) => BatchError::Validation(e),
            DeliveryFailure::Delivery(e) => BatchError::Delivery(e),
        }
    }
}

impl BatchError {
    /// The pipeline stage that failed, used as a log field and metric label.
    pub fn stage(&self) -> &'static str {
        match self {
            BatchError::Auth(_) => "auth",
            BatchError::SchemaLoad(_) => "schema",
            BatchError::Decode(_) => "decode",
            BatchError::Validation(_) => "validation",
            BatchError::Delivery(_) => "delivery",
        }
    }
}
