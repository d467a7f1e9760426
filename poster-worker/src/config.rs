use std::ops::Deref;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use poster_common::retry::RetryPolicy;
use thiserror::Error;
use url::Url;

use crate::router::{Operation, Route, RouteTable};

/// The fixed field Sierra uses for the item type code.
pub const DEFAULT_MATCH_FIELD: &str = "fixedFields.61.value";

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "DESTINATION_API_URL")]
    pub destination_api_url: Url,

    #[envconfig(from = "SCHEMA_URL")]
    pub schema_url: Url,

    #[envconfig(from = "OAUTH_KEY")]
    pub oauth_key: NonEmptyString,

    #[envconfig(from = "OAUTH_SECRET")]
    pub oauth_secret: NonEmptyString,

    #[envconfig(from = "OAUTH_URL")]
    pub oauth_url: Url,

    /// Whether the OAuth key and secret are KMS ciphertexts that must be decrypted before use.
    #[envconfig(from = "OAUTH_CREDENTIALS_ENCRYPTED", default = "false")]
    pub oauth_credentials_encrypted: FlexBool,

    /// JSON route table. Takes precedence over `ACCEPTED_ITEM_TYPES`.
    #[envconfig(from = "ROUTES")]
    pub routes: Option<RouteTable>,

    #[envconfig(from = "ACCEPTED_ITEM_TYPES", default = "")]
    pub accepted_item_types: CommaSeparated,

    #[envconfig(from = "RECORD_SOURCE")]
    pub record_source: Option<NonEmptyString>,

    #[envconfig(from = "RECORD_TYPE")]
    pub record_type: Option<NonEmptyString>,

    #[envconfig(from = "DECODE_FAILURE_POLICY", default = "abort")]
    pub decode_failure_policy: DecodeFailurePolicy,

    #[envconfig(from = "REQUEST_TIMEOUT", default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "MAX_BODY_SIZE", default = "10000000")]
    pub max_body_size: usize,

    #[envconfig(from = "CONCURRENCY_LIMIT", default = "10")]
    pub concurrency_limit: usize,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "LOG_FORMAT", default = "json")]
    pub log_format: LogFormat,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build the route table, falling back to a single upsert route on the item type code when
    /// `ROUTES` is not set. Relative endpoints are resolved against `DESTINATION_API_URL`.
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        let table = match &self.routes {
            Some(routes) => routes.clone(),
            None => RouteTable::new(vec![Route {
                match_field: DEFAULT_MATCH_FIELD.to_owned(),
                match_values: self.accepted_item_types.0.iter().cloned().collect(),
                endpoint: self.destination_api_url.to_string(),
                operation: Operation::Upsert,
            }]),
        };

        if table.is_empty() {
            return Err(ConfigError::EmptyRouteTable);
        }

        table.resolve(&self.destination_api_url)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let builder = RetryPolicy::build(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
        )
        .max_retries(self.retry_policy.max_retries);

        match self.retry_policy.maximum_interval {
            Some(maximum_interval) => builder.maximum_interval(maximum_interval.0).provide(),
            None => builder.provide(),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "MAX_RETRIES", default = "5")]
    pub max_retries: u32,

    #[envconfig(from = "BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "INITIAL_INTERVAL", default = "2000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "MAXIMUM_INTERVAL")]
    pub maximum_interval: Option<EnvMsDuration>,
}

/// Enumeration of errors that make a configuration unusable.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("the route table must contain at least one route")]
    EmptyRouteTable,
    #[error("route endpoint {endpoint} is not a valid url: {error}")]
    InvalidEndpoint {
        endpoint: String,
        error: url::ParseError,
    },
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// What to do with a record whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Fail the whole batch before anything is delivered.
    Abort,
    /// Log the record, count it as skipped and carry on with the rest of the batch.
    Skip,
}

impl FromStr for DecodeFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(DecodeFailurePolicy::Abort),
            "skip" => Ok(DecodeFailurePolicy::Skip),
            invalid => Err(format!("{invalid} is not a valid decode failure policy")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            invalid => Err(format!("{invalid} is not a valid log format")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl Deref for FlexBool {
    type Target = bool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// A comma separated list; blank entries are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}
