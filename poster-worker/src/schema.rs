//! Cache for the Avro schema records are decoded with.
use std::sync::Arc;

use apache_avro::Schema;
use poster_common::avro::parse_schema;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheSource, CachedValue};
use crate::error::SchemaLoadError;

/// The registry wraps the schema, itself JSON encoded as a string, in `{"data": {"schema": ...}}`.
#[derive(Deserialize)]
struct SchemaEnvelope {
    data: Option<SchemaData>,
}

#[derive(Deserialize)]
struct SchemaData {
    schema: Option<String>,
}

/// Holds the decode schema for the lifetime of the process. It is fetched once and never
/// invalidated; a restart picks up a new schema version.
pub struct SchemaCache {
    http_client: reqwest::Client,
    url: Url,
    cached: CachedValue<Arc<Schema>>,
}

impl SchemaCache {
    pub fn new(http_client: reqwest::Client, url: Url) -> Self {
        Self {
            http_client,
            url,
            cached: CachedValue::new(),
        }
    }

    pub async fn get_schema(&self) -> Result<Arc<Schema>, SchemaLoadError> {
        let (schema, source) = self
            .cached
            .get_or_fetch(|| self.load_schema())
            .await
            .inspect_err(|error| warn!(stage = "schema", %error, "failed to load schema"))?;

        match source {
            CacheSource::Cached => debug!("already have schema"),
            CacheSource::Fetched => info!(url = %self.url, "successfully loaded schema"),
        }

        Ok(schema)
    }

    async fn load_schema(&self) -> Result<Arc<Schema>, SchemaLoadError> {
        info!(url = %self.url, "loading schema");

        let response = self.http_client.get(self.url.clone()).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SchemaLoadError::BadResponse { status, body });
        }

        let envelope: SchemaEnvelope =
            serde_json::from_str(&body).map_err(SchemaLoadError::MalformedEnvelope)?;
        let raw = envelope
            .data
            .and_then(|data| data.schema)
            .ok_or(SchemaLoadError::MissingSchema)?;

        Ok(Arc::new(parse_schema(&raw)?))
    }
}
