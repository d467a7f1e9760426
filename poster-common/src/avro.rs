//! # Avro
//!
//! Single datum Avro encoding between JSON objects and the binary payloads carried on the
//! stream. Payloads are bare datums: no object container header, no embedded schema. The
//! writer schema is always the one the schema registry hands out.
use apache_avro::{from_avro_datum, to_avro_datum, types::Value as AvroValue, Schema};
use serde_json::{Map, Value};
use thiserror::Error;

/// Enumeration of errors that can occur while moving between JSON and Avro datums.
#[derive(Error, Debug)]
pub enum AvroError {
    #[error("failed to parse avro schema: {0}")]
    ParseSchema(#[source] apache_avro::Error),
    #[error("payload does not match the schema: {0}")]
    Read(#[source] apache_avro::Error),
    #[error("payload has {0} trailing bytes not described by the schema")]
    TrailingBytes(usize),
    #[error("payload decodes to {0}, expected a record")]
    NotARecord(&'static str),
    #[error("decoded value cannot be represented as json: {0}")]
    Json(#[source] apache_avro::Error),
    #[error("value does not conform to the schema: {0}")]
    Resolve(#[source] apache_avro::Error),
    #[error("failed to write datum: {0}")]
    Write(#[source] apache_avro::Error),
}

/// Parse a JSON encoded Avro schema.
pub fn parse_schema(raw: &str) -> Result<Schema, AvroError> {
    Schema::parse_str(raw).map_err(AvroError::ParseSchema)
}

/// Decode one datum written with `schema` into a JSON object.
///
/// Records become objects, unions collapse to the value of their branch and enums become their
/// symbol. The whole payload must be consumed: leftover bytes mean the payload was written with
/// a different schema.
pub fn decode_datum(schema: &Schema, payload: &[u8]) -> Result<Map<String, Value>, AvroError> {
    let mut reader = payload;
    let value = from_avro_datum(schema, &mut reader, None).map_err(AvroError::Read)?;

    if !reader.is_empty() {
        return Err(AvroError::TrailingBytes(reader.len()));
    }

    match Value::try_from(value).map_err(AvroError::Json)? {
        Value::Object(fields) => Ok(fields),
        other => Err(AvroError::NotARecord(json_kind(&other))),
    }
}

/// Encode a JSON value as one datum of `schema`.
///
/// The value is resolved against the schema first, so objects are accepted for records, integer
/// widths are narrowed where they fit and union branches are picked by value. Fields the schema
/// does not describe are dropped.
pub fn encode_datum(schema: &Schema, value: &Value) -> Result<Vec<u8>, AvroError> {
    let resolved = AvroValue::from(value.clone())
        .resolve(schema)
        .map_err(AvroError::Resolve)?;

    to_avro_datum(schema, resolved).map_err(AvroError::Write)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
