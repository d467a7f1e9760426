//! Turn a file of plain JSON records into a stream event fixture: every record is Avro encoded
//! with the given schema, base64 wrapped and put in a Kinesis envelope.
//!
//! ```text
//! kinesify --schema item.avsc event.unencoded.json event.json
//! ```
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use poster_common::avro::{encode_datum, parse_schema};
use poster_common::kinesis::{RawRecord, StreamEvent, StreamRecord};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

const ARRIVAL_TIMESTAMP: f64 = 1428537600.0;
const REGION: &str = "us-east-1";
const STREAM_ARN: &str = "arn:aws:kinesis:EXAMPLE";
const IDENTITY_ARN: &str = "arn:aws:iam::EXAMPLE";

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Avro schema to encode with. Either the schema itself or a registry response wrapping it in
    /// `{"data": {"schema": ...}}`
    #[arg(short, long)]
    schema: PathBuf,

    /// JSON document with a `Records` array of plain objects
    input: PathBuf,

    /// Where to write the stream event
    output: PathBuf,

    /// Partition key stamped on every record
    #[arg(long, default_value = "s1")]
    partition_key: String,

    /// Sequence number of the first record; each following record gets the next one
    #[arg(long, default_value_t = 1)]
    sequence_number: u64,
}

#[derive(Deserialize)]
struct UnencodedEvent {
    #[serde(rename = "Records")]
    records: Vec<Value>,
}

/// Kinesis sequence numbers are 56 digit decimal strings.
fn sequence_number(n: u64) -> String {
    format!("{n:056}")
}

/// Pull the schema out of a registry response, or take the document as the schema itself.
fn schema_text(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(document) => match document.pointer("/data/schema") {
            Some(Value::String(schema)) => schema.to_owned(),
            _ => raw.to_owned(),
        },
        Err(_) => raw.to_owned(),
    }
}

fn kinesify(
    schema: &str,
    records: &[Value],
    partition_key: &str,
    first_sequence_number: u64,
) -> Result<StreamEvent> {
    let schema = parse_schema(schema).context("invalid schema")?;

    let records = records
        .iter()
        .zip(first_sequence_number..)
        .enumerate()
        .map(|(i, (record, n))| {
            let payload = encode_datum(&schema, record)
                .with_context(|| format!("record {i} does not match the schema"))?;

            Ok(StreamRecord::wrap(
                RawRecord::new(partition_key, &sequence_number(n), &payload, ARRIVAL_TIMESTAMP),
                REGION,
                STREAM_ARN,
                IDENTITY_ARN,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(StreamEvent { records })
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn run(cli: &Cli) -> Result<usize> {
    let schema = schema_text(&read(&cli.schema)?);

    let input: UnencodedEvent = serde_json::from_str(&read(&cli.input)?)
        .with_context(|| format!("{} has no Records array", cli.input.display()))?;
    if input.records.is_empty() {
        bail!("{} has no records to encode", cli.input.display());
    }

    let event = kinesify(
        &schema,
        &input.records,
        &cli.partition_key,
        cli.sequence_number,
    )?;

    let json = serde_json::to_string(&event)?;
    fs::write(&cli.output, json)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;

    Ok(event.records.len())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let written = run(&cli)?;

    info!(records = written, output = %cli.output.display(), "successfully wrote data to file");

    Ok(())
}
