use apache_avro::Schema;
use poster_common::avro::decode_datum;
use poster_common::kinesis::RawRecord;
use poster_common::record::DecodedRecord;

use crate::error::DecodeError;

/// Decode the base64 wrapped Avro payload of a stream record.
pub fn decode(raw: &RawRecord, schema: &Schema) -> Result<DecodedRecord, DecodeError> {
    let payload = raw.payload().map_err(|error| DecodeError::Base64 {
        sequence_number: raw.sequence_number.clone(),
        partition_key: raw.partition_key.clone(),
        error,
    })?;

    let fields = decode_datum(schema, &payload).map_err(|error| DecodeError::Payload {
        sequence_number: raw.sequence_number.clone(),
        partition_key: raw.partition_key.clone(),
        error,
    })?;

    Ok(DecodedRecord::new(fields))
}
