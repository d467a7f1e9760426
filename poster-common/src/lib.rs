pub mod avro;
pub mod kinesis;
pub mod metrics;
pub mod record;
pub mod retry;
