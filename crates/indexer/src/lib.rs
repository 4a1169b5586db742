//! Qubic indexer: the Elasticsearch side of the pipeline.
//!
//! * [consumer] drains one Kafka topic in batches, upserts the records into an
//!   index and commits offsets only after the whole batch was indexed. Tick
//!   intervals are merged with what the index already holds so an extended
//!   interval replaces its shorter predecessor instead of duplicating it.
//! * [status] verifies that every archived transaction reached the index and
//!   serves the verified processing status over HTTP.

pub mod app;
pub mod config;
pub mod consumer;
pub mod elastic;
pub mod processor;
pub mod source;
pub mod status;

pub use config::{ConsumerConfig, StatusConfig, Stream};
pub use consumer::{ConsumerMetrics, ElasticConsumer};
pub use elastic::{DocumentStore, ElasticError, HttpElastic, IndexAction, RetryPolicy};
pub use processor::{merge_intervals, BatchSummary, ConsumeError, Processor};
pub use source::{ConsumedRecord, KafkaSource, RecordSource};
