//! Qubic publisher: crawls the archiver tick by tick and publishes
//! transactions, tick data, tick intervals and computor lists to Kafka.
//!
//! Each stage keeps a durable cursor in a local [store::CursorStore] and only
//! advances it after Kafka acknowledged the whole batch, so a crash replays at
//! most one batch. Downstream consumers upsert by document id, which makes the
//! replay harmless.

pub mod app;
pub mod archiver;
pub mod config;
pub mod convert;
pub mod metrics;
pub mod model;
pub mod planner;
pub mod pool;
pub mod producer;
pub mod server;
pub mod sink;
pub mod store;

pub use archiver::{Archiver, ArchiverError, ArchiverStatus, HttpArchiver};
pub use config::{PublisherConfig, StageDefaults};
pub use model::{EpochComputors, TickData, TickInterval, TickTransactions, Tx, ValidationError};
pub use producer::{
    run_stage, ComputorsProducer, CycleReport, ProducerError, Stage, StageContext, TickDataProducer,
    TickIntervalsProducer, TransactionsProducer,
};
pub use sink::{KafkaSink, PublishError, Record, RecordSink};
pub use store::{CursorStore, StoreError};
