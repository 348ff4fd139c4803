//! # bf-pipeline
//!
//! The compression job state machine and service facade.
//!
//! [`CompressionService`] owns the job table, the detect-once hardware
//! capabilities, and the event relay. `submit` validates and registers a
//! job, runs it on a spawned task through Probing and Encoding, and
//! publishes every transition and progress sample to the per-job event
//! stream; `subscribe` hands that stream out, `get_job` snapshots state for
//! polling, and `cancel` stops a running job.

pub mod job;
pub mod service;

pub use job::{EncodePlan, EncodeRequest, Job, JobResult};
pub use service::CompressionService;

pub use bf_core::events::JobState;
