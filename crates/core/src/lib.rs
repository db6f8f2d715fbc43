//! `courier-core`: job engine domain building blocks.
//!
//! This crate contains the **pure** parts of the job engine: identifiers, the
//! serialized data format, the job execution contract and the factory
//! registry. Persistence and scheduling live in `courier-infra`.

pub mod data;
pub mod error;
pub mod factory;
pub mod id;
pub mod job;
pub mod spec;

pub use data::{Data, DataBuilder, DataValue};
pub use error::{DataError, FactoryError};
pub use factory::{FactoryRegistry, JobFactory};
pub use id::JobId;
pub use job::{
    BackoffStrategy, CancellationToken, Constraint, Job, JobContext, Outcome, RetryPolicy,
};
pub use spec::{JobSpec, JobStatus, Priority};
