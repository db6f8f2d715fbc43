//! Infrastructure layer: job persistence, scheduling and the manager facade.

pub mod jobs;
