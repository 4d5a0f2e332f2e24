//! `mfgmon-core`: shared primitives for the job dispatch services.
//!
//! This crate has no infrastructure concerns: identifiers, job names and the
//! error type used to reject malformed input.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{JobId, JobName, JobNamespace};
