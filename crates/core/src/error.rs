// SPDX-License-Identifier: MIT

//! Error taxonomy shared by every Durably crate (spec §7).
//!
//! Each variant maps to exactly one "kind" named in the specification.
//! Downstream crates (`durably-storage`, `durably-engine`, `durably-worker`,
//! `durably`) convert their own local errors into this enum at their public
//! boundary rather than inventing parallel taxonomies.

use crate::run::{RunId, RunStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DurablyError {
    #[error("input for job failed validation: {0}")]
    InvalidInput(String),

    #[error("output for job failed validation: {0}")]
    InvalidOutput(String),

    #[error("step output could not be serialized: {0}")]
    StepOutputNotSerializable(String),

    #[error("step {step:?} failed: {error}")]
    StepFailed { step: String, error: String },

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("run was cancelled")]
    Cancelled,

    #[error("timed out waiting for run to complete")]
    Timeout,

    #[error("cannot {attempted} a run in status {from:?}")]
    InvalidTransition {
        from: RunStatus,
        attempted: &'static str,
    },

    #[error("job {name:?} is already registered with a different definition")]
    AlreadyRegistered { name: String },

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("storage is transiently unavailable: {0}")]
    TransientStorage(String),
}

pub type DurablyResult<T> = Result<T, DurablyError>;
