// SPDX-License-Identifier: MIT

//! The Job registry (spec §3 `Job Definition`, §9 "Dynamic Job registry").
//!
//! Registration is idempotent on the *same definition object*: calling
//! `register` twice with a `Job` cloned from the same `JobDefinition::build()`
//! call is a no-op, but registering a different definition under a name
//! already taken fails. Sameness is judged by `Arc::ptr_eq` on the
//! type-erased handler, not by job name alone.

use crate::job::Job;
use durably_core::{Clock, DurablyError, DurablyResult, SystemClock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Registry<C: Clock = SystemClock> {
    jobs: RwLock<HashMap<String, Job<C>>>,
}

impl<C: Clock> Default for Registry<C> {
    fn default() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Clock> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: Job<C>) -> DurablyResult<()> {
        let mut jobs = self.jobs.write();
        match jobs.get(job.name()) {
            Some(existing) if Arc::ptr_eq(&existing.inner, &job.inner) => Ok(()),
            Some(_) => Err(DurablyError::AlreadyRegistered {
                name: job.name().to_string(),
            }),
            None => {
                jobs.insert(job.name().to_string(), job);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Job<C>> {
        self.jobs.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }
}
