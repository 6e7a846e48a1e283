// SPDX-License-Identifier: MIT

//! Job registration (spec §3 `Job Definition`, §9 "Dynamic Job registry").
//!
//! A `Job` is registered once with a concrete `(In, Out)` pair chosen by the
//! caller; from that point on the registry only ever sees the type-erased
//! `Arc<dyn ErasedJob>` side of it, the same shape `SqliteStorage<T, C>` in
//! the apalis-style storage backends takes for its own job payload type —
//! the generic parameter is monomorphized away at the registration call
//! site and never appears in the registry's own signature again.

use crate::context::StepContext;
use async_trait::async_trait;
use durably_core::{Clock, DurablyError, DurablyResult, SystemClock, Validator};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// User-supplied handler for a registered job. Blanket-implemented for any
/// `async fn(StepContext, In) -> Result<Out, DurablyError>`-shaped closure.
pub trait JobHandler<C: Clock, In, Out>: Send + Sync + 'static {
    fn call(&self, ctx: StepContext<C>, input: In) -> BoxFuture<'static, DurablyResult<Out>>;
}

impl<C, In, Out, F, Fut> JobHandler<C, In, Out> for F
where
    C: Clock,
    F: Fn(StepContext<C>, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DurablyResult<Out>> + Send + 'static,
{
    fn call(&self, ctx: StepContext<C>, input: In) -> BoxFuture<'static, DurablyResult<Out>> {
        Box::pin(self(ctx, input))
    }
}

/// Object-safe, type-erased face of a registered job. The Run Executor only
/// ever talks to jobs through this trait.
#[async_trait]
pub(crate) trait ErasedJob<C: Clock>: Send + Sync {
    fn name(&self) -> &str;
    /// Validate a trigger payload against the input schema without running
    /// the handler (spec §4.G `trigger` validates before inserting a Run).
    fn validate_input(&self, payload: Value) -> DurablyResult<Value>;
    async fn run(&self, ctx: StepContext<C>, payload: Value) -> DurablyResult<Value>;
}

struct TypedJob<C, In, Out, H> {
    name: String,
    input_validator: Option<Arc<dyn Validator>>,
    output_validator: Option<Arc<dyn Validator>>,
    handler: H,
    _marker: PhantomData<fn(C, In) -> Out>,
}

#[async_trait]
impl<C, In, Out, H> ErasedJob<C> for TypedJob<C, In, Out, H>
where
    C: Clock,
    In: DeserializeOwned + Send + Sync + 'static,
    Out: Serialize + Send + Sync + 'static,
    H: JobHandler<C, In, Out>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_input(&self, payload: Value) -> DurablyResult<Value> {
        match &self.input_validator {
            Some(validator) => validator.validate(payload).map_err(DurablyError::InvalidInput),
            None => Ok(payload),
        }
    }

    async fn run(&self, ctx: StepContext<C>, mut payload: Value) -> DurablyResult<Value> {
        payload = self.validate_input(payload)?;
        let input: In = serde_json::from_value(payload)
            .map_err(|e| DurablyError::InvalidInput(e.to_string()))?;

        let output = self.handler.call(ctx, input).await?;

        let mut value = serde_json::to_value(&output)
            .map_err(|e| DurablyError::StepOutputNotSerializable(e.to_string()))?;
        if let Some(validator) = &self.output_validator {
            value = validator
                .validate(value)
                .map_err(DurablyError::InvalidOutput)?;
        }
        Ok(value)
    }
}

/// A registered job, holding its type-erased definition.
///
/// Cloning a `Job` clones the `Arc`, not the definition — two `Job` handles
/// that came from the same `JobDefinition::build()` call are the "same
/// definition object" spec §3 talks about (checked via `Arc::ptr_eq` in
/// [`crate::registry::Registry::register`]).
#[derive(Clone)]
pub struct Job<C: Clock = SystemClock> {
    pub(crate) inner: Arc<dyn ErasedJob<C>>,
}

impl<C: Clock> fmt::Debug for Job<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("name", &self.inner.name()).finish()
    }
}

impl<C: Clock> Job<C> {
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Validate a trigger payload against this job's input schema without
    /// invoking its handler.
    pub fn validate_input(&self, payload: Value) -> DurablyResult<Value> {
        self.inner.validate_input(payload)
    }
}

/// Builder for a [`Job`] (spec §3 `Job Definition`: `name`,
/// `input_validator`, `output_validator`, `handler`).
pub struct JobDefinition<In, Out, H, C: Clock = SystemClock> {
    name: String,
    input_validator: Option<Arc<dyn Validator>>,
    output_validator: Option<Arc<dyn Validator>>,
    handler: H,
    _marker: PhantomData<fn(C, In) -> Out>,
}

impl<In, Out, H, C> JobDefinition<In, Out, H, C>
where
    C: Clock,
    In: DeserializeOwned + Send + Sync + 'static,
    Out: Serialize + Send + Sync + 'static,
    H: JobHandler<C, In, Out>,
{
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            input_validator: None,
            output_validator: None,
            handler,
            _marker: PhantomData,
        }
    }

    pub fn input_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.input_validator = Some(Arc::new(validator));
        self
    }

    pub fn output_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.output_validator = Some(Arc::new(validator));
        self
    }

    pub fn build(self) -> Job<C> {
        Job {
            inner: Arc::new(TypedJob {
                name: self.name,
                input_validator: self.input_validator,
                output_validator: self.output_validator,
                handler: self.handler,
                _marker: PhantomData,
            }),
        }
    }
}
