//! What a resource type sees while its handlers, polls and deletes run.

use crate::{
    error::ReconcileError,
    resource::HandlerSpec,
    settings::{ConvergeOptions, EngineSettings},
};
use nixops4_aws_core::{Attrs, Schema, Value};
use nixops4_aws_provider::{
    is_read_only, CloudProvider, Output, Params, ProviderError, RetryPolicy,
};
use nixops4_aws_state::ResourceRecord;
use std::{ops::Deref, time::Duration};
use tokio::time::Instant;

static NULL: Value = Value::Null;

/// A resource's recorded state plus the means to talk to the provider.
pub struct ResourceContext<'a> {
    pub name: &'a str,
    pub record: &'a ResourceRecord,
    provider: &'a dyn CloudProvider,
    settings: &'a EngineSettings,
}

impl<'a> ResourceContext<'a> {
    pub fn new(
        name: &'a str,
        record: &'a ResourceRecord,
        provider: &'a dyn CloudProvider,
        settings: &'a EngineSettings,
    ) -> Self {
        ResourceContext {
            name,
            record,
            provider,
            settings,
        }
    }

    pub fn resource_id(&self) -> Result<&'a str, ReconcileError> {
        self.record
            .resource_id
            .as_deref()
            .ok_or_else(|| ReconcileError::internal(self.name, "no resource id is recorded"))
    }

    /// The recorded value of `attr`, as last applied or observed.
    pub fn current(&self, attr: &str) -> &'a Value {
        self.record.get(attr)
    }

    pub fn current_str(&self, attr: &str) -> Option<&'a str> {
        self.current(attr).as_str()
    }

    pub fn settings(&self) -> &EngineSettings {
        self.settings
    }

    fn provider_error(&self, operation: &str, error: ProviderError) -> ReconcileError {
        ReconcileError::Provider {
            resource: self.name.to_owned(),
            operation: operation.to_owned(),
            error,
        }
    }

    fn log_call(&self, operation: &str) {
        if is_read_only(operation) {
            tracing::debug!(operation, "calling provider");
        } else {
            tracing::info!(operation, "calling provider");
        }
    }

    pub async fn invoke(&self, operation: &str, params: Params) -> Result<Output, ReconcileError> {
        self.log_call(operation);
        self.provider
            .invoke(operation, params)
            .await
            .map_err(|e| self.provider_error(operation, e))
    }

    pub async fn invoke_with_retry(
        &self,
        operation: &str,
        params: Params,
        policy: &RetryPolicy,
    ) -> Result<Output, ReconcileError> {
        self.log_call(operation);
        nixops4_aws_provider::invoke_with_retry(self.provider, operation, &params, policy)
            .await
            .map_err(|e| self.provider_error(operation, e))
    }

    /// Start a bounded wait, using the configured poll interval and timeout.
    pub fn waiter(&self, waiting_for: impl Into<String>) -> Waiter {
        Waiter::new(
            self.name,
            waiting_for,
            self.settings.poll_interval,
            self.settings.provisioning_timeout,
        )
    }
}

/// A fixed-interval wait with an overall deadline.
///
/// ```ignore
/// let mut waiter = ctx.waiter("status available");
/// while !is_available(ctx).await? {
///     waiter.tick().await?;
/// }
/// ```
pub struct Waiter {
    resource: String,
    waiting_for: String,
    interval: Duration,
    timeout: Duration,
    started: Instant,
}

impl Waiter {
    pub fn new(
        resource: impl Into<String>,
        waiting_for: impl Into<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Waiter {
            resource: resource.into(),
            waiting_for: waiting_for.into(),
            interval,
            timeout,
            started: Instant::now(),
        }
    }

    /// Sleep one interval, or fail with [`ReconcileError::ProvisioningTimeout`]
    /// once the deadline has passed.
    pub async fn tick(&mut self) -> Result<(), ReconcileError> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.timeout {
            return Err(ReconcileError::ProvisioningTimeout {
                resource: self.resource.clone(),
                waiting_for: self.waiting_for.clone(),
                elapsed,
            });
        }
        tracing::debug!(
            waiting_for = %self.waiting_for,
            elapsed_s = elapsed.as_secs(),
            "waiting"
        );
        tokio::time::sleep(self.interval).await;
        Ok(())
    }
}

/// The context of one handler run.
///
/// Handlers read the resolved definition through [`HandlerContext::desired`]
/// and report what they applied with [`HandlerContext::set`]. An update
/// handler may only set its own triggers. A create handler may set any
/// attribute its call applied, and computed ones; later handlers whose
/// triggers it covered are then skipped. Nothing is written to the state
/// store until the handler returns `Ok`.
pub struct HandlerContext<'a> {
    base: ResourceContext<'a>,
    handler: &'a HandlerSpec,
    schema: &'a Schema,
    desired: &'a Attrs,
    pub options: ConvergeOptions,
    staged: Attrs,
    new_resource_id: Option<String>,
}

/// What a successful handler leaves behind for the engine to record.
pub(crate) struct HandlerOutcome {
    pub staged: Attrs,
    pub resource_id: Option<String>,
}

impl<'a> Deref for HandlerContext<'a> {
    type Target = ResourceContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        base: ResourceContext<'a>,
        handler: &'a HandlerSpec,
        schema: &'a Schema,
        desired: &'a Attrs,
        options: ConvergeOptions,
    ) -> Self {
        HandlerContext {
            base,
            handler,
            schema,
            desired,
            options,
            staged: Attrs::new(),
            new_resource_id: None,
        }
    }

    pub fn handler(&self) -> &HandlerSpec {
        self.handler
    }

    /// The definition's value for `attr`, with references resolved.
    pub fn desired(&self, attr: &str) -> &'a Value {
        self.desired.get(attr).unwrap_or(&NULL)
    }

    pub fn desired_str(&self, attr: &str) -> Result<&'a str, ReconcileError> {
        self.desired(attr).as_str().ok_or_else(|| {
            ReconcileError::internal(self.name, format!("attribute `{}` is not a string", attr))
        })
    }

    /// Record that `attr` now has `value` in the cloud.
    pub fn set(&mut self, attr: &str, value: impl Into<Value>) -> Result<(), ReconcileError> {
        let known = self.schema.get(attr).is_some();
        if !(self.handler.owns(attr) || (self.handler.is_create() && known)) {
            return Err(ReconcileError::internal(
                self.name,
                format!(
                    "handler `{}` may not set attribute `{}`",
                    self.handler.name, attr
                ),
            ));
        }
        self.staged.insert(attr.to_owned(), value.into());
        Ok(())
    }

    /// Record the identifier of the resource just created, or its new
    /// identifier after a rename.
    pub fn set_resource_id(&mut self, id: impl Into<String>) {
        self.new_resource_id = Some(id.into());
    }

    /// The resource id, including one assigned earlier in this handler.
    pub fn resource_id(&self) -> Result<&str, ReconcileError> {
        match &self.new_resource_id {
            Some(id) => Ok(id),
            None => self.base.resource_id(),
        }
    }

    /// The token to pass with the creating call, persisted before the call.
    pub fn idempotency_token(&self) -> Result<&'a str, ReconcileError> {
        self.record
            .idempotency_token
            .as_deref()
            .ok_or_else(|| ReconcileError::internal(self.name, "no idempotency token is recorded"))
    }

    pub(crate) fn finish(self) -> HandlerOutcome {
        HandlerOutcome {
            staged: self.staged,
            resource_id: self.new_resource_id,
        }
    }
}
