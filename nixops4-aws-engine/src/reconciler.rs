//! The per-resource lifecycle: create, update, recreate, poll and destroy.
//!
//! Every provider call a handler makes happens before the state write that
//! records it. Each handler's result is committed in its own transaction, so
//! after a crash the state reflects the last handler that completed.

use crate::{
    confirm::ConfirmCallback,
    context::{HandlerContext, HandlerOutcome, ResourceContext, Waiter},
    diff::{self, changed_attributes},
    error::ReconcileError,
    interrupt::InterruptState,
    registry::Registry,
    resolve::resolve_definition,
    resource::{HandlerSpec, Observed, ObservedStatus, ResourceType},
    settings::{ConvergeOptions, EngineSettings},
};
use nixops4_aws_core::{Attrs, ConfigurationError, Definition, Lifecycle, Value};
use nixops4_aws_provider::CloudProvider;
use nixops4_aws_state::{ResourceRecord, StateStore, StateStoreExt as _};
use std::sync::Arc;
use tracing::Instrument as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergeOutcome {
    /// Nothing differed; no mutating calls were made.
    NoChange,
    Created,
    /// A resource whose creation was interrupted was found and recorded.
    Adopted,
    /// The named handlers ran, in this order.
    Updated(Vec<&'static str>),
    /// Destroyed and created again, to change immutable attributes.
    Recreated,
}

/// Drives resources towards their definitions.
///
/// One `Reconciler` serves a whole deployment run. It does not lock
/// resources itself; callers must not converge the same resource twice
/// concurrently.
pub struct Reconciler {
    registry: Arc<Registry>,
    store: Arc<dyn StateStore>,
    provider: Arc<dyn CloudProvider>,
    settings: EngineSettings,
    interrupt: InterruptState,
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn CloudProvider>,
        settings: EngineSettings,
        interrupt: InterruptState,
    ) -> Self {
        Reconciler {
            registry,
            store,
            provider,
            settings,
            interrupt,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn context<'a>(&'a self, name: &'a str, record: &'a ResourceRecord) -> ResourceContext<'a> {
        ResourceContext::new(name, record, self.provider.as_ref(), &self.settings)
    }

    fn commit(&self, name: &str, record: &ResourceRecord) -> Result<(), ReconcileError> {
        let mut tx = self.store.begin();
        tx.put(name, record.clone());
        tx.commit()?;
        Ok(())
    }

    fn recorded_type(
        &self,
        name: &str,
        record: &ResourceRecord,
    ) -> Result<Arc<dyn ResourceType>, ReconcileError> {
        self.registry
            .get(&record.type_tag)
            .cloned()
            .ok_or_else(|| {
                ConfigurationError::UnknownType {
                    resource: name.to_owned(),
                    type_tag: record.type_tag.clone(),
                }
                .into()
            })
    }

    /// Bring the resource in line with `defn`.
    pub async fn converge(
        &self,
        defn: &Definition,
        options: &ConvergeOptions,
    ) -> Result<ConvergeOutcome, ReconcileError> {
        let ty = self.registry.lookup(defn)?.as_ref();
        let name = defn.name.as_str();
        let desired = resolve_definition(defn, self.store.as_ref())?;

        let mut record = match self.store.get(name)? {
            Some(record) if record.type_tag != defn.type_tag => {
                return Err(ConfigurationError::invalid(
                    name,
                    format!(
                        "recorded as type `{}` but defined as `{}`; destroy it first",
                        record.type_tag, defn.type_tag
                    ),
                )
                .into())
            }
            Some(record) => record,
            None => ResourceRecord::new(&defn.type_tag),
        };
        let prior = record.lifecycle;

        let must_poll = matches!(prior, Lifecycle::Starting | Lifecycle::Unknown)
            || (options.check && record.resource_id.is_some());
        if must_poll {
            record = self.refresh(ty, name, record).await?;
            if record.lifecycle == Lifecycle::Starting && record.resource_id.is_some() {
                record = self.wait_until_settled(ty, name, record).await?;
            }
        }

        if prior == Lifecycle::Starting && record.lifecycle == Lifecycle::Up {
            tracing::info!(
                resource_id = record.resource_id.as_deref().unwrap_or_default(),
                "adopting resource from an interrupted creation"
            );
        }
        match record.lifecycle {
            Lifecycle::Unknown => Err(ReconcileError::UnknownState {
                resource: name.to_owned(),
            }),
            Lifecycle::Missing | Lifecycle::Starting => {
                self.create(ty, name, &desired, record, options).await?;
                tracing::info!("created");
                Ok(ConvergeOutcome::Created)
            }
            Lifecycle::Up => {
                let adopted = prior == Lifecycle::Starting;
                if prior != Lifecycle::Up {
                    self.adopt(ty, name, &desired, &mut record)?;
                }
                let outcome = self.update(ty, name, &desired, record, options).await?;
                Ok(match outcome {
                    ConvergeOutcome::NoChange if adopted => ConvergeOutcome::Adopted,
                    outcome => outcome,
                })
            }
        }
    }

    async fn create(
        &self,
        ty: &dyn ResourceType,
        name: &str,
        desired: &Attrs,
        mut record: ResourceRecord,
        options: &ConvergeOptions,
    ) -> Result<(), ReconcileError> {
        let before = record.clone();
        record.lifecycle = Lifecycle::Starting;
        if record.idempotency_token.is_none() {
            record.idempotency_token = Some(uuid::Uuid::new_v4().to_string());
        }
        // A starting record carries what the creating call is made with, so
        // that it can be polled and deleted before the call is recorded.
        let create_triggers = ty.create_handler().map(|h| h.triggers).unwrap_or_default();
        for attr in create_triggers.iter().chain(ty.starting_attributes()) {
            let value = desired.get(*attr).cloned().unwrap_or_default();
            set_attribute(&mut record.attributes, attr.to_string(), value);
        }
        // The token must be durable before the creating call is made.
        if record != before {
            self.commit(name, &record)?;
        }

        let changed = changed_attributes(ty.schema(), &record.attributes, desired);
        let plan = diff::plan(ty.handlers(), &changed, true)
            .ok_or_else(|| ReconcileError::internal(name, "handler order has a cycle"))?;
        self.run_handlers(ty, name, desired, &mut record, &plan, options)
            .await?;
        Ok(())
    }

    async fn update(
        &self,
        ty: &dyn ResourceType,
        name: &str,
        desired: &Attrs,
        mut record: ResourceRecord,
        options: &ConvergeOptions,
    ) -> Result<ConvergeOutcome, ReconcileError> {
        let schema = ty.schema();
        let changed = changed_attributes(schema, &record.attributes, desired);
        if changed.is_empty() {
            tracing::debug!("up to date");
            return Ok(ConvergeOutcome::NoChange);
        }

        let immutable: Vec<String> = changed
            .intersection(&schema.immutable())
            .map(|a| a.to_string())
            .collect();
        if !immutable.is_empty() {
            if !options.allow_recreate {
                return Err(ReconcileError::ImmutableAttributeChanged {
                    resource: name.to_owned(),
                    attrs: immutable,
                });
            }
            tracing::warn!(attrs = ?immutable, "recreating resource to change immutable attributes");
            self.delete_resource(ty, name, &record).await?;
            record.reset();
            self.commit(name, &record)?;
            self.create(ty, name, desired, record, options).await?;
            return Ok(ConvergeOutcome::Recreated);
        }

        let disruptive: Vec<String> = changed
            .intersection(&schema.requires_reboot())
            .map(|a| a.to_string())
            .collect();
        if !disruptive.is_empty() && !options.allow_reboot {
            return Err(ReconcileError::DisruptiveChange {
                resource: name.to_owned(),
                attrs: disruptive,
            });
        }

        let plan = diff::plan(ty.handlers(), &changed, false)
            .ok_or_else(|| ReconcileError::internal(name, "handler order has a cycle"))?;
        let ran = self
            .run_handlers(ty, name, desired, &mut record, &plan, options)
            .await?;
        tracing::info!(handlers = ?ran, "updated");
        Ok(ConvergeOutcome::Updated(ran))
    }

    /// Run `plan` in order, committing after each handler. A handler whose
    /// triggers an earlier handler already applied is skipped. Returns the
    /// names of the handlers that ran.
    async fn run_handlers(
        &self,
        ty: &dyn ResourceType,
        name: &str,
        desired: &Attrs,
        record: &mut ResourceRecord,
        plan: &[&HandlerSpec],
        options: &ConvergeOptions,
    ) -> Result<Vec<&'static str>, ReconcileError> {
        let mut ran = Vec::with_capacity(plan.len());
        for handler in plan {
            let due = handler.is_create()
                || handler
                    .triggers
                    .iter()
                    .any(|attr| record.get(attr) != desired.get(*attr).unwrap_or(&Value::Null));
            if !due {
                tracing::debug!(handler = handler.name, "already applied");
                continue;
            }
            self.interrupt.check_interrupted()?;
            let outcome = {
                let mut ctx = HandlerContext::new(
                    self.context(name, record),
                    handler,
                    ty.schema(),
                    desired,
                    *options,
                );
                let span = tracing::info_span!("handler", handler = handler.name);
                ty.run_handler(handler.name, &mut ctx)
                    .instrument(span)
                    .await?;
                ctx.finish()
            };
            let mut next = record.clone();
            record_handler(&mut next, name, handler, desired, outcome)?;
            self.commit(name, &next)?;
            *record = next;
            ran.push(handler.name);
        }
        Ok(ran)
    }

    /// Fill in missing create handler attributes of a resource that came
    /// back up without a recorded creation.
    fn adopt(
        &self,
        ty: &dyn ResourceType,
        name: &str,
        desired: &Attrs,
        record: &mut ResourceRecord,
    ) -> Result<(), ReconcileError> {
        let Some(create) = ty.create_handler() else {
            return Ok(());
        };
        let mut filled = false;
        for attr in create.triggers {
            if record.attributes.contains_key(*attr) {
                continue;
            }
            if let Some(value) = desired.get(*attr).filter(|v| !v.is_null()) {
                record.attributes.insert(attr.to_string(), value.clone());
                filled = true;
            }
        }
        if filled {
            self.commit(name, record)?;
        }
        Ok(())
    }

    async fn wait_until_settled(
        &self,
        ty: &dyn ResourceType,
        name: &str,
        mut record: ResourceRecord,
    ) -> Result<ResourceRecord, ReconcileError> {
        let mut waiter = Waiter::new(
            name,
            "the resource to become ready",
            self.settings.poll_interval,
            self.settings.provisioning_timeout,
        );
        while record.lifecycle == Lifecycle::Starting && record.resource_id.is_some() {
            waiter.tick().await?;
            self.interrupt.check_interrupted()?;
            record = self.refresh(ty, name, record).await?;
        }
        Ok(record)
    }

    /// Query the provider and record what it reports.
    async fn refresh(
        &self,
        ty: &dyn ResourceType,
        name: &str,
        mut record: ResourceRecord,
    ) -> Result<ResourceRecord, ReconcileError> {
        let prior = record.clone();
        if record.resource_id.is_none() && record.idempotency_token.is_none() {
            // nothing to look for
            if record.lifecycle != Lifecycle::Missing {
                record.reset();
            }
        } else {
            let observed = {
                let ctx = self.context(name, &record);
                match ty.poll(&ctx).await {
                    Err(e) if e.is_not_found() => Ok(Observed::Absent),
                    other => other,
                }
            };
            match observed {
                Ok(Observed::Present {
                    resource_id,
                    status,
                    attributes,
                }) => {
                    record.resource_id = Some(resource_id);
                    match status {
                        ObservedStatus::Ready => record.lifecycle = Lifecycle::Up,
                        ObservedStatus::Transitional(status) => {
                            tracing::debug!(%status, "resource is in a transitional state");
                            if prior.lifecycle != Lifecycle::Up {
                                record.lifecycle = Lifecycle::Starting;
                            }
                        }
                        ObservedStatus::Unrecognized(status) => {
                            tracing::warn!(%status, "provider reported an unrecognized status");
                            record.lifecycle = Lifecycle::Unknown;
                        }
                    }
                    for (attr, value) in attributes {
                        set_attribute(&mut record.attributes, attr, value);
                    }
                }
                Ok(Observed::Absent) => {
                    if prior.lifecycle == Lifecycle::Up {
                        tracing::warn!("resource no longer exists");
                    }
                    let keep_token = matches!(prior.lifecycle, Lifecycle::Missing | Lifecycle::Starting);
                    let token = record.idempotency_token.take().filter(|_| keep_token);
                    record.reset();
                    record.idempotency_token = token;
                }
                Err(e) if e.is_permission_denied() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "could not determine the state of the resource");
                    record.lifecycle = Lifecycle::Unknown;
                }
            }
        }
        if record != prior {
            self.commit(name, &record)?;
        }
        Ok(record)
    }

    /// Refresh the recorded state of `name` from the provider. Returns `None`
    /// if nothing is recorded under that name.
    pub async fn poll(&self, name: &str) -> Result<Option<ResourceRecord>, ReconcileError> {
        let Some(record) = self.store.get(name)? else {
            return Ok(None);
        };
        let ty = self.recorded_type(name, &record)?;
        self.refresh(ty.as_ref(), name, record).await.map(Some)
    }

    async fn delete_resource(
        &self,
        ty: &dyn ResourceType,
        name: &str,
        record: &ResourceRecord,
    ) -> Result<(), ReconcileError> {
        let ctx = self.context(name, record);
        match ty.delete(&ctx).await {
            Err(e) if e.is_not_found() => {
                tracing::warn!(error = %e, "resource was already deleted");
                Ok(())
            }
            other => other,
        }
    }

    /// Delete the cloud resource recorded under `name`.
    ///
    /// With `wipe`, the record is removed; otherwise it is kept as missing.
    /// Returns `false`, leaving everything as it was, if the resource type
    /// asks for confirmation and `confirm` declines.
    pub async fn destroy(
        &self,
        name: &str,
        wipe: bool,
        confirm: &mut dyn ConfirmCallback,
    ) -> Result<bool, ReconcileError> {
        let Some(mut record) = self.store.get(name)? else {
            return Ok(true);
        };
        let ty = self.recorded_type(name, &record)?;

        if record.resource_id.is_none() && record.idempotency_token.is_some() {
            // an interrupted creation may still have produced something
            record = self.refresh(ty.as_ref(), name, record).await?;
        }

        if let Some(id) = record.resource_id.clone() {
            if ty.confirm_destroy(&self.context(name, &record)) {
                let prompt = format!(
                    "Are you sure you want to destroy {} `{}` ({})?",
                    record.type_tag, name, id
                );
                if !confirm.confirm(&prompt).map_err(ReconcileError::Prompt)? {
                    tracing::warn!("destruction declined");
                    return Ok(false);
                }
            }
            tracing::info!(resource_id = %id, "destroying");
            self.delete_resource(ty.as_ref(), name, &record).await?;
        }

        let mut tx = self.store.begin();
        if wipe {
            tx.remove(name);
        } else {
            record.reset();
            tx.put(name, record);
        }
        tx.commit()?;
        Ok(true)
    }
}

fn set_attribute(attrs: &mut Attrs, attr: String, value: Value) {
    if value.is_null() {
        attrs.remove(&attr);
    } else {
        attrs.insert(attr, value);
    }
}

/// Mirror a successful handler into the record: its triggers take the staged
/// value, or the desired one. Anything else staged is taken as is.
fn record_handler(
    record: &mut ResourceRecord,
    name: &str,
    handler: &HandlerSpec,
    desired: &Attrs,
    outcome: HandlerOutcome,
) -> Result<(), ReconcileError> {
    let HandlerOutcome {
        mut staged,
        resource_id,
    } = outcome;
    for attr in handler.triggers {
        let value = staged
            .remove(*attr)
            .or_else(|| desired.get(*attr).cloned())
            .unwrap_or_default();
        set_attribute(&mut record.attributes, attr.to_string(), value);
    }
    for (attr, value) in staged {
        set_attribute(&mut record.attributes, attr, value);
    }
    if handler.is_create() {
        let id = resource_id.ok_or_else(|| {
            ReconcileError::internal(
                name,
                format!("create handler `{}` did not report a resource id", handler.name),
            )
        })?;
        record.resource_id = Some(id);
        record.lifecycle = Lifecycle::Up;
    } else if let Some(id) = resource_id {
        // renamed
        record.resource_id = Some(id);
    }
    Ok(())
}
