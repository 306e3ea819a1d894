//! The interface every resource type implements.

use crate::{
    context::{HandlerContext, ResourceContext},
    error::ReconcileError,
};
use nixops4_aws_core::{Attrs, ConfigurationError, Definition, Schema};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Creates the cloud resource. Its triggers are the immutable attributes.
    Create,
    Update,
}

/// A named, independently triggerable part of a resource type's update logic.
///
/// A handler is due when any of its `triggers` differs between the recorded
/// state and the definition. Due handlers run after the due handlers named in
/// `after`; the create handler always runs first when the resource is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSpec {
    pub name: &'static str,
    pub kind: HandlerKind,
    pub triggers: &'static [&'static str],
    pub after: &'static [&'static str],
}

impl HandlerSpec {
    pub const fn create(name: &'static str, triggers: &'static [&'static str]) -> Self {
        HandlerSpec {
            name,
            kind: HandlerKind::Create,
            triggers,
            after: &[],
        }
    }

    pub const fn update(name: &'static str, triggers: &'static [&'static str]) -> Self {
        HandlerSpec {
            name,
            kind: HandlerKind::Update,
            triggers,
            after: &[],
        }
    }

    pub const fn after(self, after: &'static [&'static str]) -> Self {
        HandlerSpec { after, ..self }
    }

    pub fn is_create(&self) -> bool {
        self.kind == HandlerKind::Create
    }

    pub fn owns(&self, attr: &str) -> bool {
        self.triggers.contains(&attr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedStatus {
    Ready,
    /// Exists, but is still being created or modified.
    Transitional(String),
    /// The provider reported a status the resource type does not know.
    Unrecognized(String),
}

/// What a poll found in the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Absent,
    Present {
        resource_id: String,
        status: ObservedStatus,
        /// Current values of attributes the provider reports, in definition
        /// form. Computed attributes go here too.
        attributes: Attrs,
    },
}

impl Observed {
    pub fn ready(resource_id: impl Into<String>, attributes: Attrs) -> Self {
        Observed::Present {
            resource_id: resource_id.into(),
            status: ObservedStatus::Ready,
            attributes,
        }
    }
}

/// A kind of AWS resource: its schema, its handler graph and its calls.
#[async_trait::async_trait]
pub trait ResourceType: Send + Sync {
    fn type_tag(&self) -> &'static str;

    fn schema(&self) -> &Schema;

    fn handlers(&self) -> &[HandlerSpec];

    /// Resources of these types are always converged before resources of this
    /// type, whether or not they are referenced.
    fn create_after_types(&self) -> &[&'static str] {
        &[]
    }

    /// Attributes the creating call applies besides the create handler's
    /// triggers. They are recorded with the starting record before the call,
    /// so that a poll can find the resource by them while its id is unknown,
    /// and adopting it finds them applied.
    fn starting_attributes(&self) -> &[&'static str] {
        &[]
    }

    /// Checks beyond the schema, run when the deployment is loaded.
    fn validate(&self, _defn: &Definition) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Whether destroying the recorded resource needs explicit confirmation.
    fn confirm_destroy(&self, _ctx: &ResourceContext<'_>) -> bool {
        false
    }

    async fn run_handler(
        &self,
        handler: &'static str,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), ReconcileError>;

    /// Read the current state of the resource. Called with a record that has
    /// a resource id or an idempotency token.
    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError>;

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError>;

    fn create_handler(&self) -> Option<&HandlerSpec> {
        self.handlers().iter().find(|h| h.is_create())
    }
}

/// Which resources must be converged before a given one.
pub trait ResourceRef {
    fn create_after(&self, all: &[Definition], defn: &Definition) -> BTreeSet<String>;
}

impl<T: ResourceType + ?Sized> ResourceRef for T {
    fn create_after(&self, all: &[Definition], defn: &Definition) -> BTreeSet<String> {
        let types = self.create_after_types();
        let referenced = defn.referenced_names();
        all.iter()
            .filter(|other| other.name != defn.name)
            .filter(|other| {
                types.contains(&other.type_tag.as_str()) || referenced.contains(other.name.as_str())
            })
            .map(|other| other.name.clone())
            .collect()
    }
}
