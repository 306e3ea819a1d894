//! The reconciliation engine of `nixops4-aws`.
//!
//! A [`ResourceType`] describes one kind of AWS resource as a set of
//! [`HandlerSpec`]s over its [`Schema`](nixops4_aws_core::Schema). The
//! [`Reconciler`] compares a resource's recorded state with its definition
//! and runs only the handlers whose attributes changed, committing state after
//! each one. A [`Deployment`] orders resources by their dependencies and
//! converges them concurrently.

pub mod confirm;
pub mod context;
pub mod control;
pub mod deployment;
pub mod diff;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod reconciler;
pub mod registry;
pub mod resolve;
pub mod resource;
pub mod settings;

#[cfg(test)]
mod testing;

pub use confirm::{AutoConfirm, AutoDecline, ConfirmCallback};
pub use context::{HandlerContext, ResourceContext, Waiter};
pub use deployment::{
    DeployOptions, DeployReport, Deployment, DestroyReport, ResourceFilter, ResourceResult,
    SkipReason,
};
pub use error::ReconcileError;
pub use graph::DependencyGraph;
pub use interrupt::{InterruptState, InterruptedError};
pub use reconciler::{ConvergeOutcome, Reconciler};
pub use registry::Registry;
pub use resource::{HandlerKind, HandlerSpec, Observed, ObservedStatus, ResourceType};
pub use settings::{ConvergeOptions, EngineSettings};
