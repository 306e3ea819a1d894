//! Converging, checking and destroying a whole deployment.
//!
//! Resources are converged concurrently, each once all of its dependencies
//! have converged. A resource whose dependency failed is skipped; unrelated
//! resources carry on.

use crate::{
    confirm::ConfirmCallback,
    control::{
        task_tracker::{Cycle, TaskContext, TaskTracker, TaskWork},
        thunk::Thunk,
    },
    error::ReconcileError,
    graph::DependencyGraph,
    interrupt::InterruptState,
    reconciler::{ConvergeOutcome, Reconciler},
    registry::Registry,
    settings::{ConvergeOptions, EngineSettings},
};
use nixops4_aws_core::{ConfigurationError, Definition};
use nixops4_aws_provider::CloudProvider;
use nixops4_aws_state::{ResourceRecord, StateStore};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tracing::Instrument as _;

/// Which resources an operation applies to, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    /// If not empty, only these resources.
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

impl ResourceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, name: &str) -> bool {
        (self.include.is_empty() || self.include.contains(name)) && !self.exclude.contains(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub converge: ConvergeOptions,
    pub filter: ResourceFilter,
    /// Destroy recorded resources that are no longer defined, once every
    /// defined resource has converged.
    pub kill_obsolete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DependencyFailed(String),
    Interrupted,
}

#[derive(Debug, Clone)]
pub enum ResourceResult {
    Converged(ConvergeOutcome),
    Failed(Arc<ReconcileError>),
    Skipped(SkipReason),
}

impl ResourceResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, ResourceResult::Converged(_))
    }
}

#[derive(Debug, Default)]
pub struct DeployReport {
    pub results: BTreeMap<String, ResourceResult>,
    /// Obsolete resources that were destroyed.
    pub destroyed: Vec<String>,
    /// Obsolete resources whose destruction was declined.
    pub declined: Vec<String>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.results.values().all(ResourceResult::is_converged)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ReconcileError)> {
        self.results.iter().filter_map(|(name, result)| match result {
            ResourceResult::Failed(e) => Some((name.as_str(), e.as_ref())),
            _ => None,
        })
    }
}

#[derive(Debug, Default)]
pub struct DestroyReport {
    pub destroyed: Vec<String>,
    pub declined: Vec<String>,
}

/// Per-resource mutual exclusion, so that no two operations act on the same
/// resource at once.
#[derive(Clone, Default)]
pub struct ResourceLocks {
    locks: Arc<std::sync::Mutex<BTreeMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ResourceLocks {
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(name.to_owned()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// A deployment: the resource types, the state and the provider it is
/// reconciled against.
pub struct Deployment {
    reconciler: Arc<Reconciler>,
    locks: ResourceLocks,
    interrupt: InterruptState,
}

impl Deployment {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn CloudProvider>,
        settings: EngineSettings,
        interrupt: InterruptState,
    ) -> Self {
        Deployment {
            reconciler: Arc::new(Reconciler::new(
                registry,
                store,
                provider,
                settings,
                interrupt.clone(),
            )),
            locks: ResourceLocks::default(),
            interrupt,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Check the definitions against each other and against their types, and
    /// order them. Makes no provider calls.
    pub fn validate(&self, definitions: &[Definition]) -> Result<DependencyGraph, ConfigurationError> {
        let registry = self.reconciler.registry();
        let mut by_name: BTreeMap<&str, &Definition> = BTreeMap::new();
        for defn in definitions {
            if by_name.insert(defn.name.as_str(), defn).is_some() {
                return Err(ConfigurationError::DuplicateResource(defn.name.clone()));
            }
        }
        for defn in definitions {
            let ty = registry.lookup(defn)?;
            ty.schema().validate(defn)?;
            ty.validate(defn)?;
            for (attr, reference) in defn.references() {
                match by_name.get(reference.name.as_str()) {
                    Some(target) if target.type_tag == reference.type_tag => {}
                    _ => {
                        return Err(ConfigurationError::InvalidReference {
                            resource: defn.name.clone(),
                            attr: attr.to_owned(),
                            reference: reference.to_string(),
                        })
                    }
                }
            }
        }
        DependencyGraph::from_definitions(registry, definitions)
    }

    /// Converge every selected resource, dependencies first.
    ///
    /// Configuration errors fail the whole run before any provider call.
    /// Errors of individual resources are reported in the [`DeployReport`].
    pub async fn deploy(
        &self,
        definitions: &[Definition],
        options: &DeployOptions,
        confirm: &mut dyn ConfirmCallback,
    ) -> Result<DeployReport, ReconcileError> {
        let graph = self.validate(definitions)?;
        let selected: Vec<String> = graph
            .order()
            .iter()
            .filter(|name| options.filter.matches(name))
            .cloned()
            .collect();
        tracing::info!(resources = selected.len(), "deploying");

        let work = Arc::new(DeployWork {
            reconciler: self.reconciler.clone(),
            definitions: definitions
                .iter()
                .map(|d| (d.name.clone(), d.clone()))
                .collect(),
            selected: selected.iter().cloned().collect(),
            graph,
            options: options.converge,
            jobs: Semaphore::new(self.reconciler.settings().jobs.max(1)),
            locks: self.locks.clone(),
            interrupt: self.interrupt.clone(),
        });
        let tracker = TaskTracker::new(work);
        let mut tasks = BTreeMap::new();
        for name in selected {
            let task = tracker.spawn(name.clone()).await;
            tasks.insert(name, task);
        }
        let mut report = DeployReport {
            results: Thunk::force_into_map(tasks).await,
            ..DeployReport::default()
        };

        if options.kill_obsolete {
            if report.is_success() {
                self.kill_obsolete(definitions, &mut report, confirm).await?;
            } else {
                tracing::warn!("not destroying obsolete resources because the deployment failed");
            }
        }
        Ok(report)
    }

    async fn kill_obsolete(
        &self,
        definitions: &[Definition],
        report: &mut DeployReport,
        confirm: &mut dyn ConfirmCallback,
    ) -> Result<(), ReconcileError> {
        let defined: BTreeSet<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        let records = self.reconciler.store().snapshot()?;
        let graph = DependencyGraph::from_records(self.reconciler.registry(), &records, definitions)?;
        for name in graph.reverse_order() {
            if defined.contains(name.as_str()) {
                continue;
            }
            self.interrupt.check_interrupted()?;
            let span = tracing::info_span!("resource", name = %name);
            if self.destroy_one(name, true, confirm).instrument(span).await? {
                report.destroyed.push(name.clone());
            } else {
                report.declined.push(name.clone());
            }
        }
        Ok(())
    }

    async fn destroy_one(
        &self,
        name: &str,
        wipe: bool,
        confirm: &mut dyn ConfirmCallback,
    ) -> Result<bool, ReconcileError> {
        let _lock = self.locks.lock(name).await;
        tracing::info!("destroying obsolete or selected resource");
        self.reconciler.destroy(name, wipe, confirm).await
    }

    /// Poll every selected recorded resource and record what is found.
    pub async fn check(
        &self,
        filter: &ResourceFilter,
    ) -> Result<BTreeMap<String, Result<ResourceRecord, ReconcileError>>, ReconcileError> {
        let records = self.reconciler.store().snapshot()?;
        let mut results = BTreeMap::new();
        for name in records.keys().filter(|name| filter.matches(name)) {
            self.interrupt.check_interrupted()?;
            let _lock = self.locks.lock(name).await;
            let span = tracing::info_span!("resource", name = %name);
            let result = self
                .reconciler
                .poll(name)
                .instrument(span)
                .await
                .and_then(|record| {
                    record.ok_or_else(|| ReconcileError::internal(name.as_str(), "record disappeared"))
                });
            results.insert(name.clone(), result);
        }
        Ok(results)
    }

    /// Destroy every selected recorded resource, dependents first.
    ///
    /// `definitions` only contributes dependency edges between resources
    /// that are still defined. Stops at the first failure.
    pub async fn destroy(
        &self,
        definitions: &[Definition],
        filter: &ResourceFilter,
        wipe: bool,
        confirm: &mut dyn ConfirmCallback,
    ) -> Result<DestroyReport, ReconcileError> {
        let records = self.reconciler.store().snapshot()?;
        let graph = DependencyGraph::from_records(self.reconciler.registry(), &records, definitions)?;
        let mut report = DestroyReport::default();
        for name in graph.reverse_order() {
            if !filter.matches(name) {
                continue;
            }
            self.interrupt.check_interrupted()?;
            let span = tracing::info_span!("resource", name = %name);
            if self.destroy_one(name, wipe, confirm).instrument(span).await? {
                report.destroyed.push(name.clone());
            } else {
                report.declined.push(name.clone());
            }
        }
        Ok(report)
    }
}

struct DeployWork {
    reconciler: Arc<Reconciler>,
    definitions: BTreeMap<String, Definition>,
    graph: DependencyGraph,
    selected: BTreeSet<String>,
    options: ConvergeOptions,
    jobs: Semaphore,
    locks: ResourceLocks,
    interrupt: InterruptState,
}

impl DeployWork {
    async fn converge(&self, defn: &Definition) -> ResourceResult {
        let _permit = match self.jobs.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return ResourceResult::Failed(Arc::new(ReconcileError::internal(
                    defn.name.as_str(),
                    e.to_string(),
                )))
            }
        };
        let _lock = self.locks.lock(&defn.name).await;
        match self.reconciler.converge(defn, &self.options).await {
            Ok(outcome) => {
                tracing::debug!(?outcome, "converged");
                ResourceResult::Converged(outcome)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed");
                ResourceResult::Failed(Arc::new(e))
            }
        }
    }
}

#[async_trait::async_trait]
impl TaskWork for DeployWork {
    type Output = ResourceResult;
    type Key = String;
    type CycleError = ConfigurationError;

    async fn work(&self, context: TaskContext<Self>, name: String) -> ResourceResult {
        if self.interrupt.is_interrupted() {
            return ResourceResult::Skipped(SkipReason::Interrupted);
        }
        let dependencies: Vec<String> = self
            .graph
            .dependencies(&name)
            .filter(|dep| self.selected.contains(*dep))
            .cloned()
            .collect();
        for dep in dependencies {
            match context.require(dep.clone()).await {
                Ok(ResourceResult::Converged(_)) => {}
                Ok(_) => {
                    tracing::warn!(resource = %name, dependency = %dep, "skipping: dependency did not converge");
                    return ResourceResult::Skipped(SkipReason::DependencyFailed(dep));
                }
                Err(e) => return ResourceResult::Failed(Arc::new(e.into())),
            }
        }
        if self.interrupt.is_interrupted() {
            return ResourceResult::Skipped(SkipReason::Interrupted);
        }
        let Some(defn) = self.definitions.get(&name) else {
            return ResourceResult::Failed(Arc::new(ReconcileError::internal(
                name.as_str(),
                "not defined",
            )));
        };
        let span = tracing::info_span!("resource", name = %name, type_tag = %defn.type_tag);
        self.converge(defn).instrument(span).await
    }

    fn cycle_error(&self, cycle: Cycle<String>) -> ConfigurationError {
        ConfigurationError::Cycle {
            cycle: cycle.into_path(),
        }
    }
}
