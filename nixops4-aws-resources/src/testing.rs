//! A reconciler over every resource type, a [`FakeProvider`] and a
//! [`MemoryStore`].

use crate::default_registry;
use nixops4_aws_core::{Attrs, Definition, Value};
use nixops4_aws_engine::{
    AutoConfirm, ConvergeOptions, ConvergeOutcome, EngineSettings, InterruptState, ReconcileError,
    Reconciler,
};
use nixops4_aws_provider::{FakeProvider, Output, Params, ProviderError};
use nixops4_aws_state::{MemoryStore, ResourceRecord, StateStore};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::new());
        let settings = EngineSettings {
            poll_interval: Duration::from_secs(6),
            provisioning_timeout: Duration::from_secs(600),
            jobs: 1,
        };
        let reconciler = Reconciler::new(
            Arc::new(default_registry().unwrap()),
            store.clone(),
            provider.clone(),
            settings,
            InterruptState::new(),
        );
        Harness {
            store,
            provider,
            reconciler,
        }
    }

    pub async fn converge(&self, defn: &Definition) -> Result<ConvergeOutcome, ReconcileError> {
        self.converge_with(defn, ConvergeOptions::default()).await
    }

    pub async fn converge_with(
        &self,
        defn: &Definition,
        options: ConvergeOptions,
    ) -> Result<ConvergeOutcome, ReconcileError> {
        self.reconciler.converge(defn, &options).await
    }

    pub async fn destroy(&self, name: &str) -> Result<bool, ReconcileError> {
        self.reconciler.destroy(name, false, &mut AutoConfirm).await
    }

    pub fn record(&self, name: &str) -> ResourceRecord {
        self.store.get(name).unwrap().unwrap()
    }

    /// Parameters of the only call to `operation`.
    pub fn params(&self, operation: &str) -> Params {
        let calls: Vec<_> = self
            .provider
            .calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .collect();
        assert_eq!(calls.len(), 1, "calls to {}: {:?}", operation, calls);
        calls[0].params.clone()
    }

    pub fn reply(&self, operation: &str, output: Output) {
        self.provider.push(operation, Ok(output));
    }

    pub fn fail(&self, operation: &str, code: &str) {
        self.provider
            .push(operation, Err(ProviderError::new(code, "scripted failure")));
    }
}

pub fn defn(name: &str, type_tag: &str) -> Definition {
    Definition::new(name, type_tag, Attrs::new()).with("region", "us-east-1")
}

pub fn map<const N: usize>(pairs: [(&str, Value); N]) -> Value {
    Value::Map(attrs(pairs))
}

pub fn attrs<const N: usize>(pairs: [(&str, Value); N]) -> Attrs {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect::<BTreeMap<_, _>>()
}

/// A describe result with a single item under `key`.
pub fn listing<const N: usize>(key: &str, pairs: [(&str, Value); N]) -> Output {
    attrs([(key, Value::List(vec![map(pairs)]))])
}
