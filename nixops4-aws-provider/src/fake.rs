use crate::{is_read_only, CloudProvider, Output, Params, ProviderError};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

/// A provider call as observed by [`FakeProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub operation: String,
    pub params: Params,
}

type Responder = Box<dyn Fn(&Params) -> Result<Output, ProviderError> + Send + Sync>;

/// An in-process provider with scripted responses that records every call.
///
/// For each operation, one-shot responses queued with [`FakeProvider::push`]
/// are used first, then the responder installed with [`FakeProvider::on`],
/// and otherwise an empty successful result.
#[derive(Default)]
pub struct FakeProvider {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    queued: BTreeMap<String, VecDeque<Result<Output, ProviderError>>>,
    responders: BTreeMap<String, Responder>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a one-shot response for `operation`.
    pub fn push(&self, operation: &str, response: Result<Output, ProviderError>) {
        self.lock()
            .queued
            .entry(operation.to_owned())
            .or_default()
            .push_back(response);
    }

    /// Answer every otherwise unscripted call to `operation` with `f`.
    pub fn on(
        &self,
        operation: &str,
        f: impl Fn(&Params) -> Result<Output, ProviderError> + Send + Sync + 'static,
    ) {
        self.lock()
            .responders
            .insert(operation.to_owned(), Box::new(f));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(|c| c.operation.clone())
            .collect()
    }

    /// Calls that may have changed something in the cloud.
    pub fn mutating_calls(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| !is_read_only(&c.operation))
            .cloned()
            .collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait::async_trait]
impl CloudProvider for FakeProvider {
    async fn invoke(&self, operation: &str, params: Params) -> Result<Output, ProviderError> {
        let mut inner = self.lock();
        inner.calls.push(Call {
            operation: operation.to_owned(),
            params: params.clone(),
        });
        if let Some(response) = inner
            .queued
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return response;
        }
        match inner.responders.get(operation) {
            Some(f) => f(&params),
            None => Ok(Output::new()),
        }
    }
}
