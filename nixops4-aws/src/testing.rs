//! A [`Deployment`] over every resource type, a [`FakeProvider`] and a
//! [`MemoryStore`].

use nixops4_aws_core::{Definition, Lifecycle, Value};
use nixops4_aws_engine::{Deployment, EngineSettings, InterruptState};
use nixops4_aws_provider::FakeProvider;
use nixops4_aws_resources::default_registry;
use nixops4_aws_state::{MemoryStore, ResourceRecord, StateStoreExt as _};
use std::{sync::Arc, time::Duration};

pub(crate) fn deployment() -> (Deployment, Arc<FakeProvider>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let settings = EngineSettings {
        poll_interval: Duration::from_secs(1),
        provisioning_timeout: Duration::from_secs(60),
        jobs: 2,
    };
    let d = Deployment::new(
        Arc::new(default_registry().unwrap()),
        store.clone(),
        provider.clone(),
        settings,
        InterruptState::new(),
    );
    (d, provider, store)
}

/// A VPC elastic IP in us-east-1.
pub(crate) fn ip(name: &str) -> Definition {
    Definition::new(name, "elastic-ip", Default::default())
        .with("region", "us-east-1")
        .with("vpc", true)
}

/// Record `name` as up in us-east-1, with `attrs` besides the region.
pub(crate) fn record_up<'a>(
    store: &MemoryStore,
    name: &str,
    type_tag: &str,
    id: &str,
    attrs: impl IntoIterator<Item = (&'a str, Value)>,
) {
    let mut record = ResourceRecord::new(type_tag);
    record.lifecycle = Lifecycle::Up;
    record.resource_id = Some(id.to_owned());
    record
        .attributes
        .insert("region".to_owned(), Value::from("us-east-1"));
    for (attr, value) in attrs {
        record.attributes.insert(attr.to_owned(), value);
    }
    let mut tx = store.begin();
    tx.put(name, record);
    tx.commit().unwrap();
}
