use crate::{
    reference::Reference,
    value::{Value, NULL},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type Attrs = BTreeMap<String, Value>;

/// The desired state of one resource, as produced by the deployment loader.
///
/// A definition is created fresh for every reconciliation pass and never
/// mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub attributes: Attrs,
}

impl Definition {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>, attributes: Attrs) -> Self {
        Definition {
            name: name.into(),
            type_tag: type_tag.into(),
            attributes,
        }
    }

    /// Builder-style attribute setter, mostly for tests and loaders.
    pub fn with(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attr.into(), value.into());
        self
    }

    /// The value of `attr`, or [`Value::Null`] when it is not set.
    pub fn get(&self, attr: &str) -> &Value {
        self.attributes.get(attr).unwrap_or(&NULL)
    }

    /// All references in this definition, paired with the attribute they occur in.
    pub fn references(&self) -> impl Iterator<Item = (&str, &Reference)> {
        self.attributes
            .iter()
            .flat_map(|(attr, v)| v.references().into_iter().map(move |r| (attr.as_str(), r)))
    }

    /// Names of the resources this definition refers to.
    pub fn referenced_names(&self) -> BTreeSet<&str> {
        self.references().map(|(_, r)| r.name.as_str()).collect()
    }
}
