use crate::{definition::Definition, error::ConfigurationError, value::Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    String,
    Int,
    Bool,
    List,
    Map,
    Any,
}

impl AttrKind {
    fn describe(self) -> &'static str {
        match self {
            AttrKind::String => "a string",
            AttrKind::Int => "an integer",
            AttrKind::Bool => "a boolean",
            AttrKind::List => "a list",
            AttrKind::Map => "a map",
            AttrKind::Any => "any value",
        }
    }

    /// References are accepted where a string is: they resolve to identifiers.
    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (AttrKind::Any, _) => true,
            (AttrKind::String, Value::String(_) | Value::Reference(_)) => true,
            (AttrKind::Int, Value::Int(_)) => true,
            (AttrKind::Bool, Value::Bool(_)) => true,
            (AttrKind::List, Value::List(_)) => true,
            (AttrKind::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

/// How a change to an attribute can be applied to an existing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Updated in place.
    Mutable,
    /// Changing it means destroying and recreating the resource.
    Immutable,
    /// Updated in place, but the update disrupts the running resource.
    RequiresReboot,
    /// Reported by the provider; never set in a definition.
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSpec {
    pub name: &'static str,
    pub kind: AttrKind,
    pub required: bool,
    pub mutability: Mutability,
}

impl AttrSpec {
    pub const fn new(name: &'static str, kind: AttrKind) -> Self {
        AttrSpec {
            name,
            kind,
            required: false,
            mutability: Mutability::Mutable,
        }
    }

    pub const fn required(self) -> Self {
        AttrSpec {
            required: true,
            ..self
        }
    }

    pub const fn immutable(self) -> Self {
        AttrSpec {
            mutability: Mutability::Immutable,
            ..self
        }
    }

    pub const fn requires_reboot(self) -> Self {
        AttrSpec {
            mutability: Mutability::RequiresReboot,
            ..self
        }
    }

    pub const fn computed(self) -> Self {
        AttrSpec {
            mutability: Mutability::Computed,
            ..self
        }
    }
}

/// The attribute table of a resource type.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    attrs: &'static [AttrSpec],
}

impl Schema {
    pub const fn new(attrs: &'static [AttrSpec]) -> Self {
        Schema { attrs }
    }

    pub fn attrs(&self) -> &'static [AttrSpec] {
        self.attrs
    }

    pub fn get(&self, name: &str) -> Option<&'static AttrSpec> {
        self.attrs.iter().find(|a| a.name == name)
    }

    fn names_with(&self, mutability: Mutability) -> BTreeSet<&'static str> {
        self.attrs
            .iter()
            .filter(|a| a.mutability == mutability)
            .map(|a| a.name)
            .collect()
    }

    pub fn immutable(&self) -> BTreeSet<&'static str> {
        self.names_with(Mutability::Immutable)
    }

    pub fn requires_reboot(&self) -> BTreeSet<&'static str> {
        self.names_with(Mutability::RequiresReboot)
    }

    pub fn computed(&self) -> BTreeSet<&'static str> {
        self.names_with(Mutability::Computed)
    }

    /// Attributes that are set by definitions and compared when diffing.
    pub fn declared(&self) -> impl Iterator<Item = &'static AttrSpec> {
        self.attrs
            .iter()
            .filter(|a| a.mutability != Mutability::Computed)
    }

    /// Check the definition's attributes against this schema.
    pub fn validate(&self, defn: &Definition) -> Result<(), ConfigurationError> {
        for (attr, value) in &defn.attributes {
            let spec = match self.get(attr) {
                Some(spec) if spec.mutability != Mutability::Computed => spec,
                _ => {
                    return Err(ConfigurationError::UnknownAttribute {
                        resource: defn.name.clone(),
                        type_tag: defn.type_tag.clone(),
                        attr: attr.clone(),
                    })
                }
            };
            if !spec.kind.accepts(value) {
                return Err(ConfigurationError::AttributeType {
                    resource: defn.name.clone(),
                    attr: attr.clone(),
                    expected: spec.kind.describe().to_owned(),
                    found: value.kind_name().to_owned(),
                });
            }
        }
        for spec in self.attrs.iter().filter(|a| a.required) {
            if defn.get(spec.name).is_null() {
                return Err(ConfigurationError::MissingAttribute {
                    resource: defn.name.clone(),
                    attr: spec.name.to_owned(),
                });
            }
        }
        Ok(())
    }
}
