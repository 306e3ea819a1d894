use crate::{
    diff,
    resource::{HandlerKind, ResourceType},
};
use nixops4_aws_core::{ConfigurationError, Definition, Mutability};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// The resource types known to a deployment, by type tag.
#[derive(Default, Clone)]
pub struct Registry {
    types: BTreeMap<&'static str, Arc<dyn ResourceType>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource type after checking that its handler graph is consistent
    /// with its schema.
    pub fn register(&mut self, ty: impl ResourceType + 'static) -> Result<(), ConfigurationError> {
        check_resource_type(&ty)?;
        let tag = ty.type_tag();
        if self.types.contains_key(tag) {
            return Err(invalid_type(tag, "registered more than once"));
        }
        self.types.insert(tag, Arc::new(ty));
        Ok(())
    }

    pub fn get(&self, type_tag: &str) -> Option<&Arc<dyn ResourceType>> {
        self.types.get(type_tag)
    }

    /// The type of `defn`, or [`ConfigurationError::UnknownType`].
    pub fn lookup(&self, defn: &Definition) -> Result<&Arc<dyn ResourceType>, ConfigurationError> {
        self.get(&defn.type_tag)
            .ok_or_else(|| ConfigurationError::UnknownType {
                resource: defn.name.clone(),
                type_tag: defn.type_tag.clone(),
            })
    }

    pub fn type_tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.keys().copied()
    }
}

fn invalid_type(type_tag: &str, message: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidResourceType {
        type_tag: type_tag.to_owned(),
        message: message.into(),
    }
}

fn check_resource_type(ty: &dyn ResourceType) -> Result<(), ConfigurationError> {
    let tag = ty.type_tag();
    let schema = ty.schema();
    let handlers = ty.handlers();

    let mut names = BTreeSet::new();
    for h in handlers {
        if !names.insert(h.name) {
            return Err(invalid_type(tag, format!("handler `{}` is declared twice", h.name)));
        }
    }

    let creates: Vec<_> = handlers
        .iter()
        .filter(|h| h.kind == HandlerKind::Create)
        .collect();
    let [create] = creates.as_slice() else {
        return Err(invalid_type(tag, "exactly one create handler is required"));
    };
    let create_triggers: BTreeSet<&str> = create.triggers.iter().copied().collect();
    if create_triggers != schema.immutable() {
        return Err(invalid_type(
            tag,
            format!(
                "the triggers of create handler `{}` must be exactly the immutable attributes",
                create.name
            ),
        ));
    }

    for h in handlers {
        for trigger in h.triggers {
            match schema.get(trigger) {
                None => {
                    return Err(invalid_type(
                        tag,
                        format!("handler `{}` triggers on unknown attribute `{}`", h.name, trigger),
                    ))
                }
                Some(spec) if spec.mutability == Mutability::Computed => {
                    return Err(invalid_type(
                        tag,
                        format!("handler `{}` triggers on computed attribute `{}`", h.name, trigger),
                    ))
                }
                Some(_) => {}
            }
        }
        for dep in h.after {
            if !names.contains(dep) {
                return Err(invalid_type(
                    tag,
                    format!("handler `{}` runs after unknown handler `{}`", h.name, dep),
                ));
            }
        }
    }

    for spec in schema.declared() {
        if !handlers.iter().any(|h| h.owns(spec.name)) {
            return Err(invalid_type(
                tag,
                format!("attribute `{}` is not handled by any handler", spec.name),
            ));
        }
    }

    let all: BTreeSet<&str> = schema.declared().map(|s| s.name).collect();
    if diff::plan(handlers, &all, true).is_none() {
        return Err(invalid_type(tag, "the handlers' `after` lists form a cycle"));
    }
    Ok(())
}
