/// Errors in the deployment itself, detected before any provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("dependency cycle between resources: {}", cycle_display(.cycle))]
    Cycle { cycle: Vec<String> },

    #[error("resource `{resource}`: missing required attribute `{attr}`")]
    MissingAttribute { resource: String, attr: String },

    #[error("resource `{resource}`: unknown attribute `{attr}` for type `{type_tag}`")]
    UnknownAttribute {
        resource: String,
        type_tag: String,
        attr: String,
    },

    #[error("resource `{resource}`: attribute `{attr}` must be {expected}, found {found}")]
    AttributeType {
        resource: String,
        attr: String,
        expected: String,
        found: String,
    },

    #[error("resource `{resource}`: attribute `{attr}` refers to `{reference}`, which is not a resource of that type in this deployment")]
    InvalidReference {
        resource: String,
        attr: String,
        reference: String,
    },

    #[error("resource `{resource}`: unknown resource type `{type_tag}`")]
    UnknownType { resource: String, type_tag: String },

    #[error("resource `{0}` is defined more than once")]
    DuplicateResource(String),

    #[error("resource `{resource}`: {message}")]
    Invalid { resource: String, message: String },

    #[error("resource type `{type_tag}` is inconsistent: {message}")]
    InvalidResourceType { type_tag: String, message: String },
}

impl ConfigurationError {
    pub fn invalid(resource: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// `a -> b -> a`: the first element is repeated to close the cycle.
fn cycle_display(cycle: &[String]) -> String {
    let mut s = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        s.push_str(" -> ");
        s.push_str(first);
    }
    s
}
