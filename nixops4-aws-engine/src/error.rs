use crate::interrupt::InterruptedError;
use nixops4_aws_core::ConfigurationError;
use nixops4_aws_provider::{ErrorClass, ProviderError};
use nixops4_aws_state::StateError;
use std::time::Duration;

/// Everything that can stop a resource from converging.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("resource `{resource}`: referenced resource `{reference}` has not been created yet")]
    ReferenceNotReady { resource: String, reference: String },

    #[error(
        "resource `{resource}`: immutable attributes changed: {}; the resource must be recreated (allow with --allow-recreate)",
        attrs.join(", ")
    )]
    ImmutableAttributeChanged {
        resource: String,
        attrs: Vec<String>,
    },

    #[error(
        "resource `{resource}`: changing {} requires a reboot (allow with --allow-reboot)",
        attrs.join(", ")
    )]
    DisruptiveChange {
        resource: String,
        attrs: Vec<String>,
    },

    #[error("resource `{resource}`: {operation} failed: {error}")]
    Provider {
        resource: String,
        operation: String,
        error: ProviderError,
    },

    #[error(
        "resource `{resource}`: timed out after {}s waiting for {waiting_for}",
        elapsed.as_secs()
    )]
    ProvisioningTimeout {
        resource: String,
        waiting_for: String,
        elapsed: Duration,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("resource `{resource}`: the state of the cloud resource could not be determined; run `check` once the provider responds again")]
    UnknownState { resource: String },

    #[error(transparent)]
    Interrupted(#[from] InterruptedError),

    #[error("could not ask for confirmation: {0}")]
    Prompt(#[source] std::io::Error),

    #[error("resource `{resource}`: {message}")]
    Internal { resource: String, message: String },
}

impl ReconcileError {
    pub fn internal(resource: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Internal {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// The provider error behind this one, if any.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            ReconcileError::Provider { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.provider_error().is_some_and(ProviderError::is_not_found)
    }

    pub fn is_permission_denied(&self) -> bool {
        self.provider_error()
            .is_some_and(|e| e.class() == ErrorClass::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_their_classification() {
        let e = ReconcileError::Provider {
            resource: "db".to_owned(),
            operation: "rds:DeleteDBSecurityGroup".to_owned(),
            error: ProviderError::new("DBSecurityGroupNotFound", "gone"),
        };
        assert!(e.is_not_found());
        assert!(!e.is_permission_denied());
        assert_eq!(
            e.to_string(),
            "resource `db`: rds:DeleteDBSecurityGroup failed: DBSecurityGroupNotFound: gone"
        );

        let e = ReconcileError::Provider {
            resource: "db".to_owned(),
            operation: "rds:DescribeDBInstances".to_owned(),
            error: ProviderError::new("AccessDenied", "no"),
        };
        assert!(e.is_permission_denied());
    }

    #[test]
    fn lists_changed_attributes() {
        let e = ReconcileError::ImmutableAttributeChanged {
            resource: "rt".to_owned(),
            attrs: vec!["region".to_owned(), "vpcId".to_owned()],
        };
        assert_eq!(
            e.to_string(),
            "resource `rt`: immutable attributes changed: region, vpcId; the resource must be recreated (allow with --allow-recreate)"
        );
    }
}
