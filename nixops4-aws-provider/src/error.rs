use serde::{Deserialize, Serialize};

/// Code used for failures talking to the provider itself, rather than errors
/// reported by the cloud.
pub const TRANSPORT_ERROR_CODE: &str = "ProviderTransportError";

/// An error reported by the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    /// The provider's own opinion on whether repeating the call may help,
    /// e.g. for throttling. Only a [`RetryPolicy`](crate::RetryPolicy) that
    /// retries something acts on it.
    #[serde(default)]
    pub retryable: bool,
}

/// How the engine treats a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The resource does not exist. Non-fatal where absence is acceptable.
    NotFound,
    /// The resource is busy or still referenced. Retryable with backoff.
    Conflict,
    /// Fatal.
    PermissionDenied,
    /// Fatal.
    Unrecognized,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(TRANSPORT_ERROR_CODE, message)
    }

    pub fn class(&self) -> ErrorClass {
        classify(&self.code)
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

const PERMISSION_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AuthFailure",
    "InvalidClientTokenId",
    "OptInRequired",
    "UnauthorizedOperation",
];

const CONFLICT_CODES: &[&str] = &[
    "ConcurrentModification",
    "Conflict",
    "ConflictException",
    "DependencyViolation",
    "IncorrectState",
    "InvalidDBInstanceState",
    "InvalidDBSubnetGroupStateFault",
    "OperationAborted",
    "ResourceInUse",
    "ResourceInUseException",
];

/// Classify an AWS error code.
pub fn classify(code: &str) -> ErrorClass {
    if PERMISSION_CODES.contains(&code) {
        ErrorClass::PermissionDenied
    } else if CONFLICT_CODES.contains(&code) || code.ends_with(".InUse") {
        ErrorClass::Conflict
    } else if code.ends_with("NotFound")
        || code.ends_with("NotFoundFault")
        || code.starts_with("NoSuch")
        || code.ends_with("NotFoundException")
    {
        ErrorClass::NotFound
    } else {
        ErrorClass::Unrecognized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_aws_codes() {
        for code in [
            "InvalidRouteTableID.NotFound",
            "InvalidRoute.NotFound",
            "DBSecurityGroupNotFound",
            "DBSubnetGroupNotFoundFault",
            "DBInstanceNotFound",
            "InvalidLaunchTemplateName.NotFoundException",
            "ResourceNotFoundException",
            "NoSuchEntity",
        ] {
            assert_eq!(classify(code), ErrorClass::NotFound, "{}", code);
        }
        assert_eq!(classify("DependencyViolation"), ErrorClass::Conflict);
        assert_eq!(classify("InvalidGroup.InUse"), ErrorClass::Conflict);
        assert_eq!(
            classify("UnauthorizedOperation"),
            ErrorClass::PermissionDenied
        );
        assert_eq!(classify("InvalidParameterValue"), ErrorClass::Unrecognized);
        assert_eq!(classify(TRANSPORT_ERROR_CODE), ErrorClass::Unrecognized);
    }

    #[test]
    fn deserializes_without_retryable() {
        let e: ProviderError =
            serde_json::from_str(r#"{"code":"Throttling","message":"slow down"}"#).unwrap();
        assert_eq!(e, ProviderError::new("Throttling", "slow down"));
        assert_eq!(e.to_string(), "Throttling: slow down");
    }
}
