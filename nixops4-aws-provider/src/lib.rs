//! The boundary between `nixops4-aws` and the cloud.
//!
//! Everything the engine knows about AWS goes through [`CloudProvider::invoke`]:
//! an operation name such as `ec2:CreateRouteTable` and a parameter map in, a
//! result map or a classified [`ProviderError`] out.

mod error;
#[cfg(any(test, feature = "testing"))]
mod fake;
mod retry;
mod stdio;

pub use error::{classify, ErrorClass, ProviderError, TRANSPORT_ERROR_CODE};
#[cfg(any(test, feature = "testing"))]
pub use fake::{Call, FakeProvider};
pub use retry::{invoke_with_retry, RetryPolicy};
pub use stdio::{StdioProvider, StdioProviderConfig};

use nixops4_aws_core::Attrs;

/// Parameters of a provider operation.
pub type Params = Attrs;
/// Structured result of a provider operation.
pub type Output = Attrs;

#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    /// Perform `operation`. Every call is a suspension point; callers never
    /// hold state locks across it.
    async fn invoke(&self, operation: &str, params: Params) -> Result<Output, ProviderError>;
}

/// Whether `operation` only reads, by the AWS naming convention of its action.
pub fn is_read_only(operation: &str) -> bool {
    let action = operation.rsplit(':').next().unwrap_or(operation);
    ["Describe", "Get", "Head", "List"]
        .iter()
        .any(|prefix| action.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_operations() {
        assert!(is_read_only("ec2:DescribeRouteTables"));
        assert!(is_read_only("rds:ListTagsForResource"));
        assert!(is_read_only("s3:HeadBucket"));
        assert!(!is_read_only("ec2:CreateRouteTable"));
        assert!(!is_read_only("rds:DeleteDBInstance"));
    }
}
