//! AWS SDK error mapping

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use kiln_cloud::CloudError;

/// Fold an SDK error into `CloudError::Api`, keeping the EC2 error code
/// and message.
pub(crate) fn api_error<E, R>(context: &str, err: SdkError<E, R>) -> CloudError
where
    SdkError<E, R>: ProvideErrorMetadata,
{
    let code = err.code().unwrap_or("unknown");
    let message = err.message().unwrap_or("no detail");
    CloudError::Api(format!("{context}: {code}: {message}"))
}

/// EC2 reports missing resources with codes like
/// `InvalidInstanceID.NotFound` or `InvalidGroup.NotFound`.
pub(crate) fn is_not_found<E, R>(err: &SdkError<E, R>) -> bool
where
    SdkError<E, R>: ProvideErrorMetadata,
{
    err.code().is_some_and(|code| code.contains("NotFound"))
}
