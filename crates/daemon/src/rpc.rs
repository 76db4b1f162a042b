//! The daemon's RPC surface.

use async_trait::async_trait;

use crate::error::RpcError;
use crate::messages::{DaemonResponse, KernelInfo, ListRequest, ListResult, LoadRequest, UnloadRequest};

/// Raw daemon calls. Each call is one blocking round trip scoped to the
/// caller's reconciliation pass.
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    /// Load a program and return what the kernel reports about it.
    async fn load(&self, request: LoadRequest) -> Result<KernelInfo, RpcError>;

    /// Unload a program by kernel id.
    async fn unload(&self, request: UnloadRequest) -> Result<(), RpcError>;

    /// List programs matching a filter.
    async fn list(&self, request: ListRequest) -> Result<Vec<ListResult>, RpcError>;
}

/// Turn a response that does not answer `expected` into an error.
pub(crate) fn mismatched(expected: &'static str, response: DaemonResponse) -> RpcError {
    match response {
        DaemonResponse::Error { code, message } => RpcError::Status { code, message },
        other => RpcError::UnexpectedResponse {
            expected,
            received: other.kind(),
        },
    }
}

/// Decode a response to a load call.
pub(crate) fn expect_loaded(response: DaemonResponse) -> Result<KernelInfo, RpcError> {
    match response {
        DaemonResponse::Loaded(info) => Ok(info),
        other => Err(mismatched("load", other)),
    }
}

/// Decode a response to an unload call.
pub(crate) fn expect_unloaded(response: DaemonResponse) -> Result<(), RpcError> {
    match response {
        DaemonResponse::Unloaded => Ok(()),
        other => Err(mismatched("unload", other)),
    }
}

/// Decode a response to a list call.
pub(crate) fn expect_listed(response: DaemonResponse) -> Result<Vec<ListResult>, RpcError> {
    match response {
        DaemonResponse::Listed(results) => Ok(results),
        other => Err(mismatched("list", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    #[test]
    fn test_error_response_becomes_status() {
        let err = expect_loaded(DaemonResponse::error(StatusCode::InvalidArgument, "bad elf"));
        assert_eq!(
            err,
            Err(RpcError::status(StatusCode::InvalidArgument, "bad elf"))
        );
    }

    #[test]
    fn test_wrong_response_kind() {
        let err = expect_unloaded(DaemonResponse::Listed(Vec::new()));
        assert_eq!(
            err,
            Err(RpcError::UnexpectedResponse {
                expected: "unload",
                received: "list",
            })
        );
    }
}
