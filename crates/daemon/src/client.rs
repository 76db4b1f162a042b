//! Unix-socket client and server loop for the daemon protocol.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::error::{IoOp, RpcError, TransportError, TransportResult};
use crate::messages::{
    DaemonRequest, DaemonResponse, KernelInfo, ListRequest, ListResult, LoadRequest, UnloadRequest,
};
use crate::rpc::{DaemonRpc, expect_listed, expect_loaded, expect_unloaded};
use crate::transport::FrameTransport;

type Connection = FrameTransport<UnixStream, UnixStream>;

/// Daemon client speaking the framed protocol over a Unix socket.
///
/// Holds at most one connection, opened lazily and dropped after any
/// transport failure so the next call reconnects.
#[derive(Clone)]
pub struct SocketDaemonClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    path: PathBuf,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl SocketDaemonClient {
    /// Create a client for the socket at `path`. No connection is made yet.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                path: path.into(),
                timeout,
                connection: Mutex::new(None),
            }),
        }
    }

    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn dispatch(&self, request: DaemonRequest) -> Result<DaemonResponse, RpcError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.call(&request))
            .await
            .map_err(|e| RpcError::Cancelled(e.to_string()))?
    }
}

impl ClientInner {
    fn connect(&self) -> TransportResult<Connection> {
        let stream = UnixStream::connect(&self.path)
            .map_err(|e| TransportError::connect(self.path.display().to_string(), &e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| TransportError::io(IoOp::Read, &e))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| TransportError::io(IoOp::Write, &e))?;
        let reader = stream
            .try_clone()
            .map_err(|e| TransportError::io(IoOp::Read, &e))?;
        debug!(path = %self.path.display(), "Connected to daemon");
        Ok(FrameTransport::new(reader, stream))
    }

    fn call(&self, request: &DaemonRequest) -> Result<DaemonResponse, RpcError> {
        let mut slot = self
            .connection
            .lock()
            .map_err(|_| RpcError::Cancelled("connection lock poisoned".to_string()))?;

        if slot.is_none() {
            *slot = Some(self.connect()?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(RpcError::Cancelled("no daemon connection".to_string()));
        };

        trace!(call = request.kind(), "Sending daemon request");
        let result = connection
            .send(request)
            .and_then(|()| connection.recv::<DaemonResponse>());

        result.map_err(|err| {
            warn!(call = request.kind(), error = %err, "Daemon call failed, dropping connection");
            *slot = None;
            RpcError::from(err)
        })
    }
}

#[async_trait]
impl DaemonRpc for SocketDaemonClient {
    async fn load(&self, request: LoadRequest) -> Result<KernelInfo, RpcError> {
        expect_loaded(self.dispatch(DaemonRequest::Load(request)).await?)
    }

    async fn unload(&self, request: UnloadRequest) -> Result<(), RpcError> {
        expect_unloaded(self.dispatch(DaemonRequest::Unload(request)).await?)
    }

    async fn list(&self, request: ListRequest) -> Result<Vec<ListResult>, RpcError> {
        expect_listed(self.dispatch(DaemonRequest::List(request)).await?)
    }
}

/// Serve requests on one accepted connection until the peer hangs up.
///
/// Blocking. Used by simulators and tests that stand in for the daemon.
///
/// # Errors
/// Returns any transport failure other than a clean hang-up between frames.
pub fn serve_connection<H>(stream: UnixStream, mut handler: H) -> TransportResult<()>
where
    H: FnMut(DaemonRequest) -> DaemonResponse,
{
    let reader = stream
        .try_clone()
        .map_err(|e| TransportError::io(IoOp::Read, &e))?;
    let mut transport = FrameTransport::new(reader, stream);

    loop {
        let request = match transport.recv::<DaemonRequest>() {
            Ok(request) => request,
            Err(err) if err.is_hangup() => return Ok(()),
            Err(err) => return Err(err),
        };
        let response = handler(request);
        transport.send(&response)?;
    }
}
