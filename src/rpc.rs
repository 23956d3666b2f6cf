//! # RPC Layer
//!
//! TCP transport for the overlay protocol. [`RpcNode`] implements
//! [`OverlayRpc`] on the client side; [`serve`] accepts connections and
//! hands each request to the local [`Overlay`].
//!
//! ## Framing
//!
//! Every request and every response is one frame:
//!
//! ```text
//! ┌──────────────┬─────────────────────────┐
//! │ len: u32 BE  │ bincode body (len bytes)│
//! └──────────────┴─────────────────────────┘
//! ```
//!
//! A connection carries any number of sequential request/response pairs.
//! The client opens a fresh connection per call and closes it afterwards;
//! the remote-call gateway bounds how long a call may take and how often it
//! is retried.
//!
//! ## Security
//!
//! - Request and response sizes are bounded before allocation
//! - Each request read has its own timeout, so idle connections are closed
//! - The number of concurrently served connections is capped
//! - A failed `accept` is retried after a short backoff instead of stopping the server
//! - Peers are not authenticated: identities inside messages are taken at face value

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::identity::PeerIdentity;
use crate::messages::{
    self, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE, MAX_VISITED, MessageId, Query, RpcRequest, RpcResponse,
    SearchStatus,
};
use crate::overlay::Overlay;
use crate::protocols::OverlayRpc;

// ============================================================================
// Security Limits
// ============================================================================

/// Maximum peers accepted in one `plist` / `nlist` response.
const MAX_PEERS_PER_RESPONSE: usize = 4096;

/// Upper bound on one client exchange, independent of the gateway timeout.
const RPC_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed to read one request frame from a connection.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the overlay to answer one request.
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Connections served at the same time; further connections are closed immediately.
const MAX_CONCURRENT_CONNECTIONS: usize = 256;

// ============================================================================
// Framing
// ============================================================================

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).context("frame length exceeds u32")?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame_len<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<usize> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    Ok(u32::from_be_bytes(len_buf) as usize)
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &RpcResponse) -> Result<()> {
    let mut bytes = messages::serialize(response).context("failed to serialize response")?;
    if bytes.len() > MAX_RESPONSE_SIZE {
        warn!(size = bytes.len(), max = MAX_RESPONSE_SIZE, "response too large, sending error instead");
        let error = RpcResponse::Error {
            message: format!("response too large: {} bytes (max {})", bytes.len(), MAX_RESPONSE_SIZE),
        };
        bytes = messages::serialize(&error)?;
    }
    write_frame(writer, &bytes).await
}

// ============================================================================
// Client
// ============================================================================

/// Client side of the TCP transport.
#[derive(Clone, Debug, Default)]
pub struct RpcNode;

impl RpcNode {
    pub fn new() -> Self {
        Self
    }

    async fn rpc(&self, to: &str, request: RpcRequest) -> Result<RpcResponse> {
        let method = request.method();
        let response = tokio::time::timeout(RPC_EXCHANGE_TIMEOUT, self.exchange(to, &request))
            .await
            .context("RPC timed out")??;

        match response {
            RpcResponse::Error { message } => anyhow::bail!("{} on {} failed: {}", method, to, message),
            other => Ok(other),
        }
    }

    async fn exchange(&self, to: &str, request: &RpcRequest) -> Result<RpcResponse> {
        let mut stream = TcpStream::connect(to)
            .await
            .with_context(|| format!("failed to connect to {}", to))?;
        stream.set_nodelay(true).ok();

        let request_bytes = messages::serialize_request(request).context("failed to serialize request")?;
        if request_bytes.len() > MAX_REQUEST_SIZE {
            anyhow::bail!("request too large: {} bytes (max {})", request_bytes.len(), MAX_REQUEST_SIZE);
        }
        write_frame(&mut stream, &request_bytes).await?;

        let len = read_frame_len(&mut stream).await.context("failed to read response header")?;
        if len > MAX_RESPONSE_SIZE {
            warn!(peer = %to, size = len, max = MAX_RESPONSE_SIZE, "peer sent oversized response");
            anyhow::bail!("response too large: {} bytes (max {})", len, MAX_RESPONSE_SIZE);
        }

        let mut response_bytes = vec![0u8; len];
        stream.read_exact(&mut response_bytes).await.context("failed to read response body")?;

        trace!(peer = %to, method = request.method(), bytes = len, "rpc exchange complete");
        messages::deserialize_bounded(&response_bytes).context("failed to deserialize response")
    }

    async fn ack(&self, to: &str, request: RpcRequest) -> Result<bool> {
        let method = request.method();
        match self.rpc(to, request).await? {
            RpcResponse::Ack(ok) => Ok(ok),
            other => anyhow::bail!("unexpected response to {}: {:?}", method, other),
        }
    }

    async fn peers(&self, to: &str, request: RpcRequest) -> Result<Vec<PeerIdentity>> {
        let method = request.method();
        match self.rpc(to, request).await? {
            RpcResponse::Peers(peers) => {
                if peers.len() > MAX_PEERS_PER_RESPONSE {
                    warn!(
                        peer = %to,
                        count = peers.len(),
                        max = MAX_PEERS_PER_RESPONSE,
                        "peer returned too many peers, truncating"
                    );
                    Ok(peers.into_iter().take(MAX_PEERS_PER_RESPONSE).collect())
                } else {
                    Ok(peers)
                }
            }
            other => anyhow::bail!("unexpected response to {}: {:?}", method, other),
        }
    }
}

#[async_trait]
impl OverlayRpc for RpcNode {
    async fn hello(&self, to: &str, addr: &str) -> Result<bool> {
        self.ack(to, RpcRequest::Hello { addr: addr.to_string() }).await
    }

    async fn ping(&self, to: &str, who: &PeerIdentity) -> Result<bool> {
        self.ack(to, RpcRequest::Ping { who: who.clone() }).await
    }

    async fn pong(&self, to: &str, who: &PeerIdentity) -> Result<bool> {
        self.ack(to, RpcRequest::Pong { who: who.clone() }).await
    }

    async fn who(&self, to: &str) -> Result<PeerIdentity> {
        match self.rpc(to, RpcRequest::Who).await? {
            RpcResponse::Identity(peer) => Ok(peer),
            other => anyhow::bail!("unexpected response to who: {:?}", other),
        }
    }

    async fn plist(&self, to: &str) -> Result<Vec<PeerIdentity>> {
        self.peers(to, RpcRequest::PeerList).await
    }

    async fn nlist(&self, to: &str) -> Result<Vec<PeerIdentity>> {
        self.peers(to, RpcRequest::NeighbourList).await
    }

    async fn neighbour_request(&self, to: &str, candidate: &PeerIdentity) -> Result<(bool, PeerIdentity)> {
        let request = RpcRequest::NeighbourRequest {
            candidate: candidate.clone(),
        };
        match self.rpc(to, request).await? {
            RpcResponse::Neighbour { accepted, peer } => Ok((accepted, peer)),
            other => anyhow::bail!("unexpected response to neighbourRequest: {:?}", other),
        }
    }

    async fn find(&self, to: &str, query: &Query) -> Result<bool> {
        self.ack(to, RpcRequest::Find(query.clone())).await
    }

    async fn start_walk(&self, to: &str, query: &Query, walkers: u32) -> Result<bool> {
        let request = RpcRequest::StartWalk {
            query: query.clone(),
            walkers,
        };
        self.ack(to, request).await
    }

    async fn walker_find(&self, to: &str, query: &Query, visited: &[String]) -> Result<bool> {
        let request = RpcRequest::WalkerFind {
            query: query.clone(),
            visited: visited.to_vec(),
        };
        self.ack(to, request).await
    }

    async fn found(&self, to: &str, msg_id: MessageId, holder: &str) -> Result<bool> {
        let request = RpcRequest::Found {
            msg_id,
            holder: holder.to_string(),
        };
        self.ack(to, request).await
    }

    async fn has_found_file(&self, to: &str, msg_id: MessageId) -> Result<SearchStatus> {
        match self.rpc(to, RpcRequest::HasFoundFile { msg_id }).await? {
            RpcResponse::SearchStatus(status) => Ok(status),
            other => anyhow::bail!("unexpected response to hasFoundFile: {:?}", other),
        }
    }

    async fn search_messages(&self, to: &str, msg_id: MessageId) -> Result<u64> {
        match self.rpc(to, RpcRequest::SearchMessages { msg_id }).await? {
            RpcResponse::Count(count) => Ok(count),
            other => anyhow::bail!("unexpected response to getNumSearchMessages: {:?}", other),
        }
    }

    async fn get(&self, to: &str, file_name: &str) -> Result<String> {
        let request = RpcRequest::Get {
            file_name: file_name.to_string(),
        };
        match self.rpc(to, request).await? {
            RpcResponse::File(content) => Ok(content),
            other => anyhow::bail!("unexpected response to get: {:?}", other),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Pause after a failed `accept` before trying again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Source of inbound connections for [`serve`].
pub trait Accept {
    fn accept(&self) -> impl Future<Output = std::io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = std::io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Accept connections on `listener` for as long as the task runs.
///
/// A failed `accept` (fd exhaustion, an aborted handshake) is logged and
/// retried after [`ACCEPT_ERROR_BACKOFF`]. Connection tasks live in a
/// [`JoinSet`], so aborting the task that runs `serve` also closes every
/// connection it is serving.
pub async fn serve<A: Accept>(listener: A, overlay: Overlay) {
    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));
    let mut connections = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };

        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept connection, backing off");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!(remote = %remote, max = MAX_CONCURRENT_CONNECTIONS, "too many connections, closing");
            continue;
        };

        let overlay = overlay.clone();
        connections.spawn(async move {
            if let Err(e) = handle_connection(stream, remote, overlay).await {
                debug!(remote = %remote, error = ?e, "connection error");
            }
            drop(permit);
        });
    }
}

/// Serve sequential requests on one connection until the peer closes it.
pub async fn handle_connection(mut stream: TcpStream, remote: SocketAddr, overlay: Overlay) -> Result<()> {
    trace!(remote = %remote, "connection accepted");

    loop {
        let len = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame_len(&mut stream)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                trace!(remote = %remote, "connection closed by peer");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                trace!(remote = %remote, "idle connection timed out");
                return Ok(());
            }
        };

        if len > MAX_REQUEST_SIZE {
            warn!(remote = %remote, size = len, max = MAX_REQUEST_SIZE, "rejecting oversized request");
            let error = RpcResponse::Error {
                message: format!("request too large: {} bytes (max {})", len, MAX_REQUEST_SIZE),
            };
            write_response(&mut stream, &error).await?;
            return Ok(());
        }

        let mut request_bytes = vec![0u8; len];
        tokio::time::timeout(REQUEST_READ_TIMEOUT, stream.read_exact(&mut request_bytes))
            .await
            .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

        let request = match messages::deserialize_request(&request_bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(remote = %remote, error = %e, "rejecting malformed request");
                let error = RpcResponse::Error {
                    message: format!("malformed request: {}", e),
                };
                write_response(&mut stream, &error).await?;
                return Ok(());
            }
        };

        let method = request.method();
        let response =
            match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, handle_request(&overlay, request)).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(remote = %remote, method, "request processing timed out");
                    RpcResponse::Error {
                        message: "request processing timeout".to_string(),
                    }
                }
            };

        write_response(&mut stream, &response).await?;
    }
}

/// Apply one decoded request to the local overlay.
pub async fn handle_request(overlay: &Overlay, request: RpcRequest) -> RpcResponse {
    let result = match request {
        RpcRequest::Hello { addr } => {
            if addr.is_empty() || addr.len() > crate::identity::MAX_HOST_LENGTH + 6 {
                return RpcResponse::Error {
                    message: format!("invalid address {:?}", addr),
                };
            }
            overlay.hello(&addr).await.map(RpcResponse::Ack)
        }
        RpcRequest::Ping { who } => overlay.ping(who).await.map(RpcResponse::Ack),
        RpcRequest::Pong { who } => overlay.pong(who).await.map(RpcResponse::Ack),
        RpcRequest::Who => Ok(RpcResponse::Identity(overlay.identity().clone())),
        RpcRequest::PeerList => overlay.plist().await.map(RpcResponse::Peers),
        RpcRequest::NeighbourList => overlay.nlist().await.map(RpcResponse::Peers),
        RpcRequest::NeighbourRequest { candidate } => overlay
            .neighbour_request(candidate)
            .await
            .map(|(accepted, peer)| RpcResponse::Neighbour { accepted, peer }),
        RpcRequest::Find(query) => overlay.find(query).await.map(RpcResponse::Ack),
        RpcRequest::StartWalk { query, walkers } => {
            overlay.start_walk(query, walkers).await.map(RpcResponse::Ack)
        }
        RpcRequest::WalkerFind { query, visited } => {
            if visited.len() > MAX_VISITED {
                return RpcResponse::Error {
                    message: format!("visited list too long: {} (max {})", visited.len(), MAX_VISITED),
                };
            }
            overlay.walker_find(query, visited).await.map(RpcResponse::Ack)
        }
        RpcRequest::Found { msg_id, holder } => overlay.found(msg_id, holder).await.map(RpcResponse::Ack),
        RpcRequest::HasFoundFile { msg_id } => {
            overlay.has_found_file(msg_id).await.map(RpcResponse::SearchStatus)
        }
        RpcRequest::SearchMessages { msg_id } => overlay.search_messages(msg_id).await.map(RpcResponse::Count),
        RpcRequest::Get { file_name } => overlay.get(&file_name).await.map(RpcResponse::File),
    };

    result.unwrap_or_else(|e| RpcResponse::Error { message: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FileStore;
    use crate::messages::FILE_NOT_FOUND;
    use crate::overlay::OverlayConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn start_server() -> (Overlay, String) {
        let (overlay, addr, _server) = start_server_on(|listener| listener).await;
        (overlay, addr)
    }

    async fn start_server_on<A, F>(wrap: F) -> (Overlay, String, tokio::task::JoinHandle<()>)
    where
        A: Accept + Send + Sync + 'static,
        F: FnOnce(TcpListener) -> A,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let local = PeerIdentity::from_socket_addr("srv", addr, 2).unwrap();
        let mut files = FileStore::new();
        files.insert("bacon", "crispy");
        let overlay = Overlay::spawn(local, files, OverlayConfig::default());
        let server = tokio::spawn(serve(wrap(listener), overlay.clone()));
        (overlay, addr.to_string(), server)
    }

    /// Listener whose first `failures` accepts fail as if the process ran out of descriptors.
    struct FlakyListener {
        inner: TcpListener,
        failures: AtomicU32,
    }

    impl Accept for FlakyListener {
        fn accept(&self) -> impl Future<Output = std::io::Result<(TcpStream, SocketAddr)>> + Send {
            async move {
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(std::io::Error::from_raw_os_error(24));
                }
                self.inner.accept().await
            }
        }
    }

    async fn who_on(stream: &mut TcpStream) -> RpcResponse {
        let request = messages::serialize_request(&RpcRequest::Who).unwrap();
        write_frame(stream, &request).await.unwrap();
        let len = read_frame_len(stream).await.unwrap();
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        messages::deserialize_bounded(&body).unwrap()
    }

    #[tokio::test]
    async fn server_keeps_accepting_after_accept_errors() {
        let (overlay, addr, server) = start_server_on(|inner| FlakyListener {
            inner,
            failures: AtomicU32::new(3),
        })
        .await;

        let client = RpcNode::new();
        let peer = tokio::time::timeout(Duration::from_secs(5), client.who(&addr))
            .await
            .expect("server stopped answering")
            .unwrap();
        assert_eq!(peer, *overlay.identity());
        assert!(!server.is_finished());
    }

    #[tokio::test]
    async fn stopping_the_server_closes_open_connections() {
        let (overlay, addr, server) = start_server_on(|listener| listener).await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        assert!(matches!(who_on(&mut stream).await, RpcResponse::Identity(id) if id == *overlay.identity()));

        server.abort();

        let mut buf = [0u8; 1];
        let closed = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("connection outlived the server");
        assert!(matches!(closed, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn client_and_server_exchange_requests() {
        let (overlay, addr) = start_server().await;
        let client = RpcNode::new();

        assert_eq!(client.who(&addr).await.unwrap(), *overlay.identity());
        assert_eq!(client.get(&addr, "bacon").await.unwrap(), "crispy");
        assert_eq!(client.get(&addr, "eggs").await.unwrap(), FILE_NOT_FOUND);

        let visitor = PeerIdentity::new("visitor", "127.0.0.1", 9, 2).unwrap();
        assert!(client.ping(&addr, &visitor).await.unwrap());
        assert_eq!(client.plist(&addr).await.unwrap(), vec![visitor]);
        assert_eq!(client.search_messages(&addr, 1234).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_request_gets_error_response() {
        let (_overlay, addr) = start_server().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();

        let huge = (MAX_REQUEST_SIZE as u32 + 1).to_be_bytes();
        stream.write_all(&huge).await.unwrap();

        let len = read_frame_len(&mut stream).await.unwrap();
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        let response: RpcResponse = messages::deserialize_bounded(&body).unwrap();
        assert!(matches!(response, RpcResponse::Error { message } if message.contains("too large")));
    }

    #[tokio::test]
    async fn malformed_request_gets_error_response() {
        let (_overlay, addr) = start_server().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();

        write_frame(&mut stream, &[0xFF, 0xFE, 0xFD]).await.unwrap();

        let len = read_frame_len(&mut stream).await.unwrap();
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        let response: RpcResponse = messages::deserialize_bounded(&body).unwrap();
        assert!(matches!(response, RpcResponse::Error { .. }));
    }

    #[tokio::test]
    async fn overlong_visited_list_is_rejected() {
        let (_overlay, addr) = start_server().await;
        let client = RpcNode::new();

        let query = Query::new("127.0.0.1:9", 1, "bacon", 3);
        let visited: Vec<String> = (0..=MAX_VISITED).map(|i| format!("h:{}", i + 1)).collect();
        assert!(client.walker_find(&addr, &query, &visited).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(RpcNode::new().who(&addr).await.is_err());
    }
}
