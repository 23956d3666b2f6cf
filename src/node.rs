//! # High-Level Node API
//!
//! A [`Node`] is one running overlay participant: a TCP listener serving
//! the overlay protocol, the overlay actor holding its state, and the
//! dispatcher carrying out queued actions.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(NodeConfig { name: "A".into(), ..NodeConfig::default() }, FileStore::new()).await?;
//! node.share("bacon", "crispy").await?;
//!
//! // Join an existing overlay through any member
//! node.hello("192.168.1.20:4000").await?;
//!
//! let outcome = node.search("eggs", 4, Strategy::Flood).await?;
//! if let Some(holder) = outcome.holder {
//!     let content = node.fetch(&holder, "eggs").await?;
//! }
//! ```
//!
//! ## Component Integration
//!
//! - **Overlay**: ledgers, neighbour set, action queue (actor)
//! - **Dispatcher**: drains the action queue through the gateway
//! - **Gateway**: timeout and retry policy over [`RpcNode`]
//! - **rpc::serve**: accepts inbound connections for the overlay

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::gateway::{Gateway, GatewayConfig};
use crate::identity::PeerIdentity;
use crate::ledger::FileStore;
use crate::overlay::{Overlay, OverlayConfig};
use crate::protocols::OverlayRpc;
use crate::rpc::{self, RpcNode};
use crate::search::{self, SearchConfig, SearchOutcome, Strategy};

/// Default neighbour capacity of a node.
pub const DEFAULT_CAPACITY: u32 = 3;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub name: String,
    /// Socket address to listen on; port 0 picks a free port.
    pub bind: String,
    /// Maximum number of overlay neighbours.
    pub capacity: u32,
    /// Host announced to peers. Defaults to the bound IP, or loopback when bound to a wildcard address.
    pub advertise_host: Option<String>,
    pub overlay: OverlayConfig,
    pub gateway: GatewayConfig,
    pub dispatcher: DispatcherConfig,
    pub search: SearchConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            bind: "0.0.0.0:0".to_string(),
            capacity: DEFAULT_CAPACITY,
            advertise_host: None,
            overlay: OverlayConfig::default(),
            gateway: GatewayConfig::default(),
            dispatcher: DispatcherConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Check every component config; [`Node::bind`] refuses an invalid one.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.capacity > 0, "neighbour capacity must be positive");
        self.overlay.validate().context("invalid overlay config")?;
        self.gateway.validate().context("invalid gateway config")?;
        self.dispatcher.validate().context("invalid dispatcher config")?;
        self.search.validate().context("invalid search config")?;
        Ok(())
    }
}

pub struct Node {
    overlay: Overlay,
    gateway: Gateway<RpcNode>,
    local_addr: SocketAddr,
    search_config: SearchConfig,
    listener: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Node {
    /// Bind the listener and start the overlay, the dispatcher and the RPC server.
    pub async fn bind(config: NodeConfig, files: FileStore) -> Result<Self> {
        config.validate()?;
        let addr: SocketAddr = config.bind.parse().context("invalid socket address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        let local_addr = listener.local_addr().context("failed to get local address")?;

        let identity = match &config.advertise_host {
            Some(host) => PeerIdentity::new(config.name.clone(), host.clone(), local_addr.port(), config.capacity),
            None => {
                let advertised = SocketAddr::new(advertised_ip(local_addr.ip()), local_addr.port());
                PeerIdentity::from_socket_addr(config.name.clone(), advertised, config.capacity)
            }
        }
        .context("invalid node identity")?;

        let overlay = Overlay::spawn(identity.clone(), files, config.overlay.clone());
        let gateway = Gateway::new(Arc::new(RpcNode::new()), config.gateway.clone());
        let dispatcher =
            Dispatcher::new(overlay.clone(), gateway.clone(), config.dispatcher.clone()).spawn();
        let listener = tokio::spawn(rpc::serve(listener, overlay.clone()));

        info!(node = %identity, bind = %local_addr, "node started");

        Ok(Self {
            overlay,
            gateway,
            local_addr,
            search_config: config.search,
            listener,
            dispatcher,
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        self.overlay.identity()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn search_config(&self) -> &SearchConfig {
        &self.search_config
    }

    /// Greet the node at `addr`; discovery then continues by gossip.
    pub async fn hello(&self, addr: &str) -> Result<bool> {
        self.overlay.hello(addr).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerIdentity>> {
        self.overlay.plist().await
    }

    pub async fn neighbours(&self) -> Result<Vec<PeerIdentity>> {
        self.overlay.nlist().await
    }

    pub async fn search(&self, file_name: &str, ttl: u32, strategy: Strategy) -> Result<SearchOutcome> {
        search::originate(&self.overlay, &self.gateway, &self.search_config, file_name, ttl, strategy).await
    }

    /// Download `file_name` from the node at `addr`.
    pub async fn fetch(&self, addr: &str, file_name: &str) -> Result<String> {
        let network = self.gateway.network();
        let content = self
            .gateway
            .call(addr, "get", || network.get(addr, file_name))
            .await?;
        Ok(content)
    }

    /// Identity of the node listening at `addr`.
    pub async fn who(&self, addr: &str) -> Result<PeerIdentity> {
        let network = self.gateway.network();
        let peer = self.gateway.call(addr, "who", || network.who(addr)).await?;
        Ok(peer)
    }

    /// Actions queued but not yet dispatched.
    pub async fn pending_actions(&self) -> Result<usize> {
        self.overlay.pending_actions().await
    }

    pub async fn share(&self, name: impl Into<String>, content: impl Into<String>) -> Result<()> {
        self.overlay.share(name, content).await
    }

    /// Stop accepting and close open connections, then stop the overlay and the dispatcher.
    pub async fn shutdown(&self) {
        self.listener.abort();
        self.overlay.quit().await;
        self.dispatcher.abort();
        info!(node = %self.overlay.identity(), "node stopped");
    }
}

/// Wildcard binds are announced as loopback: there is no single reachable address to pick.
fn advertised_ip(bound: IpAddr) -> IpAddr {
    match bound {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}
