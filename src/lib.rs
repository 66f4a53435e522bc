//! dagnet: the peer-to-peer server layer of a blockDAG full node
//!
//! This crate provides:
//! - A server actor that owns the peer registry, ban list and outbound groups
//! - Peer sessions with version negotiation over any async byte stream
//! - Dynamic ban scoring with a decaying transient component
//! - Per-message protocol handlers (addresses, inventory, locators, bloom
//!   filters, committed filters)
//! - Periodic rebroadcast of unconfirmed inventory
//!
//! The address manager, sync manager, DAG, mempool, connection manager and
//! filter index are supplied by the node through the traits in [`deps`].
//!
//! # Example
//!
//! ```rust,no_run
//! use dagnet::{Config, Deps, Logger, Server};
//!
//! async fn run(deps: Deps) -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Config::default().validate()?;
//!     let server = Server::new(settings, deps, Logger::default());
//!     server.start();
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:16111").await?;
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         server.inbound_connected(stream, addr)?;
//!     }
//! }
//! ```

pub mod config;
pub mod deps;
mod handlers;
pub mod logger;
pub mod peer;
pub mod server;
pub mod wire;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::{Config, ConfigError, Settings};
pub use deps::{
    AddrManager, ConnManager, ConnReq, DagView, Deps, FilterIndex, Mempool, SyncManager, TxDesc,
};
pub use logger::Logger;
pub use peer::gate::ProcessedSignal;
pub use peer::{Peer, PeerError, PeerId, PeerInfo};
pub use server::query::{PeerSelector, Query};
pub use server::{AddedNodeInfo, RelayPayload, Server, ServerError};
pub use wire::{Hash, InvVect, Message, MsgBlock, MsgTx, NetAddress, ServiceFlags, SubnetworkId};
