//! Client-side engine for the Language Server Protocol.
//!
//! The crate is layered bottom-up:
//!
//! - [`io`]: byte transports (child stdio, TCP, Unix sockets) and child
//!   process lifecycle management
//! - [`jsonrpc`]: the JSON-RPC 2.0 message model, the Content-Length
//!   frame codec and request/response correlation
//! - [`capability`]: composable capability units that together form the
//!   advertised `ClientCapabilities` and the handlers for server-initiated
//!   traffic
//! - [`server`]: backends that produce a running server (local binary,
//!   container, socket) plus fallback selection and install-on-demand
//! - [`document`], [`workspace`], [`config`]: ref-counted document
//!   snapshots, workspace folder handling and the configuration store
//! - [`client`]: the session orchestrator tying everything together
//!
//! A typical consumer defines a [`client::ServerProfile`] for its language
//! server, then drives requests through a [`client::Session`].

pub mod capability;
pub mod client;
pub mod config;
pub mod document;
pub mod io;
pub mod jsonrpc;
pub mod logging;
pub mod server;
pub mod workspace;

#[cfg(test)]
pub mod test_utils;

pub use client::{ServerProfile, Session, SessionBuilder, SessionError, SessionState};
pub use server::{
    BackendError, ContainerServer, DefaultServers, InstallHook, LocalServer, MountSpec,
    ServerChoice, SocketEndpoint, SocketServer,
};
pub use workspace::Workspace;
