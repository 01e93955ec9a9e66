//! Discovery and connection supervision for remote hardware-abstraction servers.

#![deny(missing_docs)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod server;
pub mod url;

// Re-export key types
pub use config::{BackendKind, DiscoveryConfig, ServerConfig};
pub use discovery::{DiscoveryBackend, DiscoveryEndpoint, PeerUrls};
pub use error::{Error, Result};
pub use server::{
    ConnectionAcceptor, ConnectionWorker, EchoWorker, HandleOutcome, Server, WorkerFactory,
    WorkerSupervisor,
};
pub use url::{AddressFamily, AddressFamilyMask, NetworkPort, ServerUrl};
