//! RemoteStash for desktop hosts: multicast discovery, the transfer server and client
//! roles, and Peer Sessions on top of `stash-core`.

pub mod client;
pub mod config;
pub mod discovery;
pub mod server;
pub mod session;

pub use client::{ClientError, Pulled, StashClient};
pub use config::Config;
pub use discovery::{
    spawn_registry, Advertiser, AdvertiserState, DiscoveryError, RegistryConfig, RegistryHandle,
};
pub use server::{CurrentItemProvider, MemoryProvider, Server, ServerError, StashState};
pub use session::{PeerSession, SessionError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
